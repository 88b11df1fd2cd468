use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;

use crate::{Error, FragmentCache, Location};

/// A locally registered media source, feeding a shared [FragmentCache] that
/// any number of subscriber cursors read independently.
pub struct ObjectSource {
	url: Bytes,
	cache: Rc<RefCell<FragmentCache>>,
	real_time: bool,
	next: Location,
	finished: bool,
}

impl ObjectSource {
	pub fn new(url: Bytes, real_time: bool) -> Self {
		Self {
			url,
			cache: Rc::new(RefCell::new(FragmentCache::default())),
			real_time,
			next: Location::ZERO,
			finished: false,
		}
	}

	pub fn url(&self) -> &Bytes {
		&self.url
	}

	pub fn cache(&self) -> Rc<RefCell<FragmentCache>> {
		self.cache.clone()
	}

	pub fn is_real_time(&self) -> bool {
		self.real_time
	}

	/// Where the next published object will land.
	pub fn next_location(&self) -> Location {
		self.next
	}

	pub fn is_finished(&self) -> bool {
		self.finished
	}

	/// Append one object. `new_group` closes the current group first; the
	/// object count of the closed group rides on this object's first fragment.
	pub fn publish_object(&mut self, data: &[u8], flags: u8, new_group: bool, now: u64) -> Result<Location, Error> {
		if self.finished {
			return Err(Error::Closed);
		}

		let mut nb_objects_previous_group = 0;
		if new_group && self.next.object > 0 {
			nb_objects_previous_group = self.next.object;
			self.next = self.next.next_group();
		}

		let location = self.next;
		self.cache.borrow_mut().insert(
			location,
			0,
			Bytes::copy_from_slice(data),
			data.len() as u64,
			flags,
			nb_objects_previous_group,
			0,
			now,
		)?;
		self.next = self.next.next_object();
		tracing::trace!(url = %String::from_utf8_lossy(&self.url), %location, size = data.len(), "published object");
		Ok(location)
	}

	/// Mark the end of the media at the current append position.
	pub fn publish_fin(&mut self) {
		if !self.finished {
			self.finished = true;
			self.cache.borrow_mut().notify_final(self.next);
			tracing::debug!(url = %String::from_utf8_lossy(&self.url), last = %self.next, "source finished");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn append_and_group_boundaries() {
		let mut source = ObjectSource::new(Bytes::from_static(b"video/test"), true);
		assert_eq!(source.publish_object(b"a", 0x80, false, 0).unwrap(), Location::new(0, 0));
		assert_eq!(source.publish_object(b"b", 0x80, false, 0).unwrap(), Location::new(0, 1));
		assert_eq!(source.publish_object(b"c", 0x80, true, 0).unwrap(), Location::new(1, 0));

		let cache = source.cache();
		let cache = cache.borrow();
		assert_eq!(cache.object_count(0), Some(2));
		assert_eq!(
			cache.object_properties(Location::new(1, 0)).unwrap().nb_objects_previous_group,
			2
		);
	}

	#[test]
	fn fin_records_final_location() {
		let mut source = ObjectSource::new(Bytes::from_static(b"audio/test"), false);
		source.publish_object(b"a", 0, false, 0).unwrap();
		source.publish_fin();
		assert_eq!(source.cache().borrow().final_location(), Some(Location::new(0, 1)));
		assert!(source.publish_object(b"b", 0, false, 0).is_err());
	}
}
