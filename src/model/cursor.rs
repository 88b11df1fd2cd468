use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;

use crate::{
	CloseReason, DataPoll, Error, FLAGS_SKIPPED, FragmentCache, Location, ObjectProperties, Publisher,
};

/// When a congested sender may drop objects instead of falling behind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CongestionMode {
	/// Never skip.
	#[default]
	None,
	/// Skip droppable objects when backlogged.
	Delay,
	/// Like `Delay`, and skip the remainder of a group once one of its
	/// objects was skipped.
	Group,
	/// Like `Group`, treating mid-priority objects as droppable too.
	GroupStrict,
	/// Skip everything but the highest-priority objects when backlogged.
	ZeroStrict,
}

/// What the datagram path got out of the cursor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FragmentPoll {
	/// Nothing available at the cursor position yet.
	NotYet,
	/// The final object has been passed; nothing more will come.
	Finished,
	/// The congestion policy skips the current object; send a placeholder.
	Skip {
		location: Location,
		nb_objects_previous_group: u64,
	},
	/// A fragment ready to send.
	Data {
		location: Location,
		offset: u64,
		data: Bytes,
		object_length: u64,
		flags: u8,
		nb_objects_previous_group: u64,
		queue_delay: u64,
		is_last: bool,
	},
}

/// A read position over a shared [FragmentCache], one per subscriber.
///
/// Serves all four transport modes: the [Publisher] impl streams bytes for
/// single-stream mode, [FragmentCursor::poll_fragment] feeds the datagram
/// path, and the warp/rush engines read the cache directly while borrowing
/// the cursor's congestion state.
pub struct FragmentCursor {
	cache: Rc<RefCell<FragmentCache>>,
	position: Location,
	offset: u64,
	congestion: CongestionMode,
	skipping_group: Option<u64>,
	last_group_reported: u64,
	closed: bool,
}

impl FragmentCursor {
	pub fn new(cache: Rc<RefCell<FragmentCache>>, congestion: CongestionMode) -> Self {
		Self {
			cache,
			position: Location::ZERO,
			offset: 0,
			congestion,
			skipping_group: None,
			last_group_reported: 0,
			closed: false,
		}
	}

	pub fn cache(&self) -> Rc<RefCell<FragmentCache>> {
		self.cache.clone()
	}

	pub fn position(&self) -> Location {
		self.position
	}

	pub fn offset(&self) -> u64 {
		self.offset
	}

	/// Jump to a start point; earlier objects will never be read.
	pub fn set_position(&mut self, location: Location) {
		self.position = location;
		self.offset = 0;
		self.last_group_reported = location.group;
	}

	/// The cursor has passed the final object.
	pub fn at_final(&mut self) -> bool {
		let cache = self.cache.clone();
		let cache = cache.borrow();
		self.normalize(&cache);
		self.position_at_final(&cache)
	}

	pub fn final_location(&self) -> Option<Location> {
		self.cache.borrow().final_location()
	}

	/// Whether a wake of the owning stream would find something to send.
	pub fn is_ready(&mut self) -> bool {
		let cache = self.cache.clone();
		let cache = cache.borrow();
		self.normalize(&cache);
		if self.position_at_final(&cache) {
			return true;
		}
		let Some(props) = cache.object_properties(self.position) else {
			return false;
		};
		props.object_length == 0 || cache.available_at(self.position, self.offset) > 0
	}

	/// Pull the next fragment for the datagram path.
	pub fn poll_fragment(&mut self, max: usize, now: u64) -> FragmentPoll {
		let cache = self.cache.clone();
		let cache = cache.borrow();
		self.normalize(&cache);

		if self.position_at_final(&cache) {
			return FragmentPoll::Finished;
		}
		let Some(props) = cache.object_properties(self.position) else {
			return FragmentPoll::NotYet;
		};

		let nb_objects_previous_group = self.boundary_count(&props);
		if self.offset == 0 && self.should_skip(self.position, &props, &cache) {
			return FragmentPoll::Skip {
				location: self.position,
				nb_objects_previous_group,
			};
		}

		let data = cache.copy_available_data(self.position, self.offset, max);
		if data.is_empty() && props.object_length > 0 {
			return FragmentPoll::NotYet;
		}
		let is_last = self.offset + data.len() as u64 >= props.object_length;

		FragmentPoll::Data {
			location: self.position,
			offset: self.offset,
			queue_delay: cache.delay_at(self.position, self.offset, now),
			object_length: props.object_length,
			flags: props.flags,
			nb_objects_previous_group,
			is_last,
			data,
		}
	}

	/// Advance past `len` sent bytes, moving to the next object at its end.
	pub fn consume(&mut self, len: u64) {
		self.offset += len;
		let object_length = self
			.cache
			.borrow()
			.object_properties(self.position)
			.map(|props| props.object_length);
		if object_length.is_some_and(|length| self.offset >= length) {
			self.advance_object();
		}
	}

	/// Congestion decision for an object the warp/rush engines are about to
	/// send; shares the per-group skip state with the other paths.
	pub fn should_skip_at(&mut self, location: Location, props: &ObjectProperties) -> bool {
		let cache = self.cache.clone();
		let cache = cache.borrow();
		self.should_skip(location, props, &cache)
	}

	fn advance_object(&mut self) {
		self.position = self.position.next_object();
		self.offset = 0;
	}

	fn position_at_final(&self, cache: &FragmentCache) -> bool {
		cache.final_location().is_some_and(|last| self.position >= last)
	}

	/// Roll over group boundaries whose object count is known.
	fn normalize(&mut self, cache: &FragmentCache) {
		while self.offset == 0 {
			match cache.object_count(self.position.group) {
				Some(count) if self.position.object >= count => {
					self.position = self.position.next_group();
					self.offset = 0;
				}
				_ => break,
			}
		}
	}

	/// Count carried on the first fragment of a group's first object.
	fn boundary_count(&self, props: &ObjectProperties) -> u64 {
		if self.position.object == 0 && self.offset == 0 && self.position.group > 0 {
			props.nb_objects_previous_group
		} else {
			0
		}
	}

	fn has_backlog(&self, cache: &FragmentCache) -> bool {
		cache
			.highest_location()
			.is_some_and(|highest| highest > self.position.next_object().next_object())
	}

	fn should_skip(&mut self, location: Location, props: &ObjectProperties, cache: &FragmentCache) -> bool {
		if self.skipping_group == Some(location.group) {
			return true;
		}
		// Objects already skipped upstream carry no data to skip.
		if props.flags == 0 || props.flags == FLAGS_SKIPPED {
			return false;
		}
		if !self.has_backlog(cache) {
			return false;
		}
		let droppable = match self.congestion {
			CongestionMode::None => false,
			CongestionMode::Delay | CongestionMode::Group => props.flags == 0x82,
			CongestionMode::GroupStrict => props.flags == 0x82 || props.flags == 0x81,
			CongestionMode::ZeroStrict => props.flags != 0x80,
		};
		if droppable && matches!(self.congestion, CongestionMode::Group | CongestionMode::GroupStrict) {
			self.skipping_group = Some(location.group);
		}
		droppable
	}
}

impl Publisher for FragmentCursor {
	fn get_data(&mut self, buf: Option<&mut [u8]>, max: usize, now: u64) -> Result<DataPoll, Error> {
		let _ = now;
		if self.closed {
			return Err(Error::Closed);
		}

		let cache_rc = self.cache.clone();
		let cache = cache_rc.borrow();
		self.normalize(&cache);

		let mut poll = DataPoll {
			has_backlog: self.has_backlog(&cache),
			..Default::default()
		};

		if self.position_at_final(&cache) {
			poll.is_media_finished = true;
			return Ok(poll);
		}
		let Some(props) = cache.object_properties(self.position) else {
			return Ok(poll);
		};
		poll.flags = props.flags;
		poll.object_length = props.object_length;

		if self.offset == 0 && self.position.group > self.last_group_reported {
			poll.is_new_group = true;
			self.last_group_reported = self.position.group;
		}

		if self.offset == 0 && self.should_skip(self.position, &props, &cache) {
			poll.should_skip = true;
			poll.is_still_active = true;
			return Ok(poll);
		}

		if props.object_length == 0 {
			// A zero-length object: nothing to copy, but a fragment is due.
			poll.is_still_active = true;
			return Ok(poll);
		}

		let available = cache.available_at(self.position, self.offset).min(max as u64) as usize;
		poll.len = available;
		poll.is_still_active = available > 0;

		if let Some(buf) = buf {
			let data = cache.copy_available_data(self.position, self.offset, available.min(buf.len()));
			buf[..data.len()].copy_from_slice(&data);
			poll.len = data.len();
			drop(cache);
			self.consume(poll.len as u64);
		}

		Ok(poll)
	}

	fn skip_object(&mut self, _now: u64) -> Result<(), Error> {
		self.advance_object();
		Ok(())
	}

	fn close(&mut self, reason: CloseReason) {
		tracing::debug!(?reason, position = %self.position, "closing cursor");
		self.closed = true;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ObjectSource;

	fn source_with(objects: &[(&'static [u8], u8, bool)]) -> ObjectSource {
		let mut source = ObjectSource::new(Bytes::from_static(b"test"), true);
		for (data, flags, new_group) in objects {
			source.publish_object(data, *flags, *new_group, 0).unwrap();
		}
		source
	}

	#[test]
	fn streams_bytes_in_order() {
		let source = source_with(&[(b"hello", 0x80, false), (b"world!", 0x80, false)]);
		let mut cursor = FragmentCursor::new(source.cache(), CongestionMode::None);

		let probe = cursor.get_data(None, 64, 0).unwrap();
		assert_eq!(probe.len, 5);
		assert_eq!(probe.object_length, 5);
		assert!(!probe.is_new_group);

		let mut buf = [0u8; 64];
		let read = cursor.get_data(Some(&mut buf[..5]), 5, 0).unwrap();
		assert_eq!(read.len, 5);
		assert_eq!(&buf[..5], b"hello");
		assert_eq!(cursor.position(), Location::new(0, 1));
	}

	#[test]
	fn reports_group_boundary_once() {
		let source = source_with(&[(b"a", 0x80, false), (b"b", 0x80, true)]);
		let mut cursor = FragmentCursor::new(source.cache(), CongestionMode::None);

		let mut buf = [0u8; 8];
		cursor.get_data(Some(&mut buf[..1]), 1, 0).unwrap();
		let probe = cursor.get_data(None, 8, 0).unwrap();
		assert!(probe.is_new_group);
		let probe = cursor.get_data(None, 8, 0).unwrap();
		assert!(!probe.is_new_group);
	}

	#[test]
	fn datagram_poll_walks_fragments() {
		let source = source_with(&[(b"0123456789", 0x80, false)]);
		let mut cursor = FragmentCursor::new(source.cache(), CongestionMode::None);

		match cursor.poll_fragment(4, 0) {
			FragmentPoll::Data { data, is_last, offset, .. } => {
				assert_eq!(&data[..], b"0123");
				assert_eq!(offset, 0);
				assert!(!is_last);
				cursor.consume(data.len() as u64);
			}
			other => panic!("unexpected poll: {other:?}"),
		}
		match cursor.poll_fragment(64, 0) {
			FragmentPoll::Data { data, is_last, offset, .. } => {
				assert_eq!(&data[..], b"456789");
				assert_eq!(offset, 4);
				assert!(is_last);
				cursor.consume(data.len() as u64);
			}
			other => panic!("unexpected poll: {other:?}"),
		}
		assert_eq!(cursor.poll_fragment(64, 0), FragmentPoll::NotYet);
	}

	#[test]
	fn finishes_after_final() {
		let mut source = source_with(&[(b"a", 0x80, false)]);
		source.publish_fin();
		let mut cursor = FragmentCursor::new(source.cache(), CongestionMode::None);

		match cursor.poll_fragment(64, 0) {
			FragmentPoll::Data { data, .. } => cursor.consume(data.len() as u64),
			other => panic!("unexpected poll: {other:?}"),
		}
		assert_eq!(cursor.poll_fragment(64, 0), FragmentPoll::Finished);
		assert!(cursor.at_final());
	}

	#[test]
	fn zero_strict_skips_under_backlog() {
		let mut source = source_with(&[]);
		for _ in 0..6 {
			source.publish_object(&[0; 100], 0x82, false, 0).unwrap();
		}
		let mut cursor = FragmentCursor::new(source.cache(), CongestionMode::ZeroStrict);

		match cursor.poll_fragment(1000, 0) {
			FragmentPoll::Skip { location, .. } => {
				assert_eq!(location, Location::new(0, 0));
				cursor.skip_object(0).unwrap();
			}
			other => panic!("unexpected poll: {other:?}"),
		}
		assert_eq!(cursor.position(), Location::new(0, 1));
	}

	#[test]
	fn no_skip_without_backlog() {
		let source = source_with(&[(b"abc", 0x82, false)]);
		let mut cursor = FragmentCursor::new(source.cache(), CongestionMode::ZeroStrict);
		assert!(matches!(cursor.poll_fragment(64, 0), FragmentPoll::Data { .. }));
	}
}
