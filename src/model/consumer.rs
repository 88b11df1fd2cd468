use std::cell::RefCell;
use std::rc::Rc;

use crate::{CloseReason, Error, FragmentCache, Location, ObjectHandler, Progress, Reassembly};

/// A fragment arriving from the network, in any transport mode.
#[derive(Clone, Copy, Debug)]
pub struct FragmentIn<'a> {
	pub location: Location,
	pub offset: u64,
	pub queue_delay: u64,
	pub flags: u8,
	pub nb_objects_previous_group: u64,
	pub object_length: u64,
	pub data: &'a [u8],
}

/// Receives media from a subscribing stream.
///
/// Returning [Progress::Finished] means everything up to the final object has
/// been delivered; the stream will close gracefully.
pub trait Consumer {
	/// A fragment arrived, by datagram, substream or inline on the stream.
	fn datagram_ready(&mut self, now: u64, fragment: &FragmentIn) -> Result<Progress, Error>;

	/// The exclusive end of the media was announced.
	fn final_object_id(&mut self, now: u64, last: Location) -> Result<Progress, Error>;

	/// The sender will deliver nothing before `start`.
	fn start_point(&mut self, now: u64, start: Location) -> Result<Progress, Error>;

	/// The sender asked intermediaries to cache this media for real time only.
	fn real_time_cache(&mut self, now: u64) -> Result<Progress, Error> {
		let _ = now;
		Ok(Progress::Active)
	}

	fn close(&mut self, reason: CloseReason);
}

/// A consumer that reassembles fragments into in-order object deliveries for
/// an [ObjectHandler].
pub struct MediaConsumer {
	reassembly: Reassembly,
	handler: Box<dyn ObjectHandler>,
}

impl MediaConsumer {
	pub fn new(handler: Box<dyn ObjectHandler>) -> Self {
		Self {
			reassembly: Reassembly::default(),
			handler,
		}
	}

	fn progress(&self) -> Progress {
		if self.reassembly.is_finished() {
			Progress::Finished
		} else {
			Progress::Active
		}
	}
}

impl Consumer for MediaConsumer {
	fn datagram_ready(&mut self, now: u64, fragment: &FragmentIn) -> Result<Progress, Error> {
		self.reassembly.input_fragment(now, fragment, self.handler.as_mut())?;
		Ok(self.progress())
	}

	fn final_object_id(&mut self, _now: u64, last: Location) -> Result<Progress, Error> {
		self.reassembly.learn_final_location(last)?;
		Ok(self.progress())
	}

	fn start_point(&mut self, now: u64, start: Location) -> Result<Progress, Error> {
		self.reassembly.learn_start_point(now, start, self.handler.as_mut())?;
		Ok(self.progress())
	}

	fn close(&mut self, reason: CloseReason) {
		self.handler.on_close(reason);
	}
}

/// A consumer that fills a [FragmentCache], as a relay does. The cached media
/// can be re-served to local subscribers through a registered source.
pub struct CacheConsumer {
	cache: Rc<RefCell<FragmentCache>>,
	real_time: bool,
}

impl CacheConsumer {
	pub fn new(cache: Rc<RefCell<FragmentCache>>) -> Self {
		Self { cache, real_time: false }
	}

	pub fn is_real_time(&self) -> bool {
		self.real_time
	}
}

impl Consumer for CacheConsumer {
	fn datagram_ready(&mut self, now: u64, fragment: &FragmentIn) -> Result<Progress, Error> {
		let inserted = self.cache.borrow_mut().insert(
			fragment.location,
			fragment.offset,
			bytes::Bytes::copy_from_slice(fragment.data),
			fragment.object_length,
			fragment.flags,
			fragment.nb_objects_previous_group,
			fragment.queue_delay,
			now,
		)?;
		if !inserted {
			tracing::trace!(location = %fragment.location, offset = fragment.offset, "duplicate fragment");
		}
		Ok(Progress::Active)
	}

	fn final_object_id(&mut self, _now: u64, last: Location) -> Result<Progress, Error> {
		self.cache.borrow_mut().notify_final(last);
		Ok(Progress::Active)
	}

	fn start_point(&mut self, _now: u64, _start: Location) -> Result<Progress, Error> {
		Ok(Progress::Active)
	}

	fn real_time_cache(&mut self, _now: u64) -> Result<Progress, Error> {
		self.real_time = true;
		Ok(Progress::Active)
	}

	fn close(&mut self, _reason: CloseReason) {}
}
