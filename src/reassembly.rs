use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use crate::{Error, FragmentIn, Location};

/// How an object is being handed to the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
	/// The next in-order object.
	InSequence,
	/// Complete but out of order; delivered for inspection only.
	Peek,
	/// A previously peeked object that has become in-order.
	Repair,
}

/// Receives reassembled objects from a [Reassembly].
pub trait ObjectHandler {
	fn on_object(&mut self, now: u64, location: Location, flags: u8, data: &[u8], mode: DeliveryMode) -> Result<(), Error>;

	fn on_close(&mut self, reason: crate::CloseReason) {
		let _ = reason;
	}
}

#[derive(Default)]
struct PartialObject {
	length: u64,
	flags: u8,
	fragments: BTreeMap<u64, Bytes>,
	covered: u64,
	peeked: bool,
}

impl PartialObject {
	fn is_complete(&self) -> bool {
		self.covered == self.length
	}

	fn insert(&mut self, offset: u64, data: &[u8]) -> Result<(), Error> {
		let length = data.len() as u64;
		if offset + length > self.length {
			return Err(Error::Overlap);
		}
		if let Some(existing) = self.fragments.get(&offset) {
			if existing.len() as u64 == length {
				return Ok(());
			}
			return Err(Error::Overlap);
		}
		if let Some((start, fragment)) = self.fragments.range(..offset).next_back() {
			if start + fragment.len() as u64 > offset {
				return Err(Error::Overlap);
			}
		}
		if let Some((start, _)) = self.fragments.range(offset..).next() {
			if *start < offset + length {
				return Err(Error::Overlap);
			}
		}
		self.fragments.insert(offset, Bytes::copy_from_slice(data));
		self.covered += length;
		Ok(())
	}

	fn assemble(&self) -> Bytes {
		let mut out = BytesMut::with_capacity(self.length as usize);
		for fragment in self.fragments.values() {
			out.extend_from_slice(fragment);
		}
		out.freeze()
	}
}

/// Converts arriving fragments into in-order object deliveries.
///
/// Objects complete out of order are delivered [DeliveryMode::Peek] once,
/// then [DeliveryMode::Repair] when they become the next in-order object;
/// objects that complete in order are delivered [DeliveryMode::InSequence].
#[derive(Default)]
pub struct Reassembly {
	pending: BTreeMap<Location, PartialObject>,
	next: Location,
	start: Option<Location>,
	final_location: Option<Location>,
	group_counts: BTreeMap<u64, u64>,
	delivered_any: bool,
	is_finished: bool,
}

impl Reassembly {
	/// Insert a fragment, delivering any objects that become ready.
	pub fn input_fragment(&mut self, now: u64, fragment: &FragmentIn, handler: &mut dyn ObjectHandler) -> Result<(), Error> {
		if self.is_finished {
			return Ok(());
		}

		let location = fragment.location;
		self.learn_group_count(location, fragment.nb_objects_previous_group);

		// Below the start point or already delivered: stale data.
		if self.start.is_some_and(|start| location < start) || location < self.next {
			return Ok(());
		}

		{
			let partial = self.pending.entry(location).or_insert_with(|| PartialObject {
				length: fragment.object_length,
				flags: fragment.flags,
				..Default::default()
			});
			if partial.length != fragment.object_length {
				return Err(Error::Overlap);
			}
			partial.insert(fragment.offset, fragment.data)?;
		}

		// The fragment may have carried the group count that makes this very
		// object the next in order; only peek if it is still out of order.
		self.normalize_next();
		let partial = self.pending.get_mut(&location).expect("object just inserted");
		if partial.is_complete() && location > self.next && !partial.peeked {
			partial.peeked = true;
			let data = partial.assemble();
			let flags = partial.flags;
			tracing::trace!(%location, size = data.len(), "object complete out of order");
			handler.on_object(now, location, flags, &data, DeliveryMode::Peek)?;
		}

		self.deliver_ready(now, handler)
	}

	/// Learn the earliest object the sender will deliver. Anything buffered
	/// below it is discarded.
	pub fn learn_start_point(&mut self, now: u64, start: Location, handler: &mut dyn ObjectHandler) -> Result<(), Error> {
		if self.delivered_any && start > self.next {
			return Err(Error::StartPointConflict);
		}
		self.start = Some(start);
		if self.next < start {
			self.next = start;
			self.pending.retain(|location, _| *location >= start);
		}
		tracing::debug!(%start, "learned start point");
		self.deliver_ready(now, handler)
	}

	/// Learn the exclusive end of the media.
	pub fn learn_final_location(&mut self, last: Location) -> Result<(), Error> {
		self.final_location = Some(last);
		self.group_counts.insert(last.group, last.object);
		tracing::debug!(%last, "learned final object");
		self.normalize_next();
		self.check_finished();
		Ok(())
	}

	/// True once everything in `[start, final)` was delivered in sequence.
	pub fn is_finished(&self) -> bool {
		self.is_finished
	}

	pub fn next_location(&self) -> Location {
		self.next
	}

	pub fn start_point(&self) -> Option<Location> {
		self.start
	}

	pub fn final_location(&self) -> Option<Location> {
		self.final_location
	}

	fn learn_group_count(&mut self, location: Location, nb_objects_previous_group: u64) {
		if location.object == 0 && location.group > 0 && nb_objects_previous_group > 0 {
			self.group_counts.insert(location.group - 1, nb_objects_previous_group);
		}
	}

	/// Advance `next` across group boundaries whose object count is known.
	fn normalize_next(&mut self) {
		while let Some(count) = self.group_counts.get(&self.next.group) {
			if self.next.object >= *count {
				self.next = self.next.next_group();
			} else {
				break;
			}
		}
	}

	fn check_finished(&mut self) {
		if self.final_location.is_some_and(|last| self.next >= last) {
			self.is_finished = true;
		}
	}

	fn deliver_ready(&mut self, now: u64, handler: &mut dyn ObjectHandler) -> Result<(), Error> {
		loop {
			self.normalize_next();
			self.check_finished();
			if self.is_finished {
				break;
			}
			let Some(partial) = self.pending.get(&self.next) else {
				break;
			};
			if !partial.is_complete() {
				break;
			}
			let partial = self.pending.remove(&self.next).expect("pending object");
			let data = partial.assemble();
			let mode = if partial.peeked {
				DeliveryMode::Repair
			} else {
				DeliveryMode::InSequence
			};
			tracing::trace!(location = %self.next, size = data.len(), ?mode, "delivering object");
			handler.on_object(now, self.next, partial.flags, &data, mode)?;
			self.delivered_any = true;
			self.next = self.next.next_object();
		}
		Ok(())
	}
}
