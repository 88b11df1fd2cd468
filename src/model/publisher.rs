use crate::{CloseReason, Error};

/// What a publisher reported for the current read position.
#[derive(Clone, Copy, Debug, Default)]
pub struct DataPoll {
	/// Bytes available (probe) or copied (read).
	pub len: usize,
	pub flags: u8,
	/// A group boundary is about to be crossed; the next bytes belong to the
	/// first object of the new group.
	pub is_new_group: bool,
	/// Total length of the current object, once known.
	pub object_length: u64,
	/// End of media; valid together with `len == 0`.
	pub is_media_finished: bool,
	/// More can be sent right now (or a zero-length object is pending).
	pub is_still_active: bool,
	/// The congestion policy wants the current object skipped.
	pub should_skip: bool,
	/// The source has noticeably more data queued than what is being sent.
	pub has_backlog: bool,
}

/// Supplies media bytes to a sending stream.
///
/// `get_data` with `buf == None` probes: it reports availability without
/// consuming. With a buffer it copies up to `max` bytes and advances. A
/// source that requires a minimum packet size may answer a small probe with
/// `len == 0, is_still_active = true`.
pub trait Publisher {
	fn get_data(&mut self, buf: Option<&mut [u8]>, max: usize, now: u64) -> Result<DataPoll, Error>;

	/// Advance past the current object without sending it.
	fn skip_object(&mut self, now: u64) -> Result<(), Error>;

	fn close(&mut self, reason: CloseReason);
}
