use bytes::Bytes;

use crate::Error;

/// QUIC error code used when a stream is reset on a protocol violation.
pub const ERROR_INTERNAL: u64 = 0x51;

/// The narrow surface the core needs from the QUIC transport.
///
/// The embedding event loop implements this over its QUIC stack and passes it
/// into every [crate::Endpoint] callback. The core never blocks on it.
pub trait Transport {
	/// Ask for (or cancel) `prepare_to_send` callbacks on a stream.
	fn mark_stream_active(&mut self, stream_id: u64, active: bool);

	/// Ask for (or cancel) `prepare_datagram` callbacks.
	fn mark_datagram_ready(&mut self, ready: bool);

	/// Queue a datagram for transmission; fails when the queue is full.
	fn queue_datagram(&mut self, datagram: Bytes) -> Result<(), Error>;

	/// The largest datagram `queue_datagram` will accept.
	fn datagram_queue_max(&self) -> usize;

	/// Allocate the next locally initiated stream id.
	fn open_stream(&mut self, unidirectional: bool) -> u64;

	/// Abruptly terminate a stream.
	fn reset_stream(&mut self, stream_id: u64, error_code: u64);

	/// When the transport itself wants to wake up next.
	fn next_wake_time(&self, now: u64) -> u64;
}

/// Bit 1 of a QUIC stream id distinguishes unidirectional streams.
pub fn is_unidirectional(stream_id: u64) -> bool {
	stream_id & 2 != 0
}

/// What a `prepare_to_send` callback produced for a stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamChunk {
	pub data: Vec<u8>,
	/// The stream ends after this chunk.
	pub fin: bool,
	/// More data is ready beyond this chunk.
	pub still_active: bool,
}

impl StreamChunk {
	pub fn empty() -> Self {
		Self::default()
	}

	pub fn is_empty(&self) -> bool {
		self.data.is_empty() && !self.fin
	}
}
