use bytes::{Bytes, BytesMut};

/// Accumulates length-prefixed message frames from arbitrary stream chunks.
///
/// Each frame is a 16-bit big-endian length followed by that many body bytes.
/// Chunks may split a frame anywhere, including inside the length prefix.
#[derive(Default)]
pub struct FrameBuffer {
	header_read: usize,
	size: usize,
	body: BytesMut,
}

impl FrameBuffer {
	/// Consume bytes from the front of `input` until a frame completes.
	///
	/// Returns the frame body once all of it has arrived, leaving any
	/// following bytes in `input` for the next call.
	pub fn absorb(&mut self, input: &mut &[u8]) -> Option<Bytes> {
		while self.header_read < 2 && !input.is_empty() {
			self.size = (self.size << 8) + input[0] as usize;
			self.header_read += 1;
			*input = &input[1..];
		}

		if self.header_read < 2 {
			return None;
		}

		let required = self.size - self.body.len();
		let take = required.min(input.len());
		self.body.extend_from_slice(&input[..take]);
		*input = &input[take..];

		if self.body.len() == self.size {
			let frame = self.body.split().freeze();
			self.header_read = 0;
			self.size = 0;
			Some(frame)
		} else {
			None
		}
	}

	/// Drop any partially accumulated frame.
	pub fn reset(&mut self) {
		self.header_read = 0;
		self.size = 0;
		self.body.clear();
	}
}

/// Dribbles a pending length-prefixed frame into limited send windows.
///
/// Only one frame is pending at a time; the stream state machine decides what
/// to queue next once the previous frame has fully drained.
#[derive(Default)]
pub struct SendBuffer {
	framed: Bytes,
	offset: usize,
}

impl SendBuffer {
	/// Queue a message body, prefixing it with its 16-bit length.
	///
	/// Panics if a frame is already pending or the body exceeds 64KB - 1.
	pub fn queue(&mut self, body: &[u8]) {
		assert!(self.is_empty(), "frame already pending");
		assert!(body.len() <= u16::MAX as usize, "frame too large");

		let mut framed = BytesMut::with_capacity(2 + body.len());
		framed.extend_from_slice(&(body.len() as u16).to_be_bytes());
		framed.extend_from_slice(body);
		self.framed = framed.freeze();
		self.offset = 0;
	}

	pub fn is_empty(&self) -> bool {
		self.offset >= self.framed.len()
	}

	/// Take up to `space` bytes of the pending frame.
	pub fn pull(&mut self, space: usize) -> Bytes {
		let take = space.min(self.framed.len() - self.offset);
		let chunk = self.framed.slice(self.offset..self.offset + take);
		self.offset += take;
		if self.is_empty() {
			self.framed = Bytes::new();
			self.offset = 0;
		}
		chunk
	}
}
