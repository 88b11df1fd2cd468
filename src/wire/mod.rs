//! The low-level wire encoding for the control and data planes.
//!
//! Control messages travel on bidirectional streams as 16-bit length-prefixed
//! frames; see [crate::coding::FrameBuffer]. Datagram and substream headers
//! are not length-prefixed.

mod datagram;
mod fragment;
mod message;
mod notify;
mod policy;
mod range;
mod request;
mod warp;

pub use datagram::*;
pub use fragment::*;
pub use message::*;
pub use notify::*;
pub use policy::*;
pub use range::*;
pub use request::*;
pub use warp::*;

#[cfg(test)]
pub(crate) mod tests {
	use super::Message;
	use crate::coding::DecodeError;

	pub fn encode_message<M: Message>(msg: &M) -> Vec<u8> {
		let mut buf = bytes::BytesMut::new();
		msg.encode_msg(&mut buf);
		buf.to_vec()
	}

	pub fn decode_message<M: Message>(bytes: &[u8]) -> Result<M, DecodeError> {
		let mut buf = bytes::Bytes::from(bytes.to_vec());
		M::decode_msg(&mut buf)
	}
}
