use bytes::{Buf, BufMut, Bytes};

use crate::{
	coding::{Decode, DecodeError, Encode},
	wire::{Message, MessageType},
};

/// Sent by a subscriber to receive NOTIFY messages for every media source
/// whose URL starts with the given prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscribe {
	pub prefix: Bytes,
}

impl Message for Subscribe {
	const TYPE: MessageType = MessageType::Subscribe;

	fn decode_msg<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Self {
			prefix: Bytes::decode(r)?,
		})
	}

	fn encode_msg<W: BufMut>(&self, w: &mut W) {
		self.prefix.encode(w);
	}
}

/// Announces a matching media source to a subscribed peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notify {
	pub url: Bytes,
}

impl Message for Notify {
	const TYPE: MessageType = MessageType::Notify;

	fn decode_msg<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Self { url: Bytes::decode(r)? })
	}

	fn encode_msg<W: BufMut>(&self, w: &mut W) {
		self.url.encode(w);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wire::tests::{decode_message, encode_message};

	#[test]
	fn subscribe_round_trip() {
		let msg = Subscribe {
			prefix: Bytes::from_static(b"video/"),
		};
		let decoded: Subscribe = decode_message(&encode_message(&msg)).unwrap();
		assert_eq!(decoded, msg);
	}

	#[test]
	fn notify_round_trip() {
		let msg = Notify {
			url: Bytes::from_static(b"video/camA"),
		};
		let decoded: Notify = decode_message(&encode_message(&msg)).unwrap();
		assert_eq!(decoded, msg);
	}
}
