use bytes::{Buf, BufMut};

use crate::{
	coding::{Decode, DecodeError, Encode},
	wire::{Message, MessageType},
};

/// The first message on a unidirectional substream: which subscription the
/// substream belongs to, and the group it conveys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WarpHeader {
	pub media_id: u64,
	pub group_id: u64,
}

impl Message for WarpHeader {
	const TYPE: MessageType = MessageType::WarpHeader;

	fn decode_msg<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		let media_id = u64::decode(r)?;
		let group_id = u64::decode(r)?;
		Ok(Self { media_id, group_id })
	}

	fn encode_msg<W: BufMut>(&self, w: &mut W) {
		self.media_id.encode(w);
		self.group_id.encode(w);
	}
}

/// Introduces one object on a unidirectional substream; `object_length` bytes
/// of raw payload follow the framed header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectHeader {
	pub object_id: u64,
	pub nb_objects_previous_group: u64,
	pub flags: u8,
	pub object_length: u64,
}

impl Message for ObjectHeader {
	const TYPE: MessageType = MessageType::ObjectHeader;

	fn decode_msg<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		let object_id = u64::decode(r)?;
		let nb_objects_previous_group = u64::decode(r)?;
		let flags = u8::decode(r)?;
		let object_length = u64::decode(r)?;

		Ok(Self {
			object_id,
			nb_objects_previous_group,
			flags,
			object_length,
		})
	}

	fn encode_msg<W: BufMut>(&self, w: &mut W) {
		self.object_id.encode(w);
		self.nb_objects_previous_group.encode(w);
		self.flags.encode(w);
		self.object_length.encode(w);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wire::tests::{decode_message, encode_message};

	#[test]
	fn warp_header_round_trip() {
		let msg = WarpHeader {
			media_id: 2,
			group_id: 9,
		};
		let decoded: WarpHeader = decode_message(&encode_message(&msg)).unwrap();
		assert_eq!(decoded, msg);
	}

	#[test]
	fn object_header_round_trip() {
		let msg = ObjectHeader {
			object_id: 4,
			nb_objects_previous_group: 30,
			flags: 0x81,
			object_length: 64_000,
		};
		let decoded: ObjectHeader = decode_message(&encode_message(&msg)).unwrap();
		assert_eq!(decoded, msg);
	}

	#[test]
	fn zero_length_object_header() {
		let msg = ObjectHeader {
			object_id: 0,
			nb_objects_previous_group: 0,
			flags: crate::FLAGS_SKIPPED,
			object_length: 0,
		};
		let decoded: ObjectHeader = decode_message(&encode_message(&msg)).unwrap();
		assert_eq!(decoded, msg);
	}
}
