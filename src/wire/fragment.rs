use bytes::{Buf, BufMut, Bytes};

use crate::{
	Location,
	coding::{Decode, DecodeError, Encode},
	wire::{Message, MessageType},
};

/// A slice of an object carried inline on a stream.
///
/// `nb_objects_previous_group` is nonzero only on the first fragment of the
/// first object of a group past the first; it names the object count of the
/// group just closed, which is what allows in-order progression across the
/// boundary under loss.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
	pub location: Location,
	pub nb_objects_previous_group: u64,
	pub offset: u64,
	pub object_length: u64,
	pub flags: u8,
	pub data: Bytes,
}

impl Message for Fragment {
	const TYPE: MessageType = MessageType::Fragment;

	fn decode_msg<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		let location = Location::decode(r)?;
		let nb_objects_previous_group = u64::decode(r)?;
		let offset = u64::decode(r)?;
		let object_length = u64::decode(r)?;
		let flags = u8::decode(r)?;
		let data = Bytes::decode(r)?;

		Ok(Self {
			location,
			nb_objects_previous_group,
			offset,
			object_length,
			flags,
			data,
		})
	}

	fn encode_msg<W: BufMut>(&self, w: &mut W) {
		self.location.encode(w);
		self.nb_objects_previous_group.encode(w);
		self.offset.encode(w);
		self.object_length.encode(w);
		self.flags.encode(w);
		self.data.encode(w);
	}
}

impl Fragment {
	/// Worst-case encoded size including the message type prefix and the
	/// payload length varint, excluding the payload bytes themselves.
	pub const HEADER_MAX: usize = 1 + 8 * 5 + 1 + 8;
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wire::tests::{decode_message, encode_message};

	#[test]
	fn fragment_round_trip() {
		let msg = Fragment {
			location: Location::new(1, 0),
			nb_objects_previous_group: 18,
			offset: 1200,
			object_length: 20000,
			flags: 0x82,
			data: Bytes::from_static(b"payload bytes"),
		};

		let decoded: Fragment = decode_message(&encode_message(&msg)).unwrap();
		assert_eq!(decoded, msg);
	}

	#[test]
	fn placeholder_round_trip() {
		// A skipped object: zero length, flags 0xff, no payload.
		let msg = Fragment {
			location: Location::new(0, 4),
			nb_objects_previous_group: 0,
			offset: 0,
			object_length: 0,
			flags: crate::FLAGS_SKIPPED,
			data: Bytes::new(),
		};

		let decoded: Fragment = decode_message(&encode_message(&msg)).unwrap();
		assert_eq!(decoded, msg);
	}

	#[test]
	fn payload_overrun_rejected() {
		let msg = Fragment {
			location: Location::new(0, 0),
			nb_objects_previous_group: 0,
			offset: 0,
			object_length: 100,
			flags: 0,
			data: Bytes::from_static(b"0123456789"),
		};
		let encoded = encode_message(&msg);
		let result: Result<Fragment, _> = decode_message(&encoded[..encoded.len() - 3]);
		assert_eq!(result, Err(DecodeError::Short));
	}
}
