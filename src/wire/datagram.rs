use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
	Location,
	coding::{Decode, DecodeError, Encode},
};

/// The header of a datagram fragment. Not length-prefixed: the payload is the
/// remainder of the datagram.
///
/// `queue_delay` is in milliseconds and accumulates across hops and repeats,
/// letting downstream relays spot fragments that already spent their budget.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatagramHeader {
	pub media_id: u64,
	pub location: Location,
	pub offset: u64,
	pub queue_delay: u64,
	pub flags: u8,
	pub nb_objects_previous_group: u64,
	pub object_length: u64,
}

impl DatagramHeader {
	/// Worst-case encoded size of the header.
	pub const MAX_SIZE: usize = 8 * 7 + 1;

	pub fn decode<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		let media_id = u64::decode(r)?;
		let location = Location::decode(r)?;
		let offset = u64::decode(r)?;
		let queue_delay = u64::decode(r)?;
		let flags = u8::decode(r)?;
		let nb_objects_previous_group = u64::decode(r)?;
		let object_length = u64::decode(r)?;

		Ok(Self {
			media_id,
			location,
			offset,
			queue_delay,
			flags,
			nb_objects_previous_group,
			object_length,
		})
	}

	pub fn encode<W: BufMut>(&self, w: &mut W) {
		self.media_id.encode(w);
		self.location.encode(w);
		self.offset.encode(w);
		self.queue_delay.encode(w);
		self.flags.encode(w);
		self.nb_objects_previous_group.encode(w);
		self.object_length.encode(w);
	}

	/// Encode the header followed by the payload into a single datagram.
	pub fn encode_datagram(&self, payload: &[u8]) -> Bytes {
		let mut buf = BytesMut::with_capacity(Self::MAX_SIZE + payload.len());
		self.encode(&mut buf);
		buf.extend_from_slice(payload);
		buf.freeze()
	}

	pub fn encoded_size(&self) -> usize {
		let mut buf = BytesMut::new();
		self.encode(&mut buf);
		buf.len()
	}
}
