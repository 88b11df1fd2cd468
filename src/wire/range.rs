use bytes::{Buf, BufMut};

use crate::{
	Location,
	coding::{Decode, DecodeError, Encode},
	wire::{Message, MessageType},
};

/// The first object the sender will deliver; anything earlier was skipped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StartPoint {
	pub start: Location,
}

impl Message for StartPoint {
	const TYPE: MessageType = MessageType::StartPoint;

	fn decode_msg<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Self {
			start: Location::decode(r)?,
		})
	}

	fn encode_msg<W: BufMut>(&self, w: &mut W) {
		self.start.encode(w);
	}
}

/// The exclusive end of the media: no object at or past this location exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FinDatagram {
	pub last: Location,
}

impl Message for FinDatagram {
	const TYPE: MessageType = MessageType::FinDatagram;

	fn decode_msg<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Self {
			last: Location::decode(r)?,
		})
	}

	fn encode_msg<W: BufMut>(&self, w: &mut W) {
		self.last.encode(w);
	}
}
