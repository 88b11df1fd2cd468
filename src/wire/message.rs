use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::coding::{Decode, DecodeError, Encode};

use super::{
	Accept, CachePolicy, FinDatagram, Fragment, Notify, ObjectHeader, Post, Request, StartPoint, Subscribe, WarpHeader,
};

/// The action identifying each control message on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u64)]
pub enum MessageType {
	Request = 1,
	Post = 2,
	Accept = 3,
	StartPoint = 4,
	FinDatagram = 5,
	Fragment = 6,
	CachePolicy = 7,
	Subscribe = 8,
	Notify = 9,
	WarpHeader = 10,
	ObjectHeader = 11,
}

impl Decode for MessageType {
	fn decode<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		let t = u64::decode(r)?;
		Self::try_from(t).map_err(|_| DecodeError::InvalidMessage(t))
	}
}

impl Encode for MessageType {
	fn encode<W: BufMut>(&self, w: &mut W) {
		u64::from(*self).encode(w)
	}
}

/// A control message: a type varint followed by type-specific fields.
pub trait Message: Sized {
	const TYPE: MessageType;

	fn decode_msg<R: Buf>(r: &mut R) -> Result<Self, DecodeError>;
	fn encode_msg<W: BufMut>(&self, w: &mut W);

	/// Encode the message including its type prefix.
	fn encode<W: BufMut>(&self, w: &mut W) {
		Self::TYPE.encode(w);
		self.encode_msg(w);
	}

	/// Encode the message including its type prefix into a fresh buffer.
	fn encode_bytes(&self) -> Bytes {
		let mut buf = BytesMut::new();
		self.encode(&mut buf);
		buf.freeze()
	}
}

/// Any control message, dispatched on the type prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMessage {
	Request(Request),
	Post(Post),
	Accept(Accept),
	StartPoint(StartPoint),
	FinDatagram(FinDatagram),
	Fragment(Fragment),
	CachePolicy(CachePolicy),
	Subscribe(Subscribe),
	Notify(Notify),
	WarpHeader(WarpHeader),
	ObjectHeader(ObjectHeader),
}

impl ControlMessage {
	/// Decode a full message frame, rejecting trailing garbage.
	pub fn decode_frame(frame: &Bytes) -> Result<Self, DecodeError> {
		let mut r = frame.clone();
		let msg = Self::decode(&mut r)?;
		if r.has_remaining() {
			return Err(DecodeError::ExpectedEnd);
		}
		Ok(msg)
	}

	/// Encode with the type prefix, whichever message this is.
	pub fn encode_bytes(&self) -> Bytes {
		match self {
			Self::Request(m) => m.encode_bytes(),
			Self::Post(m) => m.encode_bytes(),
			Self::Accept(m) => m.encode_bytes(),
			Self::StartPoint(m) => m.encode_bytes(),
			Self::FinDatagram(m) => m.encode_bytes(),
			Self::Fragment(m) => m.encode_bytes(),
			Self::CachePolicy(m) => m.encode_bytes(),
			Self::Subscribe(m) => m.encode_bytes(),
			Self::Notify(m) => m.encode_bytes(),
			Self::WarpHeader(m) => m.encode_bytes(),
			Self::ObjectHeader(m) => m.encode_bytes(),
		}
	}
}

impl Decode for ControlMessage {
	fn decode<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(match MessageType::decode(r)? {
			MessageType::Request => Self::Request(Request::decode_msg(r)?),
			MessageType::Post => Self::Post(Post::decode_msg(r)?),
			MessageType::Accept => Self::Accept(Accept::decode_msg(r)?),
			MessageType::StartPoint => Self::StartPoint(StartPoint::decode_msg(r)?),
			MessageType::FinDatagram => Self::FinDatagram(FinDatagram::decode_msg(r)?),
			MessageType::Fragment => Self::Fragment(Fragment::decode_msg(r)?),
			MessageType::CachePolicy => Self::CachePolicy(CachePolicy::decode_msg(r)?),
			MessageType::Subscribe => Self::Subscribe(Subscribe::decode_msg(r)?),
			MessageType::Notify => Self::Notify(Notify::decode_msg(r)?),
			MessageType::WarpHeader => Self::WarpHeader(WarpHeader::decode_msg(r)?),
			MessageType::ObjectHeader => Self::ObjectHeader(ObjectHeader::decode_msg(r)?),
		})
	}
}
