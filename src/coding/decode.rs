use std::string::FromUtf8Error;

use thiserror::Error;

/// Read a value from the buffer.
///
/// If [DecodeError::Short] is returned, the caller should try again with more data.
pub trait Decode: Sized {
	/// Decode the value from the given buffer.
	fn decode<B: bytes::Buf>(buf: &mut B) -> Result<Self, DecodeError>;
}

/// A decode error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
	#[error("short buffer")]
	Short,

	#[error("long buffer")]
	Long,

	#[error("invalid string")]
	InvalidString(#[from] FromUtf8Error),

	#[error("invalid message: {0:?}")]
	InvalidMessage(u64),

	#[error("invalid value")]
	InvalidValue,

	#[error("bounds exceeded")]
	BoundsExceeded,

	#[error("expected end")]
	ExpectedEnd,
}

impl Decode for bool {
	fn decode<R: bytes::Buf>(r: &mut R) -> Result<Self, DecodeError> {
		match u8::decode(r)? {
			0 => Ok(false),
			1 => Ok(true),
			_ => Err(DecodeError::InvalidValue),
		}
	}
}

impl Decode for u8 {
	fn decode<R: bytes::Buf>(r: &mut R) -> Result<Self, DecodeError> {
		match r.has_remaining() {
			true => Ok(r.get_u8()),
			false => Err(DecodeError::Short),
		}
	}
}

impl Decode for u16 {
	fn decode<R: bytes::Buf>(r: &mut R) -> Result<Self, DecodeError> {
		match r.remaining() >= 2 {
			true => Ok(r.get_u16()),
			false => Err(DecodeError::Short),
		}
	}
}

/// QUIC-style variable length integer: the two high bits of the first byte
/// give the length (1, 2, 4 or 8 bytes), big-endian.
impl Decode for u64 {
	fn decode<R: bytes::Buf>(r: &mut R) -> Result<Self, DecodeError> {
		if !r.has_remaining() {
			return Err(DecodeError::Short);
		}

		let first = r.get_u8();
		let size = 1usize << (first >> 6);
		let mut value = (first & 0x3f) as u64;

		if r.remaining() < size - 1 {
			return Err(DecodeError::Short);
		}

		for _ in 1..size {
			value = (value << 8) | r.get_u8() as u64;
		}

		Ok(value)
	}
}

impl Decode for usize {
	fn decode<R: bytes::Buf>(r: &mut R) -> Result<Self, DecodeError> {
		let value = u64::decode(r)?;
		usize::try_from(value).map_err(|_| DecodeError::BoundsExceeded)
	}
}

impl Decode for String {
	/// Decode a string with a varint length prefix.
	fn decode<R: bytes::Buf>(r: &mut R) -> Result<Self, DecodeError> {
		let v = Vec::<u8>::decode(r)?;
		let str = String::from_utf8(v)?;

		Ok(str)
	}
}

impl Decode for Vec<u8> {
	fn decode<B: bytes::Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		let size = usize::decode(buf)?;

		if buf.remaining() < size {
			return Err(DecodeError::Short);
		}

		let bytes = buf.copy_to_bytes(size);
		Ok(bytes.to_vec())
	}
}

impl Decode for bytes::Bytes {
	fn decode<R: bytes::Buf>(r: &mut R) -> Result<Self, DecodeError> {
		let len = usize::decode(r)?;
		if r.remaining() < len {
			return Err(DecodeError::Short);
		}
		let bytes = r.copy_to_bytes(len);
		Ok(bytes)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::coding::Encode;
	use bytes::Buf;

	#[test]
	fn varint_round_trip() {
		for value in [0u64, 1, 63, 64, 16383, 16384, (1 << 30) - 1, 1 << 30, (1 << 62) - 1] {
			let mut buf = bytes::BytesMut::new();
			value.encode(&mut buf);
			let mut r = buf.freeze();
			assert_eq!(u64::decode(&mut r), Ok(value));
			assert!(!r.has_remaining());
		}
	}

	#[test]
	fn varint_sizes() {
		let sizes = [(0u64, 1usize), (63, 1), (64, 2), (16383, 2), (16384, 4), ((1 << 30) - 1, 4), (1 << 30, 8)];
		for (value, size) in sizes {
			let mut buf = bytes::BytesMut::new();
			value.encode(&mut buf);
			assert_eq!(buf.len(), size, "value {value}");
		}
	}

	#[test]
	fn varint_short_buffer() {
		let mut buf = bytes::BytesMut::new();
		16384u64.encode(&mut buf);
		let mut truncated = buf.freeze().slice(..2);
		assert_eq!(u64::decode(&mut truncated), Err(DecodeError::Short));
	}

	#[test]
	fn bytes_length_overflow() {
		let mut buf = bytes::BytesMut::new();
		100usize.encode(&mut buf);
		buf.extend_from_slice(b"too short");
		let mut r = buf.freeze();
		assert_eq!(bytes::Bytes::decode(&mut r), Err(DecodeError::Short));
	}
}
