use bytes::{Buf, BufMut};

use crate::{
	coding::{Decode, DecodeError, Encode},
	wire::{Message, MessageType},
};

/// Tells the receiver that intermediaries should cache this media for
/// real-time fan-out only, not for on-demand replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachePolicy {
	pub real_time: bool,
}

impl Message for CachePolicy {
	const TYPE: MessageType = MessageType::CachePolicy;

	fn decode_msg<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Self {
			real_time: bool::decode(r)?,
		})
	}

	fn encode_msg<W: BufMut>(&self, w: &mut W) {
		self.real_time.encode(w);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wire::tests::{decode_message, encode_message};

	#[test]
	fn cache_policy_round_trip() {
		for real_time in [false, true] {
			let msg = CachePolicy { real_time };
			let decoded: CachePolicy = decode_message(&encode_message(&msg)).unwrap();
			assert_eq!(decoded, msg);
		}
	}

	#[test]
	fn cache_policy_rejects_bad_flag() {
		let result: Result<CachePolicy, _> = decode_message(&[7]);
		assert_eq!(result, Err(DecodeError::InvalidValue));
	}
}
