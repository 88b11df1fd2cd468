use bytes::{Buf, BufMut, Bytes};

use crate::{
	Location, SubscribeIntent, TransportMode,
	coding::{Decode, DecodeError, Encode},
	wire::{Message, MessageType},
};

/// Sent by a subscriber to request a media stream by URL.
///
/// The requester allocates the media alias that the responder will place in
/// datagram and warp headers for this subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
	pub url: Bytes,
	pub media_id: u64,
	pub transport_mode: TransportMode,
	pub intent: SubscribeIntent,
}

impl Message for Request {
	const TYPE: MessageType = MessageType::Request;

	fn decode_msg<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		let url = Bytes::decode(r)?;
		let media_id = u64::decode(r)?;
		let transport_mode = TransportMode::decode(r)?;
		let intent = SubscribeIntent::decode(r)?;

		Ok(Self {
			url,
			media_id,
			transport_mode,
			intent,
		})
	}

	fn encode_msg<W: BufMut>(&self, w: &mut W) {
		self.url.encode(w);
		self.media_id.encode(w);
		self.transport_mode.encode(w);
		self.intent.encode(w);
	}
}

/// Sent by a publisher to push a media stream to the peer.
///
/// The start location is the first object the publisher will send; the
/// receiver treats it exactly like a start point learned from REQUEST intent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Post {
	pub url: Bytes,
	pub transport_mode: TransportMode,
	pub cache_real_time: bool,
	pub start: Location,
}

impl Message for Post {
	const TYPE: MessageType = MessageType::Post;

	fn decode_msg<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		let url = Bytes::decode(r)?;
		let transport_mode = TransportMode::decode(r)?;
		let cache_real_time = bool::decode(r)?;
		let start = Location::decode(r)?;

		Ok(Self {
			url,
			transport_mode,
			cache_real_time,
			start,
		})
	}

	fn encode_msg<W: BufMut>(&self, w: &mut W) {
		self.url.encode(w);
		self.transport_mode.encode(w);
		self.cache_real_time.encode(w);
		self.start.encode(w);
	}
}

/// Accepts a POST, assigning the media alias the publisher must use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Accept {
	pub transport_mode: TransportMode,
	pub media_id: u64,
}

impl Message for Accept {
	const TYPE: MessageType = MessageType::Accept;

	fn decode_msg<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		let transport_mode = TransportMode::decode(r)?;
		let media_id = u64::decode(r)?;

		Ok(Self { transport_mode, media_id })
	}

	fn encode_msg<W: BufMut>(&self, w: &mut W) {
		self.transport_mode.encode(w);
		self.media_id.encode(w);
	}
}
