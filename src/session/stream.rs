use std::collections::VecDeque;

use bytes::Bytes;

use crate::{
	AckEngine, CloseReason, Consumer, Error, FLAGS_SKIPPED, FragmentCursor, Location, Publisher, StreamChunk,
	Transport, TransportMode,
	coding::{FrameBuffer, SendBuffer},
	wire::{self, Message},
};

/// What a control stream is about to send, in priority order when `Ready`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SendState {
	/// Draining the initial REQUEST, POST or ACCEPT message.
	Initial,
	/// Between messages; pick the next thing by priority.
	Ready,
	/// Sending media fragments inline on this stream.
	SingleStream,
	/// Re-sending a fragment reliably after the datagram queue refused it.
	Repair,
	StartPoint,
	FinalPoint,
	CachePolicy,
	Subscribe,
	Notify,
	WaitingNotify,
	NotifyReady,
	Fin,
	NoMore,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RecvState {
	/// Client side of a POST, waiting for ACCEPT.
	NotReady,
	/// Freshly opened by the peer; expecting REQUEST, POST or SUBSCRIBE.
	Initial,
	/// Subscribed; expecting START_POINT, FIN, CACHE_POLICY and FRAGMENT.
	Fragment,
	/// Subscribed to a URL pattern; expecting NOTIFY.
	Notify,
	/// No further messages are expected.
	Done,
}

/// The media feeding a sending stream.
pub(crate) enum SenderMedia {
	/// A cache-backed cursor; required for datagram, warp and rush modes.
	Cursor(FragmentCursor),
	/// An application publisher; single-stream mode only.
	External(Box<dyn Publisher>),
}

impl SenderMedia {
	pub fn publisher(&mut self) -> &mut dyn Publisher {
		match self {
			Self::Cursor(cursor) => cursor,
			Self::External(publisher) => publisher.as_mut(),
		}
	}

	pub fn cursor(&mut self) -> Option<&mut FragmentCursor> {
		match self {
			Self::Cursor(cursor) => Some(cursor),
			Self::External(_) => None,
		}
	}
}

/// Per-subscription bidirectional stream state.
pub(crate) struct StreamCtx {
	pub stream_id: u64,
	pub media_id: Option<u64>,
	pub transport_mode: TransportMode,
	pub is_sender: bool,
	pub send_state: SendState,
	pub recv_state: RecvState,
	pub recv_buffer: FrameBuffer,
	pub send_buffer: SendBuffer,
	pub url: Option<Bytes>,

	/// Next object and offset to send in single-stream mode.
	pub next: Location,
	pub next_offset: u64,
	/// Start point; zero means none (the media starts at its beginning).
	pub start: Location,
	pub final_location: Option<Location>,
	pub is_start_sent: bool,
	pub is_final_sent: bool,
	pub is_cache_policy_sent: bool,
	pub cache_real_time: bool,

	pub is_local_finished: bool,
	pub is_peer_finished: bool,
	pub is_active_datagram: bool,
	pub close_reason: Option<CloseReason>,

	pub sender: Option<SenderMedia>,
	pub consumer: Option<Box<dyn Consumer>>,
	pub ack: AckEngine,
	/// Fragments to re-send reliably on this stream.
	pub repair_queue: VecDeque<wire::Fragment>,

	pub subscribe_prefix: Option<Bytes>,
	pub notify_queue: VecDeque<Bytes>,
	pub notify_fn: Option<Box<dyn FnMut(&[u8])>>,

	/// Next group (warp) or object (rush) that needs a substream.
	pub next_uni: Location,
}

pub(crate) fn queue_message<M: Message>(buffer: &mut SendBuffer, msg: &M) {
	let body = msg.encode_bytes();
	tracing::trace!(size = body.len(), hex = %hex::encode(&body), "encoded control message");
	buffer.queue(&body);
}

impl StreamCtx {
	pub fn new(stream_id: u64) -> Self {
		Self {
			stream_id,
			media_id: None,
			transport_mode: TransportMode::SingleStream,
			is_sender: false,
			send_state: SendState::Ready,
			recv_state: RecvState::Initial,
			recv_buffer: FrameBuffer::default(),
			send_buffer: SendBuffer::default(),
			url: None,
			next: Location::ZERO,
			next_offset: 0,
			start: Location::ZERO,
			final_location: None,
			is_start_sent: false,
			is_final_sent: false,
			is_cache_policy_sent: false,
			cache_real_time: false,
			is_local_finished: false,
			is_peer_finished: false,
			is_active_datagram: false,
			close_reason: None,
			sender: None,
			consumer: None,
			ack: AckEngine::default(),
			repair_queue: VecDeque::new(),
			subscribe_prefix: None,
			notify_queue: VecDeque::new(),
			notify_fn: None,
			next_uni: Location::ZERO,
		}
	}

	/// Fill the next chunk for this stream; the core of the send state machine.
	pub fn prepare_send(&mut self, transport: &mut dyn Transport, space: usize, now: u64) -> Result<StreamChunk, Error> {
		if self.send_state == SendState::Ready {
			if self.is_sender {
				self.pick_next_message(transport, now);
			} else {
				// Nothing for a receiver to send between messages.
				transport.mark_stream_active(self.stream_id, false);
			}
		} else if self.send_state == SendState::NotifyReady {
			if let Some(url) = self.notify_queue.pop_front() {
				tracing::debug!(stream = self.stream_id, url = %String::from_utf8_lossy(&url), "sending notify");
				queue_message(&mut self.send_buffer, &wire::Notify { url });
				self.send_state = SendState::Notify;
			}
		}

		match self.send_state {
			SendState::Ready | SendState::WaitingNotify | SendState::NotifyReady | SendState::NoMore => {
				transport.mark_stream_active(self.stream_id, false);
				Ok(StreamChunk::empty())
			}
			SendState::SingleStream => self.send_media_chunk(transport, space, now),
			SendState::Initial => {
				let more = self.final_location.is_some() && !self.is_final_sent;
				Ok(self.drain(space, more, SendState::Ready))
			}
			SendState::Repair => {
				let more = !self.repair_queue.is_empty();
				Ok(self.drain(space, more, SendState::Ready))
			}
			SendState::StartPoint => {
				let more = self.cache_real_time && !self.is_cache_policy_sent;
				let chunk = self.drain(space, more, SendState::Ready);
				if self.send_buffer.is_empty() {
					self.is_start_sent = true;
				}
				Ok(chunk)
			}
			SendState::FinalPoint => {
				let chunk = self.drain(space, false, SendState::Ready);
				if self.send_buffer.is_empty() {
					self.is_final_sent = true;
					self.close_reason.get_or_insert(CloseReason::Finished);
				}
				Ok(chunk)
			}
			SendState::CachePolicy => {
				let more = !self.is_start_sent && !self.start.is_zero();
				let chunk = self.drain(space, more, SendState::Ready);
				if self.send_buffer.is_empty() {
					self.is_cache_policy_sent = true;
				}
				Ok(chunk)
			}
			SendState::Subscribe => Ok(self.drain(space, false, SendState::WaitingNotify)),
			SendState::Notify => {
				let more = !self.notify_queue.is_empty();
				Ok(self.drain(space, more, SendState::NotifyReady))
			}
			SendState::Fin => {
				self.send_state = SendState::NoMore;
				self.is_local_finished = true;
				if self.is_peer_finished {
					self.close_reason.get_or_insert(CloseReason::RemoteApplication);
				}
				Ok(StreamChunk {
					data: Vec::new(),
					fin: true,
					still_active: false,
				})
			}
		}
	}

	/// When `Ready`, decide what to send next. First match wins.
	fn pick_next_message(&mut self, transport: &mut dyn Transport, now: u64) {
		if !self.start.is_zero() && !self.is_start_sent {
			tracing::debug!(stream = self.stream_id, start = %self.start, "sending start point");
			queue_message(&mut self.send_buffer, &wire::StartPoint { start: self.start });
			self.send_state = SendState::StartPoint;
		} else if self.final_location.is_some() && !self.is_final_sent {
			let last = self.final_location.expect("final location set");
			tracing::debug!(stream = self.stream_id, %last, "sending final point");
			queue_message(&mut self.send_buffer, &wire::FinDatagram { last });
			self.send_state = SendState::FinalPoint;
		} else if self.cache_real_time && !self.is_cache_policy_sent {
			tracing::debug!(stream = self.stream_id, "sending cache policy");
			queue_message(&mut self.send_buffer, &wire::CachePolicy { real_time: true });
			self.send_state = SendState::CachePolicy;
		} else if let Some(fragment) = self.repair_queue.pop_front() {
			tracing::debug!(stream = self.stream_id, location = %fragment.location, "sending stream repair");
			queue_message(&mut self.send_buffer, &fragment);
			self.send_state = SendState::Repair;
		} else if self.transport_mode == TransportMode::SingleStream && !self.is_final_sent && self.media_is_ready(now) {
			self.send_state = SendState::SingleStream;
		} else {
			transport.mark_stream_active(self.stream_id, false);
		}
	}

	fn media_is_ready(&mut self, now: u64) -> bool {
		let Some(sender) = self.sender.as_mut() else {
			return false;
		};
		match sender.publisher().get_data(None, usize::MAX, now) {
			Ok(poll) => poll.len > 0 || poll.is_still_active || poll.is_media_finished,
			Err(_) => false,
		}
	}

	fn drain(&mut self, space: usize, more_to_send: bool, next_state: SendState) -> StreamChunk {
		let data = self.send_buffer.pull(space);
		if self.send_buffer.is_empty() {
			self.send_state = next_state;
		}
		StreamChunk {
			data: data.to_vec(),
			fin: false,
			still_active: more_to_send || !self.send_buffer.is_empty(),
		}
	}

	/// Send media fragments inline on the stream, reusing the FRAGMENT
	/// message as the framing.
	fn send_media_chunk(&mut self, transport: &mut dyn Transport, space: usize, now: u64) -> Result<StreamChunk, Error> {
		// Room for the frame length prefix plus a worst-case fragment header.
		let overhead = 2 + wire::Fragment::HEADER_MAX;
		if space <= overhead {
			return Ok(StreamChunk {
				data: Vec::new(),
				fin: false,
				still_active: true,
			});
		}

		let publisher = self
			.sender
			.as_mut()
			.ok_or(Error::StateViolation)?
			.publisher();
		let probe = publisher.get_data(None, space - overhead, now)?;

		let mut nb_objects_previous_group = 0;
		if probe.is_new_group {
			nb_objects_previous_group = self.next.object;
			self.next = self.next.next_group();
			self.next_offset = 0;
		}

		if probe.should_skip {
			publisher.skip_object(now)?;
			let placeholder = wire::Fragment {
				location: self.next,
				nb_objects_previous_group,
				offset: 0,
				object_length: 0,
				flags: FLAGS_SKIPPED,
				data: Bytes::new(),
			};
			tracing::debug!(stream = self.stream_id, location = %self.next, "skipping object");
			self.next = self.next.next_object();
			self.next_offset = 0;
			return Ok(frame_chunk(&placeholder, true));
		}

		if probe.len == 0 {
			if probe.is_media_finished {
				// Send the fin object immediately; there may never be another
				// prepare callback after an empty response.
				self.final_location = Some(self.next);
				self.is_final_sent = true;
				self.is_local_finished = true;
				self.close_reason.get_or_insert(CloseReason::Finished);
				self.send_state = SendState::NoMore;
				tracing::debug!(stream = self.stream_id, last = %self.next, "sending fin inline");
				let mut chunk = frame_chunk(&wire::FinDatagram { last: self.next }, false);
				chunk.fin = true;
				return Ok(chunk);
			}
			if probe.is_still_active && probe.object_length == 0 {
				// A zero-length object still needs its fragment on the wire.
				let empty = wire::Fragment {
					location: self.next,
					nb_objects_previous_group,
					offset: 0,
					object_length: 0,
					flags: probe.flags,
					data: Bytes::new(),
				};
				publisher.skip_object(now)?;
				self.next = self.next.next_object();
				self.next_offset = 0;
				return Ok(frame_chunk(&empty, true));
			}
			if probe.is_still_active {
				// The source wants a larger window than this callback offers.
				return Ok(StreamChunk {
					data: Vec::new(),
					fin: false,
					still_active: true,
				});
			}
			// No data yet; wait for a wakeup.
			transport.mark_stream_active(self.stream_id, false);
			return Ok(StreamChunk::empty());
		}

		let take = probe.len.min(space - overhead);
		let mut data = vec![0u8; take];
		let read = publisher.get_data(Some(&mut data), take, now)?;
		if read.len != take {
			return Err(Error::MediaContract);
		}

		let fragment = wire::Fragment {
			location: self.next,
			nb_objects_previous_group,
			offset: self.next_offset,
			object_length: probe.object_length,
			flags: probe.flags,
			data: Bytes::from(data),
		};
		let is_last = self.next_offset + take as u64 >= probe.object_length;
		if is_last {
			tracing::trace!(stream = self.stream_id, location = %self.next, "final fragment of object");
		}

		self.next_offset += take as u64;
		if self.next_offset >= probe.object_length {
			self.next = self.next.next_object();
			self.next_offset = 0;
		}
		if read.is_media_finished {
			self.final_location = Some(self.next);
			self.send_state = SendState::Ready;
		}

		Ok(frame_chunk(&fragment, true))
	}

	/// The peer finished cleanly (stream FIN). Returns true when the stream
	/// context should be deleted.
	pub fn on_peer_fin(&mut self, transport: &mut dyn Transport) -> bool {
		self.is_peer_finished = true;
		if self.is_local_finished {
			self.close_reason.get_or_insert(CloseReason::RemoteApplication);
			true
		} else {
			self.send_state = SendState::Fin;
			transport.mark_stream_active(self.stream_id, true);
			false
		}
	}

	/// The consumer has everything: close this stream gracefully.
	pub fn on_consumer_finished(&mut self, transport: &mut dyn Transport) {
		self.close_reason.get_or_insert(CloseReason::Finished);
		if !self.is_local_finished && self.send_state != SendState::Fin {
			self.send_state = SendState::Fin;
			transport.mark_stream_active(self.stream_id, true);
		}
	}

	/// Close the media contexts attached to this stream.
	pub fn close_media(&mut self, reason: CloseReason) {
		let reason = self.close_reason.unwrap_or(reason);
		if let Some(sender) = self.sender.as_mut() {
			sender.publisher().close(reason);
		}
		if let Some(consumer) = self.consumer.as_mut() {
			consumer.close(reason);
		}
		self.ack.release();
	}
}

fn frame_chunk<M: Message>(msg: &M, still_active: bool) -> StreamChunk {
	let body = msg.encode_bytes();
	let mut data = Vec::with_capacity(2 + body.len());
	data.extend_from_slice(&(body.len() as u16).to_be_bytes());
	data.extend_from_slice(&body);
	StreamChunk {
		data,
		fin: false,
		still_active,
	}
}
