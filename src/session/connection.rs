use std::collections::BTreeMap;

use bytes::Bytes;

use crate::{
	CacheConsumer, CloseReason, Consumer, Error, FLAGS_SKIPPED, FragmentCursor, FragmentIn, FragmentKey, Location,
	ObjectSource, Progress, StreamChunk, Transport, TransportMode, is_unidirectional,
	wire::{self, ControlMessage, DatagramHeader},
};

use super::endpoint::Config;
use super::stream::{RecvState, SendState, SenderMedia, StreamCtx, queue_message};
use super::unistream::{UniRecvState, UniSendState, UniStreamCtx, check_incoming_object_order, prepare_uni_send};

/// Local media sources and the state shared by every connection.
#[derive(Default)]
pub(crate) struct Registry {
	pub sources: Vec<ObjectSource>,
	/// URLs registered since the last NOTIFY fan-out.
	pub announcements: Vec<Bytes>,
	/// Fragments received below the subscription's start point.
	pub useless_fragments: u64,
}

impl Registry {
	pub fn find_source(&self, url: &[u8]) -> Option<&ObjectSource> {
		self.sources.iter().find(|source| source.url().as_ref() == url)
	}

	pub fn register(&mut self, source: ObjectSource) -> usize {
		tracing::debug!(url = %String::from_utf8_lossy(source.url()), "registering media source");
		self.announcements.push(source.url().clone());
		self.sources.push(source);
		self.sources.len() - 1
	}
}

/// Per-connection state: control streams and unidirectional substreams.
pub(crate) struct Connection {
	pub id: u64,
	pub is_server: bool,
	pub streams: BTreeMap<u64, StreamCtx>,
	pub uni_streams: BTreeMap<u64, UniStreamCtx>,
	/// Allocator for receiver-side media aliases (REQUEST and ACCEPT).
	pub next_media_id: u64,
	last_datagram_stream: u64,
}

/// Convert a consumer result, turning `Finished` into a graceful stream FIN.
fn handle_progress(stream: &mut StreamCtx, transport: &mut dyn Transport, result: Result<Progress, Error>) -> Result<(), Error> {
	match result? {
		Progress::Active => Ok(()),
		Progress::Finished => {
			tracing::debug!(stream = stream.stream_id, "consumer finished");
			stream.on_consumer_finished(transport);
			Ok(())
		}
	}
}

impl Connection {
	pub fn new(id: u64, is_server: bool) -> Self {
		Self {
			id,
			is_server,
			streams: BTreeMap::new(),
			uni_streams: BTreeMap::new(),
			next_media_id: 0,
			last_datagram_stream: 0,
		}
	}

	/// Data arrived on a bidirectional stream.
	pub fn receive_stream_data(
		&mut self,
		registry: &mut Registry,
		config: &Config,
		transport: &mut dyn Transport,
		stream_id: u64,
		data: &[u8],
		fin: bool,
		now: u64,
	) -> Result<(), Error> {
		let mut frames = Vec::new();
		{
			let stream = self.streams.entry(stream_id).or_insert_with(|| StreamCtx::new(stream_id));
			let mut input = data;
			while let Some(frame) = stream.recv_buffer.absorb(&mut input) {
				frames.push(frame);
			}
		}

		for frame in frames {
			let msg = ControlMessage::decode_frame(&frame)?;
			self.on_control_message(registry, config, transport, stream_id, msg, now)?;
		}

		if fin {
			let delete = self
				.streams
				.get_mut(&stream_id)
				.is_some_and(|stream| stream.on_peer_fin(transport));
			if delete {
				self.delete_stream(stream_id, transport, CloseReason::RemoteApplication);
			}
		}
		Ok(())
	}

	fn on_control_message(
		&mut self,
		registry: &mut Registry,
		config: &Config,
		transport: &mut dyn Transport,
		stream_id: u64,
		msg: ControlMessage,
		now: u64,
	) -> Result<(), Error> {
		match msg {
			ControlMessage::Request(request) => {
				let stream = self.streams.get_mut(&stream_id).ok_or(Error::UnknownStream(stream_id))?;
				if stream.recv_state != RecvState::Initial {
					tracing::debug!(stream = stream_id, "unexpected request");
					return Err(Error::StateViolation);
				}
				tracing::debug!(
					stream = stream_id,
					url = %String::from_utf8_lossy(&request.url),
					mode = ?request.transport_mode,
					media_id = request.media_id,
					"received request"
				);
				let source = registry.find_source(&request.url).ok_or(Error::SourceNotFound)?;
				let cache = source.cache();
				let mut cursor = FragmentCursor::new(cache.clone(), config.congestion_control_mode);

				let current_group = cache.borrow().current_group();
				let intent = match request.intent {
					crate::SubscribeIntent::CurrentGroup => Location::new(current_group, 0),
					crate::SubscribeIntent::NextGroup => Location::new(current_group + 1, 0),
					crate::SubscribeIntent::StartPoint(start) => start,
				};

				stream.media_id = Some(request.media_id);
				stream.transport_mode = request.transport_mode;
				stream.url = Some(request.url.clone());
				stream.is_sender = true;
				stream.cache_real_time = source.is_real_time();
				if !intent.is_zero() {
					stream.start = intent;
					stream.next = intent;
					cursor.set_position(intent);
				}
				stream.next_uni = Location::new(intent.group, intent.object);
				stream.sender = Some(SenderMedia::Cursor(cursor));
				stream.recv_state = RecvState::Done;
				stream.send_state = SendState::Ready;
				transport.mark_stream_active(stream_id, true);
				if request.transport_mode == TransportMode::Datagram {
					stream.is_active_datagram = true;
					transport.mark_datagram_ready(true);
				}
				self.wake_stream(transport, stream_id, now);
				Ok(())
			}
			ControlMessage::Post(post) => {
				let media_id = self.next_media_id;
				let stream = self.streams.get_mut(&stream_id).ok_or(Error::UnknownStream(stream_id))?;
				if stream.recv_state != RecvState::Initial {
					tracing::debug!(stream = stream_id, "unexpected post");
					return Err(Error::StateViolation);
				}
				self.next_media_id += 1;
				tracing::debug!(
					stream = stream_id,
					url = %String::from_utf8_lossy(&post.url),
					mode = ?post.transport_mode,
					media_id,
					"received post"
				);

				// Cache the posted media into a locally registered source so
				// it can be re-served and announced to subscribers.
				let cache = match registry.find_source(&post.url) {
					Some(source) => source.cache(),
					None => {
						let source = ObjectSource::new(post.url.clone(), post.cache_real_time);
						let cache = source.cache();
						registry.register(source);
						cache
					}
				};
				let mut consumer: Box<dyn Consumer> = Box::new(CacheConsumer::new(cache));

				stream.media_id = Some(media_id);
				stream.transport_mode = post.transport_mode;
				stream.url = Some(post.url.clone());
				stream.cache_real_time = post.cache_real_time;
				if !post.start.is_zero() {
					stream.start = post.start;
					consumer.start_point(now, post.start)?;
				}
				stream.consumer = Some(consumer);
				stream.recv_state = RecvState::Fragment;
				queue_message(
					&mut stream.send_buffer,
					&wire::Accept {
						transport_mode: post.transport_mode,
						media_id,
					},
				);
				stream.send_state = SendState::Initial;
				transport.mark_stream_active(stream_id, true);
				Ok(())
			}
			ControlMessage::Accept(accept) => {
				let stream = self.streams.get_mut(&stream_id).ok_or(Error::UnknownStream(stream_id))?;
				if stream.recv_state != RecvState::NotReady {
					return Err(Error::StateViolation);
				}
				tracing::debug!(stream = stream_id, mode = ?accept.transport_mode, media_id = accept.media_id, "post accepted");
				let url = stream.url.clone().ok_or(Error::StateViolation)?;
				let source = registry.find_source(&url).ok_or(Error::SourceNotFound)?;
				let mut cursor = FragmentCursor::new(source.cache(), config.congestion_control_mode);
				if !stream.start.is_zero() {
					cursor.set_position(stream.start);
					stream.next = stream.start;
				}
				stream.media_id = Some(accept.media_id);
				stream.transport_mode = accept.transport_mode;
				stream.is_sender = true;
				stream.next_uni = stream.start;
				stream.sender = Some(SenderMedia::Cursor(cursor));
				// The POST already carried the start point and cache policy.
				stream.is_start_sent = true;
				stream.is_cache_policy_sent = true;
				stream.recv_state = RecvState::Done;
				stream.send_state = SendState::Ready;
				transport.mark_stream_active(stream_id, true);
				if accept.transport_mode == TransportMode::Datagram {
					stream.is_active_datagram = true;
					transport.mark_datagram_ready(true);
				}
				self.wake_stream(transport, stream_id, now);
				Ok(())
			}
			ControlMessage::StartPoint(msg) => {
				let stream = self.streams.get_mut(&stream_id).ok_or(Error::UnknownStream(stream_id))?;
				if stream.recv_state != RecvState::Fragment || !stream.start.is_zero() {
					return Err(Error::StateViolation);
				}
				tracing::debug!(stream = stream_id, start = %msg.start, "start point notified");
				stream.start = msg.start;
				let result = stream
					.consumer
					.as_mut()
					.ok_or(Error::StateViolation)?
					.start_point(now, msg.start);
				handle_progress(stream, transport, result)
			}
			ControlMessage::FinDatagram(msg) => {
				let stream = self.streams.get_mut(&stream_id).ok_or(Error::UnknownStream(stream_id))?;
				if stream.recv_state != RecvState::Fragment || stream.final_location.is_some() {
					return Err(Error::StateViolation);
				}
				tracing::debug!(stream = stream_id, last = %msg.last, "final point notified");
				stream.final_location = Some(msg.last);
				let result = stream
					.consumer
					.as_mut()
					.ok_or(Error::StateViolation)?
					.final_object_id(now, msg.last);
				handle_progress(stream, transport, result)
			}
			ControlMessage::Fragment(fragment) => {
				let stream = self.streams.get_mut(&stream_id).ok_or(Error::UnknownStream(stream_id))?;
				if stream.recv_state != RecvState::Fragment {
					return Err(Error::StateViolation);
				}
				if !stream.start.is_zero() && fragment.location < stream.start {
					registry.useless_fragments += 1;
				}
				let incoming = FragmentIn {
					location: fragment.location,
					offset: fragment.offset,
					queue_delay: 0,
					flags: fragment.flags,
					nb_objects_previous_group: fragment.nb_objects_previous_group,
					object_length: fragment.object_length,
					data: &fragment.data,
				};
				let result = stream
					.consumer
					.as_mut()
					.ok_or(Error::StateViolation)?
					.datagram_ready(now, &incoming);
				handle_progress(stream, transport, result)
			}
			ControlMessage::CachePolicy(policy) => {
				let stream = self.streams.get_mut(&stream_id).ok_or(Error::UnknownStream(stream_id))?;
				if stream.recv_state != RecvState::Fragment || stream.cache_real_time {
					return Err(Error::StateViolation);
				}
				tracing::debug!(stream = stream_id, real_time = policy.real_time, "cache policy");
				stream.cache_real_time = policy.real_time;
				let result = stream
					.consumer
					.as_mut()
					.ok_or(Error::StateViolation)?
					.real_time_cache(now);
				handle_progress(stream, transport, result)
			}
			ControlMessage::Subscribe(subscribe) => {
				let stream = self.streams.get_mut(&stream_id).ok_or(Error::UnknownStream(stream_id))?;
				if stream.recv_state != RecvState::Initial {
					return Err(Error::StateViolation);
				}
				tracing::debug!(
					stream = stream_id,
					prefix = %String::from_utf8_lossy(&subscribe.prefix),
					"received subscribe pattern"
				);
				stream.subscribe_prefix = Some(subscribe.prefix.clone());
				stream.recv_state = RecvState::Done;
				stream.send_state = SendState::NotifyReady;
				// Announce every already known source that matches.
				for source in &registry.sources {
					if source.url().starts_with(subscribe.prefix.as_ref()) {
						stream.notify_queue.push_back(source.url().clone());
					}
				}
				if !stream.notify_queue.is_empty() {
					transport.mark_stream_active(stream_id, true);
				}
				Ok(())
			}
			ControlMessage::Notify(notify) => {
				let stream = self.streams.get_mut(&stream_id).ok_or(Error::UnknownStream(stream_id))?;
				if stream.recv_state != RecvState::Notify {
					return Err(Error::StateViolation);
				}
				tracing::debug!(stream = stream_id, url = %String::from_utf8_lossy(&notify.url), "notified");
				if let Some(callback) = stream.notify_fn.as_mut() {
					callback(&notify.url);
				}
				Ok(())
			}
			ControlMessage::WarpHeader(_) | ControlMessage::ObjectHeader(_) => Err(Error::StateViolation),
		}
	}

	/// Data arrived on a unidirectional (warp/rush) substream.
	pub fn receive_uni_data(
		&mut self,
		transport: &mut dyn Transport,
		stream_id: u64,
		data: &[u8],
		fin: bool,
		now: u64,
	) -> Result<(), Error> {
		self.uni_streams
			.entry(stream_id)
			.or_insert_with(|| UniStreamCtx::new(stream_id, None));

		let mut input = data;
		while !input.is_empty() {
			let uni = self.uni_streams.get_mut(&stream_id).ok_or(Error::UnknownStream(stream_id))?;
			if uni.recv_state == UniRecvState::ObjectData {
				let copied = ((uni.object_length - uni.object_offset).min(input.len() as u64)) as usize;
				let control_id = uni.control_stream_id.ok_or(Error::StateViolation)?;
				let incoming = FragmentIn {
					location: uni.current_location(),
					offset: uni.object_offset,
					queue_delay: 0,
					flags: uni.object_flags,
					nb_objects_previous_group: uni.nb_objects_previous_group,
					object_length: uni.object_length,
					data: &input[..copied],
				};
				uni.object_offset += copied as u64;
				if uni.object_offset >= uni.object_length {
					uni.recv_state = UniRecvState::ObjectHeader;
					uni.objects_seen += 1;
					uni.object_id += 1;
					uni.object_offset = 0;
				}
				let control = self.streams.get_mut(&control_id).ok_or(Error::UnknownStream(control_id))?;
				let result = control
					.consumer
					.as_mut()
					.ok_or(Error::StateViolation)?
					.datagram_ready(now, &incoming);
				handle_progress(control, transport, result)?;
				input = &input[copied..];
			} else {
				let Some(frame) = uni.recv_buffer.absorb(&mut input) else {
					break;
				};
				let msg = ControlMessage::decode_frame(&frame)?;
				self.on_uni_message(transport, stream_id, msg, now)?;
			}
		}

		if fin {
			self.delete_uni_stream(stream_id, transport);
		}
		Ok(())
	}

	fn on_uni_message(
		&mut self,
		transport: &mut dyn Transport,
		stream_id: u64,
		msg: ControlMessage,
		now: u64,
	) -> Result<(), Error> {
		let uni = self.uni_streams.get_mut(&stream_id).ok_or(Error::UnknownStream(stream_id))?;
		match msg {
			ControlMessage::WarpHeader(header) => {
				if uni.recv_state != UniRecvState::Open {
					return Err(Error::StateViolation);
				}
				let control = self
					.streams
					.iter_mut()
					.find(|(_, stream)| !stream.is_sender && stream.media_id == Some(header.media_id))
					.map(|(id, stream)| (*id, stream));
				let Some((control_id, control)) = control else {
					tracing::debug!(stream = stream_id, media_id = header.media_id, "warp header for unknown media");
					return Err(Error::UnknownMedia(header.media_id));
				};
				tracing::debug!(stream = stream_id, control = control_id, group = header.group_id, "warp header");
				uni.control_stream_id = Some(control_id);
				uni.group_id = header.group_id;
				// A late join starts mid-group on the start group.
				uni.object_id = if control.start.group == header.group_id {
					control.start.object
				} else {
					0
				};
				uni.recv_state = UniRecvState::WarpHeader;
				Ok(())
			}
			ControlMessage::ObjectHeader(header) => {
				if uni.recv_state != UniRecvState::WarpHeader && uni.recv_state != UniRecvState::ObjectHeader {
					return Err(Error::StateViolation);
				}
				let control_id = uni.control_stream_id.ok_or(Error::StateViolation)?;
				let control = self.streams.get_mut(&control_id).ok_or(Error::UnknownStream(control_id))?;
				check_incoming_object_order(control.transport_mode, uni, header.object_id)?;

				if header.object_length > 0 {
					uni.recv_state = UniRecvState::ObjectData;
					uni.object_id = header.object_id;
					uni.object_length = header.object_length;
					uni.object_flags = header.flags;
					uni.nb_objects_previous_group = header.nb_objects_previous_group;
					uni.object_offset = 0;
					Ok(())
				} else {
					// Zero length objects complete on the header alone.
					let incoming = FragmentIn {
						location: Location::new(uni.group_id, header.object_id),
						offset: 0,
						queue_delay: 0,
						flags: header.flags,
						nb_objects_previous_group: header.nb_objects_previous_group,
						object_length: 0,
						data: &[],
					};
					uni.objects_seen += 1;
					uni.object_id = header.object_id + 1;
					uni.recv_state = UniRecvState::ObjectHeader;
					let result = control
						.consumer
						.as_mut()
						.ok_or(Error::StateViolation)?
						.datagram_ready(now, &incoming);
					handle_progress(control, transport, result)
				}
			}
			_ => Err(Error::StateViolation),
		}
	}

	/// Fill the next chunk for any stream of this connection.
	pub fn prepare_stream(
		&mut self,
		transport: &mut dyn Transport,
		stream_id: u64,
		space: usize,
		now: u64,
	) -> Result<StreamChunk, Error> {
		if is_unidirectional(stream_id) {
			let uni = self.uni_streams.get_mut(&stream_id).ok_or(Error::UnknownStream(stream_id))?;
			let control_id = uni.control_stream_id.ok_or(Error::StateViolation)?;
			let control = self.streams.get_mut(&control_id).ok_or(Error::UnknownStream(control_id))?;
			let (chunk, finished) = prepare_uni_send(uni, control, transport, space, now)?;
			if finished {
				self.delete_uni_stream(stream_id, transport);
			}
			Ok(chunk)
		} else {
			let stream = self.streams.get_mut(&stream_id).ok_or(Error::UnknownStream(stream_id))?;
			let chunk = stream.prepare_send(transport, space, now)?;
			if stream.is_local_finished && stream.is_peer_finished {
				self.delete_stream(stream_id, transport, CloseReason::RemoteApplication);
			}
			Ok(chunk)
		}
	}

	/// A datagram arrived; route it to the matching subscription.
	pub fn receive_datagram(
		&mut self,
		registry: &mut Registry,
		transport: &mut dyn Transport,
		data: &[u8],
		now: u64,
	) -> Result<(), Error> {
		let mut input = data;
		let header = DatagramHeader::decode(&mut input)?;

		let stream = self.streams.values_mut().find(|stream| {
			!stream.is_sender && stream.transport_mode == TransportMode::Datagram && stream.media_id == Some(header.media_id)
		});
		let Some(stream) = stream else {
			if header.media_id >= self.next_media_id {
				tracing::debug!(media_id = header.media_id, "datagram for unknown media");
				return Err(Error::UnknownMedia(header.media_id));
			}
			// The subscription is already closed; late datagrams are fine.
			return Ok(());
		};

		if !stream.start.is_zero() && header.location < stream.start {
			registry.useless_fragments += 1;
		}
		if header.offset + input.len() as u64 >= header.object_length {
			tracing::trace!(location = %header.location, "received final fragment of object");
		}

		let incoming = FragmentIn {
			location: header.location,
			offset: header.offset,
			queue_delay: header.queue_delay,
			flags: header.flags,
			nb_objects_previous_group: header.nb_objects_previous_group,
			object_length: header.object_length,
			data: input,
		};
		let result = stream
			.consumer
			.as_mut()
			.ok_or(Error::StateViolation)?
			.datagram_ready(now, &incoming);
		handle_progress(stream, transport, result)
	}

	/// Round-robin over datagram senders and produce the next datagram.
	pub fn prepare_datagram(
		&mut self,
		config: &Config,
		transport: &mut dyn Transport,
		space: usize,
		now: u64,
	) -> Result<Option<Bytes>, Error> {
		let mut ids: Vec<u64> = self
			.streams
			.iter()
			.filter(|(_, stream)| stream.is_sender && stream.transport_mode == TransportMode::Datagram)
			.map(|(id, _)| *id)
			.collect();
		let rotate_pos = ids.iter().position(|id| *id > self.last_datagram_stream).unwrap_or(0);
		ids.rotate_left(rotate_pos);

		let mut sent = None;
		for id in ids {
			let stream = self.streams.get_mut(&id).ok_or(Error::UnknownStream(id))?;
			if !stream.is_active_datagram || stream.media_id.is_none() {
				continue;
			}
			match Self::datagram_publish(stream, config, transport, space, now)? {
				Some(datagram) => {
					self.last_datagram_stream = id;
					sent = Some(datagram);
					break;
				}
				None => stream.is_active_datagram = false,
			}
		}

		let at_least_one_active = self
			.streams
			.values()
			.any(|stream| stream.is_sender && stream.transport_mode == TransportMode::Datagram && stream.is_active_datagram);
		transport.mark_datagram_ready(at_least_one_active);
		Ok(sent)
	}

	fn datagram_publish(
		stream: &mut StreamCtx,
		config: &Config,
		transport: &mut dyn Transport,
		space: usize,
		now: u64,
	) -> Result<Option<Bytes>, Error> {
		use crate::{FragmentPoll, Publisher};

		let media_id = stream.media_id.ok_or(Error::StateViolation)?;
		let cursor = stream
			.sender
			.as_mut()
			.and_then(|sender| sender.cursor())
			.ok_or(Error::ModeRequiresCache)?;

		match cursor.poll_fragment(space.saturating_sub(DatagramHeader::MAX_SIZE), now) {
			FragmentPoll::Finished => {
				if stream.final_location.is_none() {
					stream.final_location = cursor.final_location();
					// The final point travels on the control stream.
					transport.mark_stream_active(stream.stream_id, true);
				}
				Ok(None)
			}
			FragmentPoll::NotYet => Ok(None),
			FragmentPoll::Skip {
				location,
				nb_objects_previous_group,
			} => {
				cursor.skip_object(now)?;
				let header = DatagramHeader {
					media_id,
					location,
					offset: 0,
					queue_delay: 0,
					flags: FLAGS_SKIPPED,
					nb_objects_previous_group,
					object_length: 0,
				};
				stream.ack.ack_init(
					FragmentKey::new(location, 0),
					FLAGS_SKIPPED,
					nb_objects_previous_group,
					&[],
					0,
					0,
					&config.repeat,
					now,
				);
				Ok(Some(header.encode_datagram(&[])))
			}
			FragmentPoll::Data {
				location,
				offset,
				data,
				object_length,
				flags,
				nb_objects_previous_group,
				queue_delay,
				is_last,
			} => {
				let header = DatagramHeader {
					media_id,
					location,
					offset,
					queue_delay,
					flags,
					nb_objects_previous_group,
					object_length,
				};
				stream.ack.ack_init(
					FragmentKey::new(location, offset),
					flags,
					nb_objects_previous_group,
					&data,
					queue_delay,
					object_length,
					&config.repeat,
					now,
				);
				cursor.consume(data.len() as u64);
				if is_last {
					tracing::trace!(%location, "sending final fragment of object");
				}
				Ok(Some(header.encode_datagram(&data)))
			}
		}
	}

	/// The transport reported the fate of a sent datagram.
	pub fn handle_datagram_event(
		&mut self,
		config: &Config,
		transport: &mut dyn Transport,
		event: crate::DatagramEvent,
		send_time: u64,
		data: &[u8],
		now: u64,
	) -> Result<(), Error> {
		let mut input = data;
		let header = DatagramHeader::decode(&mut input)?;
		let payload = input;

		let stream = self.streams.values_mut().find(|stream| {
			stream.is_sender && stream.transport_mode == TransportMode::Datagram && stream.media_id == Some(header.media_id)
		});
		// The stream may already be closed; not finding it is not an error.
		let Some(stream) = stream else {
			return Ok(());
		};

		match event {
			crate::DatagramEvent::Acked | crate::DatagramEvent::Spurious => {
				stream.ack.handle_ack(header.location, header.offset, payload.len() as u64);
				Ok(())
			}
			crate::DatagramEvent::Lost => {
				let key = FragmentKey::new(header.location, header.offset);
				let queue_max = transport.datagram_queue_max();
				let result = stream.ack.handle_lost(
					key,
					send_time,
					payload,
					header.media_id,
					&config.repeat,
					queue_max,
					&mut |datagram| transport.queue_datagram(datagram),
					now,
				);
				if result.is_err() {
					// Datagram queue full: repair reliably on the stream and
					// count the fragment as delivered.
					tracing::debug!(location = %header.location, offset = header.offset, "falling back to stream repair");
					stream.repair_queue.push_back(wire::Fragment {
						location: header.location,
						nb_objects_previous_group: header.nb_objects_previous_group,
						offset: header.offset,
						object_length: header.object_length,
						flags: header.flags,
						data: Bytes::copy_from_slice(payload),
					});
					stream.ack.handle_ack(header.location, header.offset, payload.len() as u64);
					transport.mark_stream_active(stream.stream_id, true);
				}
				Ok(())
			}
		}
	}

	/// Re-evaluate what every stream could send; called after local sources
	/// gained data or subscriptions changed.
	pub fn wake(&mut self, transport: &mut dyn Transport, now: u64) {
		let ids: Vec<u64> = self.streams.keys().copied().collect();
		for id in ids {
			self.wake_stream(transport, id, now);
		}
	}

	fn wake_stream(&mut self, transport: &mut dyn Transport, stream_id: u64, now: u64) {
		use crate::Publisher;

		let mut opens: Vec<(u64, u64, u64)> = Vec::new();
		{
			let Some(stream) = self.streams.get_mut(&stream_id) else {
				return;
			};
			if !stream.is_sender {
				if stream.send_state == SendState::NotifyReady && !stream.notify_queue.is_empty() {
					transport.mark_stream_active(stream_id, true);
				}
				return;
			}

			let control_pending = (!stream.start.is_zero() && !stream.is_start_sent)
				|| (stream.final_location.is_some() && !stream.is_final_sent)
				|| (stream.cache_real_time && !stream.is_cache_policy_sent)
				|| !stream.repair_queue.is_empty();

			match stream.transport_mode {
				TransportMode::SingleStream => {
					let ready = stream
						.sender
						.as_mut()
						.map(|sender| match sender.publisher().get_data(None, usize::MAX, now) {
							Ok(poll) => poll.len > 0 || poll.is_still_active || poll.is_media_finished,
							Err(_) => false,
						})
						.unwrap_or(false);
					if ready || control_pending {
						transport.mark_stream_active(stream_id, true);
					}
				}
				TransportMode::Datagram => {
					if let Some(cursor) = stream.sender.as_mut().and_then(|sender| sender.cursor()) {
						if cursor.is_ready() {
							stream.is_active_datagram = true;
							transport.mark_datagram_ready(true);
						}
						if cursor.at_final() && stream.final_location.is_none() {
							stream.final_location = cursor.final_location();
						}
					}
					if control_pending || (stream.final_location.is_some() && !stream.is_final_sent) {
						transport.mark_stream_active(stream_id, true);
					}
				}
				TransportMode::Warp => {
					if let Some(cursor) = stream.sender.as_mut().and_then(|sender| sender.cursor()) {
						let cache = cursor.cache();
						let cache = cache.borrow();
						if stream.final_location.is_none() {
							stream.final_location = cache.final_location();
						}
						if let Some(highest) = cache.highest_location() {
							while stream.next_uni.group <= highest.group {
								let first_object = if stream.next_uni.group == stream.start.group {
									stream.start.object
								} else {
									0
								};
								opens.push((stream.next_uni.group, first_object, 0));
								stream.next_uni = Location::new(stream.next_uni.group + 1, 0);
							}
						}
					}
					if control_pending || (stream.final_location.is_some() && !stream.is_final_sent) {
						transport.mark_stream_active(stream_id, true);
					}
				}
				TransportMode::Rush => {
					if let Some(cursor) = stream.sender.as_mut().and_then(|sender| sender.cursor()) {
						let cache = cursor.cache();
						let cache = cache.borrow();
						if stream.final_location.is_none() {
							stream.final_location = cache.final_location();
						}
						loop {
							// Roll over group boundaries with a known count.
							while let Some(count) = cache.object_count(stream.next_uni.group) {
								if stream.next_uni.object >= count {
									stream.next_uni = stream.next_uni.next_group();
								} else {
									break;
								}
							}
							if cache.object_properties(stream.next_uni).is_none() {
								break;
							}
							opens.push((stream.next_uni.group, stream.next_uni.object, stream.next_uni.object + 1));
							stream.next_uni = stream.next_uni.next_object();
						}
					}
					if control_pending || (stream.final_location.is_some() && !stream.is_final_sent) {
						transport.mark_stream_active(stream_id, true);
					}
				}
			}
		}

		for (group, object, last) in opens {
			let uni_id = transport.open_stream(true);
			tracing::debug!(control = stream_id, uni = uni_id, group, object, "opening substream");
			let mut uni = UniStreamCtx::new(uni_id, Some(stream_id));
			uni.group_id = group;
			uni.object_id = object;
			uni.last_object_id = last;
			self.uni_streams.insert(uni_id, uni);
			transport.mark_stream_active(uni_id, true);
		}

		// Existing substreams may have new data to push.
		for (id, uni) in self.uni_streams.iter() {
			if uni.control_stream_id == Some(stream_id) && uni.send_state != UniSendState::ShouldClose {
				transport.mark_stream_active(*id, true);
			}
		}
	}

	pub fn delete_stream(&mut self, stream_id: u64, transport: &mut dyn Transport, reason: CloseReason) {
		if let Some(mut stream) = self.streams.remove(&stream_id) {
			tracing::debug!(stream = stream_id, ?reason, "deleting stream");
			stream.close_media(reason);
			transport.mark_stream_active(stream_id, false);

			let uni_ids: Vec<u64> = self
				.uni_streams
				.iter()
				.filter(|(_, uni)| uni.control_stream_id == Some(stream_id))
				.map(|(id, _)| *id)
				.collect();
			for id in uni_ids {
				// The control stream is gone; abandon the substream.
				if let Some(uni) = self.uni_streams.remove(&id) {
					transport.mark_stream_active(id, false);
					if stream.is_sender && uni.send_state != UniSendState::ShouldClose {
						transport.reset_stream(id, 0);
					}
				}
			}
		}
	}

	pub fn delete_uni_stream(&mut self, stream_id: u64, transport: &mut dyn Transport) {
		if let Some(uni) = self.uni_streams.remove(&stream_id) {
			tracing::trace!(uni = stream_id, "deleting substream");
			transport.mark_stream_active(stream_id, false);
			let is_sender = uni
				.control_stream_id
				.and_then(|id| self.streams.get(&id))
				.map(|stream| stream.is_sender)
				.unwrap_or(false);
			if is_sender && uni.send_state != UniSendState::ShouldClose {
				// Closing before everything was sent forces an abandon.
				transport.reset_stream(stream_id, 0);
			}
		}
	}

	/// Tear down every stream, closing publishers and consumers.
	pub fn delete(&mut self, transport: &mut dyn Transport, reason: CloseReason) {
		tracing::debug!(connection = self.id, is_server = self.is_server, ?reason, "tearing down streams");
		let ids: Vec<u64> = self.streams.keys().copied().collect();
		for id in ids {
			self.delete_stream(id, transport, reason);
		}
		let uni_ids: Vec<u64> = self.uni_streams.keys().copied().collect();
		for id in uni_ids {
			self.delete_uni_stream(id, transport);
		}
	}
}
