use std::collections::BTreeMap;

use bytes::Bytes;

use crate::{
	CloseReason, CongestionMode, Consumer, Error, Location, ObjectSource, RepeatConfig, StreamChunk, SubscribeIntent,
	Transport, TransportMode, is_unidirectional, wire,
};

use super::connection::{Connection, Registry};
use super::stream::{RecvState, SendState, StreamCtx, queue_message};

/// Endpoint-wide configuration.
#[derive(Clone, Copy, Debug)]
pub struct Config {
	/// How long a real-time cache keeps fragments, in microseconds.
	pub cache_duration_max: u64,
	pub repeat: RepeatConfig,
	pub congestion_control_mode: CongestionMode,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			cache_duration_max: 10_000_000,
			repeat: RepeatConfig::default(),
			congestion_control_mode: CongestionMode::None,
		}
	}
}

/// The fate the transport reported for a sent datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatagramEvent {
	Acked,
	Lost,
	Spurious,
}

/// Handle to a registered media source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceId(usize);

/// Counters for one subscription's datagram repair machinery.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamStats {
	pub nb_fragment_lost: u64,
	pub nb_extra_sent: u64,
	pub nb_horizon_acks: u64,
	pub nb_horizon_events: u64,
	pub pending_ack_records: usize,
}

/// The top-level context: local media sources, connections, configuration.
///
/// Sans-IO: the embedding event loop forwards transport callbacks into the
/// `on_*`/`prepare_*` methods and sleeps until the time returned from
/// [Endpoint::time_check].
pub struct Endpoint {
	config: Config,
	registry: Registry,
	connections: BTreeMap<u64, Connection>,
	next_connection_id: u64,
	cache_check_next: u64,
}

impl Endpoint {
	pub fn new(config: Config) -> Self {
		Self {
			config,
			registry: Registry::default(),
			connections: BTreeMap::new(),
			next_connection_id: 0,
			cache_check_next: 0,
		}
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	// --- connection lifecycle ---

	pub fn create_connection(&mut self, is_server: bool) -> u64 {
		let id = self.next_connection_id;
		self.next_connection_id += 1;
		self.connections.insert(id, Connection::new(id, is_server));
		tracing::debug!(connection = id, is_server, "created connection");
		id
	}

	pub fn delete_connection(&mut self, connection: u64, transport: &mut dyn Transport, reason: CloseReason) {
		if let Some(mut ctx) = self.connections.remove(&connection) {
			tracing::debug!(connection, ?reason, "deleting connection");
			ctx.delete(transport, reason);
		}
	}

	/// The transport reported the connection closed; no more callbacks follow.
	pub fn on_transport_close(&mut self, connection: u64, reason: CloseReason, code: u64) {
		if let Some(mut ctx) = self.connections.remove(&connection) {
			tracing::debug!(connection, ?reason, code, "transport closed");
			let mut sink = ClosedTransport;
			ctx.delete(&mut sink, reason);
		}
	}

	// --- local media sources ---

	/// Register a local source and announce it to matching subscribers.
	pub fn publish_object_source(&mut self, url: impl Into<Bytes>, real_time: bool) -> SourceId {
		let id = self.registry.register(ObjectSource::new(url.into(), real_time));
		self.dispatch_announcements();
		SourceId(id)
	}

	pub fn publish_object(
		&mut self,
		source: SourceId,
		data: &[u8],
		flags: u8,
		new_group: bool,
		now: u64,
	) -> Result<Location, Error> {
		let source = self.registry.sources.get_mut(source.0).ok_or(Error::SourceNotFound)?;
		source.publish_object(data, flags, new_group, now)
	}

	pub fn publish_fin(&mut self, source: SourceId) -> Result<(), Error> {
		let source = self.registry.sources.get_mut(source.0).ok_or(Error::SourceNotFound)?;
		source.publish_fin();
		Ok(())
	}

	// --- client operations ---

	/// Subscribe to a remote media stream; delivery goes to `consumer`.
	pub fn request_media(
		&mut self,
		connection: u64,
		transport: &mut dyn Transport,
		url: impl Into<Bytes>,
		transport_mode: TransportMode,
		intent: SubscribeIntent,
		consumer: Box<dyn Consumer>,
	) -> Result<u64, Error> {
		let ctx = self.connections.get_mut(&connection).ok_or(Error::UnknownConnection(connection))?;
		let url = url.into();
		let stream_id = transport.open_stream(false);
		let media_id = ctx.next_media_id;
		ctx.next_media_id += 1;

		let mut stream = StreamCtx::new(stream_id);
		stream.media_id = Some(media_id);
		stream.transport_mode = transport_mode;
		stream.url = Some(url.clone());
		stream.consumer = Some(consumer);
		stream.recv_state = RecvState::Fragment;
		stream.send_state = SendState::Initial;
		queue_message(
			&mut stream.send_buffer,
			&wire::Request {
				url: url.clone(),
				media_id,
				transport_mode,
				intent,
			},
		);
		ctx.streams.insert(stream_id, stream);
		transport.mark_stream_active(stream_id, true);
		tracing::debug!(
			connection,
			stream = stream_id,
			url = %String::from_utf8_lossy(&url),
			mode = ?transport_mode,
			"requesting media"
		);
		Ok(stream_id)
	}

	/// Push a locally registered source to the peer.
	pub fn post_media(
		&mut self,
		connection: u64,
		transport: &mut dyn Transport,
		url: impl Into<Bytes>,
		transport_mode: TransportMode,
	) -> Result<u64, Error> {
		let url = url.into();
		let source = self.registry.find_source(&url).ok_or(Error::SourceNotFound)?;
		let cache_real_time = source.is_real_time();
		// A live source starts the peer at its current position.
		let start = if cache_real_time { source.next_location() } else { Location::ZERO };

		let ctx = self.connections.get_mut(&connection).ok_or(Error::UnknownConnection(connection))?;
		let stream_id = transport.open_stream(false);
		let mut stream = StreamCtx::new(stream_id);
		stream.transport_mode = transport_mode;
		stream.url = Some(url.clone());
		stream.start = start;
		stream.cache_real_time = cache_real_time;
		stream.recv_state = RecvState::NotReady;
		stream.send_state = SendState::Initial;
		queue_message(
			&mut stream.send_buffer,
			&wire::Post {
				url: url.clone(),
				transport_mode,
				cache_real_time,
				start,
			},
		);
		ctx.streams.insert(stream_id, stream);
		transport.mark_stream_active(stream_id, true);
		tracing::debug!(
			connection,
			stream = stream_id,
			url = %String::from_utf8_lossy(&url),
			mode = ?transport_mode,
			%start,
			"posting media"
		);
		Ok(stream_id)
	}

	/// Ask the peer to NOTIFY us about sources matching a URL prefix.
	pub fn subscribe_pattern(
		&mut self,
		connection: u64,
		transport: &mut dyn Transport,
		prefix: impl Into<Bytes>,
		notify: Box<dyn FnMut(&[u8])>,
	) -> Result<u64, Error> {
		let ctx = self.connections.get_mut(&connection).ok_or(Error::UnknownConnection(connection))?;
		let prefix = prefix.into();
		let stream_id = transport.open_stream(false);
		let mut stream = StreamCtx::new(stream_id);
		stream.notify_fn = Some(notify);
		stream.recv_state = RecvState::Notify;
		stream.send_state = SendState::Subscribe;
		queue_message(&mut stream.send_buffer, &wire::Subscribe { prefix: prefix.clone() });
		ctx.streams.insert(stream_id, stream);
		transport.mark_stream_active(stream_id, true);
		tracing::debug!(
			connection,
			stream = stream_id,
			prefix = %String::from_utf8_lossy(&prefix),
			"subscribing to pattern"
		);
		Ok(stream_id)
	}

	/// Stop a pattern subscription; the stream closes with FIN.
	pub fn subscribe_pattern_close(
		&mut self,
		connection: u64,
		transport: &mut dyn Transport,
		stream_id: u64,
	) -> Result<(), Error> {
		let ctx = self.connections.get_mut(&connection).ok_or(Error::UnknownConnection(connection))?;
		let stream = ctx.streams.get_mut(&stream_id).ok_or(Error::UnknownStream(stream_id))?;
		if stream.send_state == SendState::WaitingNotify || stream.send_state == SendState::NotifyReady {
			stream.send_state = SendState::Fin;
			transport.mark_stream_active(stream_id, true);
		}
		Ok(())
	}

	// --- transport callbacks ---

	/// Stream data (possibly with FIN) arrived from the peer.
	pub fn on_stream_data(
		&mut self,
		connection: u64,
		transport: &mut dyn Transport,
		stream_id: u64,
		data: &[u8],
		fin: bool,
		now: u64,
	) -> Result<(), Error> {
		let ctx = self.connections.get_mut(&connection).ok_or(Error::UnknownConnection(connection))?;
		let result = if is_unidirectional(stream_id) {
			ctx.receive_uni_data(transport, stream_id, data, fin, now)
		} else {
			ctx.receive_stream_data(&mut self.registry, &self.config, transport, stream_id, data, fin, now)
		};
		// A POST may have registered a new source worth announcing.
		self.dispatch_announcements();

		if let Err(err) = result {
			self.abort_stream(connection, transport, stream_id, &err);
			return Err(err);
		}
		Ok(())
	}

	/// The transport is ready to send on a stream; produce the next chunk.
	pub fn prepare_stream_data(
		&mut self,
		connection: u64,
		transport: &mut dyn Transport,
		stream_id: u64,
		space: usize,
		now: u64,
	) -> Result<StreamChunk, Error> {
		let ctx = self.connections.get_mut(&connection).ok_or(Error::UnknownConnection(connection))?;
		match ctx.prepare_stream(transport, stream_id, space, now) {
			Ok(chunk) => Ok(chunk),
			Err(err) => {
				self.abort_stream(connection, transport, stream_id, &err);
				Err(err)
			}
		}
	}

	/// A datagram arrived.
	pub fn on_datagram(
		&mut self,
		connection: u64,
		transport: &mut dyn Transport,
		data: &[u8],
		now: u64,
	) -> Result<(), Error> {
		let ctx = self.connections.get_mut(&connection).ok_or(Error::UnknownConnection(connection))?;
		ctx.receive_datagram(&mut self.registry, transport, data, now)
	}

	/// The transport can send a datagram of up to `space` bytes.
	pub fn prepare_datagram(
		&mut self,
		connection: u64,
		transport: &mut dyn Transport,
		space: usize,
		now: u64,
	) -> Result<Option<Bytes>, Error> {
		let ctx = self.connections.get_mut(&connection).ok_or(Error::UnknownConnection(connection))?;
		ctx.prepare_datagram(&self.config, transport, space, now)
	}

	/// Ack, loss or spurious-loss feedback for a sent datagram.
	pub fn on_datagram_event(
		&mut self,
		connection: u64,
		transport: &mut dyn Transport,
		event: DatagramEvent,
		send_time: u64,
		data: &[u8],
		now: u64,
	) -> Result<(), Error> {
		let ctx = self.connections.get_mut(&connection).ok_or(Error::UnknownConnection(connection))?;
		ctx.handle_datagram_event(&self.config, transport, event, send_time, data, now)
	}

	/// The peer reset a stream; drop the local state for it.
	pub fn on_stream_reset(&mut self, connection: u64, transport: &mut dyn Transport, stream_id: u64) {
		if let Some(ctx) = self.connections.get_mut(&connection) {
			if is_unidirectional(stream_id) {
				ctx.delete_uni_stream(stream_id, transport);
			} else {
				ctx.delete_stream(stream_id, transport, CloseReason::RemoteApplication);
			}
		}
	}

	/// The peer no longer wants this stream; abandon the sending side.
	pub fn on_stop_sending(&mut self, connection: u64, transport: &mut dyn Transport, stream_id: u64) {
		tracing::debug!(connection, stream = stream_id, "peer stopped listening");
		transport.reset_stream(stream_id, 0);
		self.on_stream_reset(connection, transport, stream_id);
	}

	/// Re-evaluate sending opportunities after local publishing activity.
	pub fn wake(&mut self, connection: u64, transport: &mut dyn Transport, now: u64) {
		if let Some(ctx) = self.connections.get_mut(&connection) {
			ctx.wake(transport, now);
		}
	}

	/// Compute the next wakeup, firing extra repeats and cache maintenance
	/// that came due.
	pub fn time_check(&mut self, connection: u64, transport: &mut dyn Transport, now: u64) -> u64 {
		let mut next_time = u64::MAX;
		let repeat = self.config.repeat;

		if let Some(ctx) = self.connections.get_mut(&connection) {
			let queue_max = transport.datagram_queue_max();
			for stream in ctx.streams.values_mut() {
				let Some(media_id) = stream.media_id else { continue };
				if !stream.is_sender || stream.transport_mode != TransportMode::Datagram {
					continue;
				}
				let due = stream.ack.handle_extra_repeat(
					media_id,
					&repeat,
					queue_max,
					&mut |datagram| transport.queue_datagram(datagram),
					now,
				);
				if let Some(at) = due {
					next_time = next_time.min(at);
				}
			}
		}

		next_time = next_time.min(transport.next_wake_time(now));

		if self.config.cache_duration_max > 0 {
			if now >= self.cache_check_next {
				let cutoff = now.saturating_sub(self.config.cache_duration_max);
				for source in &self.registry.sources {
					if source.is_real_time() && cutoff > 0 {
						let purged = source.cache().borrow_mut().purge_older_than(cutoff);
						if purged > 0 {
							tracing::debug!(url = %String::from_utf8_lossy(source.url()), purged, "cache maintenance");
						}
					}
				}
				self.cache_check_next = now + self.config.cache_duration_max / 2;
			}
			next_time = next_time.min(self.cache_check_next);
		}

		next_time
	}

	// --- introspection ---

	pub fn useless_fragments(&self) -> u64 {
		self.registry.useless_fragments
	}

	/// Look up a registered source by exact URL.
	pub fn find_source(&self, url: &[u8]) -> Option<SourceId> {
		self.registry
			.sources
			.iter()
			.position(|source| source.url().as_ref() == url)
			.map(SourceId)
	}

	/// The shared cache behind a source; relays use this to inspect what a
	/// posted publication has filled in so far.
	pub fn source_cache(&self, source: SourceId) -> Option<std::rc::Rc<std::cell::RefCell<crate::FragmentCache>>> {
		self.registry.sources.get(source.0).map(|entry| entry.cache())
	}

	pub fn has_stream(&self, connection: u64, stream_id: u64) -> bool {
		self.connections
			.get(&connection)
			.is_some_and(|ctx| ctx.streams.contains_key(&stream_id) || ctx.uni_streams.contains_key(&stream_id))
	}

	pub fn stream_stats(&self, connection: u64, stream_id: u64) -> Option<StreamStats> {
		let stream = self.connections.get(&connection)?.streams.get(&stream_id)?;
		Some(StreamStats {
			nb_fragment_lost: stream.ack.nb_fragment_lost,
			nb_extra_sent: stream.ack.nb_extra_sent,
			nb_horizon_acks: stream.ack.nb_horizon_acks,
			nb_horizon_events: stream.ack.nb_horizon_events,
			pending_ack_records: stream.ack.len(),
		})
	}

	// --- internals ---

	/// Queue NOTIFY messages for freshly registered sources on every stream
	/// in notify-ready state with a matching prefix.
	fn dispatch_announcements(&mut self) {
		if self.registry.announcements.is_empty() {
			return;
		}
		let urls: Vec<Bytes> = self.registry.announcements.drain(..).collect();
		for url in urls {
			for ctx in self.connections.values_mut() {
				for stream in ctx.streams.values_mut() {
					if stream.send_state != SendState::NotifyReady && stream.send_state != SendState::Notify {
						continue;
					}
					let matches = stream
						.subscribe_prefix
						.as_ref()
						.is_some_and(|prefix| url.starts_with(prefix.as_ref()));
					if matches {
						tracing::debug!(
							connection = ctx.id,
							stream = stream.stream_id,
							url = %String::from_utf8_lossy(&url),
							"queuing notify"
						);
						stream.notify_queue.push_back(url.clone());
					}
				}
			}
		}
	}

	fn abort_stream(&mut self, connection: u64, transport: &mut dyn Transport, stream_id: u64, err: &Error) {
		tracing::warn!(connection, stream = stream_id, ?err, "aborting stream");
		transport.reset_stream(stream_id, crate::ERROR_INTERNAL);
		if let Some(ctx) = self.connections.get_mut(&connection) {
			if is_unidirectional(stream_id) {
				ctx.delete_uni_stream(stream_id, transport);
			} else {
				ctx.delete_stream(stream_id, transport, CloseReason::InternalError);
			}
		}
	}
}

/// Stand-in transport used while tearing down an already closed connection.
struct ClosedTransport;

impl Transport for ClosedTransport {
	fn mark_stream_active(&mut self, _stream_id: u64, _active: bool) {}
	fn mark_datagram_ready(&mut self, _ready: bool) {}
	fn queue_datagram(&mut self, _datagram: Bytes) -> Result<(), Error> {
		Err(Error::Closed)
	}
	fn datagram_queue_max(&self) -> usize {
		0
	}
	fn open_stream(&mut self, _unidirectional: bool) -> u64 {
		0
	}
	fn reset_stream(&mut self, _stream_id: u64, _error_code: u64) {}
	fn next_wake_time(&self, now: u64) -> u64 {
		now
	}
}
