//! Deterministic two-endpoint simulator: in-memory transport, scripted
//! datagram loss, and a simple test media format.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Once;

use bytes::Bytes;
use quicr_lite::{
	CloseReason, DeliveryMode, Endpoint, Error, Location, ObjectHandler, StreamStats, Transport,
	wire::{DatagramHeader, Message},
};

pub const SPACE: usize = 1200;

static INIT_LOGGING: Once = Once::new();

/// Surface core logs during test runs; filter with `RUST_LOG`.
fn init_logging() {
	INIT_LOGGING.call_once(|| {
		let _ = tracing_subscriber::fmt()
			.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
			.with_test_writer()
			.try_init();
	});
}

/// In-memory stand-in for the QUIC transport of one connection.
pub struct SimTransport {
	pub active_streams: BTreeSet<u64>,
	pub datagram_ready: bool,
	/// Datagrams queued by the core for retransmission.
	pub queued_datagrams: VecDeque<Bytes>,
	/// Refuse `queue_datagram` beyond this many pending entries.
	pub queue_limit: usize,
	pub reset_streams: Vec<u64>,
	next_bidi: u64,
	next_uni: u64,
}

impl SimTransport {
	/// Client transports allocate ids 0,4,8,… (bidi) and 2,6,10,… (uni);
	/// servers get the odd variants.
	pub fn new(is_client: bool) -> Self {
		Self {
			active_streams: BTreeSet::new(),
			datagram_ready: false,
			queued_datagrams: VecDeque::new(),
			queue_limit: usize::MAX,
			reset_streams: Vec::new(),
			next_bidi: if is_client { 0 } else { 1 },
			next_uni: if is_client { 2 } else { 3 },
		}
	}
}

impl Transport for SimTransport {
	fn mark_stream_active(&mut self, stream_id: u64, active: bool) {
		if active {
			self.active_streams.insert(stream_id);
		} else {
			self.active_streams.remove(&stream_id);
		}
	}

	fn mark_datagram_ready(&mut self, ready: bool) {
		self.datagram_ready = ready;
	}

	fn queue_datagram(&mut self, datagram: Bytes) -> Result<(), Error> {
		if self.queued_datagrams.len() >= self.queue_limit {
			return Err(Error::Transport);
		}
		self.queued_datagrams.push_back(datagram);
		Ok(())
	}

	fn datagram_queue_max(&self) -> usize {
		SPACE
	}

	fn open_stream(&mut self, unidirectional: bool) -> u64 {
		if unidirectional {
			let id = self.next_uni;
			self.next_uni += 4;
			id
		} else {
			let id = self.next_bidi;
			self.next_bidi += 4;
			id
		}
	}

	fn reset_stream(&mut self, stream_id: u64, _error_code: u64) {
		self.reset_streams.push(stream_id);
	}

	fn next_wake_time(&self, _now: u64) -> u64 {
		u64::MAX
	}
}

/// One endpoint plus the transport of its single connection.
pub struct Node {
	pub endpoint: Endpoint,
	pub cnx: u64,
	pub transport: SimTransport,
}

impl Node {
	pub fn new(config: quicr_lite::Config, is_client: bool) -> Self {
		init_logging();
		let mut endpoint = Endpoint::new(config);
		let cnx = endpoint.create_connection(!is_client);
		Self {
			endpoint,
			cnx,
			transport: SimTransport::new(is_client),
		}
	}

	pub fn peer(&mut self) -> Peer<'_> {
		Peer {
			endpoint: &mut self.endpoint,
			cnx: self.cnx,
			transport: &mut self.transport,
		}
	}
}

/// A borrowed view of one side of a simulated link; lets a single endpoint
/// (a relay) appear in several pumps with different connections.
pub struct Peer<'a> {
	pub endpoint: &'a mut Endpoint,
	pub cnx: u64,
	pub transport: &'a mut SimTransport,
}

// --- test media format: a 20 byte header followed by the content ---

pub const MEDIA_HEADER_SIZE: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaHeader {
	pub timestamp: u64,
	pub number: u64,
	pub length: u32,
}

pub fn encode_media_object(header: MediaHeader, content: &[u8]) -> Vec<u8> {
	assert_eq!(header.length as usize, content.len());
	let mut out = Vec::with_capacity(MEDIA_HEADER_SIZE + content.len());
	out.extend_from_slice(&header.timestamp.to_be_bytes());
	out.extend_from_slice(&header.number.to_be_bytes());
	out.extend_from_slice(&header.length.to_be_bytes());
	out.extend_from_slice(content);
	out
}

pub fn decode_media_header(data: &[u8]) -> Option<MediaHeader> {
	if data.len() < MEDIA_HEADER_SIZE {
		return None;
	}
	Some(MediaHeader {
		timestamp: u64::from_be_bytes(data[0..8].try_into().unwrap()),
		number: u64::from_be_bytes(data[8..16].try_into().unwrap()),
		length: u32::from_be_bytes(data[16..20].try_into().unwrap()),
	})
}

/// Deterministic filler so reassembled bytes are comparable.
pub fn test_content(seed: u64, len: usize) -> Vec<u8> {
	let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(1);
	(0..len)
		.map(|_| {
			state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
			(state >> 33) as u8
		})
		.collect()
}

/// A generated media object: payload plus the group boundary marker.
#[derive(Clone, Debug)]
pub struct TestObject {
	pub data: Vec<u8>,
	pub flags: u8,
	pub new_group: bool,
}

/// Build objects whose content sizes are `sizes`, starting a new group
/// wherever `group_starts` names the index.
pub fn make_objects(sizes: &[usize], group_starts: &[usize]) -> Vec<TestObject> {
	sizes
		.iter()
		.enumerate()
		.map(|(index, size)| {
			let header = MediaHeader {
				timestamp: index as u64 * 33_000,
				number: index as u64,
				length: *size as u32,
			};
			TestObject {
				data: encode_media_object(header, &test_content(index as u64, *size)),
				flags: if *size > 10_000 { 0x81 } else { 0x82 },
				new_group: index > 0 && group_starts.contains(&index),
			}
		})
		.collect()
}

/// The source file a zero-loss transfer must reproduce byte for byte.
pub fn concat_objects(objects: &[TestObject]) -> Vec<u8> {
	let mut out = Vec::new();
	for object in objects {
		out.extend_from_slice(&object.data);
	}
	out
}

/// Encode a control message the way it travels on a stream: 16-bit length
/// prefix plus the message body. Used to inject peer traffic by hand.
pub fn frame_message<M: Message>(msg: &M) -> Vec<u8> {
	let body = msg.encode_bytes();
	let mut out = Vec::with_capacity(2 + body.len());
	out.extend_from_slice(&(body.len() as u16).to_be_bytes());
	out.extend_from_slice(&body);
	out
}

// --- consumer side logging, in the shape of the delivery log files ---

#[derive(Default)]
pub struct MediaLogInner {
	/// One line per first delivery: group, object, arrival, timestamp,
	/// number, length, flags.
	pub lines: Vec<String>,
	pub delivered: Vec<(Location, DeliveryMode, usize)>,
	/// Objects written in order, i.e. the reassembled file.
	pub bytes: Vec<u8>,
	pub close_reason: Option<CloseReason>,
}

/// An [ObjectHandler] that mirrors the test harness consumer: log every first
/// delivery, write in-order payloads to the reassembled output.
#[derive(Clone, Default)]
pub struct MediaLog {
	pub inner: Rc<RefCell<MediaLogInner>>,
}

impl MediaLog {
	/// Written deliveries (in-sequence and repair) per location.
	pub fn times_written(&self, location: Location) -> usize {
		self.inner
			.borrow()
			.delivered
			.iter()
			.filter(|(at, mode, _)| *at == location && *mode != DeliveryMode::Peek)
			.count()
	}
}

impl ObjectHandler for MediaLog {
	fn on_object(&mut self, now: u64, location: Location, flags: u8, data: &[u8], mode: DeliveryMode) -> Result<(), Error> {
		let mut inner = self.inner.borrow_mut();
		inner.delivered.push((location, mode, data.len()));
		if mode != DeliveryMode::Repair {
			let header = decode_media_header(data).unwrap_or(MediaHeader {
				timestamp: 0,
				number: 0,
				length: 0,
			});
			inner.lines.push(format!(
				"{},{},{},{},{},{},{}",
				location.group, location.object, now, header.timestamp, header.number, header.length, flags
			));
		}
		if mode != DeliveryMode::Peek {
			inner.bytes.extend_from_slice(data);
		}
		Ok(())
	}

	fn on_close(&mut self, reason: CloseReason) {
		self.inner.borrow_mut().close_reason = Some(reason);
	}
}

// --- the pump: drive both peers until the network is quiet ---

/// Decides the fate of each fresh datagram transmission.
pub type LossPlan = Box<dyn FnMut(&DatagramHeader, usize) -> bool>;

pub fn no_loss() -> LossPlan {
	Box::new(|_, _| false)
}

#[derive(Default)]
pub struct PumpReport {
	pub datagrams_delivered: usize,
	pub datagrams_lost: usize,
	/// Field-wise maxima observed per (peer index, stream id), surviving
	/// stream deletion.
	pub stats: HashMap<(usize, u64), StreamStats>,
}

fn merge_stats(report: &mut PumpReport, side: usize, peer: &Peer) {
	for stream_id in 0..64u64 {
		if let Some(stats) = peer.endpoint.stream_stats(peer.cnx, stream_id) {
			let entry = report.stats.entry((side, stream_id)).or_default();
			entry.nb_fragment_lost = entry.nb_fragment_lost.max(stats.nb_fragment_lost);
			entry.nb_extra_sent = entry.nb_extra_sent.max(stats.nb_extra_sent);
			entry.nb_horizon_acks = entry.nb_horizon_acks.max(stats.nb_horizon_acks);
			entry.nb_horizon_events = entry.nb_horizon_events.max(stats.nb_horizon_events);
			entry.pending_ack_records = entry.pending_ack_records.max(stats.pending_ack_records);
		}
	}
}

/// Run both peers until nothing moves any more. Datagram losses are decided
/// by the plan; lost transmissions are reported back to the sender so the
/// repair machinery kicks in. The clock advances 1ms per round, jumping to
/// the next scheduled time when idle.
pub fn pump(peers: &mut [Peer; 2], clock: &mut u64, loss: &mut LossPlan) -> PumpReport {
	let mut report = PumpReport::default();
	let mut idle_rounds = 0;

	for _round in 0..20_000 {
		let mut progressed = false;

		for side in 0..2 {
			// Local wakeups: new source data, pending notifies, substreams.
			{
				let peer = &mut peers[side];
				peer.endpoint.wake(peer.cnx, &mut *peer.transport, *clock);
			}

			// Streams.
			let active: Vec<u64> = peers[side].transport.active_streams.iter().copied().collect();
			for stream_id in active {
				let chunk = {
					let peer = &mut peers[side];
					if !peer.endpoint.has_stream(peer.cnx, stream_id) {
						peer.transport.active_streams.remove(&stream_id);
						continue;
					}
					peer.endpoint
						.prepare_stream_data(peer.cnx, &mut *peer.transport, stream_id, SPACE, *clock)
						.expect("prepare failed")
				};
				if chunk.data.is_empty() && !chunk.fin {
					continue;
				}
				progressed = true;
				let other = &mut peers[1 - side];
				other
					.endpoint
					.on_stream_data(other.cnx, &mut *other.transport, stream_id, &chunk.data, chunk.fin, *clock)
					.expect("receive failed");
			}

			// Fresh datagrams.
			loop {
				let datagram = {
					let peer = &mut peers[side];
					if !peer.transport.datagram_ready {
						break;
					}
					peer.endpoint
						.prepare_datagram(peer.cnx, &mut *peer.transport, SPACE, *clock)
						.expect("prepare datagram failed")
				};
				let Some(datagram) = datagram else { break };
				progressed = true;
				deliver_datagram(peers, side, &datagram, clock, loss, &mut report);
			}

			// Queued retransmissions.
			loop {
				let datagram = peers[side].transport.queued_datagrams.pop_front();
				let Some(datagram) = datagram else { break };
				progressed = true;
				deliver_datagram(peers, side, &datagram, clock, loss, &mut report);
			}

			merge_stats(&mut report, side, &peers[side]);
		}

		if progressed {
			idle_rounds = 0;
			*clock += 1_000;
			continue;
		}

		// Nothing moved: jump to the next scheduled event, if any.
		let mut next = u64::MAX;
		for peer in peers.iter_mut() {
			let at = peer.endpoint.time_check(peer.cnx, &mut *peer.transport, *clock);
			next = next.min(at);
		}
		if next != u64::MAX && next > *clock {
			*clock = next;
			idle_rounds += 1;
			if idle_rounds > 8 {
				break;
			}
			continue;
		}

		idle_rounds += 1;
		*clock += 1_000;
		if idle_rounds > 4 {
			break;
		}
	}

	report
}

fn deliver_datagram(
	peers: &mut [Peer; 2],
	side: usize,
	datagram: &Bytes,
	clock: &mut u64,
	loss: &mut LossPlan,
	report: &mut PumpReport,
) {
	let mut input = &datagram[..];
	let header = DatagramHeader::decode(&mut input).expect("bad datagram header");
	let payload_len = input.len();
	let send_time = *clock;

	if loss(&header, payload_len) {
		report.datagrams_lost += 1;
		let peer = &mut peers[side];
		peer.endpoint
			.on_datagram_event(
				peer.cnx,
				&mut *peer.transport,
				quicr_lite::DatagramEvent::Lost,
				send_time,
				datagram,
				*clock,
			)
			.expect("loss handling failed");
	} else {
		report.datagrams_delivered += 1;
		{
			let other = &mut peers[1 - side];
			other
				.endpoint
				.on_datagram(other.cnx, &mut *other.transport, datagram, *clock)
				.expect("datagram receive failed");
		}
		let peer = &mut peers[side];
		peer.endpoint
			.on_datagram_event(
				peer.cnx,
				&mut *peer.transport,
				quicr_lite::DatagramEvent::Acked,
				send_time,
				datagram,
				*clock,
			)
			.expect("ack handling failed");
	}
}
