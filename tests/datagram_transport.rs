//! Datagram transport: loss, NACK repair, extra repeats, horizon cleanup.

mod common;

use std::collections::HashSet;

use common::*;
use quicr_lite::{
	Config, DatagramEvent, Location, MediaConsumer, RepeatConfig, SubscribeIntent, TransportMode, wire,
};

#[test]
fn datagram_loss_and_repair() {
	let mut server = Node::new(Config::default(), false);
	let mut client = Node::new(Config::default(), true);
	let mut clock = 1_000_000;

	// 16 multi-fragment objects in one group.
	let sizes = vec![3_000usize; 16];
	let objects = make_objects(&sizes, &[]);
	let source = server.endpoint.publish_object_source(&b"video/s2"[..], false);
	for object in &objects {
		server
			.endpoint
			.publish_object(source, &object.data, object.flags, object.new_group, clock)
			.unwrap();
	}
	server.endpoint.publish_fin(source).unwrap();

	let log = MediaLog::default();
	client
		.endpoint
		.request_media(
			client.cnx,
			&mut client.transport,
			&b"video/s2"[..],
			TransportMode::Datagram,
			SubscribeIntent::StartPoint(Location::ZERO),
			Box::new(MediaConsumer::new(Box::new(log.clone()))),
		)
		.unwrap();

	// Losses: objects 4, 5, 6 entirely; the first fragment of 9; the last
	// fragment of 11; a middle fragment of 15. First transmission only.
	let mut already_lost: HashSet<(u64, u64)> = HashSet::new();
	let mut loss: LossPlan = Box::new(move |header, payload_len| {
		let object = header.location.object;
		let is_first = header.offset == 0;
		let is_last = header.offset + payload_len as u64 >= header.object_length;
		let target = matches!(object, 4 | 5 | 6)
			|| (object == 9 && is_first)
			|| (object == 11 && is_last)
			|| (object == 15 && !is_first && !is_last);
		target && already_lost.insert((object, header.offset))
	});

	let report = pump(&mut [client.peer(), server.peer()], &mut clock, &mut loss);
	assert!(report.datagrams_lost >= 6);

	// Every object is delivered (written) exactly once.
	for object in 0..16u64 {
		assert_eq!(log.times_written(Location::new(0, object)), 1, "object {object}");
	}
	let inner = log.inner.borrow();
	assert_eq!(inner.bytes, concat_objects(&objects));
	assert_eq!(inner.close_reason, Some(quicr_lite::CloseReason::Finished));

	// The sender counted at least the six scripted losses.
	let sender_stats = report.stats.get(&(1, 0)).expect("sender stats");
	assert!(sender_stats.nb_fragment_lost >= 6, "lost: {}", sender_stats.nb_fragment_lost);
}

#[test]
fn datagram_extra_repeat_on_nack() {
	let config = Config {
		repeat: RepeatConfig {
			extra_repeat_delay: 10_000,
			extra_repeat_on_nack: true,
			extra_repeat_after_received_delayed: false,
		},
		..Config::default()
	};
	let mut server = Node::new(config, false);
	let mut clock = 1_000_000;

	let source = server.endpoint.publish_object_source(&b"video/s6"[..], false);
	server
		.endpoint
		.publish_object(source, &test_content(1, 100), 0x80, false, clock)
		.unwrap();
	server.endpoint.publish_fin(source).unwrap();

	// Inject the subscriber's REQUEST by hand so the ack timeline stays
	// under test control.
	let request = frame_message(&wire::Request {
		url: bytes::Bytes::from_static(b"video/s6"),
		media_id: 0,
		transport_mode: TransportMode::Datagram,
		intent: SubscribeIntent::StartPoint(Location::ZERO),
	});
	server
		.endpoint
		.on_stream_data(server.cnx, &mut server.transport, 0, &request, false, clock)
		.unwrap();
	assert!(server.transport.datagram_ready);

	let first = server
		.endpoint
		.prepare_datagram(server.cnx, &mut server.transport, SPACE, clock)
		.unwrap()
		.expect("datagram prepared");

	// The transport reports the first transmission lost: an immediate repeat
	// goes out and an extra copy is scheduled 10ms later.
	server
		.endpoint
		.on_datagram_event(server.cnx, &mut server.transport, DatagramEvent::Lost, clock, &first, clock + 100)
		.unwrap();
	let repeat = server.transport.queued_datagrams.pop_front().expect("immediate repeat");

	let stats = server.endpoint.stream_stats(server.cnx, 0).unwrap();
	assert_eq!(stats.nb_fragment_lost, 1);
	assert_eq!(stats.nb_extra_sent, 1);

	// No ack yet: the extra copy fires once its delay expires.
	let next = server.endpoint.time_check(server.cnx, &mut server.transport, clock + 1_000);
	assert_eq!(next, clock + 100 + 10_000);
	clock = next;
	server.endpoint.time_check(server.cnx, &mut server.transport, clock);
	let extra = server.transport.queued_datagrams.pop_front().expect("extra repeat");

	// Both copies reach the receiver; the duplicate is discarded silently.
	let mut client = Node::new(Config::default(), true);
	let log = MediaLog::default();
	client
		.endpoint
		.request_media(
			client.cnx,
			&mut client.transport,
			&b"video/s6"[..],
			TransportMode::Datagram,
			SubscribeIntent::StartPoint(Location::ZERO),
			Box::new(MediaConsumer::new(Box::new(log.clone()))),
		)
		.unwrap();
	client.endpoint.on_datagram(client.cnx, &mut client.transport, &repeat, clock).unwrap();
	client.endpoint.on_datagram(client.cnx, &mut client.transport, &extra, clock).unwrap();
	assert_eq!(log.times_written(Location::new(0, 0)), 1);

	// The late ack of the repeat cleans up the tracking state.
	server
		.endpoint
		.on_datagram_event(server.cnx, &mut server.transport, DatagramEvent::Acked, clock, &repeat, clock)
		.unwrap();
	let stats = server.endpoint.stream_stats(server.cnx, 0).unwrap();
	assert_eq!(stats.pending_ack_records, 0);
}

#[test]
fn datagram_repair_falls_back_to_stream() {
	let mut server = Node::new(Config::default(), false);
	let mut client = Node::new(Config::default(), true);
	let mut clock = 1_000_000;

	let objects = make_objects(&[500, 600], &[]);
	let source = server.endpoint.publish_object_source(&b"video/fb"[..], false);
	for object in &objects {
		server
			.endpoint
			.publish_object(source, &object.data, object.flags, object.new_group, clock)
			.unwrap();
	}
	server.endpoint.publish_fin(source).unwrap();

	let log = MediaLog::default();
	client
		.endpoint
		.request_media(
			client.cnx,
			&mut client.transport,
			&b"video/fb"[..],
			TransportMode::Datagram,
			SubscribeIntent::StartPoint(Location::ZERO),
			Box::new(MediaConsumer::new(Box::new(log.clone()))),
		)
		.unwrap();

	// The datagram queue refuses every retransmission, forcing the repair
	// onto the reliable control stream.
	server.transport.queue_limit = 0;
	let mut lost_once = false;
	let mut loss: LossPlan = Box::new(move |header, _| {
		let target = header.location.object == 0 && !lost_once;
		lost_once |= target;
		target
	});

	pump(&mut [client.peer(), server.peer()], &mut clock, &mut loss);

	let inner = log.inner.borrow();
	assert_eq!(inner.bytes, concat_objects(&objects));
	assert_eq!(inner.close_reason, Some(quicr_lite::CloseReason::Finished));
}
