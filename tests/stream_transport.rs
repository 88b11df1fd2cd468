//! End-to-end delivery over the single-stream transport mode.

mod common;

use common::*;
use quicr_lite::{Config, DeliveryMode, Location, MediaConsumer, SubscribeIntent, TransportMode};

fn publish_all(server: &mut Node, url: &'static [u8], objects: &[TestObject], now: u64) {
	let source = server.endpoint.publish_object_source(url, false);
	for object in objects {
		server
			.endpoint
			.publish_object(source, &object.data, object.flags, object.new_group, now)
			.unwrap();
	}
	server.endpoint.publish_fin(source).unwrap();
}

#[test]
fn stream_no_loss() {
	let mut server = Node::new(Config::default(), false);
	let mut client = Node::new(Config::default(), true);
	let mut clock = 1_000_000;

	let objects = make_objects(&[300, 20_000, 150], &[2]);
	publish_all(&mut server, b"video/s1", &objects, clock);

	let log = MediaLog::default();
	let stream_id = client
		.endpoint
		.request_media(
			client.cnx,
			&mut client.transport,
			&b"video/s1"[..],
			TransportMode::SingleStream,
			SubscribeIntent::StartPoint(Location::ZERO),
			Box::new(MediaConsumer::new(Box::new(log.clone()))),
		)
		.unwrap();

	pump(&mut [client.peer(), server.peer()], &mut clock, &mut no_loss());

	let inner = log.inner.borrow();
	assert_eq!(inner.bytes, concat_objects(&objects));

	// Every object delivered exactly once, in sequence.
	let locations: Vec<(Location, DeliveryMode)> = inner.delivered.iter().map(|(at, mode, _)| (*at, *mode)).collect();
	assert_eq!(
		locations,
		vec![
			(Location::new(0, 0), DeliveryMode::InSequence),
			(Location::new(0, 1), DeliveryMode::InSequence),
			(Location::new(1, 0), DeliveryMode::InSequence),
		]
	);

	// Log lines carry the embedded object headers in publishing order.
	assert_eq!(inner.lines.len(), 3);
	for (index, line) in inner.lines.iter().enumerate() {
		let fields: Vec<&str> = line.split(',').collect();
		assert_eq!(fields[4], index.to_string(), "object number in {line}");
	}
	let arrivals: Vec<u64> = inner.lines.iter().map(|line| line.split(',').nth(2).unwrap().parse().unwrap()).collect();
	assert!(arrivals.windows(2).all(|pair| pair[0] <= pair[1]));

	assert_eq!(inner.close_reason, Some(quicr_lite::CloseReason::Finished));
	assert!(!client.endpoint.has_stream(client.cnx, stream_id));
	assert!(!server.endpoint.has_stream(server.cnx, stream_id));
}

#[test]
fn stream_start_point_late_join() {
	let mut server = Node::new(Config::default(), false);
	let mut client = Node::new(Config::default(), true);
	let mut clock = 1_000_000;

	// Two groups; the subscriber joins at the start of the second.
	let objects = make_objects(&[300, 400, 150, 200, 250], &[2]);
	publish_all(&mut server, b"video/s3", &objects, clock);

	let log = MediaLog::default();
	client
		.endpoint
		.request_media(
			client.cnx,
			&mut client.transport,
			&b"video/s3"[..],
			TransportMode::SingleStream,
			SubscribeIntent::StartPoint(Location::new(1, 0)),
			Box::new(MediaConsumer::new(Box::new(log.clone()))),
		)
		.unwrap();

	pump(&mut [client.peer(), server.peer()], &mut clock, &mut no_loss());

	let inner = log.inner.borrow();
	assert_eq!(inner.bytes, concat_objects(&objects[2..]));
	let locations: Vec<Location> = inner.delivered.iter().map(|(at, _, _)| *at).collect();
	assert_eq!(
		locations,
		vec![Location::new(1, 0), Location::new(1, 1), Location::new(1, 2)]
	);
	assert!(inner.delivered.iter().all(|(_, mode, _)| *mode == DeliveryMode::InSequence));
	assert_eq!(inner.close_reason, Some(quicr_lite::CloseReason::Finished));

	// Nothing below the start point ever reached the consumer.
	assert_eq!(client.endpoint.useless_fragments(), 0);
}

#[test]
fn stream_subscribe_intent_current_group() {
	let mut server = Node::new(Config::default(), false);
	let mut client = Node::new(Config::default(), true);
	let mut clock = 1_000_000;

	// Group 1 is currently being published when the subscription arrives.
	let objects = make_objects(&[300, 400, 150, 200], &[2]);
	publish_all(&mut server, b"video/live", &objects, clock);

	let log = MediaLog::default();
	client
		.endpoint
		.request_media(
			client.cnx,
			&mut client.transport,
			&b"video/live"[..],
			TransportMode::SingleStream,
			SubscribeIntent::CurrentGroup,
			Box::new(MediaConsumer::new(Box::new(log.clone()))),
		)
		.unwrap();

	pump(&mut [client.peer(), server.peer()], &mut clock, &mut no_loss());

	let inner = log.inner.borrow();
	assert_eq!(inner.bytes, concat_objects(&objects[2..]));
	assert_eq!(inner.close_reason, Some(quicr_lite::CloseReason::Finished));
}

#[test]
fn transport_close_reaches_the_consumer() {
	let mut client = Node::new(Config::default(), true);

	let log = MediaLog::default();
	client
		.endpoint
		.request_media(
			client.cnx,
			&mut client.transport,
			&b"video/gone"[..],
			TransportMode::SingleStream,
			SubscribeIntent::StartPoint(Location::ZERO),
			Box::new(MediaConsumer::new(Box::new(log.clone()))),
		)
		.unwrap();

	client
		.endpoint
		.on_transport_close(client.cnx, quicr_lite::CloseReason::QuicConnection, 0);
	assert_eq!(log.inner.borrow().close_reason, Some(quicr_lite::CloseReason::QuicConnection));
}

#[test]
fn stream_zero_length_objects() {
	let mut server = Node::new(Config::default(), false);
	let mut client = Node::new(Config::default(), true);
	let mut clock = 1_000_000;

	let source = server.endpoint.publish_object_source(&b"audio/z"[..], false);
	server.endpoint.publish_object(source, b"aaa", 0x80, false, clock).unwrap();
	server.endpoint.publish_object(source, b"", 0x80, false, clock).unwrap();
	server.endpoint.publish_object(source, b"ccc", 0x80, false, clock).unwrap();
	server.endpoint.publish_fin(source).unwrap();

	let log = MediaLog::default();
	client
		.endpoint
		.request_media(
			client.cnx,
			&mut client.transport,
			&b"audio/z"[..],
			TransportMode::SingleStream,
			SubscribeIntent::StartPoint(Location::ZERO),
			Box::new(MediaConsumer::new(Box::new(log.clone()))),
		)
		.unwrap();

	pump(&mut [client.peer(), server.peer()], &mut clock, &mut no_loss());

	let inner = log.inner.borrow();
	let sizes: Vec<usize> = inner.delivered.iter().map(|(_, _, size)| *size).collect();
	assert_eq!(sizes, vec![3, 0, 3]);
	assert_eq!(inner.bytes, b"aaaccc");
	assert_eq!(inner.close_reason, Some(quicr_lite::CloseReason::Finished));
}
