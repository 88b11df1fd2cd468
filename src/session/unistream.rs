use crate::{
	Error, FLAGS_SKIPPED, Location, StreamChunk, Transport, TransportMode,
	coding::{FrameBuffer, SendBuffer},
	wire,
};

use super::stream::{StreamCtx, queue_message};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UniSendState {
	/// Nothing sent yet; the warp header goes first.
	Open,
	/// Between objects; decide whether another object header is due.
	WarpHeaderSent,
	/// Streaming the current object's payload.
	ObjectData,
	/// Every object of this substream's scope has been sent.
	AllSent,
	/// FIN emitted; the context is about to be deleted.
	ShouldClose,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UniRecvState {
	Open,
	WarpHeader,
	ObjectHeader,
	ObjectData,
}

/// A unidirectional substream: one group in warp mode, one object in rush.
pub(crate) struct UniStreamCtx {
	pub stream_id: u64,
	pub control_stream_id: Option<u64>,
	pub send_state: UniSendState,
	pub recv_state: UniRecvState,
	pub group_id: u64,
	pub object_id: u64,
	/// Exclusive end of this substream's objects; 0 while unknown.
	pub last_object_id: u64,
	pub object_length: u64,
	pub object_flags: u8,
	pub nb_objects_previous_group: u64,
	pub object_offset: u64,
	/// Objects completed on the receive side of this substream.
	pub objects_seen: u64,
	pub send_buffer: SendBuffer,
	pub recv_buffer: FrameBuffer,
}

impl UniStreamCtx {
	pub fn new(stream_id: u64, control_stream_id: Option<u64>) -> Self {
		Self {
			stream_id,
			control_stream_id,
			send_state: UniSendState::Open,
			recv_state: UniRecvState::Open,
			group_id: 0,
			object_id: 0,
			last_object_id: 0,
			object_length: 0,
			object_flags: 0,
			nb_objects_previous_group: 0,
			object_offset: 0,
			objects_seen: 0,
			send_buffer: SendBuffer::default(),
			recv_buffer: FrameBuffer::default(),
		}
	}

	pub fn current_location(&self) -> Location {
		Location::new(self.group_id, self.object_id)
	}
}

/// Fill the next chunk of a sending substream. Returns the chunk and whether
/// the substream is finished and should be deleted.
pub(crate) fn prepare_uni_send(
	uni: &mut UniStreamCtx,
	control: &mut StreamCtx,
	transport: &mut dyn Transport,
	space: usize,
	now: u64,
) -> Result<(StreamChunk, bool), Error> {
	if uni.send_state == UniSendState::ObjectData {
		let cursor = control
			.sender
			.as_mut()
			.and_then(|sender| sender.cursor())
			.ok_or(Error::ModeRequiresCache)?;
		let cache = cursor.cache();
		let data = cache
			.borrow()
			.copy_available_data(uni.current_location(), uni.object_offset, space);

		if data.is_empty() {
			transport.mark_stream_active(uni.stream_id, false);
			return Ok((StreamChunk::empty(), false));
		}

		uni.object_offset += data.len() as u64;
		if uni.object_offset >= uni.object_length {
			uni.object_id += 1;
			uni.object_offset = 0;
			uni.send_state = UniSendState::WarpHeaderSent;
		}
		return Ok((
			StreamChunk {
				data: data.to_vec(),
				fin: false,
				still_active: true,
			},
			false,
		));
	}

	if uni.send_buffer.is_empty() {
		match uni.send_state {
			UniSendState::Open => {
				let media_id = control.media_id.ok_or(Error::StateViolation)?;
				tracing::debug!(stream = uni.stream_id, group = uni.group_id, "sending warp header");
				queue_message(
					&mut uni.send_buffer,
					&wire::WarpHeader {
						media_id,
						group_id: uni.group_id,
					},
				);
				uni.send_state = UniSendState::WarpHeaderSent;
			}
			UniSendState::WarpHeaderSent => prepare_object_header(uni, control, now)?,
			_ => {}
		}
	}

	if !uni.send_buffer.is_empty() {
		let data = uni.send_buffer.pull(space);
		Ok((
			StreamChunk {
				data: data.to_vec(),
				fin: false,
				still_active: true,
			},
			false,
		))
	} else if uni.send_state == UniSendState::AllSent {
		// Everything for this scope went out; close the substream.
		uni.send_state = UniSendState::ShouldClose;
		Ok((
			StreamChunk {
				data: Vec::new(),
				fin: true,
				still_active: false,
			},
			true,
		))
	} else {
		transport.mark_stream_active(uni.stream_id, false);
		Ok((StreamChunk::empty(), false))
	}
}

/// Decide whether the next object header (or the substream FIN) is due.
fn prepare_object_header(uni: &mut UniStreamCtx, control: &mut StreamCtx, now: u64) -> Result<(), Error> {
	let _ = now;
	let cursor = control
		.sender
		.as_mut()
		.and_then(|sender| sender.cursor())
		.ok_or(Error::ModeRequiresCache)?;
	let cache_rc = cursor.cache();
	let cache = cache_rc.borrow();

	// Learn where this substream's scope ends. Rush substreams were created
	// with the end already set to one past their single object.
	if uni.last_object_id == 0 {
		if let Some(last) = control.final_location {
			if last.group == uni.group_id {
				uni.last_object_id = last.object;
			}
		}
		if uni.last_object_id == 0 {
			uni.last_object_id = cache.object_count(uni.group_id).unwrap_or(0);
		}
	}

	if uni.last_object_id > 0 && uni.object_id >= uni.last_object_id {
		uni.send_state = UniSendState::AllSent;
		return Ok(());
	}

	let location = uni.current_location();
	let Some(props) = cache.object_properties(location) else {
		// Not cached yet; stay idle until a wakeup.
		return Ok(());
	};

	let nb_objects_previous_group = if uni.object_id == 0 && uni.group_id > 0 {
		props.nb_objects_previous_group
	} else {
		0
	};

	drop(cache);
	let should_skip = cursor.should_skip_at(location, &props);
	let (object_length, flags) = if should_skip {
		tracing::debug!(stream = uni.stream_id, %location, "skipping object on substream");
		(0, FLAGS_SKIPPED)
	} else {
		(props.object_length, props.flags)
	};

	uni.object_length = object_length;
	uni.object_flags = flags;
	uni.nb_objects_previous_group = nb_objects_previous_group;
	queue_message(
		&mut uni.send_buffer,
		&wire::ObjectHeader {
			object_id: uni.object_id,
			nb_objects_previous_group,
			flags,
			object_length,
		},
	);

	if object_length == 0 {
		// No payload follows; move straight to the next object.
		uni.object_id += 1;
		uni.send_state = UniSendState::WarpHeaderSent;
	} else {
		uni.object_offset = 0;
		uni.send_state = UniSendState::ObjectData;
	}
	Ok(())
}

/// The ordering rule for incoming object headers, stated per mode.
pub(crate) fn check_incoming_object_order(
	mode: TransportMode,
	uni: &UniStreamCtx,
	incoming_object_id: u64,
) -> Result<(), Error> {
	match mode {
		// A rush substream carries exactly one object.
		TransportMode::Rush if uni.objects_seen > 0 => Err(Error::StateViolation),
		TransportMode::Rush => Ok(()),
		// A warp substream delivers objects in strict sequence.
		TransportMode::Warp if incoming_object_id != uni.object_id => Err(Error::StateViolation),
		TransportMode::Warp => Ok(()),
		_ => Err(Error::StateViolation),
	}
}
