use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;

use crate::{Error, FragmentKey, Location, wire::DatagramHeader};

/// Extra-repeat behavior, configured on the endpoint.
#[derive(Clone, Copy, Debug, Default)]
pub struct RepeatConfig {
	/// Delay before an extra copy is sent, in microseconds. Zero disables.
	pub extra_repeat_delay: u64,
	/// Send an extra copy after every NACK-driven repeat.
	pub extra_repeat_on_nack: bool,
	/// Send an extra copy of fragments that arrived already delayed upstream.
	pub extra_repeat_after_received_delayed: bool,
}

/// Outcome of registering a freshly sent datagram fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckInit {
	Created,
	/// Everything below the horizon is already acknowledged.
	BelowHorizon,
	Duplicate,
}

#[derive(Clone, Debug)]
struct ExtraRepeat {
	data: Bytes,
	at: u64,
}

#[derive(Clone, Debug)]
struct AckRecord {
	length: u64,
	object_length: u64,
	flags: u8,
	nb_objects_previous_group: u64,
	queue_delay: u64,
	start_time: u64,
	last_sent_time: u64,
	is_acked: bool,
	nack_received: bool,
	is_extra_queued: bool,
	extra: Option<ExtraRepeat>,
}

/// Sender-side tracking of transmitted datagram fragments.
///
/// Records live in an ordered tree keyed by `(group, object, offset)`. The
/// horizon is the key below which every fragment is acknowledged; records are
/// forgotten as it advances. Crossing an object boundary requires the
/// previous fragment to have been the object's last, and crossing a group
/// boundary additionally requires `nb_objects_previous_group` to match.
#[derive(Default)]
pub struct AckEngine {
	records: BTreeMap<FragmentKey, AckRecord>,
	extra_queue: VecDeque<FragmentKey>,
	horizon: Option<Horizon>,
	pub nb_fragment_lost: u64,
	pub nb_extra_sent: u64,
	pub nb_horizon_acks: u64,
	pub nb_horizon_events: u64,
}

#[derive(Clone, Copy, Debug)]
struct Horizon {
	key: FragmentKey,
	is_last_fragment: bool,
}

impl AckEngine {
	/// Register a fragment handed to the transport as a datagram.
	#[allow(clippy::too_many_arguments)]
	pub fn ack_init(
		&mut self,
		key: FragmentKey,
		flags: u8,
		nb_objects_previous_group: u64,
		data: &[u8],
		queue_delay: u64,
		object_length: u64,
		config: &RepeatConfig,
		now: u64,
	) -> AckInit {
		if self.horizon.is_some_and(|h| key < h.key) {
			self.nb_horizon_events += 1;
			return AckInit::BelowHorizon;
		}
		if self.records.contains_key(&key) {
			tracing::trace!(?key, "ack init duplicate");
			return AckInit::Duplicate;
		}

		self.records.insert(
			key,
			AckRecord {
				length: data.len() as u64,
				object_length,
				flags,
				nb_objects_previous_group,
				queue_delay,
				start_time: now,
				last_sent_time: now,
				is_acked: false,
				nack_received: false,
				is_extra_queued: false,
				extra: None,
			},
		);

		// A fragment that was already delayed upstream is a likely loss
		// candidate downstream as well.
		if config.extra_repeat_after_received_delayed && config.extra_repeat_delay > 0 && queue_delay > 20 {
			self.queue_extra(key, data, now + config.extra_repeat_delay);
		}

		AckInit::Created
	}

	/// Process an acknowledged datagram. The acked range may span several
	/// contiguous records when a repeat was split or spurious.
	pub fn handle_ack(&mut self, location: Location, offset: u64, length: u64) {
		let mut acked_offset = offset;
		let mut acked_length = length as i64;
		let mut should_check = self.horizon.is_none();
		let mut below = false;

		if let Some(h) = self.horizon {
			let floor = h.key.location();
			if location == floor {
				if offset + length < h.key.offset {
					below = true;
				} else if offset < h.key.offset {
					// Only the part above the horizon is interesting.
					acked_length -= (h.key.offset - offset) as i64;
					acked_offset = h.key.offset;
					should_check = true;
				} else if offset == h.key.offset {
					should_check = true;
				}
			} else if location < floor {
				below = true;
			} else if h.is_last_fragment && location == floor.next_object() && offset == 0 {
				should_check = true;
			}
		}

		if below {
			self.nb_horizon_acks += 1;
			return;
		}

		// Mark the matching record, then any contiguous successors covered by
		// the acked range (a spurious loss ack may span split records).
		// Zero-length placeholders ack with length 0; a range trimmed down to
		// nothing by the horizon must not touch the record at the boundary.
		if length == 0 || acked_length > 0 {
			loop {
				let key = FragmentKey::new(location, acked_offset);
				let Some(record) = self.records.get_mut(&key) else {
					break;
				};
				record.is_acked = true;
				if record.length == 0 {
					break;
				}
				acked_length -= record.length as i64;
				acked_offset += record.length;
				if acked_length <= 0 {
					break;
				}
			}
		}

		if should_check {
			self.advance_horizon();
		}
	}

	/// Process a NACK: repeat the fragment immediately unless it was already
	/// acknowledged or a fresher copy is in flight.
	#[allow(clippy::too_many_arguments)]
	pub fn handle_lost(
		&mut self,
		key: FragmentKey,
		sent_time: u64,
		data: &[u8],
		media_id: u64,
		config: &RepeatConfig,
		queue_max: usize,
		queue: &mut dyn FnMut(Bytes) -> Result<(), Error>,
		now: u64,
	) -> Result<(), Error> {
		let Some(record) = self.records.get(&key) else {
			// Not found: assume acknowledged and dropped below the horizon.
			return Ok(());
		};
		if record.is_acked {
			return Ok(());
		}
		if record.is_extra_queued && record.last_sent_time > sent_time + 1000 {
			tracing::debug!(?key, sent_time, last_sent = record.last_sent_time, "ignoring stale nack");
			return Ok(());
		}

		self.records.get_mut(&key).expect("record just found").nack_received = true;
		self.nb_fragment_lost += 1;
		self.repeat(key, data, media_id, config.extra_repeat_on_nack, config, queue_max, queue, now)
	}

	/// Re-send a fragment as one or more datagrams, splitting it when the
	/// encoded size exceeds what the transport will queue.
	#[allow(clippy::too_many_arguments)]
	pub fn repeat(
		&mut self,
		key: FragmentKey,
		data: &[u8],
		media_id: u64,
		prepare_extra: bool,
		config: &RepeatConfig,
		queue_max: usize,
		queue: &mut dyn FnMut(Bytes) -> Result<(), Error>,
		now: u64,
	) -> Result<(), Error> {
		let mut key = key;
		let mut data = Bytes::copy_from_slice(data);

		loop {
			// The record can vanish mid-split if the horizon moved past it.
			let Some(record) = self.records.get_mut(&key) else {
				return Ok(());
			};
			let queue_delay_delta = (now.saturating_sub(record.start_time) + 500) / 1000;
			record.last_sent_time = now;

			let header = DatagramHeader {
				media_id,
				location: key.location(),
				offset: key.offset,
				queue_delay: record.queue_delay + queue_delay_delta,
				flags: record.flags,
				nb_objects_previous_group: record.nb_objects_previous_group,
				object_length: record.object_length,
			};
			let header_size = header.encoded_size();
			let fragment_length = data.len().min(queue_max.saturating_sub(header_size));

			queue(header.encode_datagram(&data[..fragment_length]))?;
			tracing::trace!(?key, size = fragment_length, "repeated fragment");

			if prepare_extra && config.extra_repeat_delay > 0 {
				self.queue_extra(key, &data[..fragment_length], now + config.extra_repeat_delay);
			}

			if fragment_length >= data.len() {
				break;
			}

			// Split: the original record shrinks and a new record tracks the
			// tail, inheriting the object length and nack state.
			let record = self.records.get_mut(&key).expect("record just updated");
			let (object_length, flags, nb_objects_previous_group, queue_delay, start_time, nack_received) = (
				record.object_length,
				record.flags,
				record.nb_objects_previous_group,
				record.queue_delay,
				record.start_time,
				record.nack_received,
			);
			record.length = fragment_length as u64;

			let tail_key = FragmentKey::new(key.location(), key.offset + fragment_length as u64);
			data = data.slice(fragment_length..);
			self.records.entry(tail_key).or_insert(AckRecord {
				length: data.len() as u64,
				object_length,
				flags,
				nb_objects_previous_group,
				queue_delay,
				start_time,
				last_sent_time: now,
				is_acked: false,
				nack_received,
				is_extra_queued: false,
				extra: None,
			});
			key = tail_key;
		}
		Ok(())
	}

	/// Send every extra repeat that came due, returning the next due time.
	pub fn handle_extra_repeat(
		&mut self,
		media_id: u64,
		config: &RepeatConfig,
		queue_max: usize,
		queue: &mut dyn FnMut(Bytes) -> Result<(), Error>,
		now: u64,
	) -> Option<u64> {
		while let Some(&key) = self.extra_queue.front() {
			let Some(extra) = self.records.get(&key).and_then(|record| record.extra.clone()) else {
				self.extra_queue.pop_front();
				continue;
			};
			if extra.at > now {
				return Some(extra.at);
			}
			self.extra_queue.pop_front();
			if let Some(record) = self.records.get_mut(&key) {
				record.extra = None;
				if record.is_acked {
					continue;
				}
			}
			if let Err(err) = self.repeat(key, &extra.data, media_id, false, config, queue_max, queue, now) {
				tracing::debug!(?key, ?err, "extra repeat failed");
			}
		}
		None
	}

	/// The horizon floor, if initialized.
	pub fn horizon(&self) -> Option<(FragmentKey, bool)> {
		self.horizon.map(|h| (h.key, h.is_last_fragment))
	}

	/// Number of fragments still tracked.
	pub fn len(&self) -> usize {
		self.records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}

	fn queue_extra(&mut self, key: FragmentKey, data: &[u8], at: u64) {
		let Some(record) = self.records.get_mut(&key) else {
			return;
		};
		// At most one extra copy per record, ever.
		if record.is_extra_queued {
			return;
		}
		record.is_extra_queued = true;
		record.extra = Some(ExtraRepeat {
			data: Bytes::copy_from_slice(data),
			at,
		});
		self.extra_queue.push_back(key);
		self.nb_extra_sent += 1;
	}

	/// Walk acked records in key order from the tree's first entry, folding
	/// each contiguous one into the horizon and forgetting it.
	fn advance_horizon(&mut self) {
		loop {
			let Some((&key, record)) = self.records.iter().next() else {
				break;
			};
			if !record.is_acked {
				break;
			}

			let just_after = match self.horizon {
				None => true,
				Some(h) => {
					if key.group == h.key.group {
						if key.object == h.key.object {
							key.offset == h.key.offset
						} else {
							h.is_last_fragment && key.object == h.key.object + 1 && key.offset == 0
						}
					} else {
						h.is_last_fragment
							&& key.group == h.key.group + 1 && key.object == 0 && key.offset == 0
							&& record.nb_objects_previous_group == h.key.object + 1
					}
				}
			};
			if !just_after {
				break;
			}

			let end = key.offset + record.length;
			self.horizon = Some(Horizon {
				key: FragmentKey::new(key.location(), end),
				is_last_fragment: end >= record.object_length,
			});
			self.drop_record(key);
		}
	}

	fn drop_record(&mut self, key: FragmentKey) {
		if let Some(record) = self.records.remove(&key) {
			if record.extra.is_some() {
				self.extra_queue.retain(|queued| *queued != key);
			}
		}
	}

	/// Release the engine, reporting what was never acknowledged.
	pub fn release(&self) {
		if self.records.is_empty() && self.nb_extra_sent == 0 && self.nb_horizon_acks == 0 && self.nb_horizon_events == 0 {
			return;
		}
		let acked = self.records.values().filter(|r| r.is_acked).count();
		let nacked = self.records.values().filter(|r| r.nack_received).count();
		tracing::debug!(
			remaining = self.records.len(),
			acked,
			nacked,
			extra = self.nb_extra_sent,
			horizon_acks = self.nb_horizon_acks,
			horizon_events = self.nb_horizon_events,
			"releasing ack state"
		);
	}
}
