use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use crate::{Error, FragmentKey, Location};

/// A received fragment held by the cache.
#[derive(Clone, Debug)]
pub struct CachedFragment {
	pub data: Bytes,
	/// Queue delay inherited from the hop that delivered the fragment, in ms.
	pub queue_delay: u64,
	pub cached_at: u64,
}

#[derive(Clone, Debug)]
struct ObjectMeta {
	length: u64,
	flags: u8,
	nb_objects_previous_group: u64,
	covered: u64,
	arrived_at: u64,
}

/// Per-media ordered store of received fragments.
///
/// Shared between the local source that fills it and the per-subscriber
/// cursors that drain it; each cursor keeps an independent position.
///
/// Invariant: once an object's length is known every fragment fits within
/// `[0, length)`, and the object is complete when the inserted offsets cover
/// that range exactly. Overlapping inserts that are not exact duplicates are
/// rejected.
#[derive(Default)]
pub struct FragmentCache {
	fragments: BTreeMap<FragmentKey, CachedFragment>,
	objects: BTreeMap<Location, ObjectMeta>,
	group_counts: BTreeMap<u64, u64>,
	highest: Option<Location>,
	final_location: Option<Location>,
}

impl FragmentCache {
	/// Insert a fragment. Returns `true` if it was new, `false` on an exact
	/// duplicate. Fails with [Error::Overlap] on inconsistent overlaps.
	#[allow(clippy::too_many_arguments)]
	pub fn insert(
		&mut self,
		location: Location,
		offset: u64,
		data: Bytes,
		object_length: u64,
		flags: u8,
		nb_objects_previous_group: u64,
		queue_delay: u64,
		now: u64,
	) -> Result<bool, Error> {
		let length = data.len() as u64;
		if offset + length > object_length {
			return Err(Error::Overlap);
		}

		let meta = self.objects.entry(location).or_insert(ObjectMeta {
			length: object_length,
			flags,
			nb_objects_previous_group,
			covered: 0,
			arrived_at: now,
		});
		if meta.length != object_length {
			return Err(Error::Overlap);
		}
		if nb_objects_previous_group > 0 {
			meta.nb_objects_previous_group = nb_objects_previous_group;
		}

		let key = FragmentKey::new(location, offset);
		if let Some(existing) = self.fragments.get(&key) {
			if existing.data.len() as u64 == length {
				return Ok(false);
			}
			return Err(Error::Overlap);
		}

		// The predecessor within the same object must end at or before us,
		// and the successor must start at or after our end.
		let before = self
			.fragments
			.range(FragmentKey::new(location, 0)..key)
			.next_back()
			.map(|(k, f)| k.offset + f.data.len() as u64);
		if before.is_some_and(|end| end > offset) {
			return Err(Error::Overlap);
		}
		let after = self
			.fragments
			.range(key..FragmentKey::new(location.next_object(), 0))
			.next()
			.map(|(k, _)| k.offset);
		if after.is_some_and(|start| start < offset + length) {
			return Err(Error::Overlap);
		}

		self.fragments.insert(
			key,
			CachedFragment {
				data,
				queue_delay,
				cached_at: now,
			},
		);
		let meta = self.objects.get_mut(&location).unwrap();
		meta.covered += length;

		// The first object of a group names the size of the group before it.
		if location.object == 0 && location.group > 0 && nb_objects_previous_group > 0 {
			self.group_counts.insert(location.group - 1, nb_objects_previous_group);
		}

		if self.highest.is_none_or(|h| location > h) {
			self.highest = Some(location);
		}

		Ok(true)
	}

	/// Object metadata, if any fragment of the object has been seen.
	pub fn object_properties(&self, location: Location) -> Option<ObjectProperties> {
		self.objects.get(&location).map(|meta| ObjectProperties {
			object_length: meta.length,
			flags: meta.flags,
			nb_objects_previous_group: meta.nb_objects_previous_group,
			arrived_at: meta.arrived_at,
		})
	}

	/// The number of objects in a group, if known from a following group's
	/// first fragment or from the final-object signal.
	pub fn object_count(&self, group: u64) -> Option<u64> {
		if let Some(count) = self.group_counts.get(&group) {
			return Some(*count);
		}
		match self.final_location {
			Some(last) if last.group == group => Some(last.object),
			_ => None,
		}
	}

	/// The length of the contiguous byte run available at the given offset.
	pub fn available_at(&self, location: Location, offset: u64) -> u64 {
		let mut next = offset;
		// The run may start inside a fragment that begins before `offset`.
		if let Some((key, fragment)) = self
			.fragments
			.range(FragmentKey::new(location, 0)..=FragmentKey::new(location, offset))
			.next_back()
		{
			let end = key.offset + fragment.data.len() as u64;
			if end > offset {
				next = end;
			}
		}
		for (key, fragment) in self
			.fragments
			.range(FragmentKey::new(location, next)..FragmentKey::new(location.next_object(), 0))
		{
			if key.offset != next {
				break;
			}
			next += fragment.data.len() as u64;
		}
		next - offset
	}

	/// Copy the largest contiguous run starting at `offset`, up to `max` bytes.
	pub fn copy_available_data(&self, location: Location, offset: u64, max: usize) -> Bytes {
		let available = self.available_at(location, offset).min(max as u64) as usize;
		if available == 0 {
			return Bytes::new();
		}

		let mut out = BytesMut::with_capacity(available);
		let mut cursor = offset;
		while out.len() < available {
			// The fragment containing `cursor` may start before it.
			let (key, fragment) = self
				.fragments
				.range(FragmentKey::new(location, 0)..=FragmentKey::new(location, cursor))
				.next_back()
				.expect("available data without a covering fragment");
			let skip = (cursor - key.offset) as usize;
			let take = (fragment.data.len() - skip).min(available - out.len());
			out.extend_from_slice(&fragment.data[skip..skip + take]);
			cursor += take as u64;
		}
		out.freeze()
	}

	/// Whether the object's offsets cover `[0, length)` entirely.
	pub fn is_object_complete(&self, location: Location) -> bool {
		self.objects
			.get(&location)
			.is_some_and(|meta| meta.covered == meta.length)
	}

	/// Record the exclusive end of the media; no fragment at or past `last`
	/// will be inserted.
	pub fn notify_final(&mut self, last: Location) {
		self.final_location = Some(last);
		self.group_counts.insert(last.group, last.object);
	}

	pub fn final_location(&self) -> Option<Location> {
		self.final_location
	}

	/// The highest object for which any fragment has been seen.
	pub fn highest_location(&self) -> Option<Location> {
		self.highest
	}

	/// The group currently being filled, i.e. the group of the highest object.
	pub fn current_group(&self) -> u64 {
		self.highest.map(|location| location.group).unwrap_or(0)
	}

	/// Queue delay a forwarder should advertise for the byte at `offset`: the
	/// delay inherited from upstream plus the time it sat in this cache.
	pub fn delay_at(&self, location: Location, offset: u64, now: u64) -> u64 {
		let covering = self
			.fragments
			.range(FragmentKey::new(location, 0)..=FragmentKey::new(location, offset))
			.next_back();
		match covering {
			Some((_, fragment)) => fragment.queue_delay + (now.saturating_sub(fragment.cached_at) + 500) / 1000,
			None => 0,
		}
	}

	/// Drop whole objects whose most recent fragment arrived before `cutoff`.
	/// Used by the periodic cache maintenance pass for real-time media.
	pub fn purge_older_than(&mut self, cutoff: u64) -> usize {
		let stale: Vec<Location> = self
			.objects
			.iter()
			.filter(|(location, meta)| {
				meta.arrived_at < cutoff
					&& self
						.fragments
						.range(FragmentKey::new(**location, 0)..FragmentKey::new(location.next_object(), 0))
						.all(|(_, f)| f.cached_at < cutoff)
			})
			.map(|(location, _)| *location)
			.collect();

		for location in &stale {
			self.objects.remove(location);
			let keys: Vec<FragmentKey> = self
				.fragments
				.range(FragmentKey::new(*location, 0)..FragmentKey::new(location.next_object(), 0))
				.map(|(k, _)| *k)
				.collect();
			for key in keys {
				self.fragments.remove(&key);
			}
		}
		stale.len()
	}
}

/// Metadata learned from an object's fragments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectProperties {
	pub object_length: u64,
	pub flags: u8,
	pub nb_objects_previous_group: u64,
	pub arrived_at: u64,
}
