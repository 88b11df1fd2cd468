use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::coding::{Decode, DecodeError, Encode};

/// The name of a media object: a group and an object within the group.
///
/// Ordering is lexicographic, which matches delivery order everywhere except
/// across a group boundary; crossing one additionally requires the object
/// count of the previous group, see [crate::Reassembly] and [crate::AckEngine].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
	pub group: u64,
	pub object: u64,
}

impl Location {
	pub const ZERO: Self = Self { group: 0, object: 0 };

	pub fn new(group: u64, object: u64) -> Self {
		Self { group, object }
	}

	pub fn is_zero(&self) -> bool {
		*self == Self::ZERO
	}

	/// The next object within the same group.
	pub fn next_object(self) -> Self {
		Self {
			group: self.group,
			object: self.object + 1,
		}
	}

	/// The first object of the next group.
	pub fn next_group(self) -> Self {
		Self {
			group: self.group + 1,
			object: 0,
		}
	}
}

impl Decode for Location {
	fn decode<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		let group = u64::decode(r)?;
		let object = u64::decode(r)?;
		Ok(Self { group, object })
	}
}

impl Encode for Location {
	fn encode<W: BufMut>(&self, w: &mut W) {
		self.group.encode(w);
		self.object.encode(w);
	}
}

impl std::fmt::Display for Location {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}/{}", self.group, self.object)
	}
}

/// The ordering key of a fragment: object name plus byte offset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FragmentKey {
	pub group: u64,
	pub object: u64,
	pub offset: u64,
}

impl FragmentKey {
	pub fn new(location: Location, offset: u64) -> Self {
		Self {
			group: location.group,
			object: location.object,
			offset,
		}
	}

	pub fn location(&self) -> Location {
		Location {
			group: self.group,
			object: self.object,
		}
	}
}

/// How the media bytes travel once the control stream is established.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u64)]
pub enum TransportMode {
	/// Fragments inline on the control stream itself.
	SingleStream = 1,
	/// One fragment per QUIC datagram, with NACK-driven repair.
	Datagram = 2,
	/// One unidirectional substream per group.
	Warp = 3,
	/// One unidirectional substream per object.
	Rush = 4,
}

impl Decode for TransportMode {
	fn decode<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		Self::try_from(u64::decode(r)?).map_err(|_| DecodeError::InvalidValue)
	}
}

impl Encode for TransportMode {
	fn encode<W: BufMut>(&self, w: &mut W) {
		u64::from(*self).encode(w)
	}
}

/// Where a new subscription should start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeIntent {
	/// From the start of the group currently being published.
	CurrentGroup,
	/// From the start of the next group to be published.
	NextGroup,
	/// From an explicit object.
	StartPoint(Location),
}

#[derive(Clone, Copy, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u64)]
enum IntentKind {
	CurrentGroup = 1,
	NextGroup = 2,
	StartPoint = 3,
}

impl Decode for SubscribeIntent {
	fn decode<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		let kind = IntentKind::try_from(u64::decode(r)?).map_err(|_| DecodeError::InvalidValue)?;
		Ok(match kind {
			IntentKind::CurrentGroup => Self::CurrentGroup,
			IntentKind::NextGroup => Self::NextGroup,
			IntentKind::StartPoint => Self::StartPoint(Location::decode(r)?),
		})
	}
}

impl Encode for SubscribeIntent {
	fn encode<W: BufMut>(&self, w: &mut W) {
		match self {
			Self::CurrentGroup => u64::from(IntentKind::CurrentGroup).encode(w),
			Self::NextGroup => u64::from(IntentKind::NextGroup).encode(w),
			Self::StartPoint(start) => {
				u64::from(IntentKind::StartPoint).encode(w);
				start.encode(w);
			}
		}
	}
}

/// Flags value marking an object the sender decided to skip.
pub const FLAGS_SKIPPED: u8 = 0xff;
