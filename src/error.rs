use thiserror::Error;

use crate::coding::DecodeError;

/// A fatal error on a stream or connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
	/// The codec ran off the buffer or produced an invalid value.
	#[error("malformed message: {0}")]
	Malformed(#[from] DecodeError),

	/// A message arrived in a receive state that forbids it.
	#[error("message not allowed in the current state")]
	StateViolation,

	/// A fragment overlaps previously cached data with different content.
	#[error("fragment overlaps cached data")]
	Overlap,

	/// A start point contradicts data that was already delivered in order.
	#[error("start point conflicts with delivered data")]
	StartPointConflict,

	/// A subscription targeted a URL that is not locally registered.
	#[error("no local source for url")]
	SourceNotFound,

	/// No stream is bound to the given media alias.
	#[error("unknown media id {0}")]
	UnknownMedia(u64),

	/// No context exists for the given stream id.
	#[error("unknown stream {0}")]
	UnknownStream(u64),

	/// No context exists for the given connection id.
	#[error("unknown connection {0}")]
	UnknownConnection(u64),

	/// The requested transport mode needs an object source behind it.
	#[error("transport mode requires an object source")]
	ModeRequiresCache,

	/// The peer violated the publisher or consumer contract.
	#[error("media contract violation")]
	MediaContract,

	/// Propagated from the transport.
	#[error("transport failure")]
	Transport,

	/// The connection or stream is already closed.
	#[error("closed")]
	Closed,
}

/// Positive outcome of a consumer operation.
///
/// `Finished` means the consumer has everything up to the final object and the
/// stream can be closed gracefully. It is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
	Active,
	Finished,
}

/// Why a publisher or consumer is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
	/// All media was delivered.
	Finished,
	/// The peer application closed the stream or connection.
	RemoteApplication,
	/// The QUIC connection went away.
	QuicConnection,
	/// The local context is being torn down.
	DeleteContext,
	/// A protocol or internal error.
	InternalError,
}
