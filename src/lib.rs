//! # quicr-lite: real-time media over QUIC
//!
//! A sans-IO implementation of the QUICR media transport: named media objects,
//! grouped into groups, delivered from publishers to subscribers over a
//! QUIC-like transport. Four transport modes are supported: a single reliable
//! stream, unreliable datagrams with NACK-driven repair, and per-group (warp)
//! or per-object (rush) unidirectional substreams.
//!
//! The crate owns no sockets and reads no clocks. The embedding event loop
//! drives a QUIC implementation and forwards its callbacks to an [Endpoint]:
//! stream data, prepare-to-send, datagrams, datagram ack/loss, close. The
//! core calls back out through the narrow [Transport] trait (mark a stream
//! active, queue a datagram, open a stream). Between two callbacks the core's
//! state is fully consistent; all timing is driven by the value returned from
//! [Endpoint::time_check].
//!
//! To publish, register an [ObjectSource] on the endpoint and append objects
//! to it. To consume, call [Endpoint::request_media] with a [Consumer];
//! the provided [MediaConsumer] reassembles fragments into in-order object
//! deliveries. Publication discovery uses SUBSCRIBE/NOTIFY url-prefix
//! matching, see [Endpoint::subscribe_pattern].

mod ack;
mod cache;
mod error;
mod model;
mod reassembly;
mod session;
mod transport;

pub mod coding;
pub mod wire;

pub use ack::*;
pub use cache::*;
pub use error::*;
pub use model::*;
pub use reassembly::*;
pub use session::*;
pub use transport::*;
