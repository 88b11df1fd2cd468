//! Low-level encoding: varints, primitive codecs, and message framing.

mod buffer;
mod decode;
mod encode;

pub use buffer::*;
pub use decode::*;
pub use encode::*;
