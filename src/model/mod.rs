mod consumer;
mod cursor;
mod location;
mod publisher;
mod source;

pub use consumer::*;
pub use cursor::*;
pub use location::*;
pub use publisher::*;
pub use source::*;
