// rkv-common - Wire-level types shared by everything that speaks the RingKV protocol
//
// This crate defines the frame envelope, the stream framer and the payload messages

pub mod codes;
pub mod error;
pub mod frame;
pub mod framer;
pub mod messages;

// Re-export for convenience
pub use codes::*;
pub use error::*;
pub use frame::*;
pub use framer::*;
