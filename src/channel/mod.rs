//! Message-framed duplex channels between parent and child processes.
//!
//! Messages are JSON-serialized, zlib-compressed, base64-encoded and
//! newline-delimited. The channel itself knows nothing about processes; it
//! wraps one half of a socketpair and handles framing, buffering and
//! topic-filtered delivery.

mod duplex;
mod message;

pub use duplex::Channel;
pub use message::{Message, Payload, Topic};
