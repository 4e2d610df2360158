//! TCP transport: per-channel receive ring and endpoint handling.

pub mod channel;
pub mod ring;

pub use channel::{Channel, Endpoint};
pub use ring::RingBuffer;

/// Receive ring capacity per channel, in bytes. A multiple of the 64-byte
/// block size, so whole blocks never wrap.
pub const BUF_SIZE: usize = 32768;
