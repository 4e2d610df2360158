//! Wire-level constants: frame geometry, opcodes, and access-attribute flags.
//!
//! A frame is `(length_code + 1) * 64` bytes of little-endian 64-bit words:
//!
//! ```text
//! word0: [7:0] interface id  [15:8] length code  [30] error  [31] initiator
//!        [63:32] packet id (DMA completion matching)
//! word1: [7:0] opcode  [21:16] access size  [27:24] sub-id  [31:28] flags
//!        [63:32] byte-enable mask
//! word2: address
//! word3..7: up to 40 bytes of payload
//! ```

use bitflags::bitflags;

/// Size of one wire block; every frame is a whole number of these.
pub const BLOCK_SIZE: usize = 64;

/// Size of one queued frame slot (a frame's first two blocks).
pub const SLOT_SIZE: usize = 128;

/// Payload byte offset inside a frame (start of word3).
pub const PAYLOAD_OFFSET: usize = 24;

/// Payload bytes addressable by partial-width accesses (words 3..7).
pub const PAYLOAD_SIZE: usize = 40;

/// Frame opcodes.
pub mod opcode {
    /// Keep-alive; echoed with the length code cleared.
    pub const PING: u8 = 0x00;
    pub const READ: u8 = 0x01;
    pub const WRITE: u8 = 0x02;
    /// Paired (dual-value) read.
    pub const READP: u8 = 0x03;
    /// Paired write, no acknowledge.
    pub const WRITEP: u8 = 0x04;
    /// Write with acknowledge echo.
    pub const WRITEA: u8 = 0x05;
    /// Paired write with acknowledge echo.
    pub const WRITEAP: u8 = 0x06;
    pub const IRQ_UPDATE: u8 = 0x41;
    pub const RGN_CLAIM: u8 = 0xF0;
    pub const RESET: u8 = 0xFF;
}

bitflags! {
    /// Bus access attribute bits carried in the frame's flags field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AccessFlags: u32 {
        /// Instruction fetch.
        const IFETCH = 2;
        /// Privileged access.
        const PRIV = 4;
        /// Secure-world access.
        const SECURE = 8;
    }
}

impl AccessFlags {
    /// Build from the raw 4-bit wire field, discarding unknown bits.
    pub fn from_wire(bits: u32) -> Self {
        Self::from_bits_truncate(bits & 0xF)
    }
}
