//! Frame slot with typed field accessors and partial-width data packing.
//!
//! A [`Frame`] holds one 128-byte queue slot: the first two 64-byte blocks of a
//! wire frame (longer frames are truncated on enqueue). All multi-byte fields
//! are little-endian 64-bit words; accessors go through explicit byte
//! conversions rather than reinterpreting the buffer.
//!
//! The interesting part is the partial-width access packing: a single frame
//! format carries 1/2/4/8-byte register accesses at any intra-word offset,
//! including "paired" frames where two values share the payload in a packed
//! sub-word layout. [`Frame::data`], [`Frame::put_data`] and
//! [`Frame::write_mask`] implement that packing bit-exactly.

use super::wire::{opcode, AccessFlags, BLOCK_SIZE, PAYLOAD_OFFSET, PAYLOAD_SIZE, SLOT_SIZE};

/// One decoded (or under-construction) protocol frame.
#[derive(Clone)]
pub struct Frame {
    bytes: [u8; SLOT_SIZE],
}

impl Frame {
    /// Create a zeroed frame.
    pub fn new() -> Self {
        Self {
            bytes: [0u8; SLOT_SIZE],
        }
    }

    /// Create an initiator-tagged request frame for an interface.
    pub fn request(iface: u8, op: u8) -> Self {
        let mut f = Self::new();
        f.set_word(0, 0x8000_0000u64 | iface as u64);
        f.set_word(1, op as u64);
        f
    }

    /// Build a frame from raw wire bytes (up to one slot; the rest stays zero).
    pub fn from_wire(data: &[u8]) -> Self {
        let mut f = Self::new();
        let n = data.len().min(SLOT_SIZE);
        f.bytes[..n].copy_from_slice(&data[..n]);
        f
    }

    /// Raw slot bytes.
    pub fn as_bytes(&self) -> &[u8; SLOT_SIZE] {
        &self.bytes
    }

    /// The frame's first 64-byte block, as sent on the wire for responses.
    pub fn first_block(&self) -> &[u8] {
        &self.bytes[..BLOCK_SIZE]
    }

    /// Read word `i` (little-endian).
    pub fn word(&self, i: usize) -> u64 {
        let o = i * 8;
        u64::from_le_bytes(self.bytes[o..o + 8].try_into().expect("word in slot"))
    }

    /// Write word `i` (little-endian).
    pub fn set_word(&mut self, i: usize, v: u64) {
        let o = i * 8;
        self.bytes[o..o + 8].copy_from_slice(&v.to_le_bytes());
    }

    // --- word0 fields ---

    /// Target interface id (word0 bits 7:0).
    #[inline]
    pub fn iface_id(&self) -> u8 {
        self.bytes[0]
    }

    /// 64-byte-block length code (word0 bits 15:8).
    #[inline]
    pub fn len_code(&self) -> u8 {
        self.bytes[1]
    }

    /// Total declared frame length in bytes.
    #[inline]
    pub fn wire_len(&self) -> usize {
        (self.len_code() as usize + 1) * BLOCK_SIZE
    }

    /// Clear the length code, as done when echoing pings and bounces.
    #[inline]
    pub fn clear_len_code(&mut self) {
        self.bytes[1] = 0;
    }

    /// Error flag (word0 bit 30), set by the side that could not satisfy the
    /// request.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.bytes[3] & 0x40 != 0
    }

    /// Set the error flag.
    #[inline]
    pub fn set_error(&mut self) {
        self.bytes[3] |= 0x40;
    }

    /// Initiator/class flag (word0 bit 31); selects the DMA interface bank.
    #[inline]
    pub fn is_initiator(&self) -> bool {
        self.bytes[3] & 0x80 != 0
    }

    /// Packet id used to match DMA completions (word0 bits 63:32).
    #[inline]
    pub fn packet_id(&self) -> u32 {
        (self.word(0) >> 32) as u32
    }

    /// Set the packet id.
    pub fn set_packet_id(&mut self, pid: u32) {
        let w = (self.word(0) & 0xFFFF_FFFF) | ((pid as u64) << 32);
        self.set_word(0, w);
    }

    // --- word1 fields ---

    /// Opcode (word1 bits 7:0).
    #[inline]
    pub fn opcode(&self) -> u8 {
        self.bytes[8]
    }

    /// Access size in bytes (word1 bits 21:16).
    #[inline]
    pub fn access_size(&self) -> u32 {
        ((self.word(1) >> 16) & 63) as u32
    }

    /// Set the access size.
    pub fn set_access_size(&mut self, size: u32) {
        let w = (self.word(1) & !(63u64 << 16)) | (((size as u64) & 63) << 16);
        self.set_word(1, w);
    }

    /// DMA region sub-id (word1 bits 27:24).
    #[inline]
    pub fn sub_id(&self) -> u32 {
        ((self.word(1) >> 24) & 15) as u32
    }

    /// Set the sub-id.
    pub fn set_sub_id(&mut self, sid: u32) {
        let w = (self.word(1) & !(15u64 << 24)) | (((sid as u64) & 15) << 24);
        self.set_word(1, w);
    }

    /// Bus access attribute flags (word1 bits 31:28).
    #[inline]
    pub fn access_flags(&self) -> AccessFlags {
        AccessFlags::from_wire(((self.word(1) >> 28) & 15) as u32)
    }

    /// Set the access flags.
    pub fn set_access_flags(&mut self, flags: AccessFlags) {
        let w = (self.word(1) & !(15u64 << 28)) | (((flags.bits() as u64) & 15) << 28);
        self.set_word(1, w);
    }

    /// 32-bit byte-enable mask (word1 bits 63:32).
    #[inline]
    pub fn byte_mask(&self) -> u32 {
        (self.word(1) >> 32) as u32
    }

    /// Set the byte-enable mask.
    pub fn set_byte_mask(&mut self, mask: u32) {
        let w = (self.word(1) & 0xFFFF_FFFF) | ((mask as u64) << 32);
        self.set_word(1, w);
    }

    // --- word2 + payload ---

    /// Access address (word2).
    #[inline]
    pub fn addr(&self) -> u64 {
        self.word(2)
    }

    /// Set the access address.
    pub fn set_addr(&mut self, addr: u64) {
        self.set_word(2, addr);
    }

    /// The 40-byte payload region (words 3..7).
    pub fn payload(&self) -> &[u8] {
        &self.bytes[PAYLOAD_OFFSET..PAYLOAD_OFFSET + PAYLOAD_SIZE]
    }

    /// Mutable payload region.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[PAYLOAD_OFFSET..PAYLOAD_OFFSET + PAYLOAD_SIZE]
    }

    /// Check whether this frame is a PING keep-alive.
    #[inline]
    pub fn is_ping(&self) -> bool {
        self.opcode() == opcode::PING
    }

    // --- partial-width packing ---

    /// Byte-enable mask for the bytes at `byte_offset`, derived from the
    /// 32-bit mask field.
    ///
    /// A negative `byte_offset` represents data that logically starts before
    /// the addressable window: the mask shifts left instead of right. Offsets
    /// of 32 or more are past the mask entirely and yield 0. For paired
    /// frames with `size < 16` the mask is first folded into its compact
    /// half-width form (low `size/2` bits kept, the rest taken from the upper
    /// half of the field).
    pub fn write_mask(&self, byte_offset: i32, paired: bool, size: u32) -> u32 {
        let mut mask = self.byte_mask();
        if paired && size < 16 {
            let half = size >> 1;
            mask = (mask & ((1u32 << half) - 1)) | (mask >> (16 - half));
        }
        if byte_offset >= 32 {
            0
        } else if byte_offset < 0 {
            mask.checked_shl((-byte_offset) as u32).unwrap_or(0)
        } else {
            mask >> byte_offset as u32
        }
    }

    /// Load the two payload words covering `offset`, honoring the paired
    /// packed-word layout. Returns `(w0, w1)`.
    fn load_pair(&self, offset: usize, paired: bool, size: u32) -> (u64, u64) {
        if paired && size < 16 {
            let bits = size << 2;
            let low = (1u64 << bits) - 1;
            ((self.word(3) & low) | (self.word(4) << bits), 0)
        } else {
            let w0 = if offset < 40 { self.word(3 + offset / 8) } else { 0 };
            let w1 = if offset < 32 { self.word(4 + offset / 8) } else { 0 };
            (w0, w1)
        }
    }

    /// Read a little-endian value at `byte_offset` in the payload region.
    ///
    /// Negative offsets shift the value left by the absolute offset in bytes
    /// (an access straddling the window start). Offsets at or past the 40-byte
    /// payload read as zero.
    pub fn data(&self, byte_offset: i32, paired: bool, size: u32) -> u64 {
        let aoffs = byte_offset.max(0) as usize;
        let (w0, w1) = self.load_pair(aoffs, paired, size);

        let mut win = [0u8; 16];
        win[..8].copy_from_slice(&w0.to_le_bytes());
        win[8..].copy_from_slice(&w1.to_le_bytes());
        let lo = aoffs & 7;
        let v = u64::from_le_bytes(win[lo..lo + 8].try_into().expect("window read"));

        if byte_offset < 0 {
            v.checked_shl((-byte_offset) as u32 * 8).unwrap_or(0)
        } else {
            v
        }
    }

    /// Store a little-endian value of `width` (1/2/4/8) bytes at
    /// `byte_offset` in the payload region.
    ///
    /// Negative offsets shift the value right first; bytes falling past the
    /// payload boundary are silently dropped (boundary policy, not an error).
    pub fn put_data(&mut self, byte_offset: i32, paired: bool, size: u32, value: u64, width: u32) {
        let mut value = value;
        let offset = if byte_offset < 0 {
            value = value.checked_shr((-byte_offset) as u32 * 8).unwrap_or(0);
            0usize
        } else {
            byte_offset as usize
        };

        let (w0, w1) = self.load_pair(offset, paired, size);
        let mut win = [0u8; 16];
        win[..8].copy_from_slice(&w0.to_le_bytes());
        win[8..].copy_from_slice(&w1.to_le_bytes());

        let lo = offset & 7;
        let vb = value.to_le_bytes();
        match width {
            1 | 2 | 4 | 8 => win[lo..lo + width as usize].copy_from_slice(&vb[..width as usize]),
            _ => {}
        }

        let w0 = u64::from_le_bytes(win[..8].try_into().expect("window low"));
        let w1 = u64::from_le_bytes(win[8..].try_into().expect("window high"));
        if paired && size < 16 {
            let bits = size << 2;
            self.set_word(3, w0);
            self.set_word(4, w0 >> bits);
        } else {
            if offset < 40 {
                self.set_word(3 + offset / 8, w0);
            }
            if offset < 32 {
                self.set_word(4 + offset / 8, w1);
            }
        }
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("iface", &self.iface_id())
            .field("opcode", &self.opcode())
            .field("len_code", &self.len_code())
            .field("size", &self.access_size())
            .field("addr", &self.addr())
            .field("error", &self.is_error())
            .field("initiator", &self.is_initiator())
            .finish()
    }
}
