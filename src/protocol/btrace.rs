//! Branch-trace delta decoder.
//!
//! Trace payloads arrive as a packed byte stream: one count byte, then a
//! sequence of variable-length records. Each record's first byte carries the
//! record length in its low 3 bits (`len = (b & 7) + 2` total bytes) and the
//! low 5 bits of the delta in its high 5 bits; the remaining bytes are the
//! upper delta bits, little-endian. The decoded delta is sign-extended,
//! shifted left by 2 (addresses are 4-byte aligned) and accumulated onto the
//! previous address.

use super::{MAX_BT, SLOT_SIZE};
use crate::protocol::Frame;

/// A decoded branch-trace buffer: up to [`MAX_BT`] absolute addresses.
#[derive(Debug, Clone, Default)]
pub struct BranchTrace {
    entries: [u64; MAX_BT],
    len: usize,
}

impl BranchTrace {
    /// Decode a packed trace stream into absolute addresses.
    ///
    /// Truncated input and oversized counts decode as far as the data allows;
    /// at most [`MAX_BT`] entries are kept.
    pub fn decode(packed: &[u8]) -> Self {
        let mut bt = Self::default();
        if packed.is_empty() {
            return bt;
        }
        let count = packed[0] as usize;
        let mut prev = 0u64;
        let mut i = 1usize;
        while i < count && i < packed.len() && bt.len < MAX_BT {
            let lead = packed[i];
            let reclen = ((lead & 7) as usize) + 2;
            if i + reclen > packed.len() {
                break;
            }
            let mut raw = [0u8; 8];
            raw[..reclen - 1].copy_from_slice(&packed[i + 1..i + reclen]);
            let mut delta = i64::from_le_bytes(raw);
            delta <<= 5;
            delta |= (lead >> 3) as i64;
            let sig_bits = reclen as u32 * 8 - 3;
            if sig_bits < 64 {
                delta = (delta << (64 - sig_bits)) >> (64 - sig_bits);
            }
            delta <<= 2;
            prev = prev.wrapping_add(delta as u64);
            bt.entries[bt.len] = prev;
            bt.len += 1;
            i += reclen;
        }
        bt
    }

    /// Decode the trace region of a write frame: the packed stream follows
    /// the register payload, `3 + (size + 7) / 8` words into the frame.
    pub fn decode_frame(frame: &Frame, size: u32) -> Self {
        let start = (3 + (size as usize + 7) / 8) * 8;
        if start >= SLOT_SIZE {
            return Self::default();
        }
        Self::decode(&frame.as_bytes()[start..])
    }

    /// Number of decoded entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no entries were decoded.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address at `index`, if decoded.
    pub fn entry(&self, index: usize) -> Option<u64> {
        (index < self.len).then(|| self.entries[index])
    }

    /// The decoded addresses.
    pub fn entries(&self) -> &[u64] {
        &self.entries[..self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_stream() {
        // Four records: +100, +4, two backward jumps of -8.
        let packed = [9u8, 200, 0, 8, 0, 240, 255, 0, 0];
        let bt = BranchTrace::decode(&packed);
        assert_eq!(bt.entries(), &[100, 104, 96, 96]);
    }

    #[test]
    fn test_decode_empty_and_zero_count() {
        assert!(BranchTrace::decode(&[]).is_empty());
        assert!(BranchTrace::decode(&[0]).is_empty());
        assert!(BranchTrace::decode(&[1]).is_empty());
    }

    #[test]
    fn test_decode_truncated_record_stops() {
        // Count claims 9 bytes of records but the buffer ends mid-record.
        let packed = [9u8, 200, 0, 8];
        let bt = BranchTrace::decode(&packed);
        assert_eq!(bt.entries(), &[100]);
    }

    #[test]
    fn test_decode_caps_at_max_entries() {
        // 32 minimal records of delta +4 each; only MAX_BT survive.
        let mut packed = vec![255u8];
        for _ in 0..32 {
            packed.push(8);
            packed.push(0);
        }
        let bt = BranchTrace::decode(&packed);
        assert_eq!(bt.len(), MAX_BT);
        assert_eq!(bt.entry(0), Some(4));
        assert_eq!(bt.entry(MAX_BT - 1), Some(4 * MAX_BT as u64));
        assert_eq!(bt.entry(MAX_BT), None);
    }

    #[test]
    fn test_decode_negative_delta_sign_extension() {
        // One 2-byte record: lead 240 = len 2, low bits 30; ext byte 0xFF.
        // 13 significant bits -> delta -2 -> address -8 (wrapping).
        let packed = [4u8, 240, 255];
        let bt = BranchTrace::decode(&packed);
        assert_eq!(bt.entries(), &[(-8i64) as u64]);
    }

    #[test]
    fn test_decode_frame_region_offset() {
        // size 8 -> stream starts at word 4 (byte 32).
        let mut f = Frame::new();
        let bytes = [3u8, 200, 0];
        for (i, b) in bytes.iter().enumerate() {
            f.payload_mut()[8 + i] = *b;
        }
        let bt = BranchTrace::decode_frame(&f, 8);
        assert_eq!(bt.entries(), &[100]);
    }
}
