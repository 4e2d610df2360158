//! DMA initiator engine: operation arena, packet-id pool, fragmenter, and
//! completion matching.
//!
//! An operation covers an arbitrary byte range; the engine slices it into
//! request fragments that never cross a 32-byte address boundary, tags each
//! with a packet id from a fixed pool, and reassembles completions as they
//! arrive (in any order). The continuation fires once the operation is fully
//! fragmented and its last outstanding fragment has completed.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::error::{BuslinkError, Result};
use crate::protocol::wire::opcode;
use crate::protocol::{AccessFlags, Frame};

/// Packet-id pool size; at most this many fragments are in flight.
pub const NDMAPKTS: usize = 1024;

/// Concurrent DMA operation cap.
pub const MAX_DMA_OPS: usize = 4096;

/// Fragments never cross an address boundary of this alignment.
const FRAG_ALIGN: u64 = 32;

/// Continuation invoked when an operation finishes. Reads deliver the filled
/// buffer; writes deliver the written bytes back.
pub type DmaCompletion = Box<dyn FnOnce(Result<Bytes>) + Send>;

/// Direction-specific data buffer of one operation.
enum DmaBuffer {
    Read(BytesMut),
    Write(Bytes),
}

impl DmaBuffer {
    fn len(&self) -> usize {
        match self {
            DmaBuffer::Read(b) => b.len(),
            DmaBuffer::Write(b) => b.len(),
        }
    }
}

struct DmaOp {
    iface: u8,
    sub_id: u32,
    flags: AccessFlags,
    /// Address of the next fragment.
    addr: u64,
    /// Bytes fragmented so far (buffer offset of the next fragment).
    cursor: usize,
    /// Bytes not yet fragmented.
    remaining: usize,
    buffer: DmaBuffer,
    outstanding: u32,
    faulted: bool,
    completion: Option<DmaCompletion>,
}

/// One in-flight fragment: which operation and which byte range of it.
struct PacketSlot {
    op: usize,
    offset: usize,
    size: usize,
}

pub struct DmaEngine {
    ops: Vec<Option<DmaOp>>,
    free_ops: Vec<usize>,
    /// Operation indices with bytes left to fragment, oldest first.
    pending: VecDeque<usize>,
    pkts: Vec<Option<PacketSlot>>,
    free_pkts: VecDeque<u16>,
}

impl DmaEngine {
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            free_ops: Vec::new(),
            pending: VecDeque::new(),
            pkts: (0..NDMAPKTS).map(|_| None).collect(),
            free_pkts: (0..NDMAPKTS as u16).collect(),
        }
    }

    /// Number of operations not yet finished.
    pub fn active_ops(&self) -> usize {
        self.ops.iter().filter(|op| op.is_some()).count()
    }

    /// Whether any operation still has fragments to send or in flight.
    pub fn is_idle(&self) -> bool {
        self.active_ops() == 0
    }

    /// Queue a read of `len` bytes.
    pub fn submit_read(
        &mut self,
        iface: u8,
        sub_id: u32,
        flags: AccessFlags,
        addr: u64,
        len: usize,
        completion: DmaCompletion,
    ) -> Result<()> {
        let buffer = DmaBuffer::Read(BytesMut::zeroed(len));
        self.submit(iface, sub_id, flags, addr, buffer, completion)
    }

    /// Queue a write of the given bytes.
    pub fn submit_write(
        &mut self,
        iface: u8,
        sub_id: u32,
        flags: AccessFlags,
        addr: u64,
        data: Bytes,
        completion: DmaCompletion,
    ) -> Result<()> {
        self.submit(iface, sub_id, flags, addr, DmaBuffer::Write(data), completion)
    }

    fn submit(
        &mut self,
        iface: u8,
        sub_id: u32,
        flags: AccessFlags,
        addr: u64,
        buffer: DmaBuffer,
        completion: DmaCompletion,
    ) -> Result<()> {
        if self.active_ops() >= MAX_DMA_OPS {
            return Err(BuslinkError::ResourceExhausted("dma operations"));
        }
        let len = buffer.len();
        let op = DmaOp {
            iface,
            sub_id,
            flags,
            addr,
            cursor: 0,
            remaining: len,
            buffer,
            outstanding: 0,
            faulted: false,
            completion: Some(completion),
        };
        let idx = match self.free_ops.pop() {
            Some(idx) => {
                self.ops[idx] = Some(op);
                idx
            }
            None => {
                self.ops.push(Some(op));
                self.ops.len() - 1
            }
        };
        debug!(iface, sub_id, addr, len, "dma operation queued");
        self.pending.push_back(idx);
        Ok(())
    }

    /// Produce the next request fragment, if an operation has bytes left to
    /// fragment and a packet id is free.
    pub fn next_fragment(&mut self) -> Option<Frame> {
        let &idx = self.pending.front()?;
        let pid = self.free_pkts.pop_front()?;
        let op = self.ops[idx].as_mut().expect("pending op is live");

        let size = op
            .remaining
            .min((FRAG_ALIGN - (op.addr & (FRAG_ALIGN - 1))) as usize);

        let mut frame = Frame::new();
        frame.set_word(0, ((pid as u64) << 32) | 0x8000_0000 | op.iface as u64);
        let is_write = matches!(op.buffer, DmaBuffer::Write(_));
        let op_byte = if is_write { opcode::WRITEA } else { opcode::READ };
        let mut word1 = op_byte as u64
            | (size as u64) << 16
            | (op.sub_id as u64) << 24
            | (op.flags.bits() as u64) << 28;
        if is_write {
            word1 |= ((1u64 << size) - 1) << 32;
        }
        frame.set_word(1, word1);
        frame.set_word(2, op.addr);
        // Poison the payload so stale bytes are recognizable on the far side.
        frame.payload_mut()[..32].fill(0xAA);
        frame.set_word(7, 0);
        if let DmaBuffer::Write(data) = &op.buffer {
            frame.payload_mut()[..size].copy_from_slice(&data[op.cursor..op.cursor + size]);
        }

        self.pkts[pid as usize] = Some(PacketSlot {
            op: idx,
            offset: op.cursor,
            size,
        });
        op.outstanding += 1;
        // Addresses are modular; a transfer may end at the top of the space.
        op.addr = op.addr.wrapping_add(size as u64);
        op.cursor += size;
        op.remaining -= size;
        if op.remaining == 0 {
            self.pending.pop_front();
        }
        Some(frame)
    }

    /// Match one completion frame from the DMA channel against its fragment.
    /// Unrecognized completions are dropped with a warning.
    pub fn complete(&mut self, frame: &Frame) {
        let op_byte = frame.opcode();
        if op_byte != opcode::READ && op_byte != opcode::WRITEA {
            warn!(op = op_byte, "unexpected opcode on dma channel, dropping");
            return;
        }
        if !frame.is_initiator() {
            warn!("non-initiator frame on dma channel, dropping");
            return;
        }
        let pid = frame.packet_id() as usize;
        if pid >= NDMAPKTS {
            warn!(pid, "completion packet id out of range, dropping");
            return;
        }
        let Some(slot) = self.pkts[pid].take() else {
            warn!(pid, "completion for unowned packet id, dropping");
            return;
        };
        self.free_pkts.push_back(pid as u16);

        let op = self.ops[slot.op].as_mut().expect("slot points at live op");
        if frame.is_error() {
            op.faulted = true;
        } else if let DmaBuffer::Read(buf) = &mut op.buffer {
            buf[slot.offset..slot.offset + slot.size]
                .copy_from_slice(&frame.payload()[..slot.size]);
        }
        op.outstanding -= 1;

        if op.outstanding == 0 && op.remaining == 0 {
            self.finish(slot.op);
        }
    }

    fn finish(&mut self, idx: usize) {
        let op = self.ops[idx].take().expect("finishing a live op");
        self.free_ops.push(idx);
        debug!(iface = op.iface, "dma operation finished");
        if let Some(completion) = op.completion {
            let result = if op.faulted {
                Err(BuslinkError::Fault)
            } else {
                match op.buffer {
                    DmaBuffer::Read(buf) => Ok(buf.freeze()),
                    DmaBuffer::Write(data) => Ok(data),
                }
            };
            completion(result);
        }
    }

    /// Fail every unfinished operation; used when the connection goes away.
    pub fn fail_all(&mut self) {
        self.pending.clear();
        for pid in 0..self.pkts.len() {
            if self.pkts[pid].take().is_some() {
                self.free_pkts.push_back(pid as u16);
            }
        }
        for idx in 0..self.ops.len() {
            if let Some(op) = self.ops[idx].take() {
                self.free_ops.push(idx);
                if let Some(completion) = op.completion {
                    completion(Err(BuslinkError::Disconnected));
                }
            }
        }
    }
}

impl Default for DmaEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Captured = Arc<Mutex<Option<Result<Bytes>>>>;

    fn capture() -> (Captured, DmaCompletion) {
        let cell: Captured = Arc::new(Mutex::new(None));
        let cell2 = cell.clone();
        let cb: DmaCompletion = Box::new(move |r| {
            *cell2.lock().unwrap() = Some(r);
        });
        (cell, cb)
    }

    fn completion_for(frame: &Frame, error: bool, data: Option<&[u8]>) -> Frame {
        let mut reply = frame.clone();
        if error {
            reply.set_error();
        }
        if let Some(data) = data {
            reply.payload_mut()[..data.len()].copy_from_slice(data);
        }
        reply
    }

    #[test]
    fn test_fragments_respect_alignment_boundary() {
        let mut engine = DmaEngine::new();
        let (_cell, cb) = capture();
        engine.submit_read(2, 0, AccessFlags::empty(), 0x13, 40, cb).unwrap();

        let f1 = engine.next_fragment().unwrap();
        let f2 = engine.next_fragment().unwrap();
        assert!(engine.next_fragment().is_none(), "40 bytes make two fragments");

        assert_eq!(f1.access_size(), 13, "up to the 0x20 boundary");
        assert_eq!(f1.addr(), 0x13);
        assert_eq!(f2.access_size(), 27);
        assert_eq!(f2.addr(), 0x20);
        assert_eq!(f1.opcode(), opcode::READ);
        assert!(f1.is_initiator());
        assert_eq!(f1.iface_id(), 2);
    }

    #[test]
    fn test_read_reassembles_out_of_order() {
        let mut engine = DmaEngine::new();
        let (cell, cb) = capture();
        engine.submit_read(0, 1, AccessFlags::empty(), 0x10, 48, cb).unwrap();

        // 0x10..0x20, 0x20..0x40 -> fragments of 16 and 32 bytes.
        let f1 = engine.next_fragment().unwrap();
        let f2 = engine.next_fragment().unwrap();
        assert_eq!(f1.access_size(), 16);
        assert_eq!(f2.access_size(), 32);

        let part2: Vec<u8> = (16..48u8).collect();
        let part1: Vec<u8> = (0..16u8).collect();
        engine.complete(&completion_for(&f2, false, Some(&part2)));
        assert!(cell.lock().unwrap().is_none(), "one fragment still in flight");
        engine.complete(&completion_for(&f1, false, Some(&part1)));

        let got = cell.lock().unwrap().take().unwrap().unwrap();
        let want: Vec<u8> = (0..48u8).collect();
        assert_eq!(&got[..], &want[..]);
        assert!(engine.is_idle());
    }

    #[test]
    fn test_write_fragments_carry_data_and_mask() {
        let mut engine = DmaEngine::new();
        let (cell, cb) = capture();
        let data = Bytes::from_iter(0..40u8);
        engine
            .submit_write(3, 2, AccessFlags::PRIV, 0x20, data, cb)
            .unwrap();

        let f1 = engine.next_fragment().unwrap();
        let f2 = engine.next_fragment().unwrap();
        assert_eq!(f1.opcode(), opcode::WRITEA);
        assert_eq!(f1.access_size(), 32);
        assert_eq!(f1.byte_mask(), 0xFFFF_FFFF);
        assert_eq!(&f1.payload()[..32], &(0..32u8).collect::<Vec<_>>()[..]);
        assert_eq!(f2.access_size(), 8);
        assert_eq!(f2.byte_mask(), 0xFF);
        assert_eq!(&f2.payload()[..8], &(32..40u8).collect::<Vec<_>>()[..]);
        assert_eq!(f1.sub_id(), 2);
        assert_eq!(f1.access_flags(), AccessFlags::PRIV);

        engine.complete(&completion_for(&f1, false, None));
        engine.complete(&completion_for(&f2, false, None));
        assert!(cell.lock().unwrap().take().unwrap().is_ok());
    }

    #[test]
    fn test_fault_wins_over_data() {
        let mut engine = DmaEngine::new();
        let (cell, cb) = capture();
        engine.submit_read(0, 0, AccessFlags::empty(), 0, 64, cb).unwrap();
        let f1 = engine.next_fragment().unwrap();
        let f2 = engine.next_fragment().unwrap();

        engine.complete(&completion_for(&f1, true, None));
        engine.complete(&completion_for(&f2, false, Some(&[0u8; 32])));

        match cell.lock().unwrap().take().unwrap() {
            Err(BuslinkError::Fault) => {}
            other => panic!("expected fault, got {other:?}"),
        };
    }

    #[test]
    fn test_fragmenting_wraps_at_top_of_address_space() {
        let mut engine = DmaEngine::new();
        let (cell, cb) = capture();
        // 16 bytes starting 8 below the top of the 64-bit space.
        let addr = u64::MAX - 7;
        engine.submit_read(0, 0, AccessFlags::empty(), addr, 16, cb).unwrap();

        let f1 = engine.next_fragment().unwrap();
        let f2 = engine.next_fragment().unwrap();
        assert!(engine.next_fragment().is_none());
        assert_eq!(f1.addr(), addr);
        assert_eq!(f1.access_size(), 8, "up to the boundary at ...F8");
        assert_eq!(f2.addr(), 0, "address space is modular");
        assert_eq!(f2.access_size(), 8);

        engine.complete(&completion_for(&f1, false, Some(&[1u8; 8])));
        engine.complete(&completion_for(&f2, false, Some(&[2u8; 8])));
        let got = cell.lock().unwrap().take().unwrap().unwrap();
        assert_eq!(&got[..8], &[1u8; 8]);
        assert_eq!(&got[8..], &[2u8; 8]);
    }

    #[test]
    fn test_packet_ids_recycle() {
        let mut engine = DmaEngine::new();
        for _ in 0..3 {
            let (cell, cb) = capture();
            engine.submit_read(0, 0, AccessFlags::empty(), 0, 32, cb).unwrap();
            let f = engine.next_fragment().unwrap();
            engine.complete(&completion_for(&f, false, Some(&[7u8; 32])));
            assert!(cell.lock().unwrap().take().unwrap().is_ok());
        }
        assert!(engine.is_idle());
    }

    #[test]
    fn test_unowned_completion_is_dropped() {
        let mut engine = DmaEngine::new();
        let mut bogus = Frame::new();
        bogus.set_word(0, (500u64 << 32) | 0x8000_0000);
        bogus.set_word(1, opcode::READ as u64);
        engine.complete(&bogus);
        assert!(engine.is_idle());
    }

    #[test]
    fn test_fail_all_resolves_pending() {
        let mut engine = DmaEngine::new();
        let (cell, cb) = capture();
        engine.submit_read(0, 0, AccessFlags::empty(), 0, 128, cb).unwrap();
        engine.next_fragment().unwrap();
        engine.fail_all();
        match cell.lock().unwrap().take().unwrap() {
            Err(BuslinkError::Disconnected) => {}
            other => panic!("expected disconnected, got {other:?}"),
        }
        assert!(engine.is_idle());
    }
}
