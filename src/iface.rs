//! Per-interface state: readiness, the bounded transaction queue, IRQ line
//! bitmap, and decoded branch-trace buffers.

use crate::protocol::{BranchTrace, Frame, MAX_BTIF, MAX_TXN_PER_IF};

/// Bounded FIFO of decoded frames awaiting dispatch.
///
/// Cursors are monotonic; `wp - rp` is the queue depth and a full queue
/// refuses the push so the framer can leave bytes in the receive ring.
pub struct TxnQueue {
    slots: [Frame; MAX_TXN_PER_IF],
    rp: u64,
    wp: u64,
}

impl TxnQueue {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Frame::new()),
            rp: 0,
            wp: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        (self.wp - self.rp) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.wp == self.rp
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == MAX_TXN_PER_IF
    }

    /// Enqueue a frame; `false` when the queue is full and the frame was not
    /// taken.
    pub fn push(&mut self, frame: Frame) -> bool {
        if self.is_full() {
            return false;
        }
        self.slots[(self.wp % MAX_TXN_PER_IF as u64) as usize] = frame;
        self.wp += 1;
        true
    }

    /// Dequeue the oldest frame.
    pub fn pop(&mut self) -> Option<Frame> {
        if self.is_empty() {
            return None;
        }
        let frame = self.slots[(self.rp % MAX_TXN_PER_IF as u64) as usize].clone();
        self.rp += 1;
        Some(frame)
    }

    /// Drop everything queued.
    pub fn clear(&mut self) {
        self.rp = self.wp;
    }
}

impl Default for TxnQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// State of one bus interface slot.
pub struct Interface {
    /// Claimed (MMIO bank) or backed by a live DMA channel (initiator bank).
    pub ready: bool,
    pub queue: TxnQueue,
    /// Current asserted-state bitmap of the region's IRQ lines.
    pub irq_state: u32,
    pub btrace: [BranchTrace; MAX_BTIF],
}

impl Interface {
    pub fn new() -> Self {
        Self {
            ready: false,
            queue: TxnQueue::new(),
            irq_state: 0,
            btrace: std::array::from_fn(|_| BranchTrace::default()),
        }
    }

    /// Forget all transient state; readiness survives a bus reset.
    pub fn flush(&mut self) {
        self.queue.clear();
        self.irq_state = 0;
        for bt in &mut self.btrace {
            *bt = BranchTrace::default();
        }
    }
}

impl Default for Interface {
    fn default() -> Self {
        Self::new()
    }
}
