//! Wire protocol: frame layout, field packing, and the branch-trace decoder.

pub mod btrace;
pub mod frame;
pub mod wire;

pub use btrace::BranchTrace;
pub use frame::Frame;
pub use wire::{opcode, AccessFlags, BLOCK_SIZE, SLOT_SIZE};

/// Number of MMIO-addressable interfaces; the same count again exists as
/// DMA-addressable interfaces in the upper bank.
pub const MAX_IFACE: usize = 8;

/// IRQ lines per MMIO region.
pub const MAX_IRQ: usize = 8;

/// Pending decoded frames per interface queue.
pub const MAX_TXN_PER_IF: usize = 16;

/// Decoded branch-trace entries per trace buffer.
pub const MAX_BT: usize = 16;

/// Branch-trace buffers per interface.
pub const MAX_BTIF: usize = 2;

/// Default TCP port of the VM-side bridge.
pub const DEFAULT_PORT: u16 = 4800;
