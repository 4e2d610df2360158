//! MMIO handler interface and opcode dispatch.
//!
//! A handler implements device-side register semantics for one claimed
//! interface. Dispatch fills read payloads in place, applies writes, and
//! decides whether the frame is echoed back: reads always answer, plain
//! writes are posted, acknowledged writes answer.

use tracing::trace;

use crate::protocol::wire::{opcode, PAYLOAD_SIZE};
use crate::protocol::{AccessFlags, Frame};

/// A bus fault raised by a handler; surfaces as the frame's error flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault;

/// Decoded parameters of one MMIO access.
#[derive(Debug, Clone, Copy)]
pub struct MmioAccess {
    /// Byte address within the handler's region.
    pub addr: u64,
    /// Access size in bytes.
    pub size: u32,
    /// Bus attribute flags.
    pub flags: AccessFlags,
    /// Byte-enable mask (writes only; zero for reads). For paired writes this
    /// is the folded compact mask covering both values.
    pub mask: u32,
}

/// Device-side register semantics for one interface.
///
/// `read` and `write` are required; the paired variants default to two
/// single-value calls at consecutive addresses.
pub trait MmioHandler: Send {
    /// Fill `data` with the bytes at `access.addr`.
    fn read(&mut self, access: &MmioAccess, data: &mut [u8]) -> Result<(), Fault>;

    /// Apply `data` at `access.addr`, honoring `access.mask`.
    fn write(&mut self, access: &MmioAccess, data: &[u8]) -> Result<(), Fault>;

    /// Fill both values of a paired read.
    fn read_pair(
        &mut self,
        access: &MmioAccess,
        first: &mut [u8],
        second: &mut [u8],
    ) -> Result<(), Fault> {
        self.read(access, first)?;
        let next = MmioAccess {
            addr: access.addr + access.size as u64,
            ..*access
        };
        self.read(&next, second)
    }

    /// Apply both values of a paired write.
    fn write_pair(
        &mut self,
        access: &MmioAccess,
        first: &[u8],
        second: &[u8],
    ) -> Result<(), Fault> {
        self.write(access, first)?;
        let next = MmioAccess {
            addr: access.addr + access.size as u64,
            ..*access
        };
        self.write(&next, second)
    }
}

/// Payload byte offset of a paired access's second value.
fn pair_offset(size: u32) -> usize {
    8 + (size as usize / 8) * 8
}

/// Run one queued frame through a handler. Returns `true` when the (possibly
/// modified) frame must be echoed on the control channel; handler faults set
/// the frame's error flag first.
pub fn dispatch(handler: &mut dyn MmioHandler, frame: &mut Frame) -> bool {
    let op = frame.opcode();
    let size = frame.access_size();
    let access = MmioAccess {
        addr: frame.addr(),
        size,
        flags: frame.access_flags(),
        mask: 0,
    };
    trace!(op, size, addr = access.addr, "mmio dispatch");

    let (result, echo) = match op {
        opcode::READ => {
            let n = (size as usize).min(PAYLOAD_SIZE);
            let r = handler.read(&access, &mut frame.payload_mut()[..n]);
            (r, true)
        }
        opcode::READP => {
            let off = pair_offset(size).min(PAYLOAD_SIZE);
            let first_len = (size as usize).min(off);
            let second_len = (size as usize).min(16).min(PAYLOAD_SIZE - off);
            let (first, second) = frame.payload_mut().split_at_mut(off);
            let r = handler.read_pair(
                &access,
                &mut first[..first_len],
                &mut second[..second_len],
            );
            (r, true)
        }
        opcode::WRITE | opcode::WRITEA => {
            let access = MmioAccess {
                mask: frame.byte_mask(),
                ..access
            };
            let n = (size as usize).min(PAYLOAD_SIZE);
            let r = handler.write(&access, &frame.payload()[..n]);
            (r, op == opcode::WRITEA)
        }
        opcode::WRITEP | opcode::WRITEAP => {
            let access = MmioAccess {
                mask: frame.write_mask(0, true, size),
                ..access
            };
            let off = pair_offset(size).min(PAYLOAD_SIZE);
            let first_len = (size as usize).min(off);
            let second_len = (size as usize).min(16).min(PAYLOAD_SIZE - off);
            let (first, second) = frame.payload().split_at(off);
            let r = handler.write_pair(&access, &first[..first_len], &second[..second_len]);
            (r, op == opcode::WRITEAP)
        }
        // Unknown opcodes are acknowledged untouched so the initiator does
        // not stall waiting for a response.
        _ => (Ok(()), true),
    };

    if result.is_err() {
        frame.set_error();
    }
    echo
}
