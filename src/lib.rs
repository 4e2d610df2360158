//! Act as a bus peripheral and/or DMA master of a remote virtual machine.
//!
//! A [`Connection`] speaks a fixed-block frame protocol over one or two TCP
//! streams: the control channel carries MMIO traffic, IRQ updates, and bus
//! resets, while an optional second channel carries DMA initiator requests
//! and their completions. Register an [`MmioHandler`] to model device
//! registers, or issue [`Connection::dma_read`] / [`Connection::dma_write`]
//! to master the bus; [`Connection::run_for`] drives both.
//!
//! Everything runs single-threaded on the caller's task; the connection owns
//! all protocol state.
//!
//! ```no_run
//! use buslink::{AccessFlags, Connection, Fault, MmioAccess, MmioHandler};
//!
//! struct Scratch {
//!     mem: [u8; 256],
//! }
//!
//! impl MmioHandler for Scratch {
//!     fn read(&mut self, access: &MmioAccess, data: &mut [u8]) -> Result<(), Fault> {
//!         let base = access.addr as usize;
//!         data.copy_from_slice(&self.mem[base..base + data.len()]);
//!         Ok(())
//!     }
//!
//!     fn write(&mut self, access: &MmioAccess, data: &[u8]) -> Result<(), Fault> {
//!         let base = access.addr as usize;
//!         self.mem[base..base + data.len()].copy_from_slice(data);
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> buslink::Result<()> {
//! let mut conn = Connection::connect(Some("127.0.0.1:4800"), true).await?;
//! conn.register_handler(0, Box::new(Scratch { mem: [0; 256] })).await?;
//! let _data = conn.dma_read(1, 0, AccessFlags::empty(), 0x1000, 64).await?;
//! conn.run_for(None).await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod dma;
pub mod error;
pub mod iface;
pub mod mmio;
pub mod protocol;
pub mod transport;

pub use connection::{Connection, Readiness};
pub use dma::{DmaCompletion, MAX_DMA_OPS, NDMAPKTS};
pub use error::{BuslinkError, Result};
pub use mmio::{Fault, MmioAccess, MmioHandler};
pub use protocol::{
    opcode, AccessFlags, BranchTrace, Frame, DEFAULT_PORT, MAX_BT, MAX_BTIF, MAX_IFACE, MAX_IRQ,
};
pub use transport::Endpoint;
