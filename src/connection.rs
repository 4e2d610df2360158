//! Connection context: channel polling, frame routing, the fixed-point
//! processing loop, and the public bus API.
//!
//! A [`Connection`] owns one control channel (MMIO traffic, IRQ updates,
//! resets) and optionally a second DMA channel (initiator requests and their
//! completions). All state is owned by the connection; nothing is shared or
//! global, and the whole engine runs on the caller's task.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dma::{DmaCompletion, DmaEngine};
use crate::error::{BuslinkError, Result};
use crate::iface::Interface;
use crate::mmio::{self, MmioHandler};
use crate::protocol::wire::opcode;
use crate::protocol::{
    AccessFlags, BranchTrace, Frame, BLOCK_SIZE, MAX_BTIF, MAX_IFACE, MAX_IRQ, SLOT_SIZE,
};
use crate::transport::{Channel, Endpoint};

/// Which channels are worth waiting on: a channel is ready for more input
/// only while its receive ring has room for at least one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub ctrl: bool,
    pub dma: bool,
}

/// Interface bank selected by a frame's initiator flag.
const CTRL_BANK: usize = 0;
const DMA_BANK: usize = 1;

/// Re-check interval while both receive rings are full and the loop has no
/// deadline to sleep toward.
const STALL_POLL: Duration = Duration::from_millis(10);

pub struct Connection {
    ctrl: Channel,
    dma: Option<Channel>,
    /// Control bank then initiator bank.
    ifaces: [Interface; 2 * MAX_IFACE],
    handlers: [Option<Box<dyn MmioHandler>>; MAX_IFACE],
    engine: DmaEngine,
    reset_pending: bool,
}

impl Connection {
    /// Connect to the VM-side bridge. `target` is `host[:port]`; when `None`
    /// the `BUSLINK_VM` environment variable is consulted. `want_dma` opens a
    /// second stream to the same endpoint for initiator traffic.
    pub async fn connect(target: Option<&str>, want_dma: bool) -> Result<Self> {
        let endpoint = Endpoint::resolve(target)?;
        let ctrl = Channel::connect(&endpoint).await?;
        let dma = if want_dma {
            Some(Channel::connect(&endpoint).await?)
        } else {
            None
        };
        info!(host = %endpoint.host, port = endpoint.port, dma = want_dma, "connected");
        Ok(Self::assemble(ctrl, dma))
    }

    /// Build a connection over already-connected streams.
    pub fn from_streams(ctrl: TcpStream, dma: Option<TcpStream>) -> Result<Self> {
        let ctrl = Channel::from_stream(ctrl)?;
        let dma = dma.map(Channel::from_stream).transpose()?;
        Ok(Self::assemble(ctrl, dma))
    }

    fn assemble(ctrl: Channel, dma: Option<Channel>) -> Self {
        Self {
            ctrl,
            dma,
            ifaces: std::array::from_fn(|_| Interface::new()),
            handlers: std::array::from_fn(|_| None),
            engine: DmaEngine::new(),
            reset_pending: false,
        }
    }

    // --- interface management ---

    /// Claim an interface: mark it ready and announce the claim to the VM.
    /// Claimed-but-handlerless interfaces queue their transactions for
    /// [`Self::pop_transaction`].
    pub async fn claim_interface(&mut self, id: u8) -> Result<()> {
        if id as usize >= MAX_IFACE {
            return Err(BuslinkError::InvalidArgument(format!(
                "interface id {id} out of range"
            )));
        }
        self.ifaces[id as usize].ready = true;
        let frame = Frame::request(id, opcode::RGN_CLAIM);
        self.ctrl.send(frame.first_block()).await?;
        debug!(id, "interface claimed");
        Ok(())
    }

    /// Register MMIO semantics for an interface and claim it.
    pub async fn register_handler(
        &mut self,
        id: u8,
        handler: Box<dyn MmioHandler>,
    ) -> Result<()> {
        if id as usize >= MAX_IFACE {
            return Err(BuslinkError::InvalidArgument(format!(
                "interface id {id} out of range"
            )));
        }
        if self.handlers[id as usize].is_some() {
            return Err(BuslinkError::AlreadyRegistered(id));
        }
        self.handlers[id as usize] = Some(handler);
        self.claim_interface(id).await
    }

    /// Dequeue the oldest transaction of a claimed, handlerless interface.
    pub fn pop_transaction(&mut self, id: u8) -> Option<Frame> {
        if id as usize >= MAX_IFACE {
            return None;
        }
        self.ifaces[id as usize].queue.pop()
    }

    // --- IRQ lines ---

    /// Drive an IRQ line. Idempotent: re-asserting the current state sends
    /// nothing.
    pub async fn update_irq(&mut self, rid: u8, iid: u8, active: bool) -> Result<()> {
        if rid as usize >= MAX_IFACE {
            return Err(BuslinkError::InvalidArgument(format!(
                "region id {rid} out of range"
            )));
        }
        if iid as usize >= MAX_IRQ {
            return Err(BuslinkError::InvalidArgument(format!(
                "irq line {iid} out of range"
            )));
        }
        let bit = 1u32 << iid;
        let iface = &mut self.ifaces[rid as usize];
        if (iface.irq_state & bit != 0) == active {
            return Ok(());
        }
        iface.irq_state ^= bit;

        let mut frame = Frame::request(rid, opcode::IRQ_UPDATE);
        frame.set_word(2, iid as u64);
        frame.set_word(3, active as u64);
        self.ctrl.send(frame.first_block()).await?;
        debug!(rid, iid, active, "irq update sent");
        Ok(())
    }

    // --- reset ---

    /// Poll the control channel and report whether a bus reset arrived since
    /// the last call; the pending flag is cleared after being reported.
    ///
    /// A reported reset also flushes per-interface transient state: queued
    /// transactions that were not yet dispatched are dropped, and the IRQ
    /// bitmap and trace buffers are cleared. Readiness and registered
    /// handlers survive.
    pub async fn take_reset(&mut self) -> Result<bool> {
        self.poll_ctrl().await?;
        let was_pending = self.reset_pending;
        self.reset_pending = false;
        if was_pending {
            info!("bus reset observed");
            for iface in &mut self.ifaces {
                iface.flush();
            }
        }
        Ok(was_pending)
    }

    // --- branch traces ---

    /// Decode a branch-trace stream carried by `frame` into one of the
    /// interface's trace buffers. `framed` skips the register payload in
    /// front of the stream; otherwise the stream starts at the payload.
    pub fn unpack_branch_trace(
        &mut self,
        ifn: u8,
        ibt: usize,
        frame: &Frame,
        framed: bool,
    ) -> Result<()> {
        let iface = self.trace_iface(ifn, ibt)?;
        iface.btrace[ibt] = if framed {
            BranchTrace::decode_frame(frame, frame.access_size())
        } else {
            BranchTrace::decode(frame.payload())
        };
        Ok(())
    }

    /// The decoded trace buffer.
    pub fn branch_trace(&mut self, ifn: u8, ibt: usize) -> Result<&BranchTrace> {
        Ok(&self.trace_iface(ifn, ibt)?.btrace[ibt])
    }

    /// One decoded trace address; `InvalidArgument` past the produced count.
    pub fn branch_trace_entry(&mut self, ifn: u8, ibt: usize, ent: usize) -> Result<u64> {
        self.branch_trace(ifn, ibt)?.entry(ent).ok_or_else(|| {
            BuslinkError::InvalidArgument(format!("trace entry {ent} not produced"))
        })
    }

    fn trace_iface(&mut self, ifn: u8, ibt: usize) -> Result<&mut Interface> {
        if ifn as usize >= MAX_IFACE || ibt >= MAX_BTIF {
            return Err(BuslinkError::InvalidArgument(format!(
                "trace buffer {ifn}/{ibt} out of range"
            )));
        }
        let iface = &mut self.ifaces[ifn as usize];
        if !iface.ready {
            return Err(BuslinkError::InvalidArgument(format!(
                "interface {ifn} not claimed"
            )));
        }
        Ok(iface)
    }

    // --- DMA ---

    /// Start a DMA read; the continuation fires from a later processing pass.
    pub async fn dma_read_with(
        &mut self,
        iface: u8,
        sub_id: u32,
        flags: AccessFlags,
        addr: u64,
        len: usize,
        completion: DmaCompletion,
    ) -> Result<()> {
        self.check_dma_args(iface, sub_id, len)?;
        self.ifaces[DMA_BANK * MAX_IFACE + iface as usize].ready = true;
        self.engine
            .submit_read(iface, sub_id, flags, addr, len, completion)?;
        self.kick_dma().await
    }

    /// Start a DMA write; the continuation fires from a later processing pass.
    pub async fn dma_write_with(
        &mut self,
        iface: u8,
        sub_id: u32,
        flags: AccessFlags,
        addr: u64,
        data: Bytes,
        completion: DmaCompletion,
    ) -> Result<()> {
        self.check_dma_args(iface, sub_id, data.len())?;
        self.ifaces[DMA_BANK * MAX_IFACE + iface as usize].ready = true;
        self.engine
            .submit_write(iface, sub_id, flags, addr, data, completion)?;
        self.kick_dma().await
    }

    /// Read `len` bytes over DMA, pumping the DMA channel until done.
    pub async fn dma_read(
        &mut self,
        iface: u8,
        sub_id: u32,
        flags: AccessFlags,
        addr: u64,
        len: usize,
    ) -> Result<Bytes> {
        let (cell, completion) = completion_cell();
        self.dma_read_with(iface, sub_id, flags, addr, len, completion)
            .await?;
        self.pump_dma(&cell).await
    }

    /// Write bytes over DMA, pumping the DMA channel until acknowledged.
    pub async fn dma_write(
        &mut self,
        iface: u8,
        sub_id: u32,
        flags: AccessFlags,
        addr: u64,
        data: Bytes,
    ) -> Result<()> {
        let (cell, completion) = completion_cell();
        self.dma_write_with(iface, sub_id, flags, addr, data, completion)
            .await?;
        self.pump_dma(&cell).await.map(|_| ())
    }

    fn check_dma_args(&self, iface: u8, sub_id: u32, len: usize) -> Result<()> {
        if self.dma.is_none() {
            return Err(BuslinkError::NotConnected);
        }
        if iface as usize >= MAX_IFACE {
            return Err(BuslinkError::InvalidArgument(format!(
                "dma interface {iface} out of range"
            )));
        }
        if sub_id >= 16 {
            return Err(BuslinkError::InvalidArgument(format!(
                "sub-id {sub_id} out of range"
            )));
        }
        if len == 0 {
            return Err(BuslinkError::InvalidArgument("zero-length dma".into()));
        }
        Ok(())
    }

    /// Send every fragment the engine can produce right now.
    async fn kick_dma(&mut self) -> Result<()> {
        let Some(dma) = &mut self.dma else {
            return Ok(());
        };
        while let Some(frame) = self.engine.next_fragment() {
            dma.send(frame.first_block()).await?;
        }
        Ok(())
    }

    /// DMA-only progress loop used by the blocking wrappers: poll the DMA
    /// channel, feed completions, keep fragmenting, and wait for readability
    /// whenever a pass makes no progress.
    async fn pump_dma(&mut self, cell: &CompletionCell) -> Result<Bytes> {
        loop {
            if let Some(result) = take_completion(cell) {
                return result;
            }
            let mut progressed = self.poll_dma().await?;
            for id in 0..MAX_IFACE {
                while let Some(frame) = self.ifaces[DMA_BANK * MAX_IFACE + id].queue.pop() {
                    self.engine.complete(&frame);
                    progressed = true;
                }
            }
            self.kick_dma().await?;
            if !progressed {
                if let Some(result) = take_completion(cell) {
                    return result;
                }
                match &self.dma {
                    Some(dma) => dma.readable().await?,
                    None => return Err(BuslinkError::NotConnected),
                }
            }
        }
    }

    // --- event loop ---

    /// Which channels should be waited on before the next [`Self::process`].
    pub fn prepare(&self) -> Readiness {
        Readiness {
            ctrl: self.ctrl.rx.has_room(BLOCK_SIZE),
            dma: self
                .dma
                .as_ref()
                .map_or(false, |d| d.rx.has_room(BLOCK_SIZE)),
        }
    }

    /// One processing pass: pull in whatever the ready channels have, then
    /// drain queues, dispatch MMIO, feed DMA completions, and kick the
    /// engine until a pass makes no further progress.
    pub async fn process(&mut self, ready: Readiness) -> Result<()> {
        if ready.ctrl {
            self.poll_ctrl().await?;
        }
        if ready.dma {
            self.poll_dma().await?;
        }
        loop {
            let mut progressed = self.dispatch_mmio().await?;
            for id in 0..MAX_IFACE {
                while let Some(frame) = self.ifaces[DMA_BANK * MAX_IFACE + id].queue.pop() {
                    self.engine.complete(&frame);
                    progressed = true;
                }
            }
            self.kick_dma().await?;
            if !progressed {
                return Ok(());
            }
            // Draining queues freed slots; the rings may hold more frames.
            self.poll_ctrl().await?;
            self.poll_dma().await?;
        }
    }

    /// Run the event loop for at most `limit` (forever when `None`).
    pub async fn run_for(&mut self, limit: Option<Duration>) -> Result<()> {
        let deadline = limit.map(|d| Instant::now() + d);
        loop {
            let ready = self.prepare();
            let mut timed_out = false;
            if !ready.ctrl && !ready.dma {
                // Both rings full: only queue consumers can make progress, so
                // sleep out the remaining time instead of spinning.
                match deadline {
                    Some(deadline) => {
                        tokio::time::sleep_until(deadline).await;
                        timed_out = true;
                    }
                    None => tokio::time::sleep(STALL_POLL).await,
                }
            } else {
                let ctrl_wait = wait_readable(ready.ctrl.then_some(&self.ctrl));
                let dma_wait = wait_readable(if ready.dma { self.dma.as_ref() } else { None });
                match deadline {
                    Some(deadline) => tokio::select! {
                        r = ctrl_wait => r?,
                        r = dma_wait => r?,
                        _ = tokio::time::sleep_until(deadline) => timed_out = true,
                    },
                    None => tokio::select! {
                        r = ctrl_wait => r?,
                        r = dma_wait => r?,
                    },
                }
            }
            self.process(ready).await?;
            if timed_out || deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(());
            }
        }
    }

    /// Tear the connection down, failing every pending DMA operation with
    /// [`BuslinkError::Disconnected`].
    pub fn disconnect(mut self) {
        self.engine.fail_all();
        info!("disconnected");
    }

    // --- internals ---

    /// Run queued control-bank frames through their handlers, echoing where
    /// the opcode demands it.
    async fn dispatch_mmio(&mut self) -> Result<bool> {
        let Self {
            ctrl,
            ifaces,
            handlers,
            ..
        } = self;
        let mut progressed = false;
        for id in 0..MAX_IFACE {
            let Some(handler) = handlers[id].as_mut() else {
                continue;
            };
            while let Some(mut frame) = ifaces[id].queue.pop() {
                progressed = true;
                if mmio::dispatch(handler.as_mut(), &mut frame) {
                    ctrl.send(frame.first_block()).await?;
                }
            }
        }
        Ok(progressed)
    }

    /// Fill and slice the control channel. Returns whether bytes moved.
    async fn poll_ctrl(&mut self) -> Result<bool> {
        let filled = self.ctrl.fill()?;
        let sliced = slice_frames(
            &mut self.ctrl,
            &mut self.ifaces,
            Some(&mut self.reset_pending),
        )
        .await?;
        Ok(filled > 0 || sliced)
    }

    /// Fill and slice the DMA channel, if present.
    async fn poll_dma(&mut self) -> Result<bool> {
        let Some(dma) = &mut self.dma else {
            return Ok(false);
        };
        let filled = dma.fill()?;
        let sliced = slice_frames(dma, &mut self.ifaces, None).await?;
        Ok(filled > 0 || sliced)
    }
}

/// Slice complete frames out of a channel's ring into interface queues.
///
/// Keep-alives are echoed in place, resets latch the flag (control channel
/// only), frames for unknown or unclaimed targets are bounced or dropped,
/// and a full target queue stops slicing so the bytes stay buffered.
async fn slice_frames(
    channel: &mut Channel,
    ifaces: &mut [Interface; 2 * MAX_IFACE],
    mut reset_pending: Option<&mut bool>,
) -> Result<bool> {
    let mut progressed = false;
    while channel.rx.available() >= BLOCK_SIZE {
        let word0 = channel.rx.peek_u64(0);
        let word1 = channel.rx.peek_u64(8);
        let wire_len = (((word0 >> 8) & 0xFF) as usize + 1) * BLOCK_SIZE;
        if channel.rx.available() < wire_len {
            break;
        }
        let ifn = (word0 & 0xFF) as usize;
        let initiator = word0 & 0x8000_0000 != 0;
        let op = (word1 & 0xFF) as u8;

        if op == opcode::PING {
            let mut block = [0u8; BLOCK_SIZE];
            channel.rx.copy_out(0, &mut block);
            block[1] = 0;
            channel.send(&block).await?;
            channel.rx.advance(wire_len);
            progressed = true;
            continue;
        }
        if op == opcode::RESET {
            if let Some(flag) = reset_pending.as_mut() {
                **flag = true;
            }
            channel.rx.advance(wire_len);
            progressed = true;
            continue;
        }

        let bank = if initiator { DMA_BANK } else { CTRL_BANK };
        let in_range = ifn < MAX_IFACE;
        if !in_range || !ifaces[bank * MAX_IFACE + ifn].ready {
            if !initiator && in_range {
                // Answer so the VM does not stall on an unclaimed region.
                let mut block = [0u8; BLOCK_SIZE];
                channel.rx.copy_out(0, &mut block);
                block[1] = 0;
                channel.send(&block).await?;
                debug!(ifn, op, "bounced frame for unclaimed interface");
            } else {
                warn!(ifn, op, initiator, "dropping frame for invalid target");
            }
            channel.rx.advance(wire_len);
            progressed = true;
            continue;
        }

        let iface = &mut ifaces[bank * MAX_IFACE + ifn];
        if iface.queue.is_full() {
            // Backpressure: leave the frame in the ring.
            break;
        }
        let take = wire_len.min(SLOT_SIZE);
        let mut slot = [0u8; SLOT_SIZE];
        channel.rx.copy_out(0, &mut slot[..take]);
        iface.queue.push(Frame::from_wire(&slot[..take]));
        channel.rx.advance(wire_len);
        progressed = true;
    }
    Ok(progressed)
}

async fn wait_readable(channel: Option<&Channel>) -> Result<()> {
    match channel {
        Some(c) => c.readable().await,
        None => std::future::pending().await,
    }
}

type CompletionCell = Arc<Mutex<Option<Result<Bytes>>>>;

fn completion_cell() -> (CompletionCell, DmaCompletion) {
    let cell: CompletionCell = Arc::new(Mutex::new(None));
    let tx = cell.clone();
    let completion: DmaCompletion = Box::new(move |result| {
        *tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
    });
    (cell, completion)
}

fn take_completion(cell: &CompletionCell) -> Option<Result<Bytes>> {
    cell.lock().unwrap_or_else(|e| e.into_inner()).take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn loopback() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        (Connection::from_streams(client, None).unwrap(), peer)
    }

    #[tokio::test]
    async fn test_claim_sends_region_claim_frame() {
        let (mut conn, mut peer) = loopback().await;
        conn.claim_interface(3).await.unwrap();

        let mut block = [0u8; BLOCK_SIZE];
        peer.read_exact(&mut block).await.unwrap();
        let f = Frame::from_wire(&block);
        assert_eq!(f.iface_id(), 3);
        assert!(f.is_initiator());
        assert_eq!(f.opcode(), opcode::RGN_CLAIM);
    }

    #[tokio::test]
    async fn test_claim_rejects_out_of_range() {
        let (mut conn, _peer) = loopback().await;
        assert!(matches!(
            conn.claim_interface(MAX_IFACE as u8).await,
            Err(BuslinkError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_irq_update_is_idempotent() {
        let (mut conn, mut peer) = loopback().await;
        conn.update_irq(1, 4, true).await.unwrap();
        conn.update_irq(1, 4, true).await.unwrap();
        conn.update_irq(1, 4, false).await.unwrap();

        // Exactly two frames: assert and deassert.
        let mut blocks = [0u8; 2 * BLOCK_SIZE];
        peer.read_exact(&mut blocks).await.unwrap();
        let assert_f = Frame::from_wire(&blocks[..BLOCK_SIZE]);
        let deassert_f = Frame::from_wire(&blocks[BLOCK_SIZE..]);
        assert_eq!(assert_f.opcode(), opcode::IRQ_UPDATE);
        assert_eq!(assert_f.word(2), 4);
        assert_eq!(assert_f.word(3), 1);
        assert_eq!(deassert_f.word(3), 0);
    }

    #[tokio::test]
    async fn test_irq_update_validates_ids() {
        let (mut conn, _peer) = loopback().await;
        assert!(conn.update_irq(MAX_IFACE as u8, 0, true).await.is_err());
        assert!(conn.update_irq(0, MAX_IRQ as u8, true).await.is_err());
    }

    #[tokio::test]
    async fn test_dma_without_channel_is_not_connected() {
        let (mut conn, _peer) = loopback().await;
        assert!(matches!(
            conn.dma_read(0, 0, AccessFlags::empty(), 0, 64).await,
            Err(BuslinkError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_take_reset_latches_once() {
        let (mut conn, mut peer) = loopback().await;
        let mut block = [0u8; BLOCK_SIZE];
        block[8] = opcode::RESET;
        peer.write_all(&block).await.unwrap();
        peer.flush().await.unwrap();

        // Give the bytes time to land, then poll until observed.
        let mut seen = false;
        for _ in 0..100 {
            if conn.take_reset().await.unwrap() {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(seen, "reset must be reported");
        assert!(!conn.take_reset().await.unwrap(), "reported only once");
    }

    #[tokio::test]
    async fn test_reset_drops_undispatched_transactions() {
        let (mut conn, mut peer) = loopback().await;
        conn.claim_interface(0).await.unwrap();
        let mut claim = [0u8; BLOCK_SIZE];
        peer.read_exact(&mut claim).await.unwrap();

        // A queued write followed by a reset; the write never reaches a
        // consumer.
        let mut write = Frame::new();
        write.set_word(1, opcode::WRITE as u64);
        write.set_addr(0x30);
        peer.write_all(write.first_block()).await.unwrap();
        let mut reset = [0u8; BLOCK_SIZE];
        reset[8] = opcode::RESET;
        peer.write_all(&reset).await.unwrap();

        let mut seen = false;
        for _ in 0..100 {
            if conn.take_reset().await.unwrap() {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(seen);
        assert!(
            conn.pop_transaction(0).is_none(),
            "reset must drop queued transactions"
        );
    }

    #[tokio::test]
    async fn test_branch_trace_requires_claimed_interface() {
        let (mut conn, _peer) = loopback().await;
        let f = Frame::new();
        assert!(conn.unpack_branch_trace(0, 0, &f, false).is_err());

        conn.claim_interface(0).await.unwrap();
        let mut f = Frame::new();
        f.payload_mut()[..3].copy_from_slice(&[3, 200, 0]);
        conn.unpack_branch_trace(0, 0, &f, false).unwrap();
        assert_eq!(conn.branch_trace_entry(0, 0, 0).unwrap(), 100);
        assert!(conn.branch_trace_entry(0, 0, 1).is_err());
    }
}
