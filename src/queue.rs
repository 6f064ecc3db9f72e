// SPDX-License-Identifier: MPL-2.0
use crate::error::{AtaError, CmdResult, Result};
use crate::poll::Clock;
use crate::port::{Port, PortFlags};
use crate::regs::{BmStatus, Control, Status};
use crate::taskfile::{Direction, Protocol, Taskfile};
use crate::tfio::PortOps;
use core::mem::size_of;
use heapless::Vec;
use log::*;
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Command tags per port. The tag bitmap below bounds concurrency.
pub const MAX_TAGS: usize = 32;
/// Scatter/gather segments per command.
pub const MAX_SG: usize = 16;
/// PRD slots per port; segments may split at 64 KiB boundaries.
pub const MAX_PRD: usize = 64;
/// `active_tag` value while no command drives the hardware.
pub const TAG_POISON: u8 = 0xFF;

pub const SECTOR_SIZE: usize = 512;
pub const SECTOR_WORDS: usize = SECTOR_SIZE / 2;

/// One pre-mapped, DMA-visible span handed in by the resource layer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SgEntry {
    pub addr: u64,
    pub len: u32,
}

/// One hardware scatter/gather table slot: 32-bit bus address, 16-bit byte
/// count where zero encodes a full 64 KiB, end-of-table flag in bit 15 of
/// the flag word. Layout fixed by the bus-master programming interface.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PrdEntry {
    pub addr: u32,
    pub count: u16,
    pub flags: u16,
}
assert_eq_size!(PrdEntry, [u8; 8]);

pub const PRD_EOT: u16 = 1 << 15;

impl PrdEntry {
    pub fn len(&self) -> u32 {
        if self.count == 0 {
            0x1_0000
        } else {
            self.count as u32
        }
    }
}

/// Builds the PRD table for a scatter list. Entries are split so that no
/// single descriptor crosses a 64 KiB boundary; the final entry carries the
/// end-of-table flag.
pub fn fill_prd_table(sg: &[SgEntry], table: &mut Vec<PrdEntry, MAX_PRD>) -> Result<()> {
    table.clear();
    for entry in sg {
        let mut addr = entry.addr;
        let mut remaining = entry.len as u64;
        while remaining > 0 {
            let boundary = (addr | 0xFFFF) + 1;
            let chunk = remaining.min(boundary - addr).min(0x1_0000);
            table
                .push(PrdEntry {
                    addr: addr as u32,
                    count: if chunk == 0x1_0000 { 0 } else { chunk as u16 },
                    flags: 0,
                })
                .map_err(|_| AtaError::InvalidRequest)?;
            addr += chunk;
            remaining -= chunk;
        }
    }
    match table.last_mut() {
        Some(last) => last.flags |= PRD_EOT,
        None => return Err(AtaError::InvalidRequest),
    }
    Ok(())
}

/// Raw view of a caller buffer for PIO data movement and PRD serialization.
/// Constructing one asserts the buffer stays valid and untouched for the
/// lifetime of the command it is attached to.
#[derive(Clone, Copy, Debug)]
pub struct DataBuf {
    ptr: *mut u8,
    len: usize,
}

// One execution context touches a command's buffer at a time; the tag
// engine serializes access, so the raw pointer may cross contexts.
unsafe impl Send for DataBuf {}

impl DataBuf {
    pub const fn empty() -> Self {
        DataBuf {
            ptr: core::ptr::null_mut(),
            len: 0,
        }
    }

    /// # Safety
    ///
    /// `ptr..ptr+len` must stay valid and unaliased until the command using
    /// this buffer completes.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        DataBuf { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies words read from the device into the buffer at `offset`.
    pub(crate) fn store_words(&self, offset: usize, words: &[u16]) {
        let bytes = offset + words.len() * 2;
        assert!(bytes <= self.len, "PIO write past buffer end");
        for (i, word) in words.iter().enumerate() {
            let le = word.to_le_bytes();
            unsafe {
                self.ptr.add(offset + i * 2).write(le[0]);
                self.ptr.add(offset + i * 2 + 1).write(le[1]);
            }
        }
    }

    /// Fills `words` from the buffer at `offset` for a device write.
    pub(crate) fn load_words(&self, offset: usize, words: &mut [u16]) {
        let bytes = offset + words.len() * 2;
        assert!(bytes <= self.len, "PIO read past buffer end");
        for (i, word) in words.iter_mut().enumerate() {
            unsafe {
                let lo = self.ptr.add(offset + i * 2).read();
                let hi = self.ptr.add(offset + i * 2 + 1).read();
                *word = u16::from_le_bytes([lo, hi]);
            }
        }
    }

    pub(crate) fn store_bytes(&self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.len, "write past buffer end");
        for (i, byte) in bytes.iter().enumerate() {
            unsafe {
                self.ptr.add(offset + i).write(*byte);
            }
        }
    }
}

impl Default for DataBuf {
    fn default() -> Self {
        Self::empty()
    }
}

/// Completion callback: tag, caller token, outcome. Runs exactly once per
/// issued command, from whichever context finishes it.
pub type CompleteFn = fn(tag: u8, token: usize, result: CmdResult);

/// Free/used bookkeeping for the command tags of one port.
#[derive(Clone, Copy, Debug, Default)]
pub struct TagMap {
    bits: u32,
}

impl TagMap {
    pub const fn new() -> Self {
        TagMap { bits: 0 }
    }

    /// Lowest free tag, or `None` with state untouched when all are in use.
    pub fn allocate(&mut self) -> Option<u8> {
        let tag = self.bits.trailing_ones() as u8;
        if tag as usize >= MAX_TAGS {
            return None;
        }
        self.bits |= 1 << tag;
        Some(tag)
    }

    /// Releasing a tag twice is an engine bug, not a hardware condition.
    pub fn release(&mut self, tag: u8) {
        let bit = 1u32 << tag;
        assert!(self.bits & bit != 0, "double release of tag {}", tag);
        self.bits &= !bit;
    }

    pub fn is_allocated(&self, tag: u8) -> bool {
        self.bits & (1 << tag) != 0
    }

    pub fn in_use(&self) -> u32 {
        self.bits.count_ones()
    }
}

/// One in-flight command bound to a hardware tag.
#[derive(Clone, Debug, Default)]
pub struct QueuedCommand {
    pub tag: u8,
    pub devno: u8,
    pub tf: Taskfile,
    pub protocol: Protocol,
    pub dir: Direction,
    pub buf: DataBuf,
    pub sg: Vec<SgEntry, MAX_SG>,
    /// Byte offset of the PIO cursor into `buf`.
    pub cursor: usize,
    pub timeout_ms: u64,
    /// Clock instant the command hit the hardware; watchdog anchor.
    pub started_at: u64,
    pub active: bool,
    pub(crate) complete_fn: Option<CompleteFn>,
    pub(crate) token: usize,
}

impl QueuedCommand {
    pub fn bytes_left(&self) -> usize {
        self.buf.len().saturating_sub(self.cursor)
    }

    /// True when the sector about to move is the final one.
    pub fn on_last_sector(&self) -> bool {
        self.bytes_left() <= SECTOR_SIZE
    }
}

/// What a caller hands the engine: a register image plus transfer plumbing.
/// `sg` must already be bus-mapped; `buf` backs PIO data movement.
pub struct CmdRequest<'a> {
    pub devno: u8,
    pub tf: Taskfile,
    pub protocol: Protocol,
    pub dir: Direction,
    pub buf: DataBuf,
    pub sg: &'a [SgEntry],
    pub timeout_ms: u64,
    pub complete: Option<CompleteFn>,
    pub token: usize,
}

impl<'a> CmdRequest<'a> {
    pub fn new(devno: u8, tf: Taskfile, protocol: Protocol) -> Self {
        CmdRequest {
            devno,
            tf,
            protocol,
            dir: Direction::None,
            buf: DataBuf::empty(),
            sg: &[],
            timeout_ms: crate::regs::TMOUT_DEFAULT_CMD_MS,
            complete: None,
            token: 0,
        }
    }
}

/// Maps a status/error register pair onto a command outcome.
pub fn result_from_status(status: u8, error: u8) -> CmdResult {
    let st = Status::from_bits_truncate(status);
    if st.contains(Status::ERR) || st.contains(Status::DF) {
        Err(AtaError::DeviceError { status, error })
    } else {
        Ok(())
    }
}

impl<O: PortOps> Port<O> {
    /// Accepts a command, binds it to a free tag, and starts it as soon as
    /// the channel is idle. Fails cleanly with `QueueFull` when all tags are
    /// taken; the caller requeues.
    pub fn submit<C: Clock>(&mut self, clock: &C, req: CmdRequest<'_>) -> Result<u8> {
        if self.flags.contains(PortFlags::DISABLED) {
            return Err(AtaError::PortDisabled);
        }
        if req.devno as usize >= self.devices.len()
            || !self.devices[req.devno as usize].class.is_enabled()
        {
            return Err(AtaError::NoDevice);
        }
        let sg = Vec::from_slice(req.sg).map_err(|_| AtaError::InvalidRequest)?;
        let tag = self.tags.allocate().ok_or(AtaError::QueueFull)?;
        {
            let qc = &mut self.qcmd[tag as usize];
            qc.tag = tag;
            qc.devno = req.devno;
            qc.tf = req.tf;
            qc.tf.select(req.devno);
            qc.protocol = req.protocol;
            qc.dir = req.dir;
            qc.buf = req.buf;
            qc.sg = sg;
            qc.cursor = 0;
            qc.timeout_ms = req.timeout_ms;
            qc.active = true;
            qc.complete_fn = req.complete;
            qc.token = req.token;
        }
        trace!(
            "port {}: qc {} queued, protocol {:?}",
            self.id,
            tag,
            req.protocol
        );
        if self.active_tag == TAG_POISON {
            if let Err(e) = self.start_qc(clock, tag) {
                // The caller learns of the failure through the return
                // value; the callback is reserved for accepted commands.
                self.qcmd[tag as usize].complete_fn = None;
                self.finish_qc(tag, Err(e));
                return Err(e);
            }
        } else {
            // Channel busy; the tag starts when the current command retires.
            self.pending.push_back(tag).ok();
        }
        Ok(tag)
    }

    /// Protocol dispatch for one tag. The caller has verified the channel
    /// is idle.
    fn start_qc<C: Clock>(&mut self, clock: &C, tag: u8) -> Result<()> {
        let (mut tf, protocol, dir, devno, timeout_ms) = {
            let qc = &mut self.qcmd[tag as usize];
            qc.started_at = clock.now_ms();
            (qc.tf, qc.protocol, qc.dir, qc.devno, qc.timeout_ms)
        };
        self.ops.dev_select(devno);
        match protocol {
            Protocol::NoData => {
                tf.control |= Control::NIEN.bits();
                self.ops.tf_load(&tf);
                self.ops.exec_command(&tf);
            }
            Protocol::Dma => {
                if self.prd_bus == 0 {
                    return Err(AtaError::InvalidRequest);
                }
                let mut table: Vec<PrdEntry, MAX_PRD> = Vec::new();
                fill_prd_table(&self.qcmd[tag as usize].sg, &mut table)?;
                self.write_prd(&table)?;
                self.ops.tf_load(&tf);
                self.ops
                    .bmdma_setup(self.prd_bus, dir == Direction::ToDevice);
                self.ops.exec_command(&tf);
                self.ops.bmdma_start();
            }
            Protocol::Pio => {
                let buf = self.qcmd[tag as usize].buf;
                if buf.is_empty() || buf.len() % SECTOR_SIZE != 0 {
                    return Err(AtaError::InvalidRequest);
                }
                // Self-polled: mask the device interrupt and let the PIO
                // engine drive the transfer.
                tf.control |= Control::NIEN.bits();
                self.ops.tf_load(&tf);
                self.ops.exec_command(&tf);
                self.pio_start(clock, timeout_ms);
            }
        }
        self.active_tag = tag;
        Ok(())
    }

    /// Serializes the PRD table into the port's DMA-coherent table memory.
    fn write_prd(&mut self, table: &[PrdEntry]) -> Result<()> {
        if self.prd_buf.len() < table.len() * size_of::<PrdEntry>() {
            return Err(AtaError::InvalidRequest);
        }
        for (i, entry) in table.iter().enumerate() {
            self.prd_buf
                .store_bytes(i * size_of::<PrdEntry>(), entry.as_bytes());
        }
        Ok(())
    }

    /// Retires a tag: callback, tag release, ACTIVE clear. Idempotent; a
    /// second call for the same tag is a no-op, so a late interrupt cannot
    /// double-complete a command the watchdog already failed.
    pub fn qc_complete<C: Clock>(&mut self, clock: &C, tag: u8, result: CmdResult) {
        if !self.finish_qc(tag, result) {
            return;
        }
        // The hardware is idle again; feed it the oldest queued tag.
        while self.active_tag == TAG_POISON {
            let next = match self.pending.pop_front() {
                Some(next) => next,
                None => break,
            };
            if !self.qcmd[next as usize].active {
                continue;
            }
            if let Err(e) = self.start_qc(clock, next) {
                self.finish_qc(next, Err(e));
            }
        }
    }

    /// The release half of completion. Returns false if the tag was already
    /// retired.
    pub(crate) fn finish_qc(&mut self, tag: u8, result: CmdResult) -> bool {
        let qc = &mut self.qcmd[tag as usize];
        if !qc.active {
            return false;
        }
        qc.active = false;
        let callback = qc.complete_fn.take();
        let token = qc.token;
        self.tags.release(tag);
        if self.active_tag == tag {
            self.active_tag = TAG_POISON;
            self.pio_reset();
        }
        if let Err(e) = result {
            warn!("port {}: qc {} failed: {}", self.id, tag, e);
        }
        if let Some(callback) = callback {
            callback(tag, token, result);
        }
        true
    }

    /// Watchdog recovery for a lost interrupt: decode what the hardware was
    /// doing and force a terminal result for the stuck command.
    pub fn eng_timeout<C: Clock>(&mut self, clock: &C) {
        let tag = self.active_tag;
        if tag == TAG_POISON {
            warn!("port {}: timeout with no active command", self.id);
            return;
        }
        let protocol = self.qcmd[tag as usize].protocol;
        let result = match protocol {
            Protocol::Dma => {
                let dma_status = BmStatus::from_bits_truncate(self.ops.bmdma_status());
                self.ops.bmdma_stop();
                let status = self.ops.check_status();
                let error = self.ops.read_error();
                error!(
                    "port {}: DMA timeout, bmdma status {:?}, device status {:#04X}",
                    self.id, dma_status, status
                );
                if dma_status.contains(BmStatus::ERROR) {
                    Err(AtaError::BusReset)
                } else {
                    result_from_status(status, error).and(Err(AtaError::Timeout))
                }
            }
            Protocol::Pio | Protocol::NoData => {
                let status = self.ops.check_status();
                let error = self.ops.read_error();
                error!(
                    "port {}: command timeout, device status {:#04X}",
                    self.id, status
                );
                result_from_status(status, error).and(Err(AtaError::Timeout))
            }
        };
        self.stats.timeouts += 1;
        self.qc_complete(clock, tag, result);
    }

    /// Fails every outstanding command on this port; the bus-reset path and
    /// port teardown funnel through here.
    pub(crate) fn abort_all(&mut self, reason: AtaError) {
        while self.pending.pop_front().is_some() {}
        for tag in 0..MAX_TAGS as u8 {
            if self.qcmd[tag as usize].active {
                self.finish_qc(tag, Err(reason));
            }
        }
    }
}
