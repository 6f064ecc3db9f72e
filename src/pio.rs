// SPDX-License-Identifier: MPL-2.0
use crate::error::AtaError;
use crate::poll::{Backoff, Clock, Deadline};
use crate::port::Port;
use crate::queue::{result_from_status, SECTOR_SIZE, SECTOR_WORDS, TAG_POISON};
use crate::regs::Status;
use crate::taskfile::Direction;
use crate::tfio::PortOps;
use log::*;

/// Slow-path re-poll interval once the quick spins are exhausted.
const PIO_POLL_MS: u64 = 2;

/// Where the polled transfer stands. One task per port, advanced once per
/// scheduled invocation; it is never re-entered while a step runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PioState {
    Idle,
    /// Waiting for DRQ before moving a data sector.
    Transfer,
    /// `Transfer`, after escalating to the slow re-poll path.
    Poll,
    /// All data moved; waiting for the device to go idle.
    Last,
    /// `Last`, after escalating to the slow re-poll path.
    LastPoll,
    /// Terminal: the device sat busy past the command deadline.
    Timedout,
    /// Terminal: the device broke the transfer protocol.
    Failed,
}

impl Default for PioState {
    fn default() -> Self {
        PioState::Idle
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PioTask {
    pub state: PioState,
    pub deadline: Option<Deadline>,
    /// Instant the next step is due, in clock milliseconds.
    pub wake_at: u64,
    pub backoff: Backoff,
}

impl<O: PortOps> Port<O> {
    /// Arms the PIO task for the command that was just issued.
    pub(crate) fn pio_start<C: Clock>(&mut self, clock: &C, timeout_ms: u64) {
        self.pio.state = PioState::Transfer;
        self.pio.deadline = Some(Deadline::after(clock, timeout_ms));
        self.pio.wake_at = clock.now_ms();
        self.pio.backoff = Backoff::new();
    }

    pub(crate) fn pio_reset(&mut self) {
        self.pio = PioTask::default();
    }

    pub fn pio_state(&self) -> PioState {
        self.pio.state
    }

    /// True while the active command is being self-polled; such a command
    /// must never be completed from interrupt context.
    pub(crate) fn pio_in_progress(&self) -> bool {
        !matches!(
            self.pio.state,
            PioState::Idle | PioState::Timedout | PioState::Failed
        )
    }

    /// One scheduled invocation of the transfer machine. Returns true when
    /// the task re-armed itself (`wake_at` says when it is next due) and
    /// false once it went idle or terminal.
    pub(crate) fn pio_step<C: Clock>(&mut self, clock: &C) -> bool {
        match self.pio.state {
            PioState::Idle | PioState::Timedout | PioState::Failed => return false,
            _ => {}
        }
        let tag = self.active_tag;
        if tag == TAG_POISON {
            self.pio_reset();
            return false;
        }
        if clock.now_ms() < self.pio.wake_at {
            return true;
        }

        let mut status = Status::from_bits_truncate(self.ops.check_altstatus());
        // A handful of cheap spins catch a fast device; after that every
        // re-check costs a scheduled sleep, bounded by the deadline.
        while status.contains(Status::BSY) && self.pio.backoff.spinning() {
            self.pio.backoff.wait(clock);
            status = Status::from_bits_truncate(self.ops.check_altstatus());
        }
        if status.contains(Status::BSY) {
            let deadline = match self.pio.deadline {
                Some(deadline) => deadline,
                None => Deadline::after(clock, 0),
            };
            if deadline.expired(clock) {
                error!("port {}: device stuck busy, failing qc {}", self.id, tag);
                self.pio.state = PioState::Timedout;
                self.qc_complete(clock, tag, Err(AtaError::Timeout));
                return false;
            }
            self.pio.state = match self.pio.state {
                PioState::Last | PioState::LastPoll => PioState::LastPoll,
                _ => PioState::Poll,
            };
            self.pio.wake_at = clock.now_ms() + PIO_POLL_MS;
            return true;
        }

        match self.pio.state {
            PioState::Last | PioState::LastPoll => self.pio_finish(clock, tag, status),
            _ => self.pio_data(clock, tag, status),
        }
    }

    /// Data phase: the device must be asking for a sector.
    fn pio_data<C: Clock>(&mut self, clock: &C, tag: u8, status: Status) -> bool {
        if !status.contains(Status::DRQ) {
            // BSY clear without DRQ mid-transfer is a protocol violation.
            let raw = self.ops.check_status();
            let error = self.ops.read_error();
            warn!(
                "port {}: DRQ missing mid-transfer, status {:#04X}",
                self.id, raw
            );
            self.pio.state = PioState::Failed;
            let result = match result_from_status(raw, error) {
                Ok(()) => Err(AtaError::Protocol),
                err => err,
            };
            self.qc_complete(clock, tag, result);
            return false;
        }
        let last = self.qcmd[tag as usize].on_last_sector();
        self.pio_move_sector(tag);
        self.pio.backoff = Backoff::new();
        self.pio.state = if last {
            PioState::Last
        } else {
            PioState::Transfer
        };
        self.pio.wake_at = clock.now_ms();
        true
    }

    /// All sectors moved; the device has gone un-busy. Anything but idle
    /// means it wants data we do not have.
    fn pio_finish<C: Clock>(&mut self, clock: &C, tag: u8, status: Status) -> bool {
        if status.contains(Status::DRQ) {
            warn!("port {}: DRQ after final sector", self.id);
            self.pio.state = PioState::Failed;
            self.qc_complete(clock, tag, Err(AtaError::Protocol));
            return false;
        }
        let raw = self.ops.check_status();
        let error = self.ops.read_error();
        self.qc_complete(clock, tag, result_from_status(raw, error));
        false
    }

    /// Moves exactly one sector between the data register and the caller
    /// buffer at the cursor.
    fn pio_move_sector(&mut self, tag: u8) {
        let Port {
            ref mut ops,
            ref mut qcmd,
            ..
        } = *self;
        let qc = &mut qcmd[tag as usize];
        let mut words = [0u16; SECTOR_WORDS];
        match qc.dir {
            Direction::FromDevice => {
                ops.data_read(&mut words);
                qc.buf.store_words(qc.cursor, &words);
            }
            Direction::ToDevice => {
                qc.buf.load_words(qc.cursor, &mut words);
                ops.data_write(&words);
            }
            Direction::None => {}
        }
        qc.cursor += SECTOR_SIZE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mockhw::*;
    use crate::queue::CmdRequest;
    use crate::taskfile::{Protocol, Taskfile};

    #[test]
    fn pio_read_moves_all_sectors_and_completes() {
        let (mut port, clock) = test_port_with_disk();
        let mut buf = [0u8; 2 * SECTOR_SIZE];
        let tf = Taskfile::read_sectors(false, 8, 2);
        let mut req = CmdRequest::new(0, tf, Protocol::Pio);
        req.dir = Direction::FromDevice;
        req.buf = unsafe { crate::queue::DataBuf::new(buf.as_mut_ptr(), buf.len()) };
        req.complete = Some(record_completion);
        req.token = 0x51;
        port.submit(&clock, req).unwrap();

        let mut guard = 0;
        while port.pio_step(&clock) {
            clock.advance_ms(1);
            guard += 1;
            assert!(guard < 1_000, "PIO machine failed to converge");
        }
        assert_eq!(take_completion(0x51), Some(Ok(())));
        assert_eq!(port.pio_state(), PioState::Idle);
        // The fake disk fills sectors with a per-sector pattern.
        assert_eq!(buf[0], sector_byte(8, 0));
        assert_eq!(buf[SECTOR_SIZE], sector_byte(9, 0));
    }

    #[test]
    fn pio_stuck_busy_times_out_instead_of_hanging() {
        let (mut port, clock) = test_port_with_disk();
        port.ops.hang_busy();
        let mut buf = [0u8; SECTOR_SIZE];
        let tf = Taskfile::read_sectors(false, 0, 1);
        let mut req = CmdRequest::new(0, tf, Protocol::Pio);
        req.dir = Direction::FromDevice;
        req.buf = unsafe { crate::queue::DataBuf::new(buf.as_mut_ptr(), buf.len()) };
        req.timeout_ms = 40;
        req.complete = Some(record_completion);
        req.token = 0x52;
        port.submit(&clock, req).unwrap();

        let mut guard = 0;
        while port.pio_step(&clock) {
            clock.advance_ms(1);
            guard += 1;
            assert!(guard < 10_000, "timeout never fired");
        }
        assert_eq!(take_completion(0x52), Some(Err(AtaError::Timeout)));
        assert!(!port.pio_in_progress());
        assert_eq!(completion_count(0x52), 0, "completion ran twice");
    }

    #[test]
    fn pio_missing_drq_is_a_protocol_error() {
        let (mut port, clock) = test_port_with_disk();
        port.ops.drop_drq();
        let mut buf = [0u8; SECTOR_SIZE];
        let tf = Taskfile::read_sectors(false, 0, 1);
        let mut req = CmdRequest::new(0, tf, Protocol::Pio);
        req.dir = Direction::FromDevice;
        req.buf = unsafe { crate::queue::DataBuf::new(buf.as_mut_ptr(), buf.len()) };
        req.complete = Some(record_completion);
        req.token = 0x53;
        port.submit(&clock, req).unwrap();

        let mut guard = 0;
        while port.pio_step(&clock) {
            clock.advance_ms(1);
            guard += 1;
            assert!(guard < 1_000);
        }
        assert_eq!(take_completion(0x53), Some(Err(AtaError::Protocol)));
    }
}
