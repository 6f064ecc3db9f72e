//! Scripted fake hardware for the unit tests: a clock the tests advance by
//! hand and a port backend that models enough of a well-behaved (or
//! deliberately broken) ATA channel to drive the whole engine end to end.
use crate::error::CmdResult;
use crate::identify::tests::{finish_checksum, sample_page, set_string};
use crate::identify::ID_WORDS;
use crate::poll::Clock;
use crate::port::{Port, PortConfig};
use crate::regs::*;
use crate::tfio::PortOps;
use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Mutex;
use std::vec::Vec;

/// Virtual time. Clones share the same instant, so a test can hold a handle
/// while a `HostSet` owns another.
#[derive(Clone, Default)]
pub struct FakeClock {
    micros: Rc<Cell<u64>>,
}

impl FakeClock {
    pub fn new() -> Self {
        FakeClock::default()
    }

    pub fn advance_ms(&self, ms: u64) {
        self.micros.set(self.micros.get() + ms * 1000);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.micros.get() / 1000
    }

    fn delay_us(&self, us: u64) {
        self.micros.set(self.micros.get() + us);
    }
}

static COMPLETIONS: Mutex<Vec<(u8, usize, CmdResult)>> = Mutex::new(Vec::new());

/// A `CompleteFn` that records into a process-wide log; tests pick their
/// entries back out by token, so unique tokens keep parallel tests apart.
pub fn record_completion(tag: u8, token: usize, result: CmdResult) {
    COMPLETIONS.lock().unwrap().push((tag, token, result));
}

pub fn take_completion(token: usize) -> Option<CmdResult> {
    let mut log = COMPLETIONS.lock().unwrap();
    let idx = log.iter().position(|(_, t, _)| *t == token)?;
    Some(log.remove(idx).2)
}

pub fn completion_count(token: usize) -> usize {
    COMPLETIONS
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, t, _)| *t == token)
        .count()
}

/// Deterministic per-sector fill pattern the fake disk serves.
pub fn sector_byte(lba: u64, offset: usize) -> u8 {
    (lba as u8)
        .wrapping_mul(31)
        .wrapping_add((offset as u8).wrapping_mul(7))
}

/// One emulated drive on the fake channel.
#[derive(Clone)]
pub struct FakeDisk {
    pub class: DeviceClass,
    pub identify: [u16; ID_WORDS],
    pub sig: (u8, u8),
    /// Never clears BSY; exercises the reset/PIO timeout paths.
    pub never_ready: bool,
    sig_valid: bool,
}

impl FakeDisk {
    pub fn ata() -> Self {
        FakeDisk {
            class: DeviceClass::Ata,
            identify: sample_page(0x7F),
            sig: (0x00, 0x00),
            never_ready: false,
            sig_valid: false,
        }
    }

    pub fn atapi() -> Self {
        let mut identify = sample_page(0x3F);
        identify[0] = 0x8580;
        set_string(&mut identify, 27, 47, b"LIBATA TESTROM");
        finish_checksum(&mut identify);
        FakeDisk {
            class: DeviceClass::Atapi,
            identify,
            sig: (0x14, 0xEB),
            never_ready: false,
            sig_valid: false,
        }
    }

    /// Clears the word-49 capability bits so the feature checks reject the
    /// device.
    pub fn strip_dma_support(&mut self) {
        self.identify[49] = 0;
        finish_checksum(&mut self.identify);
    }
}

/// A `PortOps` backend emulating one channel with up to two drives. Commands
/// execute instantly apart from a scripted number of busy status reads; the
/// fault knobs below bend the model for the error-path tests.
pub struct MockPort {
    devices: [Option<FakeDisk>; 2],
    selected: u8,
    /// Last write per command-block register, and the one before it (the
    /// high-order byte for 48-bit loads).
    regs: [u8; 8],
    hob: [u8; 8],
    ctl: u8,
    last_ctl_cache: u8,
    status: u8,
    error: u8,
    /// Status reads that still report BSY before `status` shows through.
    busy_reads: u32,
    /// Device-to-host data words awaiting the data register.
    data_out: VecDeque<u16>,
    /// Host-to-device words captured from the data register.
    pub data_in: Vec<u16>,
    scr: Option<[u32; 4]>,
    pub bmdma_started: bool,
    bmdma_status: u8,
    pub set_features_mode: Option<u8>,
    /// Fault knob: the channel never leaves BSY.
    hang_busy: bool,
    /// Fault knob: BSY clears but DRQ never rises for a data command.
    drop_drq: bool,
}

impl MockPort {
    pub fn with_devices(devices: [Option<FakeDisk>; 2]) -> Self {
        MockPort {
            devices,
            selected: 0,
            regs: [0; 8],
            hob: [0; 8],
            ctl: 0,
            last_ctl_cache: 0,
            status: Status::DRDY.bits(),
            error: 0,
            busy_reads: 0,
            data_out: VecDeque::new(),
            data_in: Vec::new(),
            scr: None,
            bmdma_started: false,
            bmdma_status: 0,
            set_features_mode: None,
            hang_busy: false,
            drop_drq: false,
        }
    }

    pub fn empty() -> Self {
        MockPort::with_devices([None, None])
    }

    /// Attaches a SATA phy window reporting an established link.
    pub fn with_scr(mut self) -> Self {
        self.scr = Some([0x0000_0123, 0, 0x300, 0]);
        self
    }

    pub fn hang_busy(&mut self) {
        self.hang_busy = true;
    }

    pub fn drop_drq(&mut self) {
        self.drop_drq = true;
    }

    /// Finishes the outstanding bus-master transfer and asserts the port's
    /// interrupt condition.
    pub fn raise_dma_irq(&mut self) {
        self.bmdma_status |= BmStatus::INTR.bits();
        self.status = Status::DRDY.bits();
        self.busy_reads = 0;
    }

    fn disk(&self) -> Option<&FakeDisk> {
        self.devices[self.selected as usize].as_ref()
    }

    fn disk_mut(&mut self) -> Option<&mut FakeDisk> {
        self.devices[self.selected as usize].as_mut()
    }

    fn status_byte(&mut self) -> u8 {
        if self.hang_busy {
            return Status::BSY.bits();
        }
        match self.disk() {
            Some(disk) => {
                if disk.never_ready {
                    return Status::BSY.bits();
                }
                if self.busy_reads > 0 {
                    self.busy_reads -= 1;
                    return Status::BSY.bits();
                }
                self.status
            }
            None => 0,
        }
    }

    fn lba28(&self) -> u64 {
        ((self.regs[REG_DEVICE as usize] & 0x0F) as u64) << 24
            | (self.regs[REG_LBAH as usize] as u64) << 16
            | (self.regs[REG_LBAM as usize] as u64) << 8
            | self.regs[REG_LBAL as usize] as u64
    }

    fn load_sectors(&mut self, lba: u64, count: u32) {
        self.data_out.clear();
        for sector in 0..count as u64 {
            for offset in (0..512).step_by(2) {
                let lo = sector_byte(lba + sector, offset);
                let hi = sector_byte(lba + sector, offset + 1);
                self.data_out.push_back(u16::from_le_bytes([lo, hi]));
            }
        }
    }

    fn reset_devices(&mut self) {
        for disk in self.devices.iter_mut().flatten() {
            disk.sig_valid = true;
        }
        self.status = Status::DRDY.bits();
        self.error = 0;
        self.busy_reads = 2;
        self.data_out.clear();
    }

    fn exec(&mut self, cmd: u8) {
        let class = match self.disk() {
            Some(disk) => disk.class,
            None => return,
        };
        if let Some(disk) = self.disk_mut() {
            disk.sig_valid = false;
        }
        self.error = 0;
        match cmd {
            c if c == AtaCommand::IdentifyDevice as u8 => {
                if class == DeviceClass::Ata {
                    let page = self.disk().unwrap().identify;
                    self.data_out = page.iter().copied().collect();
                    self.busy_reads = 2;
                    self.status = (Status::DRDY | Status::DRQ).bits();
                } else {
                    // Packet devices abort IDENTIFY DEVICE.
                    self.status = (Status::DRDY | Status::ERR).bits();
                    self.error = ErrorReg::ABRT.bits();
                }
            }
            c if c == AtaCommand::IdentifyPacketDevice as u8 => {
                if class == DeviceClass::Atapi {
                    let page = self.disk().unwrap().identify;
                    self.data_out = page.iter().copied().collect();
                    self.busy_reads = 2;
                    self.status = (Status::DRDY | Status::DRQ).bits();
                } else {
                    self.status = (Status::DRDY | Status::ERR).bits();
                    self.error = ErrorReg::ABRT.bits();
                }
            }
            c if c == AtaCommand::ReadSectors as u8 => {
                let count = match self.regs[REG_NSECT as usize] {
                    0 => 256,
                    n => n as u32,
                };
                let lba = self.lba28();
                self.busy_reads = 1;
                if self.drop_drq {
                    self.status = Status::DRDY.bits();
                } else {
                    self.load_sectors(lba, count);
                    self.status = (Status::DRDY | Status::DRQ).bits();
                }
            }
            c if c == AtaCommand::WriteSectors as u8 => {
                self.busy_reads = 1;
                self.status = (Status::DRDY | Status::DRQ).bits();
            }
            c if c == AtaCommand::SetFeatures as u8 => {
                if self.regs[REG_FEATURE as usize]
                    == SetFeaturesSubcommand::SetTransferMode as u8
                {
                    self.set_features_mode = Some(self.regs[REG_NSECT as usize]);
                }
                self.busy_reads = 1;
                self.status = Status::DRDY.bits();
            }
            c if c == AtaCommand::ExecuteDeviceDiagnostic as u8 => {
                self.reset_devices();
            }
            c if c == AtaCommand::ReadDma as u8 || c == AtaCommand::ReadDmaExt as u8 => {
                // Completion arrives when the test raises the DMA interrupt.
                self.status = Status::DRDY.bits();
            }
            _ => {
                self.busy_reads = 1;
                self.status = Status::DRDY.bits();
            }
        }
    }
}

impl PortOps for MockPort {
    fn cmd_read(&mut self, reg: u16) -> u8 {
        match reg {
            REG_STATUS => self.status_byte(),
            REG_ERROR => self.error,
            REG_LBAM | REG_LBAH => match self.disk() {
                Some(disk) if disk.sig_valid => {
                    if reg == REG_LBAM {
                        disk.sig.0
                    } else {
                        disk.sig.1
                    }
                }
                Some(_) => self.regs[reg as usize],
                None => 0xFF,
            },
            _ => match self.disk() {
                Some(_) => self.regs[reg as usize],
                None => 0xFF,
            },
        }
    }

    fn cmd_write(&mut self, reg: u16, val: u8) {
        if reg == REG_DEVICE {
            self.selected = (val >> 4) & 1;
            self.regs[reg as usize] = val;
            return;
        }
        if reg == REG_COMMAND {
            self.exec(val);
            return;
        }
        self.hob[reg as usize] = self.regs[reg as usize];
        self.regs[reg as usize] = val;
        if reg == REG_LBAM || reg == REG_LBAH {
            for disk in self.devices.iter_mut().flatten() {
                disk.sig_valid = false;
            }
        }
    }

    fn alt_read(&mut self) -> u8 {
        self.status_byte()
    }

    fn ctl_write_raw(&mut self, val: u8) {
        let was_srst = Control::from_bits_truncate(self.ctl).contains(Control::SRST);
        let is_srst = Control::from_bits_truncate(val).contains(Control::SRST);
        self.ctl = val;
        if was_srst && !is_srst {
            self.reset_devices();
        }
    }

    fn data_read_word(&mut self) -> u16 {
        let word = self.data_out.pop_front().unwrap_or(0);
        if self.data_out.is_empty() {
            self.status = Status::DRDY.bits();
        }
        word
    }

    fn data_write_word(&mut self, val: u16) {
        self.data_in.push(val);
        let expected = match self.regs[REG_NSECT as usize] {
            0 => 256usize * 256,
            n => n as usize * 256,
        };
        if self.data_in.len() >= expected {
            self.status = Status::DRDY.bits();
        }
    }

    fn cached_ctl(&mut self) -> &mut u8 {
        &mut self.last_ctl_cache
    }

    fn bmdma_setup(&mut self, _prd_addr: u64, _to_device: bool) {}

    fn bmdma_start(&mut self) {
        self.bmdma_started = true;
        self.bmdma_status |= BmStatus::ACTIVE.bits();
    }

    fn bmdma_stop(&mut self) {
        self.bmdma_started = false;
        self.bmdma_status &= !BmStatus::ACTIVE.bits();
    }

    fn bmdma_status(&mut self) -> u8 {
        self.bmdma_status
    }

    fn irq_ack(&mut self) {
        self.bmdma_status &= !BmStatus::INTR.bits();
    }

    fn scr_read(&mut self, reg: ScrReg) -> Option<u32> {
        self.scr.map(|regs| regs[reg as usize])
    }

    fn scr_write(&mut self, reg: ScrReg, val: u32) {
        let old = match self.scr.as_mut() {
            Some(regs) => {
                let old = regs[reg as usize];
                regs[reg as usize] = val;
                old
            }
            None => return,
        };
        // Releasing COMRESET resets the attached device like SRST would.
        if reg == ScrReg::Control && old & 0x1 == 1 && val & 0x1 == 0 {
            self.reset_devices();
        }
    }
}

/// Drives the probe task to its terminal state under virtual time.
pub fn run_probe<C: Clock>(port: &mut Port<MockPort>, clock: &C) {
    port.start_probe(clock);
    let mut guard = 0u32;
    while port.probe_step(clock) {
        clock.delay_ms(1);
        guard += 1;
        assert!(guard < 100_000, "probe failed to converge");
    }
}

/// A probed single-disk port ready for command tests.
pub fn test_port_with_disk() -> (Port<MockPort>, FakeClock) {
    let clock = FakeClock::new();
    let mut port = Port::new(
        0,
        MockPort::with_devices([Some(FakeDisk::ata()), None]),
        PortConfig::default(),
    );
    run_probe(&mut port, &clock);
    assert!(port.is_enabled(), "fake disk failed to probe");
    (port, clock)
}
