// SPDX-License-Identifier: MPL-2.0
use crate::error::{AtaError, Result};
use crate::identify::IdentifyPage;
use crate::pio::PioTask;
use crate::poll::{poll_until, Clock, Deadline};
use crate::queue::{DataBuf, QueuedCommand, TagMap, MAX_TAGS, TAG_POISON};
use crate::regs::*;
use crate::taskfile::Taskfile;
use crate::tfio::PortOps;
use bitflags::bitflags;
use heapless::Deque;
use log::*;

pub const MAX_DEVICES: usize = 2;

bitflags! {
    pub struct PortFlags: u32 {
        /// The transport is SATA; reset goes through the phy when the
        /// binding exposes the status/control registers.
        const SATA = 1 << 0;
        /// Reset with EXECUTE DEVICE DIAGNOSTIC instead of SRST.
        const DIAG_RESET = 1 << 1;
        /// Command issue is rejected until a probe cycle succeeds.
        const DISABLED = 1 << 2;
    }
}

/// Lifecycle of the port's deferred probe task.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PortState {
    Unknown,
    PortReset,
    ProbeSuccess,
    ProbeFailed,
    Idle,
    /// Terminal; the port is being torn down and accepts nothing.
    AwaitDeath,
}

/// One of the up-to-two drives on a channel.
#[derive(Clone, Copy, Debug)]
pub struct Device {
    pub class: DeviceClass,
    pub id: Option<IdentifyPage>,
    pub udma_mode: u8,
    pub pio_mode: u8,
    pub lba48: bool,
    pub n_sectors: u64,
}

impl Device {
    const fn absent() -> Self {
        Device {
            class: DeviceClass::None,
            id: None,
            udma_mode: 0,
            pio_mode: 0,
            lba48: false,
            n_sectors: 0,
        }
    }

    fn clear(&mut self) {
        *self = Device::absent();
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::absent()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PortStats {
    /// Interrupts that arrived with nothing for this port to do.
    pub idle_irq: u32,
    pub resets: u32,
    pub timeouts: u32,
}

/// Progress of the asynchronous probe sequence. Every state either finishes
/// its work in microseconds or re-arms with a wake instant, so no single
/// step stalls the worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ProbeState {
    Inactive,
    Start,
    /// COMRESET is being driven on the phy.
    PhyPulse,
    PhyRelease,
    /// SRST is asserted in the control register.
    ResetAsserted { devmask: u8 },
    /// SRST released; the bus is settling.
    ResetSettle { devmask: u8 },
    WaitReady {
        devmask: u8,
        devno: u8,
        deadline: Deadline,
        /// Still inside the short impatient window.
        quick: bool,
    },
    Classify { devmask: u8 },
    Identify { devmask: u8, devno: u8 },
    SetMode { devno: u8 },
    Finish,
    Settle,
}

/// Host configuration for one channel, handed over by the resource layer.
/// The PRD memory must be DMA-coherent and exclusively this port's.
pub struct PortConfig {
    pub flags: PortFlags,
    /// UDMA modes the controller supports, bit 0 = UDMA0.
    pub udma_mask: u8,
    /// PIO modes the controller supports, bit 0 = PIO3.
    pub pio_mask: u8,
    pub prd_buf: DataBuf,
    /// Bus address of `prd_buf`; zero means no DMA engine.
    pub prd_bus: u64,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            flags: PortFlags::empty(),
            udma_mask: 0x3F,
            pio_mask: 0x03,
            prd_buf: DataBuf::empty(),
            prd_bus: 0,
        }
    }
}

/// One physical channel: taskfile transport, two device slots, the tagged
/// command arena, and the deferred tasks that drive it.
pub struct Port<O: PortOps> {
    pub id: u8,
    pub(crate) ops: O,
    pub(crate) flags: PortFlags,
    pub(crate) state: PortState,
    pub(crate) devices: [Device; MAX_DEVICES],
    pub(crate) udma_mask: u8,
    pub(crate) pio_mask: u8,
    pub(crate) tags: TagMap,
    pub(crate) qcmd: [QueuedCommand; MAX_TAGS],
    pub(crate) pending: Deque<u8, MAX_TAGS>,
    pub(crate) active_tag: u8,
    pub(crate) prd_buf: DataBuf,
    pub(crate) prd_bus: u64,
    pub(crate) pio: PioTask,
    pub(crate) probe: ProbeState,
    pub(crate) probe_wake_at: u64,
    pub(crate) stats: PortStats,
}

impl<O: PortOps> Port<O> {
    pub fn new(id: u8, ops: O, config: PortConfig) -> Self {
        Port {
            id,
            ops,
            flags: config.flags | PortFlags::DISABLED,
            state: PortState::Unknown,
            devices: [Device::absent(); MAX_DEVICES],
            udma_mask: config.udma_mask,
            pio_mask: config.pio_mask,
            tags: TagMap::new(),
            qcmd: [(); MAX_TAGS].map(|_| QueuedCommand::default()),
            pending: Deque::new(),
            active_tag: TAG_POISON,
            prd_buf: config.prd_buf,
            prd_bus: config.prd_bus,
            pio: PioTask::default(),
            probe: ProbeState::Inactive,
            probe_wake_at: 0,
            stats: PortStats::default(),
        }
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        !self.flags.contains(PortFlags::DISABLED)
    }

    pub fn device(&self, devno: usize) -> &Device {
        &self.devices[devno]
    }

    pub fn stats(&self) -> &PortStats {
        &self.stats
    }

    pub fn active_tag(&self) -> Option<u8> {
        if self.active_tag == TAG_POISON {
            None
        } else {
            Some(self.active_tag)
        }
    }

    /// Kicks off (or restarts) the asynchronous probe sequence. Anything
    /// in flight is failed with a bus-reset result first.
    pub fn start_probe<C: Clock>(&mut self, clock: &C) {
        if self.state == PortState::AwaitDeath {
            return;
        }
        self.abort_all(AtaError::BusReset);
        self.flags.insert(PortFlags::DISABLED);
        self.state = PortState::PortReset;
        self.probe = ProbeState::Start;
        self.probe_wake_at = clock.now_ms();
        self.stats.resets += 1;
        info!("port {}: probe started", self.id);
    }

    /// True once the probe task has reached a terminal state.
    pub fn probe_finished(&self) -> bool {
        matches!(self.state, PortState::Idle | PortState::AwaitDeath)
            && self.probe == ProbeState::Inactive
    }

    /// Marks the port dead: every outstanding command fails and nothing is
    /// accepted again.
    pub fn kill(&mut self) {
        self.abort_all(AtaError::BusReset);
        self.flags.insert(PortFlags::DISABLED);
        self.probe = ProbeState::Inactive;
        self.state = PortState::AwaitDeath;
    }

    /// One invocation of the probe task. Returns true while re-armed.
    pub(crate) fn probe_step<C: Clock>(&mut self, clock: &C) -> bool {
        if self.probe == ProbeState::Inactive {
            return false;
        }
        if clock.now_ms() < self.probe_wake_at {
            return true;
        }
        match self.probe {
            ProbeState::Inactive => false,
            ProbeState::Start => self.probe_begin(clock),
            ProbeState::PhyPulse => {
                self.ops.scr_write(ScrReg::Control, 0x301);
                self.probe = ProbeState::PhyRelease;
                self.probe_wake_at = clock.now_ms() + 1;
                true
            }
            ProbeState::PhyRelease => {
                self.ops.scr_write(ScrReg::Control, 0x300);
                // Give the link the same settle window as a software reset.
                self.probe = ProbeState::ResetSettle { devmask: 1 };
                self.probe_wake_at = clock.now_ms() + TMOUT_RESET_SETTLE_MS;
                true
            }
            ProbeState::ResetAsserted { devmask } => {
                self.ops.set_ctl(Control::NIEN.bits());
                self.probe = ProbeState::ResetSettle { devmask };
                self.probe_wake_at = clock.now_ms() + TMOUT_RESET_SETTLE_MS;
                true
            }
            ProbeState::ResetSettle { devmask } => {
                self.probe = match first_device(devmask, 0) {
                    Some(devno) => ProbeState::WaitReady {
                        devmask,
                        devno,
                        deadline: Deadline::after(clock, TMOUT_BOOT_QUICK_MS),
                        quick: true,
                    },
                    None => ProbeState::Finish,
                };
                true
            }
            ProbeState::WaitReady {
                devmask,
                devno,
                deadline,
                quick,
            } => self.probe_wait_ready(clock, devmask, devno, deadline, quick),
            ProbeState::Classify { devmask } => {
                for devno in 0..MAX_DEVICES as u8 {
                    if devmask & (1 << devno) != 0 {
                        self.probe_classify(devno);
                    }
                }
                self.probe = ProbeState::Identify { devmask, devno: 0 };
                true
            }
            ProbeState::Identify { devmask, devno } => {
                if devmask & (1 << devno) != 0 {
                    self.probe_identify(clock, devno);
                }
                if (devno as usize) + 1 < MAX_DEVICES {
                    self.probe = ProbeState::Identify {
                        devmask,
                        devno: devno + 1,
                    };
                } else {
                    self.probe = ProbeState::SetMode { devno: 0 };
                }
                true
            }
            ProbeState::SetMode { devno } => {
                if self.devices[devno as usize].class.is_enabled() {
                    self.probe_set_mode(clock, devno);
                }
                if (devno as usize) + 1 < MAX_DEVICES {
                    self.probe = ProbeState::SetMode { devno: devno + 1 };
                } else {
                    self.probe = ProbeState::Finish;
                }
                true
            }
            ProbeState::Finish => {
                let enabled = self.devices.iter().any(|d| d.class.is_enabled());
                if enabled {
                    self.state = PortState::ProbeSuccess;
                    self.flags.remove(PortFlags::DISABLED);
                } else {
                    self.state = PortState::ProbeFailed;
                    self.flags.insert(PortFlags::DISABLED);
                    warn!("port {}: no usable device, port disabled", self.id);
                }
                self.probe = ProbeState::Settle;
                true
            }
            ProbeState::Settle => {
                self.state = PortState::Idle;
                self.probe = ProbeState::Inactive;
                false
            }
        }
    }

    /// Presence check and reset start. On SATA the phy takes the place of
    /// the pattern round-trip.
    fn probe_begin<C: Clock>(&mut self, clock: &C) -> bool {
        for device in self.devices.iter_mut() {
            device.clear();
        }
        if self.flags.contains(PortFlags::SATA) {
            if let Some(sstatus) = self.ops.scr_read(ScrReg::Status) {
                if sstatus & 0xF == 0x3 {
                    self.probe = ProbeState::PhyPulse;
                } else {
                    debug!("port {}: phy reports no device (DET {})", self.id, sstatus & 0xF);
                    self.probe = ProbeState::Finish;
                }
                self.probe_wake_at = clock.now_ms();
                return true;
            }
            // No phy window from the binding; fall through to a plain
            // software reset.
        }
        let devmask = self.device_check();
        if devmask == 0 {
            debug!("port {}: nothing answered the presence check", self.id);
            self.probe = ProbeState::Finish;
            return true;
        }
        debug!("port {}: presence mask {:#04b}", self.id, devmask);
        if self.flags.contains(PortFlags::DIAG_RESET) {
            let tf = Taskfile::new(AtaCommand::ExecuteDeviceDiagnostic);
            self.ops.dev_select(0);
            self.ops.exec_command(&tf);
            self.probe = ProbeState::ResetSettle { devmask };
            self.probe_wake_at = clock.now_ms() + TMOUT_RESET_SETTLE_MS;
        } else {
            self.ops
                .set_ctl(Control::SRST.bits() | Control::NIEN.bits());
            self.probe = ProbeState::ResetAsserted { devmask };
            // SRST must stay asserted long enough for the device to latch
            // it; the standard asks for microseconds, one tick is plenty.
            self.probe_wake_at = clock.now_ms() + 1;
        }
        true
    }

    /// Writes a pattern through each device's shadow registers; a device is
    /// present only when the pattern round-trips exactly.
    fn device_check(&mut self) -> u8 {
        let mut devmask = 0u8;
        for devno in 0..MAX_DEVICES as u8 {
            self.ops.dev_select(devno);
            self.ops.cmd_write(REG_NSECT, 0x55);
            self.ops.cmd_write(REG_LBAL, 0xAA);
            self.ops.cmd_write(REG_NSECT, 0xAA);
            self.ops.cmd_write(REG_LBAL, 0x55);
            self.ops.cmd_write(REG_NSECT, 0x55);
            self.ops.cmd_write(REG_LBAL, 0xAA);
            let nsect = self.ops.cmd_read(REG_NSECT);
            let lbal = self.ops.cmd_read(REG_LBAL);
            if nsect == 0x55 && lbal == 0xAA {
                devmask |= 1 << devno;
            }
        }
        devmask
    }

    /// Waits for BSY to drop on one present device, then moves to the next.
    /// Only devices in the mask are waited on; an empty slave slot never
    /// costs its timeout window.
    fn probe_wait_ready<C: Clock>(
        &mut self,
        clock: &C,
        mut devmask: u8,
        devno: u8,
        deadline: Deadline,
        quick: bool,
    ) -> bool {
        self.ops.dev_select(devno);
        let status = Status::from_bits_truncate(self.ops.check_altstatus());
        if !status.contains(Status::BSY) {
            self.probe = match first_device(devmask, devno + 1) {
                Some(next) => ProbeState::WaitReady {
                    devmask,
                    devno: next,
                    deadline: Deadline::after(clock, TMOUT_BOOT_QUICK_MS),
                    quick: true,
                },
                None => ProbeState::Classify { devmask },
            };
            self.probe_wake_at = clock.now_ms();
            return true;
        }
        if deadline.expired(clock) {
            if quick {
                // Impatient window over; grant the full boot timeout once.
                self.probe = ProbeState::WaitReady {
                    devmask,
                    devno,
                    deadline: Deadline::after(clock, TMOUT_BOOT_MS),
                    quick: false,
                };
            } else {
                warn!(
                    "port {}: device {} stuck busy after reset, dropping it",
                    self.id, devno
                );
                devmask &= !(1 << devno);
                self.probe = match first_device(devmask, devno + 1) {
                    Some(next) => ProbeState::WaitReady {
                        devmask,
                        devno: next,
                        deadline: Deadline::after(clock, TMOUT_BOOT_QUICK_MS),
                        quick: true,
                    },
                    None => ProbeState::Classify { devmask },
                };
            }
            self.probe_wake_at = clock.now_ms();
            return true;
        }
        self.probe = ProbeState::WaitReady {
            devmask,
            devno,
            deadline,
            quick,
        };
        self.probe_wake_at = clock.now_ms() + 10;
        true
    }

    /// Reads the post-reset signature and files the device class.
    fn probe_classify(&mut self, devno: u8) {
        self.ops.dev_select(devno);
        let lbam = self.ops.cmd_read(REG_LBAM);
        let lbah = self.ops.cmd_read(REG_LBAH);
        let class = match classify_signature(lbam, lbah) {
            DeviceClass::Unknown => {
                debug!(
                    "port {}: device {} has unknown signature {:#04X}/{:#04X}",
                    self.id, devno, lbam, lbah
                );
                DeviceClass::None
            }
            class => class,
        };
        self.devices[devno as usize].class = class;
    }

    /// IDENTIFY [PACKET] DEVICE with feature validation. A device that
    /// fails the mandatory checks stays enumerated but unsupported; a
    /// device that never produces the page is dropped.
    fn probe_identify<C: Clock>(&mut self, clock: &C, devno: u8) {
        let class = self.devices[devno as usize].class;
        if !class.is_enabled() {
            return;
        }
        match self.read_identify(clock, devno, class) {
            Ok(page) => {
                if page.checksum_ok() == Some(false) {
                    warn!(
                        "port {}: device {} identify page failed its checksum",
                        self.id, devno
                    );
                }
                let device = &mut self.devices[devno as usize];
                device.id = Some(page);
                device.lba48 = page.lba48_supported();
                device.n_sectors = page.n_sectors();
                if class == DeviceClass::Ata {
                    if let Err(e) = page.validate() {
                        warn!(
                            "port {}: device {} rejected: {}; marking unsupported",
                            self.id, devno, e
                        );
                        device.class = class.into_unsupported();
                    }
                }
            }
            Err(e) => {
                debug!(
                    "port {}: device {} failed identify: {}",
                    self.id, devno, e
                );
                self.devices[devno as usize].clear();
            }
        }
    }

    /// Issues the identify command and burst-reads the 256-word page.
    fn read_identify<C: Clock>(
        &mut self,
        clock: &C,
        devno: u8,
        class: DeviceClass,
    ) -> Result<IdentifyPage> {
        self.ops.dev_select(devno);
        self.ops.set_ctl(Control::NIEN.bits());
        let command = if class == DeviceClass::Atapi {
            AtaCommand::IdentifyPacketDevice
        } else {
            AtaCommand::IdentifyDevice
        };
        let mut tf = Taskfile::new(command);
        tf.select(devno);
        self.ops.exec_command(&tf);
        if self.ops.check_status() == 0 {
            return Err(AtaError::NoDevice);
        }
        let deadline = Deadline::after(clock, TMOUT_IDENTIFY_MS);
        let ops = &mut self.ops;
        poll_until(clock, deadline, || {
            let status = Status::from_bits_truncate(ops.check_altstatus());
            !status.contains(Status::BSY)
                && (status.contains(Status::DRQ) || status.contains(Status::ERR))
        })?;
        let status = Status::from_bits_truncate(self.ops.check_status());
        if status.contains(Status::ERR) {
            let error = self.ops.read_error();
            return Err(AtaError::DeviceError {
                status: status.bits(),
                error,
            });
        }
        let mut raw = [0u16; crate::identify::ID_WORDS];
        self.ops.data_read(&mut raw);
        Ok(IdentifyPage::new(raw))
    }

    /// Picks the highest transfer modes both ends support and commits them
    /// with SET FEATURES. No common UDMA mode degrades the device to
    /// unsupported.
    fn probe_set_mode<C: Clock>(&mut self, clock: &C, devno: u8) {
        let (dev_udma, dev_pio) = match self.devices[devno as usize].id {
            Some(page) => (page.udma_mask(), page.pio_mask()),
            None => (0, 0),
        };
        let udma = match negotiate_udma(self.udma_mask, dev_udma) {
            Some(udma) => udma,
            None => {
                warn!(
                    "port {}: device {} shares no UDMA mode (host {:#04X}, device {:#04X})",
                    self.id, devno, self.udma_mask, dev_udma
                );
                let device = &mut self.devices[devno as usize];
                device.class = device.class.into_unsupported();
                return;
            }
        };
        // PIO stays available as the fallback path; pick the best common
        // mode, defaulting to PIO3 when the device predates the mask.
        let pio = match highest_bit(self.pio_mask & dev_pio) {
            Some(bit) => 3 + bit,
            None => 3,
        };
        self.ops.set_piomode(devno, pio);
        self.ops.set_udmamode(devno, udma);
        if let Err(e) = self.set_transfer_mode(clock, devno, 0x40 | udma) {
            warn!(
                "port {}: device {} did not take UDMA{}: {}",
                self.id, devno, udma, e
            );
            let device = &mut self.devices[devno as usize];
            device.class = device.class.into_unsupported();
            return;
        }
        let device = &mut self.devices[devno as usize];
        device.udma_mode = udma;
        device.pio_mode = pio;
        let (model, serial, fw) = match device.id {
            Some(page) => (page.model(), page.serial(), page.firmware_rev()),
            None => Default::default(),
        };
        info!(
            "port {}: device {} is {:?} \"{}\" (sn {}, fw {}), {} sectors, UDMA{}/PIO{}",
            self.id,
            devno,
            self.devices[devno as usize].class,
            model,
            serial,
            fw,
            self.devices[devno as usize].n_sectors,
            udma,
            pio
        );
    }

    /// SET FEATURES - transfer mode, polled with a bounded wait.
    fn set_transfer_mode<C: Clock>(&mut self, clock: &C, devno: u8, mode: u8) -> Result<()> {
        self.ops.dev_select(devno);
        let mut tf = Taskfile::new(AtaCommand::SetFeatures);
        tf.feature = SetFeaturesSubcommand::SetTransferMode as u8;
        tf.nsect = mode;
        tf.control = Control::NIEN.bits();
        tf.select(devno);
        self.ops.tf_load(&tf);
        self.ops.exec_command(&tf);
        let deadline = Deadline::after(clock, TMOUT_IDENTIFY_MS);
        let ops = &mut self.ops;
        poll_until(clock, deadline, || {
            !Status::from_bits_truncate(ops.check_altstatus()).contains(Status::BSY)
        })?;
        let status = self.ops.check_status();
        let error = self.ops.read_error();
        crate::queue::result_from_status(status, error)
    }
}

/// Highest UDMA mode present in both masks.
pub fn negotiate_udma(host_mask: u8, dev_mask: u8) -> Option<u8> {
    highest_bit(host_mask & dev_mask)
}

fn highest_bit(mask: u8) -> Option<u8> {
    if mask == 0 {
        None
    } else {
        Some(7 - mask.leading_zeros() as u8)
    }
}

fn first_device(devmask: u8, from: u8) -> Option<u8> {
    (from..MAX_DEVICES as u8).find(|d| devmask & (1 << d) != 0)
}
