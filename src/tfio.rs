// SPDX-License-Identifier: MPL-2.0
use crate::regs::*;
use crate::taskfile::Taskfile;
use voladdress::{Safe, VolAddress};

/// Register-level operations one port exposes to the protocol engine.
///
/// A backend supplies the transport primitives (`cmd_read`, `cmd_write`,
/// ...); the protocol sequencing on top of them (taskfile load order,
/// high-order byte toggling, settle delays) comes with the trait and is the
/// same for every transport. A controller binding with special requirements
/// may override any of the provided methods.
///
/// The bus-master, SATA and mode hooks are optional: the defaults are safe
/// no-ops, so a binding that leaves them alone gets a port that simply does
/// not offer DMA or phy control rather than a crash.
pub trait PortOps {
    /// Byte read from a command-block register.
    fn cmd_read(&mut self, reg: u16) -> u8;
    /// Byte write to a command-block register.
    fn cmd_write(&mut self, reg: u16, val: u8);
    /// Read of the alternate status register (does not clear interrupts).
    fn alt_read(&mut self) -> u8;
    /// Raw write of the device control register. Callers go through
    /// [`PortOps::set_ctl`] so redundant writes are skipped.
    fn ctl_write_raw(&mut self, val: u8);
    fn data_read_word(&mut self) -> u16;
    fn data_write_word(&mut self, val: u16);
    /// Backend storage for the last control value written.
    fn cached_ctl(&mut self) -> &mut u8;

    /// Bus turnaround: the classic four altstatus reads (~400ns) after a
    /// register write, before the status register is trustworthy.
    fn pause(&mut self) {
        for _ in 0..4 {
            self.alt_read();
        }
    }

    fn set_ctl(&mut self, val: u8) {
        if *self.cached_ctl() != val {
            self.ctl_write_raw(val);
            *self.cached_ctl() = val;
            self.pause();
        }
    }

    fn check_status(&mut self) -> u8 {
        self.cmd_read(REG_STATUS)
    }

    fn check_altstatus(&mut self) -> u8 {
        self.alt_read()
    }

    fn read_error(&mut self) -> u8 {
        self.cmd_read(REG_ERROR)
    }

    fn dev_select(&mut self, devno: u8) {
        let val = if devno == 0 {
            DEV_OBS
        } else {
            DEV_OBS | DEV_SLAVE
        };
        self.cmd_write(REG_DEVICE, val);
        self.pause();
    }

    /// Loads a taskfile image into the shadow registers. For a 48-bit
    /// command each register is written twice, high-order byte first.
    fn tf_load(&mut self, tf: &Taskfile) {
        self.set_ctl(tf.control);
        if tf.lba48 {
            self.cmd_write(REG_FEATURE, tf.hob_feature);
            self.cmd_write(REG_NSECT, tf.hob_nsect);
            self.cmd_write(REG_LBAL, tf.hob_lbal);
            self.cmd_write(REG_LBAM, tf.hob_lbam);
            self.cmd_write(REG_LBAH, tf.hob_lbah);
        }
        self.cmd_write(REG_FEATURE, tf.feature);
        self.cmd_write(REG_NSECT, tf.nsect);
        self.cmd_write(REG_LBAL, tf.lbal);
        self.cmd_write(REG_LBAM, tf.lbam);
        self.cmd_write(REG_LBAH, tf.lbah);
        self.cmd_write(REG_DEVICE, tf.device);
        self.pause();
    }

    /// Reads the result registers back. The error register lands in the
    /// feature slot of the image, mirroring the shared hardware register.
    fn tf_read(&mut self, tf: &mut Taskfile) {
        tf.feature = self.cmd_read(REG_ERROR);
        tf.nsect = self.cmd_read(REG_NSECT);
        tf.lbal = self.cmd_read(REG_LBAL);
        tf.lbam = self.cmd_read(REG_LBAM);
        tf.lbah = self.cmd_read(REG_LBAH);
        tf.device = self.cmd_read(REG_DEVICE);
        if tf.lba48 {
            let ctl = *self.cached_ctl();
            self.set_ctl(ctl | Control::HOB.bits());
            tf.hob_feature = self.cmd_read(REG_ERROR);
            tf.hob_nsect = self.cmd_read(REG_NSECT);
            tf.hob_lbal = self.cmd_read(REG_LBAL);
            tf.hob_lbam = self.cmd_read(REG_LBAM);
            tf.hob_lbah = self.cmd_read(REG_LBAH);
            self.set_ctl(ctl);
        }
    }

    fn exec_command(&mut self, tf: &Taskfile) {
        self.cmd_write(REG_COMMAND, tf.command);
        self.pause();
    }

    fn data_read(&mut self, buf: &mut [u16]) {
        for word in buf.iter_mut() {
            *word = self.data_read_word();
        }
    }

    fn data_write(&mut self, buf: &[u16]) {
        for word in buf.iter() {
            self.data_write_word(*word);
        }
    }

    /// Programs the bus-master PRD pointer and direction. No-op without a
    /// DMA engine.
    fn bmdma_setup(&mut self, _prd_addr: u64, _to_device: bool) {}
    fn bmdma_start(&mut self) {}
    fn bmdma_stop(&mut self) {}
    fn bmdma_status(&mut self) -> u8 {
        0
    }
    /// Acknowledges the port's interrupt condition at the controller.
    fn irq_ack(&mut self) {}
    /// SATA status/control access; `None` when the transport has no phy.
    fn scr_read(&mut self, _reg: ScrReg) -> Option<u32> {
        None
    }
    fn scr_write(&mut self, _reg: ScrReg, _val: u32) {}
    fn set_piomode(&mut self, _devno: u8, _mode: u8) {}
    fn set_udmamode(&mut self, _devno: u8, _mode: u8) {}
}

/// Memory-mapped taskfile backend: byte-wide registers at `cmd_base`, the
/// control block at `ctl_base`, optionally a bus-master block and SATA
/// status registers.
pub struct MmioTaskfile {
    cmd_base: usize,
    ctl_base: usize,
    bmdma_base: Option<usize>,
    scr_base: Option<usize>,
    last_ctl: u8,
}

impl MmioTaskfile {
    /// # Safety
    ///
    /// Every base must point at the live, exclusively-owned register window
    /// for this port, already mapped by the resource layer.
    pub unsafe fn new(
        cmd_base: usize,
        ctl_base: usize,
        bmdma_base: Option<usize>,
        scr_base: Option<usize>,
    ) -> Self {
        MmioTaskfile {
            cmd_base,
            ctl_base,
            bmdma_base,
            scr_base,
            last_ctl: 0,
        }
    }

    #[inline]
    fn reg8(&self, addr: usize) -> VolAddress<u8, Safe, Safe> {
        unsafe { VolAddress::new(addr) }
    }

    #[inline]
    fn reg16(&self, addr: usize) -> VolAddress<u16, Safe, Safe> {
        unsafe { VolAddress::new(addr) }
    }

    #[inline]
    fn reg32(&self, addr: usize) -> VolAddress<u32, Safe, Safe> {
        unsafe { VolAddress::new(addr) }
    }
}

impl PortOps for MmioTaskfile {
    fn cmd_read(&mut self, reg: u16) -> u8 {
        self.reg8(self.cmd_base + reg as usize).read()
    }

    fn cmd_write(&mut self, reg: u16, val: u8) {
        self.reg8(self.cmd_base + reg as usize).write(val);
    }

    fn alt_read(&mut self) -> u8 {
        self.reg8(self.ctl_base + REG_ALTSTATUS as usize).read()
    }

    fn ctl_write_raw(&mut self, val: u8) {
        self.reg8(self.ctl_base + REG_CTL as usize).write(val);
    }

    fn data_read_word(&mut self) -> u16 {
        self.reg16(self.cmd_base + REG_DATA as usize).read()
    }

    fn data_write_word(&mut self, val: u16) {
        self.reg16(self.cmd_base + REG_DATA as usize).write(val);
    }

    fn cached_ctl(&mut self) -> &mut u8 {
        &mut self.last_ctl
    }

    fn bmdma_setup(&mut self, prd_addr: u64, to_device: bool) {
        if let Some(base) = self.bmdma_base {
            self.reg32(base + BMDMA_PRD as usize).write(prd_addr as u32);
            let mut cmd = BmCommand::from_bits_truncate(self.reg8(base + BMDMA_CMD as usize).read());
            cmd.set(BmCommand::WRITE, !to_device);
            cmd.remove(BmCommand::START);
            self.reg8(base + BMDMA_CMD as usize).write(cmd.bits());
        }
    }

    fn bmdma_start(&mut self) {
        if let Some(base) = self.bmdma_base {
            let addr = self.reg8(base + BMDMA_CMD as usize);
            addr.write(addr.read() | BmCommand::START.bits());
        }
    }

    fn bmdma_stop(&mut self) {
        if let Some(base) = self.bmdma_base {
            let addr = self.reg8(base + BMDMA_CMD as usize);
            addr.write(addr.read() & !BmCommand::START.bits());
        }
    }

    fn bmdma_status(&mut self) -> u8 {
        match self.bmdma_base {
            Some(base) => self.reg8(base + BMDMA_STATUS as usize).read(),
            None => 0,
        }
    }

    fn irq_ack(&mut self) {
        if let Some(base) = self.bmdma_base {
            // Writing the interrupt bit back clears it.
            let addr = self.reg8(base + BMDMA_STATUS as usize);
            addr.write(addr.read() | BmStatus::INTR.bits());
        }
    }

    fn scr_read(&mut self, reg: ScrReg) -> Option<u32> {
        self.scr_base
            .map(|base| self.reg32(base + (reg as usize) * 4).read())
    }

    fn scr_write(&mut self, reg: ScrReg, val: u32) {
        if let Some(base) = self.scr_base {
            self.reg32(base + (reg as usize) * 4).write(val);
        }
    }
}

/// Port-mapped taskfile backend for the legacy x86 I/O space.
#[cfg(target_arch = "x86_64")]
pub struct PioTaskfile {
    cmd_base: u16,
    ctl_base: u16,
    bmdma_base: Option<u16>,
    last_ctl: u8,
}

#[cfg(target_arch = "x86_64")]
impl PioTaskfile {
    /// # Safety
    ///
    /// The I/O port ranges must belong to this port's controller and must
    /// not be driven by anything else.
    pub unsafe fn new(cmd_base: u16, ctl_base: u16, bmdma_base: Option<u16>) -> Self {
        PioTaskfile {
            cmd_base,
            ctl_base,
            bmdma_base,
            last_ctl: 0,
        }
    }

    #[inline]
    fn inb(&self, port: u16) -> u8 {
        let mut p = x86_64::instructions::port::Port::<u8>::new(port);
        unsafe { p.read() }
    }

    #[inline]
    fn outb(&self, port: u16, val: u8) {
        let mut p = x86_64::instructions::port::Port::<u8>::new(port);
        unsafe { p.write(val) }
    }

    #[inline]
    fn inw(&self, port: u16) -> u16 {
        let mut p = x86_64::instructions::port::Port::<u16>::new(port);
        unsafe { p.read() }
    }

    #[inline]
    fn outw(&self, port: u16, val: u16) {
        let mut p = x86_64::instructions::port::Port::<u16>::new(port);
        unsafe { p.write(val) }
    }

    #[inline]
    fn outl(&self, port: u16, val: u32) {
        let mut p = x86_64::instructions::port::Port::<u32>::new(port);
        unsafe { p.write(val) }
    }
}

#[cfg(target_arch = "x86_64")]
impl PortOps for PioTaskfile {
    fn cmd_read(&mut self, reg: u16) -> u8 {
        self.inb(self.cmd_base + reg)
    }

    fn cmd_write(&mut self, reg: u16, val: u8) {
        self.outb(self.cmd_base + reg, val);
    }

    fn alt_read(&mut self) -> u8 {
        self.inb(self.ctl_base + REG_ALTSTATUS)
    }

    fn ctl_write_raw(&mut self, val: u8) {
        self.outb(self.ctl_base + REG_CTL, val);
    }

    fn data_read_word(&mut self) -> u16 {
        self.inw(self.cmd_base + REG_DATA)
    }

    fn data_write_word(&mut self, val: u16) {
        self.outw(self.cmd_base + REG_DATA, val);
    }

    fn cached_ctl(&mut self) -> &mut u8 {
        &mut self.last_ctl
    }

    fn bmdma_setup(&mut self, prd_addr: u64, to_device: bool) {
        if let Some(base) = self.bmdma_base {
            self.outl(base + BMDMA_PRD, prd_addr as u32);
            let mut cmd = BmCommand::from_bits_truncate(self.inb(base + BMDMA_CMD));
            cmd.set(BmCommand::WRITE, !to_device);
            cmd.remove(BmCommand::START);
            self.outb(base + BMDMA_CMD, cmd.bits());
        }
    }

    fn bmdma_start(&mut self) {
        if let Some(base) = self.bmdma_base {
            let cur = self.inb(base + BMDMA_CMD);
            self.outb(base + BMDMA_CMD, cur | BmCommand::START.bits());
        }
    }

    fn bmdma_stop(&mut self) {
        if let Some(base) = self.bmdma_base {
            let cur = self.inb(base + BMDMA_CMD);
            self.outb(base + BMDMA_CMD, cur & !BmCommand::START.bits());
        }
    }

    fn bmdma_status(&mut self) -> u8 {
        match self.bmdma_base {
            Some(base) => self.inb(base + BMDMA_STATUS),
            None => 0,
        }
    }

    fn irq_ack(&mut self) {
        if let Some(base) = self.bmdma_base {
            let cur = self.inb(base + BMDMA_STATUS);
            self.outb(base + BMDMA_STATUS, cur | BmStatus::INTR.bits());
        }
    }
}
