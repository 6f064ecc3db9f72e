// SPDX-License-Identifier: MPL-2.0
use crate::regs::{AtaCommand, DEV_LBA, DEV_OBS, DEV_SLAVE};
use bit_field::BitField;
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Transfer protocol a queued command runs under.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Protocol {
    /// No data phase; the device raises an interrupt when done.
    NoData,
    /// Polled sector transfer through the data register.
    Pio,
    /// Bus-master DMA through the PRD table.
    Dma,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::NoData
    }
}

/// Data movement direction, from the host's point of view.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Direction {
    None,
    ToDevice,
    FromDevice,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::None
    }
}

/// Register image for one ATA command: everything that gets written to (or
/// read back from) the taskfile registers. The high-order bytes are only
/// loaded for 48-bit commands.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Taskfile {
    pub command: u8,
    pub feature: u8,
    pub nsect: u8,
    pub lbal: u8,
    pub lbam: u8,
    pub lbah: u8,
    pub hob_feature: u8,
    pub hob_nsect: u8,
    pub hob_lbal: u8,
    pub hob_lbam: u8,
    pub hob_lbah: u8,
    pub device: u8,
    pub control: u8,
    /// Load the high-order bytes (two writes per register) when set.
    pub lba48: bool,
}

impl Taskfile {
    pub fn new(command: AtaCommand) -> Self {
        Taskfile {
            command: command as u8,
            device: DEV_OBS,
            ..Default::default()
        }
    }

    /// Places a 28-bit address: low 24 bits in the LBA registers, bits 27:24
    /// in the low nibble of the device register.
    pub fn set_lba28(&mut self, lba: u32) {
        self.lbal = lba.get_bits(0..8) as u8;
        self.lbam = lba.get_bits(8..16) as u8;
        self.lbah = lba.get_bits(16..24) as u8;
        self.device = DEV_OBS | DEV_LBA | lba.get_bits(24..28) as u8;
        self.lba48 = false;
    }

    /// Places a 48-bit address across the low and high-order register bytes.
    pub fn set_lba48(&mut self, lba: u64) {
        self.lbal = lba.get_bits(0..8) as u8;
        self.lbam = lba.get_bits(8..16) as u8;
        self.lbah = lba.get_bits(16..24) as u8;
        self.hob_lbal = lba.get_bits(24..32) as u8;
        self.hob_lbam = lba.get_bits(32..40) as u8;
        self.hob_lbah = lba.get_bits(40..48) as u8;
        self.device = DEV_OBS | DEV_LBA;
        self.lba48 = true;
    }

    pub fn lba(&self) -> u64 {
        let mut lba = 0u64;
        lba.set_bits(0..8, self.lbal as u64);
        lba.set_bits(8..16, self.lbam as u64);
        lba.set_bits(16..24, self.lbah as u64);
        if self.lba48 {
            lba.set_bits(24..32, self.hob_lbal as u64);
            lba.set_bits(32..40, self.hob_lbam as u64);
            lba.set_bits(40..48, self.hob_lbah as u64);
        } else {
            lba.set_bits(24..28, (self.device & 0x0F) as u64);
        }
        lba
    }

    /// Sector count; a 48-bit command carries 16 bits, otherwise 8.
    pub fn set_count(&mut self, count: u16) {
        self.nsect = count.get_bits(0..8) as u8;
        self.hob_nsect = count.get_bits(8..16) as u8;
    }

    pub fn count(&self) -> u16 {
        let mut count = self.nsect as u16;
        if self.lba48 {
            count.set_bits(8..16, self.hob_nsect as u16);
        }
        count
    }

    /// Points the device register at device 0 or 1, keeping address bits.
    pub fn select(&mut self, devno: u8) {
        if devno == 0 {
            self.device &= !DEV_SLAVE;
        } else {
            self.device |= DEV_SLAVE;
        }
    }

    /// Builds a sector read in the addressing mode the device supports.
    pub fn read_sectors(lba48: bool, lba: u64, count: u16) -> Self {
        Self::xfer(
            lba48,
            lba,
            count,
            AtaCommand::ReadSectorsExt,
            AtaCommand::ReadSectors,
        )
    }

    pub fn write_sectors(lba48: bool, lba: u64, count: u16) -> Self {
        Self::xfer(
            lba48,
            lba,
            count,
            AtaCommand::WriteSectorsExt,
            AtaCommand::WriteSectors,
        )
    }

    pub fn read_dma(lba48: bool, lba: u64, count: u16) -> Self {
        Self::xfer(lba48, lba, count, AtaCommand::ReadDmaExt, AtaCommand::ReadDma)
    }

    pub fn write_dma(lba48: bool, lba: u64, count: u16) -> Self {
        Self::xfer(
            lba48,
            lba,
            count,
            AtaCommand::WriteDmaExt,
            AtaCommand::WriteDma,
        )
    }

    pub fn flush_cache(lba48: bool) -> Self {
        if lba48 {
            Taskfile::new(AtaCommand::FlushCacheExt)
        } else {
            Taskfile::new(AtaCommand::FlushCache)
        }
    }

    fn xfer(lba48: bool, lba: u64, count: u16, ext: AtaCommand, legacy: AtaCommand) -> Self {
        let mut tf = if lba48 {
            let mut tf = Taskfile::new(ext);
            tf.set_lba48(lba);
            tf
        } else {
            let mut tf = Taskfile::new(legacy);
            tf.set_lba28(lba as u32);
            tf
        };
        tf.set_count(count);
        tf
    }

    /// Encodes this image as a host-to-device register FIS.
    pub fn to_fis(&self) -> FisRegH2D {
        let mut fis = FisRegH2D::new_zeroed();
        fis.fis_type = FIS_TYPE_REG_H2D;
        fis.flags = FIS_FLAG_CMD;
        fis.command = self.command;
        fis.feature_lo = self.feature;
        fis.lba0 = self.lbal;
        fis.lba1 = self.lbam;
        fis.lba2 = self.lbah;
        fis.device = self.device;
        fis.lba3 = self.hob_lbal;
        fis.lba4 = self.hob_lbam;
        fis.lba5 = self.hob_lbah;
        fis.feature_hi = self.hob_feature;
        fis.count_lo = self.nsect;
        fis.count_hi = self.hob_nsect;
        fis.control = self.control;
        fis
    }

    /// Decodes a host-to-device FIS back into a register image. The FIS does
    /// not record the addressing mode, so the caller states it.
    pub fn from_fis(fis: &FisRegH2D, lba48: bool) -> Self {
        Taskfile {
            command: fis.command,
            feature: fis.feature_lo,
            nsect: fis.count_lo,
            lbal: fis.lba0,
            lbam: fis.lba1,
            lbah: fis.lba2,
            hob_feature: fis.feature_hi,
            hob_nsect: fis.count_hi,
            hob_lbal: fis.lba3,
            hob_lbam: fis.lba4,
            hob_lbah: fis.lba5,
            device: fis.device,
            control: fis.control,
            lba48,
        }
    }
}

pub const FIS_TYPE_REG_H2D: u8 = 0x27;
pub const FIS_TYPE_REG_D2H: u8 = 0x34;
/// Flag byte bit 7: this FIS updates the command register.
pub const FIS_FLAG_CMD: u8 = 1 << 7;

/// Host-to-device register FIS, 20 bytes, layout fixed by SATA.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FisRegH2D {
    pub fis_type: u8,
    /// Port multiplier port in the low nibble, command flag in bit 7.
    pub flags: u8,
    pub command: u8,
    pub feature_lo: u8,
    pub lba0: u8,
    pub lba1: u8,
    pub lba2: u8,
    pub device: u8,
    pub lba3: u8,
    pub lba4: u8,
    pub lba5: u8,
    pub feature_hi: u8,
    pub count_lo: u8,
    pub count_hi: u8,
    pub icc: u8,
    pub control: u8,
    pub rsv: [u8; 4],
}
assert_eq_size!(FisRegH2D, [u8; 20]);

/// Device-to-host register FIS, 20 bytes, layout fixed by SATA.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FisRegD2H {
    pub fis_type: u8,
    /// Port multiplier port in the low nibble, interrupt flag in bit 6.
    pub flags: u8,
    pub status: u8,
    pub error: u8,
    pub lba0: u8,
    pub lba1: u8,
    pub lba2: u8,
    pub device: u8,
    pub lba3: u8,
    pub lba4: u8,
    pub lba5: u8,
    pub rsv2: u8,
    pub count_lo: u8,
    pub count_hi: u8,
    pub rsv3: [u8; 2],
    pub rsv4: [u8; 4],
}
assert_eq_size!(FisRegD2H, [u8; 20]);

impl FisRegD2H {
    /// Folds the result registers the device shipped back into a taskfile
    /// image, leaving command/feature/control untouched.
    pub fn update_taskfile(&self, tf: &mut Taskfile) {
        tf.nsect = self.count_lo;
        tf.hob_nsect = self.count_hi;
        tf.lbal = self.lba0;
        tf.lbam = self.lba1;
        tf.lbah = self.lba2;
        tf.hob_lbal = self.lba3;
        tf.hob_lbam = self.lba4;
        tf.hob_lbah = self.lba5;
        tf.device = self.device;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fis_round_trip_lba28() {
        let mut tf = Taskfile::new(AtaCommand::ReadSectors);
        tf.set_lba28(0x0A1_B2C3);
        tf.set_count(16);
        tf.feature = 0x7E;
        tf.control = 0x08;
        let back = Taskfile::from_fis(&tf.to_fis(), false);
        assert_eq!(back, tf);
        assert_eq!(back.lba(), 0x0A1_B2C3);
        assert_eq!(back.count(), 16);
    }

    #[test]
    fn fis_round_trip_lba48() {
        let mut tf = Taskfile::new(AtaCommand::WriteDmaExt);
        tf.set_lba48(0x0000_8F1E_2D3C_4B5A & 0x0000_FFFF_FFFF_FFFF);
        tf.set_count(0x0102);
        let fis = tf.to_fis();
        assert_eq!(fis.fis_type, FIS_TYPE_REG_H2D);
        assert_eq!(fis.flags, FIS_FLAG_CMD);
        let back = Taskfile::from_fis(&fis, true);
        assert_eq!(back, tf);
        assert_eq!(back.lba(), tf.lba());
        assert_eq!(back.count(), 0x0102);
    }

    #[test]
    fn d2h_result_registers() {
        let mut fis = FisRegD2H::new_zeroed();
        fis.fis_type = FIS_TYPE_REG_D2H;
        fis.status = 0x50;
        fis.error = 0x00;
        fis.lba0 = 0x11;
        fis.lba1 = 0x22;
        fis.lba2 = 0x33;
        fis.count_lo = 0x01;
        let mut tf = Taskfile::default();
        fis.update_taskfile(&mut tf);
        assert_eq!((tf.lbal, tf.lbam, tf.lbah), (0x11, 0x22, 0x33));
        assert_eq!(tf.nsect, 0x01);
    }

    #[test]
    fn device_selection_keeps_address_bits() {
        let mut tf = Taskfile::read_sectors(false, 0x00F_FFFF, 1);
        tf.select(1);
        assert_eq!(tf.device & DEV_SLAVE, DEV_SLAVE);
        assert_eq!(tf.lba(), 0x00F_FFFF);
        tf.select(0);
        assert_eq!(tf.device & DEV_SLAVE, 0);
    }
}
