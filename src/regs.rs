// SPDX-License-Identifier: MPL-2.0
use bitflags::bitflags;

/// ATA command opcodes, per ACS-4 section 7.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum AtaCommand {
    CheckPowerMode = 0xE5,
    DeviceReset = 0x08,
    ExecuteDeviceDiagnostic = 0x90,
    FlushCache = 0xE7,
    FlushCacheExt = 0xEA,
    IdentifyDevice = 0xEC,
    IdentifyPacketDevice = 0xA1,
    Idle = 0xE3,
    IdleImmediate = 0xE1,
    Nop = 0x00,
    Packet = 0xA0,
    ReadDma = 0xC8,
    ReadDmaExt = 0x25,
    ReadSectors = 0x20,
    ReadSectorsExt = 0x24,
    ReadVerifySectors = 0x40,
    ReadVerifySectorsExt = 0x42,
    SetFeatures = 0xEF,
    SetMultipleMode = 0xC6,
    Sleep = 0xE6,
    Standby = 0xE2,
    StandbyImmediate = 0xE0,
    WriteDma = 0xCA,
    WriteDmaExt = 0x35,
    WriteSectors = 0x30,
    WriteSectorsExt = 0x34,
}

/// SET FEATURES subcommands used during mode negotiation.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SetFeaturesSubcommand {
    SetTransferMode = 0x03,
    EnableWriteCache = 0x02,
    DisableWriteCache = 0x82,
    EnableReadLookahead = 0xAA,
    DisableReadLookahead = 0x55,
}

// Taskfile register offsets from the command block base.
pub const REG_DATA: u16 = 0;
pub const REG_ERROR: u16 = 1;
pub const REG_FEATURE: u16 = 1;
pub const REG_NSECT: u16 = 2;
pub const REG_LBAL: u16 = 3;
pub const REG_LBAM: u16 = 4;
pub const REG_LBAH: u16 = 5;
pub const REG_DEVICE: u16 = 6;
pub const REG_STATUS: u16 = 7;
pub const REG_COMMAND: u16 = 7;
// Offsets from the control block base.
pub const REG_ALTSTATUS: u16 = 0;
pub const REG_CTL: u16 = 0;

// Bus master registers, offsets from the bmdma base.
pub const BMDMA_CMD: u16 = 0;
pub const BMDMA_STATUS: u16 = 2;
pub const BMDMA_PRD: u16 = 4;

bitflags! {
    /// Status register bits.
    pub struct Status: u8 {
        const ERR = 1 << 0;
        const DRQ = 1 << 3;
        const SRV = 1 << 4;
        const DF = 1 << 5;
        const DRDY = 1 << 6;
        const BSY = 1 << 7;
    }
}

bitflags! {
    /// Error register bits.
    pub struct ErrorReg: u8 {
        const AMNF = 1 << 0;
        const TK0NF = 1 << 1;
        const ABRT = 1 << 2;
        const MCR = 1 << 3;
        const IDNF = 1 << 4;
        const MC = 1 << 5;
        const UNC = 1 << 6;
        const BBK = 1 << 7;
    }
}

bitflags! {
    /// Device control register bits.
    pub struct Control: u8 {
        const NIEN = 1 << 1;
        const SRST = 1 << 2;
        const HOB = 1 << 7;
    }
}

bitflags! {
    /// Bus master command register bits.
    pub struct BmCommand: u8 {
        const START = 1 << 0;
        /// Transfer direction: set = device-to-memory.
        const WRITE = 1 << 3;
    }
}

bitflags! {
    /// Bus master status register bits.
    pub struct BmStatus: u8 {
        const ACTIVE = 1 << 0;
        const ERROR = 1 << 1;
        const INTR = 1 << 2;
        const DMA_DEV0 = 1 << 5;
        const DMA_DEV1 = 1 << 6;
        const SIMPLEX = 1 << 7;
    }
}

// Device register bits.
pub const DEV_LBA: u8 = 1 << 6;
/// Selects device 1 (the slave) when set.
pub const DEV_SLAVE: u8 = 1 << 4;
pub const DEV_OBS: u8 = 0xA0;

/// SATA status and control registers reachable through the scr hooks.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ScrReg {
    Status = 0,
    Error = 1,
    Control = 2,
    Active = 3,
}

// Timeouts, all in milliseconds. The quick window is tried before falling
// back to the full boot window so an empty channel does not stall attach.
pub const TMOUT_BOOT_MS: u64 = 30_000;
pub const TMOUT_BOOT_QUICK_MS: u64 = 7_000;
pub const TMOUT_RESET_SETTLE_MS: u64 = 150;
pub const TMOUT_IDENTIFY_MS: u64 = 5_000;
pub const TMOUT_DEFAULT_CMD_MS: u64 = 30_000;

/// Reset signature bytes left in the LBA mid/high shadow registers, and the
/// classification they imply.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum DeviceClass {
    /// Nothing answered selection.
    None,
    Ata,
    Atapi,
    /// An ATA device that failed a mandatory feature check.
    AtaUnsupported,
    /// An ATAPI device that failed a mandatory feature check.
    AtapiUnsupported,
    /// The signature matched neither standard; treated as absent.
    Unknown,
}

impl DeviceClass {
    /// True when the device may be issued commands.
    pub fn is_enabled(self) -> bool {
        matches!(self, DeviceClass::Ata | DeviceClass::Atapi)
    }

    /// Degrades a working class into its unsupported sentinel after a
    /// feature-test failure. The device stays enumerated but is excluded
    /// from command issue.
    pub fn into_unsupported(self) -> Self {
        match self {
            DeviceClass::Ata => DeviceClass::AtaUnsupported,
            DeviceClass::Atapi => DeviceClass::AtapiUnsupported,
            other => other,
        }
    }
}

/// Classifies the post-reset signature. The byte pairs are fixed by the ATA
/// and ATAPI standards; anything else means no usable device.
pub fn classify_signature(lbam: u8, lbah: u8) -> DeviceClass {
    match (lbam, lbah) {
        (0x00, 0x00) | (0x3c, 0xc3) => DeviceClass::Ata,
        (0x14, 0xeb) | (0x69, 0x96) => DeviceClass::Atapi,
        _ => DeviceClass::Unknown,
    }
}
