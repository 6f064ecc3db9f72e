// SPDX-License-Identifier: MPL-2.0
use core::fmt;

/// Errors a command or probe sequence can surface. Expected hardware
/// misbehavior (timeouts, bad signatures, rejected features) always comes back
/// through this enum; the crate only panics on internal invariant violations
/// such as a double tag release.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum AtaError {
    /// No device answered selection, or the presence check failed.
    NoDevice,
    /// A bus-level fault forced (or requires) a full port reset. Every
    /// command outstanding on the port fails with this error.
    BusReset,
    /// The device finished the command with ERR set. The raw status and
    /// error registers are preserved for the caller; the bus is left alone.
    DeviceError { status: u8, error: u8 },
    /// The watchdog window elapsed without a completion.
    Timeout,
    /// Feature negotiation failed: the device is enumerated but excluded
    /// from command issue.
    Unsupported,
    /// The port is disabled (a previous probe failed) and will not accept
    /// commands until a fresh reset cycle succeeds.
    PortDisabled,
    /// All command tags are in use; the caller must requeue.
    QueueFull,
    /// The device violated the transfer protocol (e.g. BSY clear without
    /// DRQ during a data phase).
    Protocol,
    /// The request itself cannot be expressed to the hardware (scatter list
    /// too long for the PRD table, DMA without a bus-master engine, ...).
    InvalidRequest,
}

pub type Result<T> = core::result::Result<T, AtaError>;

/// Outcome handed to a completion callback.
pub type CmdResult = Result<()>;

impl fmt::Display for AtaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtaError::NoDevice => write!(f, "no such device"),
            AtaError::BusReset => write!(f, "command aborted by bus reset"),
            AtaError::DeviceError { status, error } => write!(
                f,
                "device error (status {:#04X}, error {:#04X})",
                status, error
            ),
            AtaError::Timeout => write!(f, "command timed out"),
            AtaError::Unsupported => write!(f, "device lacks a mandatory feature"),
            AtaError::PortDisabled => write!(f, "port is disabled"),
            AtaError::QueueFull => write!(f, "all command tags are in use"),
            AtaError::Protocol => write!(f, "device violated the transfer protocol"),
            AtaError::InvalidRequest => write!(f, "request not expressible to the hardware"),
        }
    }
}
