// SPDX-License-Identifier: MPL-2.0
//! The libata library implements the host side of the AT Attachment
//! command protocol: device discovery and identification, transfer-mode
//! negotiation, tagged command issue over the taskfile registers, and the
//! completion, timeout and reset handling around all of it. It conforms to
//! [INCITS 529-2018](https://standards.incits.org/apps/group_public/project/details.php?project_id=1643)
//! for the command layer and to the SATA register FIS layouts where the
//! transport is serial.
//!
//! The crate is transport-agnostic: everything reaches the hardware through
//! the [`tfio::PortOps`] trait, for which port-mapped and memory-mapped
//! backends are provided. A controller binding supplies the register
//! windows (and optionally its bus-master and phy hooks); the resource
//! layer supplies pre-mapped buffers, the interrupt line, and a clock. The
//! engine itself never allocates and never sleeps outside the bounded waits
//! in [`poll`].
//!
//! Execution is split into the two contexts a driver actually has: an
//! interrupt body that never blocks ([`host::Host::handle_irq`]) and a
//! deferred-work side that steps the probe and PIO state machines
//! ([`host::Host::run_pending`]), with the host-set lock serializing
//! completion between them.
#![cfg_attr(not(test), no_std)]

/// The error module defines the result taxonomy every command and probe
/// path reports: device errors with preserved registers, timeouts, bus
/// resets, unsupported devices.
pub mod error;
/// The host module owns the port registry, the shared-interrupt demux and
/// the deferred-work queue.
pub mod host;
/// The identify module wraps the raw IDENTIFY [PACKET] DEVICE page with
/// typed accessors, integrity checking, and the mandatory feature checks.
pub mod identify;
/// The pio module is the cooperative polled-transfer state machine used for
/// commands issued without DMA.
pub mod pio;
/// The poll module provides the deadline/backoff primitives every bounded
/// wait in the crate goes through.
pub mod poll;
/// The port module models one channel: up to two devices, bus reset,
/// signature classification, identification and mode negotiation, driven by
/// an asynchronous probe task.
pub mod port;
/// The queue module is the tagged command engine: slot arena, PRD table
/// construction, protocol dispatch, completion and watchdog recovery.
pub mod queue;
/// The regs module holds the register-level constants fixed by the ATA
/// standards: opcodes, status/error/control bits, reset signatures and
/// protocol timeouts.
pub mod regs;
/// The taskfile module carries the per-command register image and its
/// bit-exact conversions to and from the SATA register FIS forms.
pub mod taskfile;
/// The tfio module defines the transport ops trait and the port-mapped and
/// memory-mapped taskfile backends.
pub mod tfio;

#[cfg(test)]
pub(crate) mod mockhw;

pub use error::{AtaError, CmdResult, Result};
pub use host::{Host, HostSet, MAX_PORTS};
pub use port::{Device, Port, PortConfig, PortFlags, PortState};
pub use queue::{CmdRequest, DataBuf, QueuedCommand, SgEntry};
pub use regs::DeviceClass;
pub use taskfile::{Direction, Protocol, Taskfile};
