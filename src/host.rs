// SPDX-License-Identifier: MPL-2.0
use crate::error::{AtaError, Result};
use crate::poll::Clock;
use crate::port::Port;
use crate::queue::TAG_POISON;
use crate::regs::{BmStatus, Status};
use crate::taskfile::Protocol;
use crate::tfio::PortOps;
use heapless::mpmc::MpMcQueue;
use heapless::Vec;
use log::*;
use spin::Mutex;

pub const MAX_PORTS: usize = 8;

impl<O: PortOps> Port<O> {
    /// Services this port's share of a (possibly shared) host interrupt.
    /// Returns true only when a real completion happened; everything else
    /// counts as an idle interrupt for this port and the caller keeps
    /// scanning.
    pub(crate) fn irq_service<C: Clock>(&mut self, clock: &C) -> bool {
        let tag = self.active_tag;
        if tag == TAG_POISON {
            self.stats.idle_irq += 1;
            return false;
        }
        // A self-polled command is completed by the PIO task, never from
        // interrupt context.
        if self.pio_in_progress() {
            self.stats.idle_irq += 1;
            return false;
        }
        match self.qcmd[tag as usize].protocol {
            Protocol::Dma => {
                let dma_status = BmStatus::from_bits_truncate(self.ops.bmdma_status());
                if !dma_status.contains(BmStatus::INTR) {
                    self.stats.idle_irq += 1;
                    return false;
                }
                self.ops.bmdma_stop();
                self.ops.irq_ack();
                let status = self.ops.check_status();
                let error = self.ops.read_error();
                let result = if dma_status.contains(BmStatus::ERROR) {
                    // The bus master faulted mid-transfer; only a reset
                    // gets the channel back to a known state.
                    Err(AtaError::BusReset)
                } else {
                    crate::queue::result_from_status(status, error)
                };
                self.qc_complete(clock, tag, result);
                true
            }
            Protocol::NoData => {
                let status = self.ops.check_status();
                if Status::from_bits_truncate(status).contains(Status::BSY) {
                    self.stats.idle_irq += 1;
                    return false;
                }
                let error = self.ops.read_error();
                self.qc_complete(clock, tag, crate::queue::result_from_status(status, error));
                true
            }
            Protocol::Pio => {
                self.stats.idle_irq += 1;
                false
            }
        }
    }

    /// True when the active command has outlived its watchdog window.
    fn watchdog_expired<C: Clock>(&self, clock: &C) -> bool {
        let tag = self.active_tag;
        if tag == TAG_POISON {
            return false;
        }
        let qc = &self.qcmd[tag as usize];
        clock.now_ms() >= qc.started_at.saturating_add(qc.timeout_ms)
    }
}

/// The registry of ports behind one interrupt line. Owned by the embedder;
/// nothing here is file-scope state. All mutation happens through the
/// host-set lock in [`Host`].
pub struct HostSet<O: PortOps, C: Clock> {
    clock: C,
    ports: Vec<Port<O>, MAX_PORTS>,
    /// Port ids the interrupt side wants serviced promptly; drained by the
    /// worker before its regular scan.
    wakeups: MpMcQueue<u8, 16>,
}

impl<O: PortOps, C: Clock> HostSet<O, C> {
    pub fn new(clock: C) -> Self {
        HostSet {
            clock,
            ports: Vec::new(),
            wakeups: MpMcQueue::new(),
        }
    }

    /// Registers a port and hands back its slot id.
    pub fn add_port(&mut self, port: Port<O>) -> Result<u8> {
        let id = self.ports.len() as u8;
        self.ports
            .push(port)
            .map_err(|_| AtaError::InvalidRequest)?;
        Ok(id)
    }

    pub fn port(&self, id: u8) -> Option<&Port<O>> {
        self.ports.get(id as usize)
    }

    pub fn port_mut(&mut self, id: u8) -> Option<&mut Port<O>> {
        self.ports.get_mut(id as usize)
    }

    pub fn ports(&self) -> impl Iterator<Item = &Port<O>> {
        self.ports.iter()
    }

    pub fn ports_mut(&mut self) -> impl Iterator<Item = &mut Port<O>> {
        self.ports.iter_mut()
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Arms the probe task on every registered port. The probes then run
    /// interleaved from [`HostSet::run_pending`], so a slow channel never
    /// serializes behind a fast one.
    pub fn start_probes(&mut self) {
        let HostSet {
            ref clock,
            ref mut ports,
            ..
        } = *self;
        for port in ports.iter_mut() {
            port.start_probe(clock);
        }
    }

    pub fn probes_finished(&self) -> bool {
        self.ports.iter().all(|p| p.probe_finished())
    }

    /// One pass of the deferred-work context: steps every due probe and
    /// PIO task. Returns true while any task is still armed.
    pub fn run_pending(&mut self) -> bool {
        while self.wakeups.dequeue().is_some() {}
        let HostSet {
            ref clock,
            ref mut ports,
            ..
        } = *self;
        let mut armed = false;
        for port in ports.iter_mut() {
            armed |= port.probe_step(clock);
            armed |= port.pio_step(clock);
        }
        armed
    }

    /// Fails every command whose watchdog window has elapsed. The embedder
    /// calls this from its timer tick.
    pub fn check_timeouts(&mut self) {
        let HostSet {
            ref clock,
            ref mut ports,
            ..
        } = *self;
        for port in ports.iter_mut() {
            if port.watchdog_expired(clock) {
                warn!("port {}: watchdog expired", port.id);
                port.eng_timeout(clock);
            }
        }
    }

    /// The interrupt body: scan every port, complete what actually
    /// finished. The return value says whether the interrupt was ours at
    /// all, which is what a shared line needs.
    pub fn handle_irq(&mut self) -> bool {
        let HostSet {
            ref clock,
            ref mut ports,
            ref wakeups,
        } = *self;
        let mut handled = false;
        for port in ports.iter_mut() {
            if port.irq_service(clock) {
                handled = true;
                // More work may now be startable from the worker side.
                wakeups.enqueue(port.id).ok();
            }
        }
        if !handled {
            trace!("spurious host interrupt");
        }
        handled
    }
}

/// A host set behind its lock. The interrupt handler holds the lock for its
/// whole (non-blocking) body; the deferred-work side takes it per step and
/// releases it across every wait, which is why the probe and PIO tasks
/// re-arm with wake instants instead of sleeping in place.
pub struct Host<O: PortOps, C: Clock> {
    inner: Mutex<HostSet<O, C>>,
}

impl<O: PortOps, C: Clock> Host<O, C> {
    pub fn new(set: HostSet<O, C>) -> Self {
        Host {
            inner: Mutex::new(set),
        }
    }

    /// Runs `f` under the host-set lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut HostSet<O, C>) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Interrupt entry point. Never blocks; safe on a shared line.
    pub fn handle_irq(&self) -> bool {
        self.inner.lock().handle_irq()
    }

    /// One worker pass; the lock drops before the caller sleeps.
    pub fn run_pending(&self) -> bool {
        self.inner.lock().run_pending()
    }

    pub fn check_timeouts(&self) {
        self.inner.lock().check_timeouts()
    }

    /// Starts every port's probe and drives the work queue until all of
    /// them reach a terminal state. This is what attach blocks on; the
    /// per-port probes themselves proceed in parallel. `pace` runs with the
    /// lock released between passes and is where the embedder sleeps.
    pub fn attach<F: Fn()>(&self, pace: F) {
        self.with(|set| set.start_probes());
        loop {
            let done = self.with(|set| {
                set.run_pending();
                set.probes_finished()
            });
            if done {
                break;
            }
            pace();
        }
    }
}
