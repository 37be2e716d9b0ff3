//! Single-threaded round-robin model: one host thread time-slices all
//! vCPUs by instruction count, which makes runs deterministic.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info};
use smtcg_frontend::GuestCpu;

use crate::cpu::VCpu;
use crate::exec_loop::{Dispatcher, ExitReason};
use crate::mttcg::Control;
use crate::Engine;

/// Default slice, in guest instructions.
pub const RR_SLICE: u64 = 10_000;

struct Slot {
    dispatcher: Dispatcher,
    cpu: Box<dyn GuestCpu>,
    stopped: bool,
}

pub struct RoundRobin {
    engine: Arc<Engine>,
    slots: Vec<Slot>,
    slice: u64,
}

impl RoundRobin {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            slots: Vec::new(),
            slice: RR_SLICE,
        }
    }

    pub fn with_slice(mut self, slice: u64) -> Self {
        self.slice = slice.max(1);
        self
    }

    /// Add a vCPU; it runs after the ones added before it.
    pub fn add_cpu(&mut self, cpu: Box<dyn GuestCpu>) -> VCpu {
        let dispatcher = Dispatcher::new(Arc::clone(&self.engine));
        let vcpu = dispatcher.vcpu().clone();
        self.slots.push(Slot {
            dispatcher,
            cpu,
            stopped: false,
        });
        vcpu
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn cpu(&self, i: usize) -> &dyn GuestCpu {
        &*self.slots[i].cpu
    }

    pub fn cpu_mut(&mut self, i: usize) -> &mut dyn GuestCpu {
        &mut *self.slots[i].cpu
    }

    pub fn vcpu(&self, i: usize) -> &VCpu {
        self.slots[i].dispatcher.vcpu()
    }

    pub fn dispatcher(&self, i: usize) -> &Dispatcher {
        &self.slots[i].dispatcher
    }

    /// Run one slice of every runnable vCPU, in order. Returns false
    /// once every vCPU is stopped or `handler` asked to stop.
    ///
    /// `handler(i, cpu, vcpu, reason)` sees every exit except the end
    /// of a slice, `Stopped` and `Halted`.
    pub fn run_round<H>(&mut self, handler: &mut H) -> bool
    where
        H: FnMut(usize, &mut dyn GuestCpu, &VCpu, ExitReason) -> Control,
    {
        let slice = self.slice;
        let mut ran = false;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.stopped {
                continue;
            }
            let vcpu = slot.dispatcher.vcpu().clone();
            if vcpu.is_halted() && !vcpu.is_stop_requested() {
                continue;
            }
            ran = true;
            slot.dispatcher.set_budget(Some(slice));
            loop {
                match slot.dispatcher.cpu_exec(&mut *slot.cpu) {
                    ExitReason::BudgetExhausted | ExitReason::Halted => break,
                    ExitReason::Stopped => {
                        debug!("rr: vcpu {i} stopped");
                        slot.stopped = true;
                        break;
                    }
                    reason => {
                        if handler(i, &mut *slot.cpu, &vcpu, reason) == Control::Stop {
                            return false;
                        }
                    }
                }
            }
        }
        if self.slots.iter().all(|s| s.stopped) {
            return false;
        }
        if !ran {
            // Everything is halted; wait for an interrupt or a wake.
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Run rounds until every vCPU stopped or `handler` asked to stop.
    pub fn run<H>(&mut self, mut handler: H)
    where
        H: FnMut(usize, &mut dyn GuestCpu, &VCpu, ExitReason) -> Control,
    {
        info!("rr: running {} vCPUs, slice {}", self.slots.len(), self.slice);
        while self.run_round(&mut handler) {}
        if self.engine.config().stats {
            for slot in &self.slots {
                info!("vcpu {} stats:\n{}", slot.dispatcher.vcpu().index(), slot.dispatcher.stats());
            }
        }
    }

    /// Hand the CPU states back.
    pub fn into_cpus(self) -> Vec<Box<dyn GuestCpu>> {
        self.slots.into_iter().map(|s| s.cpu).collect()
    }
}
