//! The cross-thread half of a vCPU: kick, stop, interrupts, halt and
//! queued work.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use smtcg_mmu::{CpuTlb, TlbShared};

/// Work queued for a vCPU and run by its own thread at the next block
/// boundary.
pub enum CpuWork {
    TlbFlush,
    /// Flush the MMU modes selected by the mask (bit n = mode n).
    TlbFlushByMode(u32),
    TlbFlushPage(u64),
    /// Evict TLB entries covering `[start, end)`.
    TlbFlushRange(u64, u64),
    JumpCacheFlush,
    Run(Box<dyn FnOnce(&mut CpuTlb) + Send>),
}

impl fmt::Debug for CpuWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuWork::TlbFlush => f.write_str("TlbFlush"),
            CpuWork::TlbFlushByMode(m) => write!(f, "TlbFlushByMode({m:#x})"),
            CpuWork::TlbFlushPage(a) => write!(f, "TlbFlushPage({a:#x})"),
            CpuWork::TlbFlushRange(s, e) => write!(f, "TlbFlushRange({s:#x}, {e:#x})"),
            CpuWork::JumpCacheFlush => f.write_str("JumpCacheFlush"),
            CpuWork::Run(_) => f.write_str("Run(..)"),
        }
    }
}

pub(crate) struct VCpuInner {
    index: usize,
    /// Polled by generated code at every block entry.
    pub(crate) exit_request: AtomicBool,
    kick_pending: AtomicBool,
    stop: AtomicBool,
    interrupt_request: AtomicU32,
    single_step: AtomicBool,
    halted: Mutex<bool>,
    halt_cond: Condvar,
    work: Mutex<VecDeque<CpuWork>>,
    /// Inside an `ExecSection`.
    pub(crate) running: AtomicBool,
    /// Counted by a pending exclusive section. Only touched under the
    /// CPU list lock.
    pub(crate) has_waiter: AtomicBool,
    pub(crate) tlb: Arc<TlbShared>,
}

/// Handle on a vCPU, usable from any thread.
#[derive(Clone)]
pub struct VCpu(pub(crate) Arc<VCpuInner>);

impl fmt::Debug for VCpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VCpu")
            .field("index", &self.0.index)
            .field("halted", &self.is_halted())
            .field("stop", &self.is_stop_requested())
            .finish()
    }
}

impl VCpu {
    pub(crate) fn new(index: usize, tlb: Arc<TlbShared>) -> Self {
        VCpu(Arc::new(VCpuInner {
            index,
            exit_request: AtomicBool::new(false),
            kick_pending: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            interrupt_request: AtomicU32::new(0),
            single_step: AtomicBool::new(false),
            halted: Mutex::new(false),
            halt_cond: Condvar::new(),
            work: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            has_waiter: AtomicBool::new(false),
            tlb,
        }))
    }

    pub fn index(&self) -> usize {
        self.0.index
    }

    /// Make generated code return to the dispatcher at the next block
    /// entry, without reporting anything.
    pub(crate) fn exit(&self) {
        self.0.exit_request.store(true, Ordering::Release);
    }

    /// Ask the vCPU to return `Kicked` at its next block boundary.
    pub fn kick(&self) {
        self.0.kick_pending.store(true, Ordering::Release);
        self.exit();
    }

    pub(crate) fn take_kick(&self) -> bool {
        self.0.kick_pending.swap(false, Ordering::AcqRel)
    }

    /// Ask the vCPU to return `Stopped`, now and on every later entry.
    pub fn request_stop(&self) {
        self.0.stop.store(true, Ordering::Release);
        self.exit();
        let _g = self.0.halted.lock();
        self.0.halt_cond.notify_all();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.stop.load(Ordering::Acquire)
    }

    /// Raise the interrupt lines in `mask`. Wakes a halted vCPU.
    pub fn cpu_interrupt(&self, mask: u32) {
        self.0.interrupt_request.fetch_or(mask, Ordering::AcqRel);
        self.exit();
        self.wake();
    }

    pub fn reset_interrupt(&self, mask: u32) {
        self.0.interrupt_request.fetch_and(!mask, Ordering::AcqRel);
    }

    pub fn interrupt_request(&self) -> u32 {
        self.0.interrupt_request.load(Ordering::Acquire)
    }

    /// Stop executing guest code until `wake`, an interrupt or a stop
    /// request.
    pub fn halt(&self) {
        *self.0.halted.lock() = true;
        self.exit();
    }

    pub fn wake(&self) {
        let mut halted = self.0.halted.lock();
        if *halted {
            *halted = false;
            self.0.halt_cond.notify_all();
        }
    }

    pub fn is_halted(&self) -> bool {
        *self.0.halted.lock()
    }

    /// Park the calling thread while the vCPU is halted.
    pub fn wait_while_halted(&self) {
        let mut halted = self.0.halted.lock();
        while *halted && !self.is_stop_requested() {
            self.0.halt_cond.wait(&mut halted);
        }
    }

    /// Queue `work` for the vCPU's own thread.
    pub fn async_run_on_cpu(&self, work: CpuWork) {
        self.0.work.lock().push_back(work);
        self.exit();
    }

    pub(crate) fn take_work(&self) -> VecDeque<CpuWork> {
        std::mem::take(&mut *self.0.work.lock())
    }

    pub(crate) fn set_single_step(&self, on: bool) {
        self.0.single_step.store(on, Ordering::Release);
        self.exit();
    }

    pub fn single_step(&self) -> bool {
        self.0.single_step.load(Ordering::Acquire)
    }

    /// The part of the vCPU's TLB other threads may tighten.
    pub fn tlb(&self) -> &Arc<TlbShared> {
        &self.0.tlb
    }
}
