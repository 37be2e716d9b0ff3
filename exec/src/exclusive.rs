//! Exclusive sections: stop every running vCPU at a block boundary and
//! run with the guest quiesced.
//!
//! Mirrors QEMU's `cpus-common.c`. A vCPU brackets every stretch of
//! translation and execution with an [`ExecSection`], which calls
//! `cpu_exec_start` and runs `cpu_exec_end` on drop, unwinding included.
//! `start_exclusive` kicks the vCPUs currently inside such a stretch
//! and waits until each of them has left it.

use std::cell::Cell;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use log::trace;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::cpu::VCpu;

thread_local! {
    static IN_CPU_EXEC: Cell<bool> = const { Cell::new(false) };
    static EXCLUSIVE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// CPU list plus the exclusive-section handshake.
pub struct Exclusive {
    cpus: Mutex<Vec<VCpu>>,
    /// 0: no exclusive section. Otherwise 1 plus the number of running
    /// vCPUs still to acknowledge.
    pending_cpus: AtomicUsize,
    exclusive_cond: Condvar,
    exclusive_resume: Condvar,
}

/// Ends the exclusive section on drop.
#[must_use = "the exclusive section ends when the guard is dropped"]
pub struct ExclusiveGuard<'a> {
    ex: &'a Exclusive,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        let depth = EXCLUSIVE_DEPTH.get() - 1;
        EXCLUSIVE_DEPTH.set(depth);
        if depth == 0 {
            self.ex.end_exclusive();
        }
    }
}

/// A vCPU's stretch of guest execution. Leaves it on drop.
#[must_use = "the vCPU leaves guest execution when the guard is dropped"]
pub struct ExecSection<'a> {
    ex: &'a Exclusive,
    cpu: VCpu,
}

impl ExecSection<'_> {
    /// Step out of guest execution while `f` runs, so that `f` may
    /// start an exclusive section itself.
    pub fn suspend<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.ex.cpu_exec_end(&self.cpu);
        let out = f();
        self.ex.cpu_exec_start(&self.cpu);
        out
    }
}

impl Drop for ExecSection<'_> {
    fn drop(&mut self) {
        self.ex.cpu_exec_end(&self.cpu);
    }
}

impl Exclusive {
    pub fn new() -> Self {
        Self {
            cpus: Mutex::new(Vec::new()),
            pending_cpus: AtomicUsize::new(0),
            exclusive_cond: Condvar::new(),
            exclusive_resume: Condvar::new(),
        }
    }

    pub(crate) fn register(&self, cpu: VCpu) {
        self.cpus.lock().push(cpu);
    }

    pub(crate) fn unregister(&self, index: usize) {
        self.cpus.lock().retain(|c| c.index() != index);
    }

    /// Snapshot of the registered vCPUs.
    pub fn cpus(&self) -> Vec<VCpu> {
        self.cpus.lock().clone()
    }

    fn exclusive_idle(&self, guard: &mut MutexGuard<'_, Vec<VCpu>>) {
        while self.pending_cpus.load(Ordering::SeqCst) != 0 {
            self.exclusive_resume.wait(guard);
        }
    }

    /// Wait until no vCPU runs guest code and keep it that way until
    /// the guard is dropped. Nested calls on one thread are free.
    ///
    /// Panics when called inside an [`ExecSection`] on this thread,
    /// which would wait for itself.
    pub fn start_exclusive(&self) -> ExclusiveGuard<'_> {
        assert!(!IN_CPU_EXEC.get(), "start_exclusive called from inside cpu_exec");
        let depth = EXCLUSIVE_DEPTH.get();
        EXCLUSIVE_DEPTH.set(depth + 1);
        if depth > 0 {
            return ExclusiveGuard { ex: self };
        }

        let mut cpus = self.cpus.lock();
        self.exclusive_idle(&mut cpus);

        // Make all other vCPUs stop at their next block boundary.
        self.pending_cpus.store(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        let mut running = 0;
        for cpu in cpus.iter() {
            if cpu.0.running.load(Ordering::SeqCst) {
                cpu.0.has_waiter.store(true, Ordering::Relaxed);
                running += 1;
                cpu.exit();
            }
        }
        self.pending_cpus.store(running + 1, Ordering::SeqCst);
        while self.pending_cpus.load(Ordering::SeqCst) > 1 {
            self.exclusive_cond.wait(&mut cpus);
        }
        trace!("exclusive section entered ({running} vCPUs stopped)");
        ExclusiveGuard { ex: self }
    }

    fn end_exclusive(&self) {
        let _cpus = self.cpus.lock();
        self.pending_cpus.store(0, Ordering::SeqCst);
        self.exclusive_resume.notify_all();
    }

    /// Enter guest execution on behalf of `cpu` until the returned guard
    /// is dropped.
    pub fn exec_section(&self, cpu: &VCpu) -> ExecSection<'_> {
        self.cpu_exec_start(cpu);
        ExecSection { ex: self, cpu: cpu.clone() }
    }

    /// Waits out a pending exclusive section that has not counted `cpu`.
    fn cpu_exec_start(&self, cpu: &VCpu) {
        cpu.0.running.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        if self.pending_cpus.load(Ordering::SeqCst) != 0 {
            let mut cpus = self.cpus.lock();
            if !cpu.0.has_waiter.load(Ordering::Relaxed) {
                // Not counted by start_exclusive; wait for it to end.
                cpu.0.running.store(false, Ordering::SeqCst);
                self.exclusive_idle(&mut cpus);
                cpu.0.running.store(true, Ordering::SeqCst);
            }
        }
        IN_CPU_EXEC.set(true);
    }

    /// Acknowledges a pending exclusive section. A second call without
    /// an intervening `cpu_exec_start` does nothing.
    fn cpu_exec_end(&self, cpu: &VCpu) {
        IN_CPU_EXEC.set(false);
        cpu.0.running.store(false, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        if self.pending_cpus.load(Ordering::SeqCst) != 0 {
            let _cpus = self.cpus.lock();
            if cpu.0.has_waiter.load(Ordering::Relaxed) {
                cpu.0.has_waiter.store(false, Ordering::Relaxed);
                if self.pending_cpus.fetch_sub(1, Ordering::SeqCst) == 2 {
                    self.exclusive_cond.notify_one();
                }
            }
        }
    }
}

impl Default for Exclusive {
    fn default() -> Self {
        Self::new()
    }
}
