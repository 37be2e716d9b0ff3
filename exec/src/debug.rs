//! Debugger support: breakpoints shared by all vCPUs and per-vCPU
//! single-stepping.

use log::debug;
use smtcg_mmu::{TARGET_PAGE_MASK, TARGET_PAGE_SIZE};

use crate::cpu::{CpuWork, VCpu};
use crate::Engine;

impl Engine {
    /// Stop every vCPU before it executes the instruction at `pc`.
    /// Returns false if the breakpoint already existed.
    pub fn insert_breakpoint(&self, pc: u64) -> bool {
        let _ex = self.start_exclusive();
        if !self.breakpoints.write().insert(pc) {
            return false;
        }
        self.invalidate_bp_page(pc);
        debug!("breakpoint inserted at {pc:#x}");
        true
    }

    /// Returns false if there was no breakpoint at `pc`.
    pub fn remove_breakpoint(&self, pc: u64) -> bool {
        let _ex = self.start_exclusive();
        if !self.breakpoints.write().remove(&pc) {
            return false;
        }
        self.invalidate_bp_page(pc);
        debug!("breakpoint removed at {pc:#x}");
        true
    }

    pub fn remove_all_breakpoints(&self) {
        let _ex = self.start_exclusive();
        let pcs = std::mem::take(&mut *self.breakpoints.write());
        for pc in pcs {
            self.invalidate_bp_page(pc);
        }
    }

    /// Blocks from the page are translated with a different instruction
    /// budget once its breakpoint set changes; drop the old ones.
    fn invalidate_bp_page(&self, pc: u64) {
        let page = pc & TARGET_PAGE_MASK;
        self.tb_invalidate_phys_range(page, page + TARGET_PAGE_SIZE);
        for cpu in self.vcpus() {
            cpu.async_run_on_cpu(CpuWork::JumpCacheFlush);
        }
    }

    pub fn has_breakpoint(&self, pc: u64) -> bool {
        let bps = self.breakpoints.read();
        !bps.is_empty() && bps.contains(&pc)
    }

    /// Whether any breakpoint lies on the page of `pc`.
    pub fn page_has_breakpoint(&self, pc: u64) -> bool {
        let page = pc & TARGET_PAGE_MASK;
        self.breakpoints.read().range(page..page + TARGET_PAGE_SIZE).next().is_some()
    }

    pub fn breakpoints(&self) -> Vec<u64> {
        self.breakpoints.read().iter().copied().collect()
    }

    /// Turn single-stepping of `cpu` on or off. While on, every block
    /// holds one instruction and the dispatcher returns `SingleStep`
    /// after it.
    pub fn single_step(&self, cpu: &VCpu, on: bool) {
        cpu.set_single_step(on);
        debug!("vcpu {} single-step {}", cpu.index(), if on { "on" } else { "off" });
    }
}
