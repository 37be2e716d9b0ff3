//! Invalidation interface for memory-management code: called whenever
//! guest-visible contents, mappings or permissions change outside of
//! guest stores.

use log::debug;
use smtcg_mmu::{PageFlags, RangeError, TARGET_PAGE_SIZE};

use crate::cpu::CpuWork;
use crate::Engine;

impl Engine {
    /// Guest memory in `[start, end)` changed behind the TLB (DMA, a
    /// loader, a remap of the same permissions). Drops translated code
    /// from the range and every vCPU's TLB entries covering it.
    pub fn notify_page_changed(&self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let _ex = self.start_exclusive();
        let n = {
            let _big = self.mem.big_lock();
            let mut flags = self.mem.pages_mut();
            let mut index = self.pages.lock();
            self.tb_invalidate_range_locked(&mut flags, &mut index, start, end)
        };
        for cpu in self.vcpus() {
            cpu.tlb().flush_range(start, end);
        }
        debug!("page change {start:#x}..{end:#x}: {n} TBs invalidated");
    }

    /// Replace the flags of `[start, end)`; empty `flags` unmaps the
    /// range. Translated code in the range is dropped and the TLBs of
    /// every vCPU forget the old permissions.
    ///
    /// A range whose end rounds up past the top of the address space
    /// is rejected and changes nothing.
    pub fn notify_permission_changed(&self, start: u64, end: u64, flags: PageFlags) -> Result<(), RangeError> {
        if start >= end {
            return Ok(());
        }
        let _ex = self.start_exclusive();
        let n = {
            let _big = self.mem.big_lock();
            let mut table = self.mem.pages_mut();
            let mut index = self.pages.lock();
            if flags.is_empty() {
                table.reset(start, end)?;
            } else {
                for r in table.set_flags(start, end, flags)? {
                    debug!("{:#x}..{:#x} became writable", r.start, r.end);
                }
            }
            self.tb_invalidate_range_locked(&mut table, &mut index, start, end)
        };
        for cpu in self.vcpus() {
            cpu.tlb().flush_range(start, end);
        }
        debug!("permission change {start:#x}..{end:#x} -> {flags:?}: {n} TBs invalidated");
        Ok(())
    }

    /// Validate a host-side access to `[start, start+len)` with `flags`.
    /// For a write, pages write-protected because they hold translated
    /// code lose that code first.
    pub fn check_range(&self, start: u64, len: u64, flags: PageFlags) -> Result<(), RangeError> {
        let _big = self.mem.big_lock();
        let mut table = self.mem.pages_mut();
        let protected = table.check_range(start, len, flags)?;
        if !protected.is_empty() {
            let mut index = self.pages.lock();
            for page in protected {
                self.tb_invalidate_range_locked(&mut table, &mut index, page, page + TARGET_PAGE_SIZE);
                table.unprotect(page);
            }
        }
        Ok(())
    }

    /// Drop all translated code and every TLB entry of every vCPU.
    pub fn flush_all(&self) {
        let _ex = self.start_exclusive();
        self.tb_flush(self.flush_count());
        for cpu in self.vcpus() {
            cpu.tlb().flush_all();
        }
    }

    /// Queue a TLB flush of the modes in `mode_mask` on every vCPU; each
    /// runs it at its next block boundary.
    pub fn tlb_flush_all_cpus(&self, mode_mask: u32) {
        for cpu in self.vcpus() {
            cpu.async_run_on_cpu(CpuWork::TlbFlushByMode(mode_mask));
        }
    }

    /// Queue a flush of the page containing `addr` on every vCPU.
    pub fn tlb_flush_page_all_cpus(&self, addr: u64) {
        for cpu in self.vcpus() {
            cpu.async_run_on_cpu(CpuWork::TlbFlushPage(addr));
        }
    }
}
