//! TB maintenance: linking TBs to their guest pages, invalidation,
//! direct-jump chaining, self-modifying-code detection and flushes.
//!
//! Reference: `~/qemu/accel/tcg/tb-maint.c`.

use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::Ordering;

use log::{debug, trace, warn};
use smtcg_core::tb::cflags::CF_NO_GOTO_TB;
use smtcg_core::TranslationBlock;
use smtcg_mmu::{CpuTlb, MemoryMap, PageFlagsTable, SmcHandler, TARGET_PAGE_MASK, TARGET_PAGE_SIZE};

use crate::tb_store::TbInsert;
use crate::Engine;

const BITMAP_WORDS: usize = (TARGET_PAGE_SIZE / 64) as usize;

/// One bit per byte of a guest page, set where translated code lives.
#[derive(Clone)]
pub(crate) struct CodeBitmap([u64; BITMAP_WORDS]);

impl CodeBitmap {
    fn new() -> Self {
        CodeBitmap([0; BITMAP_WORDS])
    }

    /// Mark page offsets `[start, end)`.
    fn set(&mut self, start: usize, end: usize) {
        for bit in start..end {
            self.0[bit / 64] |= 1 << (bit % 64);
        }
    }

    /// Whether any of `len` bytes at page offset `off` holds code.
    fn intersects(&self, off: usize, len: usize) -> bool {
        (off..(off + len).min(TARGET_PAGE_SIZE as usize)).any(|bit| self.0[bit / 64] & (1 << (bit % 64)) != 0)
    }
}

/// Code bookkeeping for one guest page.
#[derive(Default)]
pub(crate) struct PageDesc {
    tbs: Vec<usize>,
    /// Writes through a not-dirty TLB entry since the bitmap was built.
    write_count: u32,
    code_bitmap: Option<CodeBitmap>,
}

/// Guest page → TBs whose code was read from it.
#[derive(Default)]
pub struct PageIndex {
    pages: BTreeMap<u64, PageDesc>,
}

impl PageIndex {
    /// TBs recorded for `page`.
    pub fn tbs_on_page(&self, page: u64) -> &[usize] {
        self.pages.get(&(page & TARGET_PAGE_MASK)).map_or(&[], |d| &d.tbs)
    }
}

impl Engine {
    fn build_code_bitmap(&self, page: u64, tbs: &[usize]) -> CodeBitmap {
        let mut bitmap = CodeBitmap::new();
        for &idx in tbs {
            let tb = self.tbs.get(idx);
            if tb.size == 0 {
                continue;
            }
            let start = tb.pc.max(page);
            let last = tb.pc.wrapping_add(tb.size as u64 - 1).min(page | !TARGET_PAGE_MASK);
            if start <= last {
                bitmap.set((start - page) as usize, (last - page) as usize + 1);
            }
        }
        bitmap
    }

    /// Publish `tb` and attach it to its guest pages, write-protecting
    /// them. Pages are protected before the TB becomes reachable so no
    /// vCPU can run it while a fast-path write to its code is possible.
    pub(crate) fn tb_link(&self, tb: TranslationBlock) -> TbInsert {
        let pages: Vec<u64> = tb.page_addr.iter().flatten().copied().collect();
        let _big = self.mem.big_lock();
        let mut flags = self.mem.pages_mut();
        let mut index = self.pages.lock();

        for &page in &pages {
            if flags.protect_code(page) {
                for cpu in self.exclusive.cpus() {
                    cpu.tlb().reset_dirty_page(page);
                }
                debug!("write-protect code page {page:#x}");
            }
        }

        let res = self.tbs.insert(tb);
        if let TbInsert::Inserted(idx) = res {
            for page in pages {
                let desc = index.pages.entry(page).or_default();
                desc.tbs.push(idx);
                desc.code_bitmap = None;
            }
        }
        res
    }

    /// Remove TB `idx` from every lookup structure and unchain it.
    fn tb_phys_invalidate(&self, idx: usize, index: &mut PageIndex) {
        let tb = self.tbs.get(idx);
        if tb.invalid.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tbs.remove(idx);
        for page in tb.page_addr.iter().flatten() {
            if let Some(desc) = index.pages.get_mut(page) {
                desc.tbs.retain(|&i| i != idx);
                desc.code_bitmap = None;
            }
        }
        self.tb_jmp_unlink(idx);
        trace!("invalidate tb {idx} pc={:#x} size={:#x}", tb.pc, tb.size);
    }

    /// Reset every jump into TB `idx` and forget its outgoing edges.
    fn tb_jmp_unlink(&self, idx: usize) {
        let tb = self.tbs.get(idx);
        let (incoming, outgoing) = {
            let mut jmp = tb.jmp.lock();
            jmp.exit_target = None;
            (mem::take(&mut jmp.jmp_list), mem::take(&mut jmp.jmp_dest))
        };

        for (src, slot) in incoming {
            let src_tb = self.tbs.get(src);
            let mut src_jmp = src_tb.jmp.lock();
            if src_jmp.jmp_dest[slot] == Some(idx) {
                src_jmp.jmp_dest[slot] = None;
                if let Some(link) = src_tb.jmp_insn_offset[slot] {
                    self.backend.patch_jump(&self.code_buf, link as usize, None);
                }
            }
        }

        for (slot, dst) in outgoing.iter().enumerate() {
            if let Some(dst) = *dst {
                self.tbs
                    .get(dst)
                    .jmp
                    .lock()
                    .jmp_list
                    .retain(|&(s, n)| !(s == idx && n == slot));
            }
        }
    }

    /// Patch exit slot `slot` of `src` to jump straight into `dst`.
    /// Returns false when either TB is invalid, the slot is already
    /// linked or `src` may not chain.
    pub(crate) fn tb_add_jump(&self, src: usize, slot: usize, dst: usize) -> bool {
        let src_tb = self.tbs.get(src);
        let dst_tb = self.tbs.get(dst);
        let Some(link) = src_tb.jmp_insn_offset[slot] else {
            return false;
        };
        if src_tb.cflags & CF_NO_GOTO_TB != 0 {
            return false;
        }

        {
            let mut src_jmp = src_tb.jmp.lock();
            if src_tb.is_invalid() || src_jmp.jmp_dest[slot].is_some() {
                return false;
            }
            src_jmp.jmp_dest[slot] = Some(dst);
        }

        {
            let mut dst_jmp = dst_tb.jmp.lock();
            if !dst_tb.is_invalid() {
                dst_jmp.jmp_list.push((src, slot));
                self.backend
                    .patch_jump(&self.code_buf, link as usize, Some((dst, dst_tb.host_offset)));
                trace!("chain tb {src}[{slot}] -> tb {dst} ({:#x} -> {:#x})", src_tb.pc, dst_tb.pc);
                return true;
            }
        }

        // `dst` was invalidated in between: drop the claim.
        let mut src_jmp = src_tb.jmp.lock();
        if src_jmp.jmp_dest[slot] == Some(dst) {
            src_jmp.jmp_dest[slot] = None;
        }
        false
    }

    /// Invalidate every TB overlapping guest `[start, end)` and restore
    /// write access to pages left without code. Returns the number of
    /// TBs invalidated.
    pub(crate) fn tb_invalidate_range_locked(
        &self,
        flags: &mut PageFlagsTable,
        index: &mut PageIndex,
        start: u64,
        end: u64,
    ) -> usize {
        if start >= end {
            return 0;
        }
        let first = start & TARGET_PAGE_MASK;
        let mut victims: Vec<usize> = index
            .pages
            .range(first..end)
            .flat_map(|(_, d)| d.tbs.iter().copied())
            .filter(|&idx| self.tbs.get(idx).overlaps(start, end))
            .collect();
        victims.sort_unstable();
        victims.dedup();
        for &idx in &victims {
            self.tb_phys_invalidate(idx, index);
        }

        let emptied: Vec<u64> = index
            .pages
            .range(first..end)
            .filter(|(_, d)| d.tbs.is_empty())
            .map(|(&p, _)| p)
            .collect();
        for page in emptied {
            index.pages.remove(&page);
            flags.unprotect(page);
        }
        if !victims.is_empty() {
            debug!("invalidated {} TBs in {start:#x}..{end:#x}", victims.len());
        }
        victims.len()
    }

    /// Invalidate TBs overlapping guest `[start, end)`.
    pub(crate) fn tb_invalidate_phys_range(&self, start: u64, end: u64) -> usize {
        let _big = self.mem.big_lock();
        let mut flags = self.mem.pages_mut();
        let mut index = self.pages.lock();
        self.tb_invalidate_range_locked(&mut flags, &mut index, start, end)
    }

    /// TBs currently attached to the page containing `addr`.
    pub fn tbs_on_page(&self, addr: u64) -> Vec<usize> {
        self.pages.lock().tbs_on_page(addr).to_vec()
    }

    /// Drop all translated code, unless another flush completed since
    /// the caller read `observed` from [`flush_count`].
    ///
    /// Runs inside an exclusive section: resets the arena, the TB slab
    /// and hash, the page index, and write access to code pages. vCPUs
    /// clear their jump caches when they notice the new flush count.
    ///
    /// [`flush_count`]: Engine::flush_count
    pub fn tb_flush(&self, observed: u32) {
        let _ex = self.start_exclusive();
        if self.flush_count.load(Ordering::Acquire) != observed {
            debug!("tb_flush: already flushed");
            return;
        }
        let _big = self.mem.big_lock();
        let mut flags = self.mem.pages_mut();
        let mut index = self.pages.lock();
        let nb_tbs = self.tbs.len();
        let used = self.code_buf.used();
        // SAFETY: inside an exclusive section no vCPU executes or
        // translates, so nothing refers to TBs or arena contents.
        unsafe {
            self.tbs.flush();
            self.code_buf.reset();
        }
        index.pages.clear();
        flags.unprotect_all();
        self.flush_count.fetch_add(1, Ordering::AcqRel);
        debug!("tb_flush: dropped {nb_tbs} TBs, {used} bytes of code");
    }

    /// Called when the arena or the TB slab ran out of space.
    pub(crate) fn tb_flush_exhausted(&self, observed: u32) {
        warn!(
            "code cache exhausted ({} TBs, {} of {} bytes), flushing",
            self.tbs.len(),
            self.code_buf.used(),
            self.code_buf.capacity()
        );
        self.tb_flush(observed);
    }
}

impl SmcHandler for Engine {
    fn notdirty_write(&self, tlb: &mut CpuTlb, mem: &MemoryMap, addr: u64, len: usize) -> bool {
        let page = addr & TARGET_PAGE_MASK;
        let _big = mem.big_lock();
        let mut flags = mem.pages_mut();
        let mut index = self.pages.lock();

        let mut victims = Vec::new();
        if let Some(desc) = index.pages.get_mut(&page) {
            desc.write_count += 1;
            if desc.code_bitmap.is_none() && desc.write_count >= self.config.smc_bitmap_threshold {
                desc.code_bitmap = Some(self.build_code_bitmap(page, &desc.tbs));
            }
            let touches_code = desc
                .code_bitmap
                .as_ref()
                .map_or(true, |b| b.intersects((addr - page) as usize, len));
            if touches_code {
                let end = addr.wrapping_add(len as u64);
                victims = desc
                    .tbs
                    .iter()
                    .copied()
                    .filter(|&idx| self.tbs.get(idx).overlaps(addr, end))
                    .collect();
            }
        }
        for &idx in &victims {
            self.tb_phys_invalidate(idx, &mut index);
        }
        if !victims.is_empty() {
            debug!("smc: write {addr:#x}+{len} invalidated {} TBs", victims.len());
        }

        if index.pages.get(&page).map_or(true, |d| d.tbs.is_empty()) {
            index.pages.remove(&page);
            flags.unprotect(page);
            tlb.set_dirty(page);
        }
        !victims.is_empty()
    }
}
