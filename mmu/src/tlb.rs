//! Per-vCPU software TLB.
//!
//! Each MMU mode owns a direct-mapped table of `2^bits` entries plus a
//! small fully-associative victim table. Entry fields are atomics so
//! that other threads can *tighten* an entry (set `TLB_NOTDIRTY` on its
//! write tag) while the owning vCPU runs; every other
//! mutation happens on the owning thread, or while the owner is
//! quiescent, under [`TlbShared`]'s lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::address_space::{HostPtr, IoPort, MmuAccessType, Translation};
use crate::error::{MmuFault, RefillError};
use crate::memory::MemoryMap;
use crate::page::{PageFlags, TARGET_PAGE_BITS, TARGET_PAGE_MASK, TARGET_PAGE_SIZE};

/// Number of victim entries per MMU mode.
pub const CPU_VTLB_SIZE: usize = 8;

/// Entry does not match any address.
pub const TLB_INVALID_MASK: u64 = 1 << (TARGET_PAGE_BITS - 1);
/// Writes must take the slow path: the page holds translated code.
pub const TLB_NOTDIRTY: u64 = 1 << (TARGET_PAGE_BITS - 2);
/// Accesses are dispatched to a device.
pub const TLB_MMIO: u64 = 1 << (TARGET_PAGE_BITS - 3);
/// Status bits that force the slow path on an otherwise matching entry.
pub const TLB_FLAGS_MASK: u64 = TLB_NOTDIRTY | TLB_MMIO;

/// Unprivileged MMU mode: pages need `PageFlags::USER`.
pub const MMU_USER_IDX: usize = 0;
/// Privileged MMU mode.
pub const MMU_KERNEL_IDX: usize = 1;

/// Whether a tag field maps `page` (page-aligned), ignoring the
/// slow-path status bits.
#[inline]
pub fn tlb_hit_page(tlb_addr: u64, page: u64) -> bool {
    page == tlb_addr & (TARGET_PAGE_MASK | TLB_INVALID_MASK)
}

#[inline]
pub fn tlb_hit(tlb_addr: u64, addr: u64) -> bool {
    tlb_hit_page(tlb_addr, addr & TARGET_PAGE_MASK)
}

/// Plain snapshot of a TLB entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntryData {
    pub addr_read: u64,
    pub addr_write: u64,
    pub addr_code: u64,
    /// `host = guest + addend` (wrapping).
    pub addend: u64,
}

impl TlbEntryData {
    pub const EMPTY: TlbEntryData = TlbEntryData {
        addr_read: u64::MAX,
        addr_write: u64::MAX,
        addr_code: u64::MAX,
        addend: 0,
    };

    pub fn addr(&self, access: MmuAccessType) -> u64 {
        match access {
            MmuAccessType::DataLoad => self.addr_read,
            MmuAccessType::DataStore => self.addr_write,
            MmuAccessType::InstFetch => self.addr_code,
        }
    }

    /// Page mapped by this entry, if any field is valid.
    pub fn page(&self) -> Option<u64> {
        [self.addr_read, self.addr_write, self.addr_code]
            .into_iter()
            .find(|a| a & TLB_INVALID_MASK == 0)
            .map(|a| a & TARGET_PAGE_MASK)
    }

    pub fn maps_page(&self, page: u64) -> bool {
        self.page() == Some(page)
    }
}

/// One fast-path entry.
#[derive(Debug)]
#[repr(C, align(32))]
pub struct TlbEntry {
    addr_read: AtomicU64,
    addr_write: AtomicU64,
    addr_code: AtomicU64,
    addend: AtomicU64,
}

impl TlbEntry {
    fn empty() -> Self {
        Self {
            addr_read: AtomicU64::new(u64::MAX),
            addr_write: AtomicU64::new(u64::MAX),
            addr_code: AtomicU64::new(u64::MAX),
            addend: AtomicU64::new(0),
        }
    }

    fn field(&self, access: MmuAccessType) -> &AtomicU64 {
        match access {
            MmuAccessType::DataLoad => &self.addr_read,
            MmuAccessType::DataStore => &self.addr_write,
            MmuAccessType::InstFetch => &self.addr_code,
        }
    }

    /// Tag field for `access`.
    #[inline]
    pub fn addr(&self, access: MmuAccessType) -> u64 {
        self.field(access).load(Ordering::Acquire)
    }

    #[inline]
    pub fn addend(&self) -> u64 {
        self.addend.load(Ordering::Relaxed)
    }

    pub fn load(&self) -> TlbEntryData {
        TlbEntryData {
            addr_read: self.addr_read.load(Ordering::Acquire),
            addr_write: self.addr_write.load(Ordering::Acquire),
            addr_code: self.addr_code.load(Ordering::Acquire),
            addend: self.addend.load(Ordering::Relaxed),
        }
    }

    fn store(&self, d: &TlbEntryData) {
        self.addend.store(d.addend, Ordering::Relaxed);
        self.addr_read.store(d.addr_read, Ordering::Release);
        self.addr_write.store(d.addr_write, Ordering::Release);
        self.addr_code.store(d.addr_code, Ordering::Release);
    }

    fn invalidate(&self) {
        self.store(&TlbEntryData::EMPTY);
    }

    /// OR `bit` into `access`'s tag if it currently maps `page` and is
    /// not MMIO.
    fn tighten(&self, access: MmuAccessType, page: u64, bit: u64) {
        let f = self.field(access);
        let cur = f.load(Ordering::Acquire);
        if tlb_hit_page(cur, page) && cur & TLB_MMIO == 0 {
            f.fetch_or(bit, Ordering::AcqRel);
        }
    }
}

struct TlbTable {
    entries: Box<[TlbEntry]>,
    victim: Box<[TlbEntry]>,
    generation: AtomicU64,
}

impl TlbTable {
    fn new(size: usize) -> Self {
        Self {
            entries: (0..size).map(|_| TlbEntry::empty()).collect(),
            victim: (0..CPU_VTLB_SIZE).map(|_| TlbEntry::empty()).collect(),
            generation: AtomicU64::new(0),
        }
    }

    fn flush(&self) {
        for e in self.entries.iter().chain(self.victim.iter()) {
            e.invalidate();
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

/// The part of a vCPU's TLB visible to other threads.
pub struct TlbShared {
    modes: Box<[TlbTable]>,
    bits: u32,
    lock: Mutex<()>,
}

impl TlbShared {
    pub fn new(nb_modes: usize, bits: u32) -> Self {
        assert!(nb_modes > 0, "at least one MMU mode");
        assert!((1..=20).contains(&bits), "unreasonable TLB size 2^{bits}");
        Self {
            modes: (0..nb_modes).map(|_| TlbTable::new(1 << bits)).collect(),
            bits,
            lock: Mutex::new(()),
        }
    }

    pub fn nb_modes(&self) -> usize {
        self.modes.len()
    }

    /// Entries per mode.
    pub fn size(&self) -> usize {
        1 << self.bits
    }

    #[inline]
    pub fn index(&self, addr: u64) -> usize {
        ((addr >> TARGET_PAGE_BITS) as usize) & (self.size() - 1)
    }

    #[inline]
    pub fn entry(&self, mode: usize, addr: u64) -> &TlbEntry {
        &self.modes[mode].entries[self.index(addr)]
    }

    pub fn victim(&self, mode: usize, n: usize) -> &TlbEntry {
        &self.modes[mode].victim[n]
    }

    /// Bumped on every bulk flush of `mode`.
    pub fn generation(&self, mode: usize) -> u64 {
        self.modes[mode].generation.load(Ordering::Acquire)
    }

    /// Flush every mode.
    pub fn flush_all(&self) {
        let _g = self.lock.lock();
        for t in self.modes.iter() {
            t.flush();
        }
        trace!("tlb flush all modes");
    }

    /// Flush the modes selected by `mode_mask` (bit n = mode n).
    pub fn flush_by_mode(&self, mode_mask: u32) {
        let _g = self.lock.lock();
        for (i, t) in self.modes.iter().enumerate() {
            if mode_mask & (1 << i) != 0 {
                t.flush();
            }
        }
    }

    fn flush_page_locked(&self, mode: usize, page: u64) {
        let t = &self.modes[mode];
        let e = &t.entries[self.index(page)];
        if e.load().maps_page(page) {
            e.invalidate();
        }
        for v in t.victim.iter() {
            if v.load().maps_page(page) {
                v.invalidate();
            }
        }
    }

    /// Evict entries mapping the page of `addr`, in every mode.
    pub fn flush_page(&self, addr: u64) {
        let page = addr & TARGET_PAGE_MASK;
        let _g = self.lock.lock();
        for mode in 0..self.modes.len() {
            self.flush_page_locked(mode, page);
        }
    }

    /// Evict entries for every page intersecting `[start, end)`, in
    /// every mode. Falls back to a whole flush when the range has at
    /// least as many pages as the table has entries; returns true in
    /// that case.
    pub fn flush_range(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return false;
        }
        let first = start & TARGET_PAGE_MASK;
        let npages = ((end - 1) & TARGET_PAGE_MASK).wrapping_sub(first) / TARGET_PAGE_SIZE + 1;
        if npages >= self.size() as u64 {
            self.flush_all();
            return true;
        }
        let _g = self.lock.lock();
        for i in 0..npages {
            let page = first + i * TARGET_PAGE_SIZE;
            for mode in 0..self.modes.len() {
                self.flush_page_locked(mode, page);
            }
        }
        false
    }

    /// Force writes to `page` through the slow path (the page just
    /// gained translated code). Safe while the owner runs.
    pub fn reset_dirty_page(&self, page: u64) {
        let page = page & TARGET_PAGE_MASK;
        let _g = self.lock.lock();
        for t in self.modes.iter() {
            t.entries[self.index(page)].tighten(MmuAccessType::DataStore, page, TLB_NOTDIRTY);
            for v in t.victim.iter() {
                v.tighten(MmuAccessType::DataStore, page, TLB_NOTDIRTY);
            }
        }
    }
}

#[derive(Clone, Default)]
struct ModeSide {
    iotlb: Vec<Option<IoPort>>,
    viotlb: Vec<Option<IoPort>>,
    vindex: usize,
}

/// Refill and flush counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct TlbStats {
    pub fills: u64,
    pub victim_hits: u64,
    pub flushes: u64,
    pub range_flushes: u64,
}

/// Owner-side view of a vCPU's TLB.
pub struct CpuTlb {
    shared: Arc<TlbShared>,
    side: Vec<ModeSide>,
    pub stats: TlbStats,
}

impl CpuTlb {
    pub fn new(nb_modes: usize, bits: u32) -> Self {
        let shared = Arc::new(TlbShared::new(nb_modes, bits));
        let side = (0..nb_modes)
            .map(|_| ModeSide {
                iotlb: vec![None; shared.size()],
                viotlb: vec![None; CPU_VTLB_SIZE],
                vindex: 0,
            })
            .collect();
        Self {
            shared,
            side,
            stats: TlbStats::default(),
        }
    }

    pub fn shared(&self) -> &Arc<TlbShared> {
        &self.shared
    }

    pub fn nb_modes(&self) -> usize {
        self.shared.nb_modes()
    }

    #[inline]
    pub fn entry(&self, mode: usize, addr: u64) -> &TlbEntry {
        self.shared.entry(mode, addr)
    }

    pub fn generation(&self, mode: usize) -> u64 {
        self.shared.generation(mode)
    }

    /// Fast-path lookup: the host address for `addr`, or `None` when
    /// the access must take the slow path (miss, wrong permission,
    /// MMIO or a code page write).
    #[inline]
    pub fn lookup(&self, mode: usize, addr: u64, access: MmuAccessType) -> Option<HostPtr> {
        let e = self.entry(mode, addr);
        let tlb_addr = e.addr(access);
        if tlb_hit(tlb_addr, addr) && tlb_addr & TLB_FLAGS_MASK == 0 {
            HostPtr::new(addr.wrapping_add(e.addend()) as usize as *mut u8)
        } else {
            None
        }
    }

    /// Device behind the main entry for `addr`, when it is MMIO.
    pub fn io_port(&self, mode: usize, addr: u64) -> Option<IoPort> {
        self.side[mode].iotlb[self.shared.index(addr)].clone()
    }

    /// Look for `addr` in the victim table; on a hit, swap the victim
    /// into the main table.
    pub fn victim_tlb_hit(&mut self, mode: usize, addr: u64, access: MmuAccessType) -> bool {
        let page = addr & TARGET_PAGE_MASK;
        let idx = self.shared.index(addr);
        let _g = self.shared.lock.lock();
        let table = &self.shared.modes[mode];
        for vidx in 0..CPU_VTLB_SIZE {
            let v = &table.victim[vidx];
            if tlb_hit_page(v.addr(access), page) {
                let main = &table.entries[idx];
                let vdata = v.load();
                let mdata = main.load();
                main.store(&vdata);
                v.store(&mdata);
                let side = &mut self.side[mode];
                std::mem::swap(&mut side.iotlb[idx], &mut side.viotlb[vidx]);
                self.stats.victim_hits += 1;
                trace!("victim tlb hit mode={mode} addr={addr:#x}");
                return true;
            }
        }
        false
    }

    /// Install `data` for `page`, moving the previous occupant of the
    /// slot into the victim table.
    pub fn set_page(&mut self, mode: usize, page: u64, data: TlbEntryData, io: Option<IoPort>) {
        let idx = self.shared.index(page);
        let _g = self.shared.lock.lock();
        let table = &self.shared.modes[mode];
        let side = &mut self.side[mode];

        for (v, vio) in table.victim.iter().zip(side.viotlb.iter_mut()) {
            if v.load().maps_page(page) {
                v.invalidate();
                *vio = None;
            }
        }

        let main = &table.entries[idx];
        let old = main.load();
        if old.page().is_some_and(|p| p != page) {
            let vidx = side.vindex % CPU_VTLB_SIZE;
            side.vindex = side.vindex.wrapping_add(1);
            table.victim[vidx].store(&old);
            side.viotlb[vidx] = side.iotlb[idx].take();
        }
        main.store(&data);
        side.iotlb[idx] = io;
    }

    /// Resolve `addr` for `access` in `mode` and install a fresh entry.
    ///
    /// Returns the host delta. `IoMapped` still installs an entry, with
    /// `TLB_MMIO` set on every permitted access kind.
    pub fn refill(
        &mut self,
        mode: usize,
        addr: u64,
        access: MmuAccessType,
        mem: &MemoryMap,
    ) -> Result<u64, RefillError> {
        let page = addr & TARGET_PAGE_MASK;
        let _big = mem.big_lock();
        // Held until the entry is installed, so a concurrent code
        // write-protect either sees this entry or is seen by it.
        let pages = mem.pages();
        let flags = pages.get_flags(page);

        if !flags.contains(PageFlags::VALID) || flags.contains(PageFlags::RESERVED) {
            return Err(MmuFault::Unmapped { addr, access }.into());
        }
        if mode == MMU_USER_IDX && !flags.contains(PageFlags::USER) {
            return Err(MmuFault::PermissionDenied { addr, access }.into());
        }
        let allowed = match access {
            MmuAccessType::DataLoad => flags.contains(PageFlags::READ),
            MmuAccessType::DataStore => flags.intersects(PageFlags::WRITE | PageFlags::WRITE_ORG),
            MmuAccessType::InstFetch => flags.contains(PageFlags::EXEC),
        };
        if !allowed {
            return Err(MmuFault::PermissionDenied { addr, access }.into());
        }

        let (addend, mmio, io) = match mem.space().translate_guest(page, access) {
            Translation::Host(region) => ((region.host.addr() as u64).wrapping_sub(page), 0, None),
            Translation::Io(port) => (0, TLB_MMIO, Some(port)),
            Translation::Unmapped => return Err(MmuFault::Unmapped { addr, access }.into()),
        };

        let tag = |ok: bool| if ok { page | mmio } else { u64::MAX };
        let addr_write = if flags.contains(PageFlags::WRITE) {
            page | mmio
        } else if flags.contains(PageFlags::WRITE_ORG) {
            page | mmio | TLB_NOTDIRTY
        } else {
            u64::MAX
        };
        let data = TlbEntryData {
            addr_read: tag(flags.contains(PageFlags::READ)),
            addr_write,
            addr_code: tag(flags.contains(PageFlags::EXEC)),
            addend,
        };
        self.set_page(mode, page, data, io);
        drop(pages);
        self.stats.fills += 1;
        trace!("tlb fill mode={mode} page={page:#x} flags={flags:?} mmio={}", mmio != 0);

        if mmio != 0 {
            Err(RefillError::IoMapped(page))
        } else {
            Ok(addend)
        }
    }

    /// Flush every mode.
    pub fn flush(&mut self) {
        self.shared.flush_all();
        self.stats.flushes += 1;
    }

    /// Flush a single mode.
    pub fn flush_mode(&mut self, mode: usize) {
        self.shared.flush_by_mode(1 << mode);
        self.stats.flushes += 1;
    }

    pub fn flush_page(&mut self, addr: u64) {
        self.shared.flush_page(addr);
    }

    /// Evict entries covering `[start, end)`.
    pub fn invalidate_range(&mut self, start: u64, end: u64) {
        if self.shared.flush_range(start, end) {
            self.stats.flushes += 1;
        } else {
            self.stats.range_flushes += 1;
        }
    }

    /// Let writes to `page` use the fast path again (it no longer holds
    /// translated code).
    pub fn set_dirty(&mut self, page: u64) {
        let page = page & TARGET_PAGE_MASK;
        let _g = self.shared.lock.lock();
        let clear = |e: &TlbEntry| {
            let w = e.addr_write.load(Ordering::Acquire);
            if w & TLB_NOTDIRTY != 0 && tlb_hit_page(w, page) {
                e.addr_write.store(w & !TLB_NOTDIRTY, Ordering::Release);
            }
        };
        for t in self.shared.modes.iter() {
            clear(&t.entries[self.shared.index(page)]);
            t.victim.iter().for_each(clear);
        }
    }
}
