//! Page flags, soft TLB and slow-path access tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use proptest::prelude::*;
use smtcg_core::MemOp;
use smtcg_mmu::{
    AddressSpace, CpuTlb, GuestMemory, MemAccess, MemoryMap, MmioDevice, MmuAccessType, MmuFault, NoSmc, PageFlags,
    RefillError, CPU_VTLB_SIZE, MMU_KERNEL_IDX, MMU_USER_IDX, TARGET_PAGE_SIZE,
};

const RAM: u64 = 0x40_0000;
const P: u64 = 0x5000;

fn rw_user() -> PageFlags {
    PageFlags::VALID | PageFlags::RW | PageFlags::USER
}

fn memory() -> (Arc<GuestMemory>, MemoryMap) {
    let space = Arc::new(GuestMemory::new(RAM as usize).unwrap());
    space.map_ram(0, RAM, 0).unwrap();
    let mem = MemoryMap::new(space.clone());
    (space, mem)
}

fn host_of(space: &GuestMemory, addr: u64) -> usize {
    space.ram().ptr_at(addr) as usize
}

// ── PageFlags ───────────────────────────────────────────────

#[test]
fn test_set_flags_implies_write_org() {
    let (_, mem) = memory();
    let mut pages = mem.pages_mut();
    pages.set_flags(0x1000, 0x3000, rw_user()).unwrap();
    assert!(pages.get_flags(0x1800).contains(PageFlags::WRITE_ORG));
    assert!(pages.get_flags(0x3000).is_empty());
}

#[test]
fn test_set_flags_reports_newly_writable() {
    let (_, mem) = memory();
    let mut pages = mem.pages_mut();
    pages.set_flags(0, 0x4000, PageFlags::VALID | PageFlags::READ).unwrap();
    pages.set_flags(0x2000, 0x3000, rw_user()).unwrap();
    let grown = pages.set_flags(0, 0x4000, rw_user()).unwrap();
    assert_eq!(grown, vec![0..0x2000, 0x3000..0x4000]);
}

#[test]
fn test_set_flags_unaligned_range() {
    let (_, mem) = memory();
    let mut pages = mem.pages_mut();
    pages.set_flags(0x1010, 0x2001, rw_user()).unwrap();
    assert!(pages.get_flags(0x1000).contains(PageFlags::VALID));
    assert!(pages.get_flags(0x2fff).contains(PageFlags::VALID));
    assert!(pages.get_flags(0x3000).is_empty());
}

#[test]
fn test_reset_clears_range() {
    let (_, mem) = memory();
    let mut pages = mem.pages_mut();
    pages.set_flags(0, 0x10000, rw_user()).unwrap();
    pages.reset(0x4000, 0x6000).unwrap();
    assert!(pages.get_flags(0x4000).is_empty());
    assert!(pages.get_flags(0x5fff).is_empty());
    assert!(pages.get_flags(0x6000).contains(PageFlags::READ));
    assert_eq!(pages.iter_range(0, 0x10000).len(), 2);
}

#[test]
fn test_check_range() {
    let (_, mem) = memory();
    let mut pages = mem.pages_mut();
    pages.set_flags(0, 0x2000, rw_user()).unwrap();
    pages.set_flags(0x2000, 0x3000, PageFlags::VALID | PageFlags::READ).unwrap();
    assert_eq!(pages.check_range(0x100, 0x1000, PageFlags::READ), Ok(vec![]));
    assert!(pages.check_range(0x1800, 0x1000, PageFlags::WRITE).is_err());
    assert!(pages.check_range(0x2800, 0x1000, PageFlags::READ).is_err());
    assert!(pages.check_range(u64::MAX - 4, 16, PageFlags::READ).is_err());
    assert_eq!(pages.check_range(0x2800, 0, PageFlags::WRITE), Ok(vec![]));

    // Code-protected pages still pass a write check, and are reported.
    assert!(pages.protect_code(0x1000));
    assert_eq!(pages.check_range(0x0, 0x2000, PageFlags::WRITE), Ok(vec![0x1000]));
}

#[test]
fn test_protect_and_unprotect_code() {
    let (_, mem) = memory();
    let mut pages = mem.pages_mut();
    pages.set_flags(0, 0x4000, rw_user() | PageFlags::EXEC).unwrap();
    assert!(pages.protect_code(0x1000));
    assert!(!pages.protect_code(0x1000));
    let f = pages.get_flags(0x1000);
    assert!(!f.contains(PageFlags::WRITE) && f.contains(PageFlags::WRITE_ORG));
    assert!(pages.get_flags(0x2000).contains(PageFlags::WRITE));

    assert!(pages.unprotect(0x1000));
    assert!(!pages.unprotect(0x1000));
    pages.protect_code(0x1000);
    pages.protect_code(0x3000);
    pages.unprotect_all();
    assert!(pages.get_flags(0x3000).contains(PageFlags::WRITE));
    assert_eq!(pages.runs().count(), 1);
}

// ── TLB ─────────────────────────────────────────────────────

#[test]
fn test_refill_then_lookup() {
    let (space, mem) = memory();
    mem.pages_mut().set_flags(P, P + TARGET_PAGE_SIZE, rw_user() | PageFlags::EXEC).unwrap();
    let mut tlb = CpuTlb::new(2, 8);
    assert!(tlb.lookup(MMU_USER_IDX, P + 8, MmuAccessType::DataLoad).is_none());
    tlb.refill(MMU_USER_IDX, P + 8, MmuAccessType::DataLoad, &mem).unwrap();
    let host = tlb.lookup(MMU_USER_IDX, P + 8, MmuAccessType::DataLoad).unwrap();
    assert_eq!(host.addr(), host_of(&space, P + 8));
    // The other mode has its own table.
    assert!(tlb.lookup(MMU_KERNEL_IDX, P + 8, MmuAccessType::DataLoad).is_none());
    assert_eq!(tlb.stats.fills, 1);
}

#[test]
fn test_invalidate_range_evicts() {
    let (_, mem) = memory();
    mem.pages_mut().set_flags(0, RAM, rw_user() | PageFlags::EXEC).unwrap();
    let mut tlb = CpuTlb::new(2, 8);
    tlb.refill(MMU_USER_IDX, P, MmuAccessType::DataLoad, &mem).unwrap();
    tlb.refill(MMU_USER_IDX, P + TARGET_PAGE_SIZE, MmuAccessType::DataLoad, &mem).unwrap();
    tlb.invalidate_range(P, P + 1);
    assert!(tlb.lookup(MMU_USER_IDX, P, MmuAccessType::DataLoad).is_none());
    assert!(tlb.lookup(MMU_USER_IDX, P + TARGET_PAGE_SIZE, MmuAccessType::DataLoad).is_some());
}

#[test]
fn test_read_only_page_refuses_write_refill() {
    let (_, mem) = memory();
    mem.pages_mut()
        .set_flags(P, P + TARGET_PAGE_SIZE, PageFlags::VALID | PageFlags::READ | PageFlags::USER).unwrap();
    let mut tlb = CpuTlb::new(2, 8);
    assert_eq!(
        tlb.refill(MMU_USER_IDX, P, MmuAccessType::DataStore, &mem),
        Err(RefillError::Fault(MmuFault::PermissionDenied {
            addr: P,
            access: MmuAccessType::DataStore
        }))
    );
    tlb.refill(MMU_USER_IDX, P, MmuAccessType::DataLoad, &mem).unwrap();
    assert!(tlb.lookup(MMU_USER_IDX, P, MmuAccessType::DataStore).is_none());
}

#[test]
fn test_user_mode_needs_user_bit() {
    let (_, mem) = memory();
    mem.pages_mut().set_flags(P, P + TARGET_PAGE_SIZE, PageFlags::VALID | PageFlags::RW).unwrap();
    let mut tlb = CpuTlb::new(2, 8);
    assert!(matches!(
        tlb.refill(MMU_USER_IDX, P, MmuAccessType::DataLoad, &mem),
        Err(RefillError::Fault(MmuFault::PermissionDenied { .. }))
    ));
    assert!(tlb.refill(MMU_KERNEL_IDX, P, MmuAccessType::DataLoad, &mem).is_ok());
}

#[test]
fn test_unmapped_refill() {
    let (_, mem) = memory();
    let mut tlb = CpuTlb::new(2, 8);
    assert_eq!(
        tlb.refill(MMU_USER_IDX, 0x10, MmuAccessType::InstFetch, &mem),
        Err(RefillError::Fault(MmuFault::Unmapped {
            addr: 0x10,
            access: MmuAccessType::InstFetch
        }))
    );
}

#[test]
fn test_victim_tlb_hit() {
    let (_, mem) = memory();
    mem.pages_mut().set_flags(0, RAM, rw_user()).unwrap();
    let mut tlb = CpuTlb::new(1, 4);
    let stride = 16 * TARGET_PAGE_SIZE; // same slot in a 16-entry table
    tlb.refill(0, 0, MmuAccessType::DataLoad, &mem).unwrap();
    tlb.refill(0, stride, MmuAccessType::DataLoad, &mem).unwrap();
    assert!(tlb.lookup(0, 0, MmuAccessType::DataLoad).is_none());
    assert!(tlb.victim_tlb_hit(0, 0, MmuAccessType::DataLoad));
    assert!(tlb.lookup(0, 0, MmuAccessType::DataLoad).is_some());
    assert!(tlb.lookup(0, stride, MmuAccessType::DataLoad).is_none());
    assert!(tlb.victim_tlb_hit(0, stride, MmuAccessType::DataLoad));
    assert_eq!(tlb.stats.victim_hits, 2);
}

#[test]
fn test_victim_table_is_bounded() {
    let (_, mem) = memory();
    mem.pages_mut().set_flags(0, RAM, rw_user()).unwrap();
    let mut tlb = CpuTlb::new(1, 4);
    let stride = 16 * TARGET_PAGE_SIZE;
    for i in 0..(CPU_VTLB_SIZE as u64 + 2) {
        tlb.refill(0, i * stride, MmuAccessType::DataLoad, &mem).unwrap();
    }
    // The oldest entry fell out of the victim table.
    assert!(!tlb.victim_tlb_hit(0, 0, MmuAccessType::DataLoad));
    assert!(tlb.victim_tlb_hit(0, 2 * stride, MmuAccessType::DataLoad));
}

#[test]
fn test_flush_bumps_generation() {
    let (_, mem) = memory();
    mem.pages_mut().set_flags(0, RAM, rw_user()).unwrap();
    let mut tlb = CpuTlb::new(2, 8);
    let g0 = tlb.generation(0);
    tlb.refill(0, P, MmuAccessType::DataLoad, &mem).unwrap();
    tlb.flush_mode(0);
    assert!(tlb.generation(0) > g0);
    assert!(tlb.lookup(0, P, MmuAccessType::DataLoad).is_none());
    tlb.refill(1, P, MmuAccessType::DataLoad, &mem).unwrap();
    tlb.flush();
    assert!(tlb.lookup(1, P, MmuAccessType::DataLoad).is_none());
}

#[test]
fn test_large_range_falls_back_to_flush() {
    let (_, mem) = memory();
    mem.pages_mut().set_flags(0, RAM, rw_user()).unwrap();
    let mut tlb = CpuTlb::new(1, 4);
    tlb.refill(0, 0x3f_f000, MmuAccessType::DataLoad, &mem).unwrap();
    tlb.invalidate_range(0, 32 * TARGET_PAGE_SIZE);
    assert_eq!(tlb.stats.flushes, 1);
    assert!(tlb.lookup(0, 0x3f_f000, MmuAccessType::DataLoad).is_none());
}

#[test]
fn test_code_page_write_goes_slow() {
    let (_, mem) = memory();
    mem.pages_mut().set_flags(0, RAM, rw_user() | PageFlags::EXEC).unwrap();
    let mut tlb = CpuTlb::new(1, 8);
    tlb.refill(0, P, MmuAccessType::DataStore, &mem).unwrap();
    assert!(tlb.lookup(0, P, MmuAccessType::DataStore).is_some());

    mem.pages_mut().protect_code(P);
    tlb.shared().reset_dirty_page(P);
    assert!(tlb.lookup(0, P, MmuAccessType::DataStore).is_none());
    // Reads keep the fast path.
    tlb.refill(0, P, MmuAccessType::DataLoad, &mem).unwrap();
    assert!(tlb.lookup(0, P, MmuAccessType::DataLoad).is_some());

    // A refill on a protected page installs a not-dirty write entry.
    tlb.refill(0, P, MmuAccessType::DataStore, &mem).unwrap();
    assert!(tlb.lookup(0, P, MmuAccessType::DataStore).is_none());
    mem.pages_mut().unprotect(P);
    tlb.set_dirty(P);
    assert!(tlb.lookup(0, P, MmuAccessType::DataStore).is_some());
}

// ── Slow path ───────────────────────────────────────────────

#[test]
fn test_load_store_through_slow_path() {
    let (space, mem) = memory();
    mem.pages_mut().set_flags(0, RAM, rw_user()).unwrap();
    let mut tlb = CpuTlb::new(2, 8);
    let mut acc = MemAccess::new(&mut tlb, &mem, &NoSmc);
    acc.store(0, 0x100, MemOp::uq(), 0x1122_3344_5566_7788).unwrap();
    assert_eq!(acc.load(0, 0x100, MemOp::ul()).unwrap(), 0x5566_7788);
    assert_eq!(acc.load(0, 0x104, MemOp::sl()).unwrap(), 0x1122_3344);
    acc.store(0, 0x108, MemOp::ub(), 0xff).unwrap();
    assert_eq!(acc.load(0, 0x108, MemOp::sb()).unwrap(), u64::MAX);
    let mut b = [0u8; 8];
    space.read_guest(0x100, &mut b).unwrap();
    assert_eq!(u64::from_le_bytes(b), 0x1122_3344_5566_7788);
}

#[test]
fn test_cross_page_access() {
    let (_, mem) = memory();
    mem.pages_mut().set_flags(0, 0x2000, rw_user()).unwrap();
    let mut tlb = CpuTlb::new(2, 8);
    let mut acc = MemAccess::new(&mut tlb, &mem, &NoSmc);
    acc.store(0, 0xffc, MemOp::uq(), 0x0102_0304_0506_0708).unwrap();
    assert_eq!(acc.load(0, 0xffc, MemOp::uq()).unwrap(), 0x0102_0304_0506_0708);

    // The second page faults: nothing of the store lands.
    assert_eq!(
        acc.store(0, 0x1ffc, MemOp::uq(), u64::MAX),
        Err(MmuFault::Unmapped {
            addr: 0x2000,
            access: MmuAccessType::DataStore
        })
    );
    assert_eq!(acc.load(0, 0x1ffc, MemOp::ul()).unwrap(), 0);
}

#[test]
fn test_unaligned_access_faults_when_required() {
    let (_, mem) = memory();
    mem.pages_mut().set_flags(0, RAM, rw_user()).unwrap();
    let mut tlb = CpuTlb::new(2, 8);
    let mut acc = MemAccess::new(&mut tlb, &mem, &NoSmc);
    assert_eq!(
        acc.load(0, 0x102, MemOp::ul().aligned()),
        Err(MmuFault::Unaligned {
            addr: 0x102,
            access: MmuAccessType::DataLoad
        })
    );
    assert!(acc.load(0, 0x102, MemOp::ul()).is_ok());
}

struct Counter {
    last: AtomicU64,
}

impl MmioDevice for Counter {
    fn name(&self) -> &str {
        "counter"
    }
    fn read(&self, offset: u64, _size: u32) -> u64 {
        offset + 0x100
    }
    fn write(&self, _offset: u64, _size: u32, val: u64) {
        self.last.store(val, Ordering::SeqCst);
    }
}

#[test]
fn test_mmio_dispatch() {
    let space = Arc::new(GuestMemory::new(0x10000).unwrap());
    space.map_ram(0, 0x10000, 0).unwrap();
    let dev = Arc::new(Counter { last: AtomicU64::new(0) });
    space.map_io(0x10_0000, 0x1000, dev.clone()).unwrap();
    let mem = MemoryMap::new(space);
    mem.pages_mut().set_flags(0x10_0000, 0x10_1000, rw_user()).unwrap();

    let mut tlb = CpuTlb::new(2, 8);
    assert_eq!(
        tlb.refill(0, 0x10_0010, MmuAccessType::DataLoad, &mem),
        Err(RefillError::IoMapped(0x10_0000))
    );
    assert!(tlb.lookup(0, 0x10_0010, MmuAccessType::DataLoad).is_none());
    let mut acc = MemAccess::new(&mut tlb, &mem, &NoSmc);
    assert_eq!(acc.load(0, 0x10_0010, MemOp::ul()).unwrap(), 0x110);
    acc.store(0, 0x10_0020, MemOp::uw(), 0xbeef).unwrap();
    assert_eq!(dev.last.load(Ordering::SeqCst), 0xbeef);
}

#[test]
fn test_no_smc_unprotects_on_write() {
    let (_, mem) = memory();
    mem.pages_mut().set_flags(0, RAM, rw_user() | PageFlags::EXEC).unwrap();
    mem.pages_mut().protect_code(P);
    let mut tlb = CpuTlb::new(1, 8);
    let mut acc = MemAccess::new(&mut tlb, &mem, &NoSmc);
    acc.store(0, P, MemOp::ul(), 7).unwrap();
    assert!(!acc.code_modified);
    assert!(mem.page_flags(P).contains(PageFlags::WRITE));
    assert!(tlb.lookup(0, P, MmuAccessType::DataStore).is_some());
}

// ── TLB correctness property ────────────────────────────────

#[derive(Debug, Clone)]
enum TlbOp {
    Refill(u64, MmuAccessType),
    Flush,
    FlushMode,
    Invalidate(u64, u64),
    Protect(u64, u8),
}

fn access_strategy() -> impl Strategy<Value = MmuAccessType> {
    prop_oneof![
        Just(MmuAccessType::DataLoad),
        Just(MmuAccessType::DataStore),
        Just(MmuAccessType::InstFetch),
    ]
}

const NPAGES: u64 = 48;

fn op_strategy() -> impl Strategy<Value = TlbOp> {
    prop_oneof![
        6 => (0..NPAGES, access_strategy()).prop_map(|(p, a)| TlbOp::Refill(p, a)),
        1 => Just(TlbOp::Flush),
        1 => Just(TlbOp::FlushMode),
        2 => (0..NPAGES, 1..4u64).prop_map(|(p, n)| TlbOp::Invalidate(p, n)),
        3 => (0..NPAGES, 0..16u8).prop_map(|(p, f)| TlbOp::Protect(p, f)),
    ]
}

fn flags_from_bits(bits: u8) -> PageFlags {
    let mut f = PageFlags::empty();
    if bits & 1 != 0 {
        f |= PageFlags::VALID | PageFlags::USER;
    }
    if bits & 2 != 0 {
        f |= PageFlags::READ;
    }
    if bits & 4 != 0 {
        f |= PageFlags::WRITE;
    }
    if bits & 8 != 0 {
        f |= PageFlags::EXEC;
    }
    f
}

fn permits(flags: PageFlags, access: MmuAccessType) -> bool {
    flags.contains(PageFlags::VALID | PageFlags::USER)
        && match access {
            MmuAccessType::DataLoad => flags.contains(PageFlags::READ),
            MmuAccessType::DataStore => flags.contains(PageFlags::WRITE),
            MmuAccessType::InstFetch => flags.contains(PageFlags::EXEC),
        }
}

proptest! {
    /// A fast-path hit always agrees with the current page flags and
    /// with the address space, whatever refills, flushes and
    /// permission changes came before.
    #[test]
    fn test_tlb_never_returns_stale_mapping(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let (space, mem) = memory();
        mem.pages_mut().set_flags(0, NPAGES * TARGET_PAGE_SIZE, rw_user() | PageFlags::EXEC).unwrap();
        // 16 entries per mode, so the 48 pages collide.
        let mut tlb = CpuTlb::new(1, 4);

        for op in ops {
            match op {
                TlbOp::Refill(p, a) => {
                    let addr = p * TARGET_PAGE_SIZE + 8;
                    if !tlb.victim_tlb_hit(0, addr, a) {
                        let _ = tlb.refill(0, addr, a, &mem);
                    }
                }
                TlbOp::Flush => tlb.flush(),
                TlbOp::FlushMode => tlb.flush_mode(0),
                TlbOp::Invalidate(p, n) => {
                    let start = p * TARGET_PAGE_SIZE;
                    tlb.invalidate_range(start, start + n * TARGET_PAGE_SIZE);
                }
                TlbOp::Protect(p, bits) => {
                    let start = p * TARGET_PAGE_SIZE;
                    let flags = flags_from_bits(bits);
                    {
                        let mut pages = mem.pages_mut();
                        if flags.is_empty() {
                            pages.reset(start, start + TARGET_PAGE_SIZE).unwrap();
                        } else {
                            pages.set_flags(start, start + TARGET_PAGE_SIZE, flags).unwrap();
                        }
                    }
                    tlb.invalidate_range(start, start + TARGET_PAGE_SIZE);
                }
            }

            for p in 0..NPAGES {
                let addr = p * TARGET_PAGE_SIZE + 8;
                let flags = mem.page_flags(addr);
                for a in [MmuAccessType::DataLoad, MmuAccessType::DataStore, MmuAccessType::InstFetch] {
                    if let Some(host) = tlb.lookup(0, addr, a) {
                        prop_assert!(permits(flags, a), "page {p} {a:?} hit with flags {flags:?}");
                        prop_assert_eq!(host.addr(), host_of(&space, addr));
                    }
                }
            }
        }
    }
}
