//! Soft-MMU: page flags, the per-vCPU TLB and the memory slow path.

pub mod access;
pub mod address_space;
pub mod error;
pub mod memory;
pub mod page;
pub mod tlb;

pub use access::{MemAccess, NoSmc, SmcHandler};
pub use address_space::{
    AddressSpace, GuestMemory, GuestRam, HostPtr, HostRegion, IoPort, MmioDevice, MmuAccessType,
    Translation,
};
pub use error::{MapError, MmuFault, RangeError, RefillError};
pub use memory::MemoryMap;
pub use page::{
    page_align_down, page_align_up, PageFlags, PageFlagsTable, TARGET_PAGE_BITS, TARGET_PAGE_MASK,
    TARGET_PAGE_SIZE,
};
pub use tlb::{
    tlb_hit, tlb_hit_page, CpuTlb, TlbEntry, TlbEntryData, TlbShared, TlbStats, CPU_VTLB_SIZE,
    MMU_KERNEL_IDX, MMU_USER_IDX, TLB_FLAGS_MASK, TLB_INVALID_MASK, TLB_MMIO, TLB_NOTDIRTY,
};
