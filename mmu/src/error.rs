use thiserror::Error;

use crate::address_space::MmuAccessType;

/// A guest-visible memory fault.
///
/// These never abort the emulator: the dispatcher converts them into the
/// guest architecture's own trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MmuFault {
    #[error("unmapped guest address {addr:#x} ({access:?})")]
    Unmapped { addr: u64, access: MmuAccessType },
    #[error("permission denied for {access:?} at guest address {addr:#x}")]
    PermissionDenied { addr: u64, access: MmuAccessType },
    #[error("unaligned {access:?} at guest address {addr:#x}")]
    Unaligned { addr: u64, access: MmuAccessType },
}

impl MmuFault {
    pub fn addr(&self) -> u64 {
        match *self {
            MmuFault::Unmapped { addr, .. }
            | MmuFault::PermissionDenied { addr, .. }
            | MmuFault::Unaligned { addr, .. } => addr,
        }
    }

    pub fn access(&self) -> MmuAccessType {
        match *self {
            MmuFault::Unmapped { access, .. }
            | MmuFault::PermissionDenied { access, .. }
            | MmuFault::Unaligned { access, .. } => access,
        }
    }
}

/// Result of a failed TLB refill.
///
/// `IoMapped` is not a fault: the entry has been installed with the
/// MMIO bit and the access must go through device dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RefillError {
    #[error(transparent)]
    Fault(#[from] MmuFault),
    #[error("guest page {0:#x} is I/O mapped")]
    IoMapped(u64),
}

/// Errors from building the guest memory layout.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("range {start:#x}..{end:#x} is empty or not page aligned")]
    BadRange { start: u64, end: u64 },
    #[error("range {start:#x}..{end:#x} overlaps an existing mapping")]
    Overlap { start: u64, end: u64 },
    #[error("RAM offset {offset:#x}+{len:#x} exceeds RAM size {size:#x}")]
    RamBounds { offset: u64, len: u64, size: u64 },
    #[error("failed to allocate guest RAM: {0}")]
    Mmap(#[from] std::io::Error),
}

/// A page in a checked range lacks the requested permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("guest range check failed at {0:#x}")]
pub struct RangeError(pub u64);
