//! Slow-path guest memory access.
//!
//! Called when the inline TLB check fails: refills the TLB, dispatches
//! MMIO under the big lock, splits accesses that cross a page and
//! routes stores to code pages through an [`SmcHandler`].

use std::ptr;

use log::trace;
use smtcg_core::MemOp;

use crate::address_space::{HostPtr, IoPort, MmuAccessType};
use crate::error::{MmuFault, RefillError};
use crate::memory::MemoryMap;
use crate::page::{TARGET_PAGE_MASK, TARGET_PAGE_SIZE};
use crate::tlb::{tlb_hit, CpuTlb, TLB_MMIO, TLB_NOTDIRTY};

/// Reacts to a store that hits a page holding translated code.
pub trait SmcHandler: Send + Sync {
    /// Called before `len` bytes at `addr` are written. Returns true if
    /// translated code was invalidated.
    fn notdirty_write(&self, tlb: &mut CpuTlb, mem: &MemoryMap, addr: u64, len: usize) -> bool;
}

/// Handler for configurations without translated code: unprotects the
/// page and lets later writes take the fast path.
pub struct NoSmc;

impl SmcHandler for NoSmc {
    fn notdirty_write(&self, tlb: &mut CpuTlb, mem: &MemoryMap, addr: u64, _len: usize) -> bool {
        mem.pages_mut().unprotect(addr);
        tlb.set_dirty(addr);
        false
    }
}

enum Target {
    Ram { host: HostPtr, notdirty: bool },
    Io(IoPort),
}

#[inline]
fn crosses_page(addr: u64, size: u32) -> bool {
    (addr & !TARGET_PAGE_MASK) + size as u64 > TARGET_PAGE_SIZE
}

/// One vCPU's slow-path access context.
pub struct MemAccess<'a> {
    pub tlb: &'a mut CpuTlb,
    pub mem: &'a MemoryMap,
    pub smc: &'a dyn SmcHandler,
    /// Set when a store through this context invalidated translated code.
    pub code_modified: bool,
}

impl<'a> MemAccess<'a> {
    pub fn new(tlb: &'a mut CpuTlb, mem: &'a MemoryMap, smc: &'a dyn SmcHandler) -> Self {
        Self {
            tlb,
            mem,
            smc,
            code_modified: false,
        }
    }

    fn resolve(&mut self, mode: usize, addr: u64, access: MmuAccessType) -> Result<Target, MmuFault> {
        loop {
            let entry = self.tlb.entry(mode, addr);
            let tag = entry.addr(access);
            if tlb_hit(tag, addr) {
                if tag & TLB_MMIO != 0 {
                    let port = self
                        .tlb
                        .io_port(mode, addr)
                        .ok_or(MmuFault::Unmapped { addr, access })?;
                    return Ok(Target::Io(IoPort {
                        device: port.device,
                        offset: port.offset + (addr & !TARGET_PAGE_MASK),
                    }));
                }
                let host = HostPtr::new(addr.wrapping_add(entry.addend()) as usize as *mut u8)
                    .ok_or(MmuFault::Unmapped { addr, access })?;
                return Ok(Target::Ram {
                    host,
                    notdirty: tag & TLB_NOTDIRTY != 0,
                });
            }
            if self.tlb.victim_tlb_hit(mode, addr, access) {
                continue;
            }
            match self.tlb.refill(mode, addr, access, self.mem) {
                Ok(_) | Err(RefillError::IoMapped(_)) => {}
                Err(RefillError::Fault(f)) => return Err(f),
            }
        }
    }

    fn check_align(addr: u64, memop: MemOp, access: MmuAccessType) -> Result<(), MmuFault> {
        let a_bits = memop.a_bits();
        if a_bits != 0 && addr & ((1u64 << a_bits) - 1) != 0 {
            return Err(MmuFault::Unaligned { addr, access });
        }
        Ok(())
    }

    /// Raw little-endian read of `size` bytes that stay within one page.
    fn read_in_page(&mut self, mode: usize, addr: u64, size: u32, access: MmuAccessType) -> Result<u64, MmuFault> {
        match self.resolve(mode, addr, access)? {
            Target::Ram { host, .. } => {
                let mut buf = [0u8; 8];
                // SAFETY: the TLB maps the whole page to live host memory
                // and the access does not leave the page.
                unsafe { ptr::copy_nonoverlapping(host.as_ptr(), buf.as_mut_ptr(), size as usize) };
                Ok(u64::from_le_bytes(buf))
            }
            Target::Io(port) => {
                let _big = self.mem.big_lock();
                let val = port.device.read(port.offset, size);
                trace!("mmio read {} +{:#x} size={size} -> {val:#x}", port.device.name(), port.offset);
                Ok(val)
            }
        }
    }

    fn read(&mut self, mode: usize, addr: u64, size: u32, access: MmuAccessType) -> Result<u64, MmuFault> {
        if !crosses_page(addr, size) {
            return self.read_in_page(mode, addr, size, access);
        }
        let mut val = 0u64;
        for i in 0..size {
            let b = self.read_in_page(mode, addr.wrapping_add(i as u64), 1, access)?;
            val |= (b & 0xff) << (8 * i);
        }
        Ok(val)
    }

    /// Guest data load, extended per `memop`.
    pub fn load(&mut self, mode: usize, addr: u64, memop: MemOp) -> Result<u64, MmuFault> {
        Self::check_align(addr, memop, MmuAccessType::DataLoad)?;
        let size = memop.size_bytes();
        let mut raw = self.read(mode, addr, size, MmuAccessType::DataLoad)?;
        if memop.is_big_endian() {
            raw = raw.swap_bytes() >> (64 - 8 * size);
        }
        Ok(memop.extend(raw))
    }

    /// Instruction fetch of `memop.size_bytes()` bytes, zero-extended.
    pub fn fetch(&mut self, mode: usize, addr: u64, memop: MemOp) -> Result<u64, MmuFault> {
        Self::check_align(addr, memop, MmuAccessType::InstFetch)?;
        let size = memop.size_bytes();
        let mut raw = self.read(mode, addr, size, MmuAccessType::InstFetch)?;
        if memop.is_big_endian() {
            raw = raw.swap_bytes() >> (64 - 8 * size);
        }
        Ok(raw)
    }

    /// Guest data store of the low `memop.size_bytes()` bytes of `val`.
    pub fn store(&mut self, mode: usize, addr: u64, memop: MemOp, val: u64) -> Result<(), MmuFault> {
        let access = MmuAccessType::DataStore;
        Self::check_align(addr, memop, access)?;
        let size = memop.size_bytes();
        let val = if memop.is_big_endian() {
            val.swap_bytes() >> (64 - 8 * size)
        } else {
            val
        };

        if !crosses_page(addr, size) {
            let target = self.resolve(mode, addr, access)?;
            return self.write_target(target, addr, size, val);
        }

        // Both pages must be writable before any byte lands.
        let second = (addr & TARGET_PAGE_MASK).wrapping_add(TARGET_PAGE_SIZE);
        self.resolve(mode, addr, access)?;
        self.resolve(mode, second, access)?;
        for i in 0..size {
            let a = addr.wrapping_add(i as u64);
            let target = self.resolve(mode, a, access)?;
            self.write_target(target, a, 1, (val >> (8 * i)) & 0xff)?;
        }
        Ok(())
    }

    fn write_target(&mut self, target: Target, addr: u64, size: u32, val: u64) -> Result<(), MmuFault> {
        match target {
            Target::Ram { host, notdirty } => {
                if notdirty && self.smc.notdirty_write(self.tlb, self.mem, addr, size as usize) {
                    self.code_modified = true;
                }
                let bytes = val.to_le_bytes();
                // SAFETY: as in `read_in_page`.
                unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), host.as_ptr(), size as usize) };
                Ok(())
            }
            Target::Io(port) => {
                let _big = self.mem.big_lock();
                trace!("mmio write {} +{:#x} size={size} <- {val:#x}", port.device.name(), port.offset);
                port.device.write(port.offset, size, val);
                Ok(())
            }
        }
    }
}
