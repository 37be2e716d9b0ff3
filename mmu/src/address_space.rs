use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{MapError, MmuFault};
use crate::page::{TARGET_PAGE_MASK, TARGET_PAGE_SIZE};

/// Kind of guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MmuAccessType {
    DataLoad,
    DataStore,
    InstFetch,
}

/// Host pointer into guest RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPtr(NonNull<u8>);

// SAFETY: a HostPtr is only an address into RAM owned by an
// AddressSpace; synchronization of the bytes is the guest's business.
unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

impl HostPtr {
    pub fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(HostPtr)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

/// Directly accessible host memory backing a guest address.
#[derive(Debug, Clone, Copy)]
pub struct HostRegion {
    /// Host address corresponding to the translated guest address.
    pub host: HostPtr,
    /// Contiguous bytes available from `host`.
    pub len: usize,
}

/// Memory-mapped device window.
pub trait MmioDevice: Send + Sync {
    fn name(&self) -> &str {
        "mmio"
    }
    /// Read `size` bytes (1, 2, 4 or 8) at `offset` within the device.
    fn read(&self, offset: u64, size: u32) -> u64;
    /// Write `size` bytes at `offset` within the device.
    fn write(&self, offset: u64, size: u32, val: u64);
}

/// A guest address that resolves to a device.
#[derive(Clone)]
pub struct IoPort {
    pub device: Arc<dyn MmioDevice>,
    /// Device offset corresponding to the translated guest address.
    pub offset: u64,
}

impl fmt::Debug for IoPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoPort")
            .field("device", &self.device.name())
            .field("offset", &format_args!("{:#x}", self.offset))
            .finish()
    }
}

/// Outcome of `AddressSpace::translate_guest`.
#[derive(Debug, Clone)]
pub enum Translation {
    Host(HostRegion),
    Io(IoPort),
    Unmapped,
}

/// The guest memory view consumed by the soft-MMU.
///
/// Permissions are not checked here; they belong to the page flags
/// table. `read_guest`/`write_guest` are debug-style accessors that
/// bypass the TLB.
pub trait AddressSpace: Send + Sync {
    fn translate_guest(&self, addr: u64, access: MmuAccessType) -> Translation;

    fn read_guest(&self, addr: u64, buf: &mut [u8]) -> Result<(), MmuFault> {
        let mut done = 0usize;
        while done < buf.len() {
            let cur = addr.wrapping_add(done as u64);
            let in_page = (TARGET_PAGE_SIZE - (cur & !TARGET_PAGE_MASK)) as usize;
            let n = in_page.min(buf.len() - done);
            match self.translate_guest(cur, MmuAccessType::DataLoad) {
                Translation::Host(r) => {
                    let n = n.min(r.len);
                    // SAFETY: the region spans at least `n` bytes of live RAM.
                    unsafe { ptr::copy_nonoverlapping(r.host.as_ptr(), buf[done..].as_mut_ptr(), n) };
                    done += n;
                }
                Translation::Io(port) => {
                    for (i, b) in buf[done..done + n].iter_mut().enumerate() {
                        *b = port.device.read(port.offset + i as u64, 1) as u8;
                    }
                    done += n;
                }
                Translation::Unmapped => {
                    return Err(MmuFault::Unmapped {
                        addr: cur,
                        access: MmuAccessType::DataLoad,
                    })
                }
            }
        }
        Ok(())
    }

    fn write_guest(&self, addr: u64, data: &[u8]) -> Result<(), MmuFault> {
        let mut done = 0usize;
        while done < data.len() {
            let cur = addr.wrapping_add(done as u64);
            let in_page = (TARGET_PAGE_SIZE - (cur & !TARGET_PAGE_MASK)) as usize;
            let n = in_page.min(data.len() - done);
            match self.translate_guest(cur, MmuAccessType::DataStore) {
                Translation::Host(r) => {
                    let n = n.min(r.len);
                    // SAFETY: the region spans at least `n` bytes of live RAM.
                    unsafe { ptr::copy_nonoverlapping(data[done..].as_ptr(), r.host.as_ptr(), n) };
                    done += n;
                }
                Translation::Io(port) => {
                    for (i, &b) in data[done..done + n].iter().enumerate() {
                        port.device.write(port.offset + i as u64, 1, b as u64);
                    }
                    done += n;
                }
                Translation::Unmapped => {
                    return Err(MmuFault::Unmapped {
                        addr: cur,
                        access: MmuAccessType::DataStore,
                    })
                }
            }
        }
        Ok(())
    }
}

/// Anonymous mmap'd block of guest RAM.
pub struct GuestRam {
    base: *mut u8,
    size: usize,
}

// SAFETY: GuestRam owns its mmap'd memory exclusively; concurrent guest
// accesses go through raw pointers, as on real hardware.
unsafe impl Send for GuestRam {}
unsafe impl Sync for GuestRam {}

impl GuestRam {
    pub fn new(size: usize) -> io::Result<Self> {
        let size = ((size as u64 + TARGET_PAGE_SIZE - 1) & TARGET_PAGE_MASK) as usize;
        // SAFETY: anonymous private mapping, no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            base: ptr as *mut u8,
            size,
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Host pointer for RAM offset `off`.
    #[inline]
    pub fn ptr_at(&self, off: u64) -> *mut u8 {
        assert!((off as usize) < self.size, "RAM offset {off:#x} out of range");
        // SAFETY: bounds checked above.
        unsafe { self.base.add(off as usize) }
    }
}

impl Drop for GuestRam {
    fn drop(&mut self) {
        // SAFETY: base/size came from a successful mmap.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

#[derive(Clone)]
enum RegionKind {
    Ram { ram_offset: u64 },
    Io { device: Arc<dyn MmioDevice> },
}

#[derive(Clone)]
struct Region {
    end: u64,
    kind: RegionKind,
}

/// Reference [`AddressSpace`]: one RAM block plus device windows,
/// placed at page-aligned guest ranges.
pub struct GuestMemory {
    ram: GuestRam,
    regions: RwLock<BTreeMap<u64, Region>>,
}

impl GuestMemory {
    pub fn new(ram_size: usize) -> Result<Self, MapError> {
        Ok(Self {
            ram: GuestRam::new(ram_size)?,
            regions: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn ram(&self) -> &GuestRam {
        &self.ram
    }

    fn check_free(map: &BTreeMap<u64, Region>, start: u64, end: u64) -> Result<(), MapError> {
        if start >= end || start & !TARGET_PAGE_MASK != 0 || end & !TARGET_PAGE_MASK != 0 {
            return Err(MapError::BadRange { start, end });
        }
        let before = map.range(..end).next_back();
        if let Some((&s, r)) = before {
            if s < end && r.end > start {
                return Err(MapError::Overlap { start, end });
            }
        }
        Ok(())
    }

    /// Map `[start, start+len)` onto RAM starting at `ram_offset`.
    pub fn map_ram(&self, start: u64, len: u64, ram_offset: u64) -> Result<(), MapError> {
        let end = start.wrapping_add(len);
        if ram_offset.checked_add(len).map_or(true, |e| e > self.ram.size as u64) {
            return Err(MapError::RamBounds {
                offset: ram_offset,
                len,
                size: self.ram.size as u64,
            });
        }
        let mut map = self.regions.write();
        Self::check_free(&map, start, end)?;
        map.insert(
            start,
            Region {
                end,
                kind: RegionKind::Ram { ram_offset },
            },
        );
        Ok(())
    }

    /// Map a device window at `[start, start+len)`.
    pub fn map_io(&self, start: u64, len: u64, device: Arc<dyn MmioDevice>) -> Result<(), MapError> {
        let end = start.wrapping_add(len);
        let mut map = self.regions.write();
        Self::check_free(&map, start, end)?;
        map.insert(
            start,
            Region {
                end,
                kind: RegionKind::Io { device },
            },
        );
        Ok(())
    }

    /// Remove every region starting inside `[start, start+len)`.
    pub fn unmap(&self, start: u64, len: u64) {
        let end = start.wrapping_add(len);
        let mut map = self.regions.write();
        let keys: Vec<u64> = map.range(start..end).map(|(&k, _)| k).collect();
        for k in keys {
            map.remove(&k);
        }
    }
}

impl AddressSpace for GuestMemory {
    fn translate_guest(&self, addr: u64, _access: MmuAccessType) -> Translation {
        let map = self.regions.read();
        let Some((&start, region)) = map.range(..=addr).next_back() else {
            return Translation::Unmapped;
        };
        if addr >= region.end {
            return Translation::Unmapped;
        }
        let off = addr - start;
        match &region.kind {
            RegionKind::Ram { ram_offset } => {
                let ptr = self.ram.ptr_at(ram_offset + off);
                match HostPtr::new(ptr) {
                    Some(host) => Translation::Host(HostRegion {
                        host,
                        len: (region.end - addr) as usize,
                    }),
                    None => Translation::Unmapped,
                }
            }
            RegionKind::Io { device } => Translation::Io(IoPort {
                device: Arc::clone(device),
                offset: off,
            }),
        }
    }
}
