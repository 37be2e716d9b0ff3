use std::io;
use std::ptr;
use std::sync::atomic::AtomicU64;

use parking_lot::{Mutex, MutexGuard};

use crate::CodeGenError;

/// Arena for generated host code, backed by mmap'd memory.
///
/// Code is appended by one [`CodeWriter`] at a time; everything below
/// the committed offset is immutable apart from the 64-bit link words
/// of `goto_tb` sites, which are patched atomically. The arena is only
/// rewound by [`CodeBuffer::reset`], which requires that no vCPU is
/// executing from it.
pub struct CodeBuffer {
    ptr: *mut u8,
    size: usize,
    offset: Mutex<usize>,
}

// SAFETY: the arena is written only below a writer's exclusive cursor
// (guarded by `offset`) or through atomic link words; committed code is
// read-only.
unsafe impl Send for CodeBuffer {}
unsafe impl Sync for CodeBuffer {}

impl CodeBuffer {
    /// Allocate a new arena of the given size (rounded up to page size).
    pub fn new(size: usize) -> io::Result<Self> {
        let page_size = page_size();
        let size = (size.max(1) + page_size - 1) & !(page_size - 1);

        // SAFETY: mmap with MAP_ANONYMOUS | MAP_PRIVATE, no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            offset: Mutex::new(0),
        })
    }

    /// Total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Committed bytes.
    pub fn used(&self) -> usize {
        *self.offset.lock()
    }

    pub fn remaining(&self) -> usize {
        self.size - self.used()
    }

    /// Start appending code at the current offset. Blocks while another
    /// writer is active.
    pub fn writer(&self) -> CodeWriter<'_> {
        let guard = self.offset.lock();
        let start = *guard;
        CodeWriter {
            buf: self,
            guard,
            start,
            pos: start,
            overflow: false,
        }
    }

    /// Give back `[start, end)` if it is still the most recent
    /// allocation. Returns whether the space was reclaimed.
    pub fn try_rollback(&self, start: usize, end: usize) -> bool {
        let mut off = self.offset.lock();
        if *off == end {
            *off = start;
            true
        } else {
            false
        }
    }

    /// Discard all generated code.
    ///
    /// # Safety
    /// No thread may be executing from, or hold offsets into, the arena.
    pub unsafe fn reset(&self) {
        *self.offset.lock() = 0;
    }

    #[inline]
    pub fn read_u8(&self, offset: usize) -> u8 {
        assert!(offset < self.size);
        // SAFETY: in bounds; committed code is not written concurrently.
        unsafe { self.ptr.add(offset).read() }
    }

    #[inline]
    pub fn read_u16(&self, offset: usize) -> u16 {
        assert!(offset + 2 <= self.size);
        // SAFETY: as in `read_u8`.
        unsafe { (self.ptr.add(offset) as *const u16).read_unaligned() }
    }

    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size);
        // SAFETY: as in `read_u8`.
        unsafe { (self.ptr.add(offset) as *const u32).read_unaligned() }
    }

    #[inline]
    pub fn read_u64(&self, offset: usize) -> u64 {
        assert!(offset + 8 <= self.size);
        // SAFETY: as in `read_u8`.
        unsafe { (self.ptr.add(offset) as *const u64).read_unaligned() }
    }

    /// The patchable link word at `offset` (8-byte aligned).
    #[inline]
    pub fn link(&self, offset: usize) -> &AtomicU64 {
        assert!(offset % 8 == 0 && offset + 8 <= self.size, "bad link offset {offset:#x}");
        // SAFETY: aligned, in bounds, and only ever accessed atomically
        // once committed; the mapping lives as long as `self`.
        unsafe { AtomicU64::from_ptr(self.ptr.add(offset) as *mut u64) }
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: ptr/size came from a successful mmap.
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

/// Exclusive appender over the free tail of a [`CodeBuffer`].
///
/// Writes past the end of the arena set an overflow flag instead of
/// panicking; [`CodeWriter::commit`] then reports `BufferFull`.
pub struct CodeWriter<'a> {
    buf: &'a CodeBuffer,
    guard: MutexGuard<'a, usize>,
    start: usize,
    pos: usize,
    overflow: bool,
}

impl CodeWriter<'_> {
    /// Offset where this writer started.
    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    /// Current write offset.
    #[inline]
    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn overflowed(&self) -> bool {
        self.overflow
    }

    fn reserve(&mut self, n: usize) -> Option<*mut u8> {
        if self.overflow || self.pos + n > self.buf.size {
            self.overflow = true;
            return None;
        }
        // SAFETY: in bounds, and beyond the committed offset.
        let p = unsafe { self.buf.ptr.add(self.pos) };
        self.pos += n;
        Some(p)
    }

    #[inline]
    pub fn emit_u8(&mut self, val: u8) {
        if let Some(p) = self.reserve(1) {
            // SAFETY: reserved above.
            unsafe { p.write(val) };
        }
    }

    #[inline]
    pub fn emit_u16(&mut self, val: u16) {
        if let Some(p) = self.reserve(2) {
            // SAFETY: reserved above.
            unsafe { (p as *mut u16).write_unaligned(val) };
        }
    }

    #[inline]
    pub fn emit_u32(&mut self, val: u32) {
        if let Some(p) = self.reserve(4) {
            // SAFETY: reserved above.
            unsafe { (p as *mut u32).write_unaligned(val) };
        }
    }

    #[inline]
    pub fn emit_u64(&mut self, val: u64) {
        if let Some(p) = self.reserve(8) {
            // SAFETY: reserved above.
            unsafe { (p as *mut u64).write_unaligned(val) };
        }
    }

    /// Pad with zero bytes up to a multiple of `align`.
    pub fn align(&mut self, align: usize) {
        while self.pos % align != 0 && !self.overflow {
            self.emit_u8(0);
        }
    }

    /// Patch a u32 previously emitted by this writer.
    pub fn patch_u32(&mut self, offset: usize, val: u32) {
        if self.overflow {
            return;
        }
        assert!(offset >= self.start && offset + 4 <= self.pos);
        // SAFETY: inside this writer's uncommitted range.
        unsafe { (self.buf.ptr.add(offset) as *mut u32).write_unaligned(val) };
    }

    /// Publish the written bytes. Returns `(start, end)`.
    pub fn commit(mut self) -> Result<(usize, usize), CodeGenError> {
        if self.overflow {
            return Err(CodeGenError::BufferFull {
                capacity: self.buf.size,
            });
        }
        *self.guard = self.pos;
        Ok((self.start, self.pos))
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
