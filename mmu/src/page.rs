use std::collections::BTreeMap;
use std::ops::Range;

use bitflags::bitflags;

use crate::error::RangeError;

pub const TARGET_PAGE_BITS: u32 = 12;
pub const TARGET_PAGE_SIZE: u64 = 1 << TARGET_PAGE_BITS;
pub const TARGET_PAGE_MASK: u64 = !(TARGET_PAGE_SIZE - 1);

/// Round `addr` down to a page boundary.
#[inline]
pub const fn page_align_down(addr: u64) -> u64 {
    addr & TARGET_PAGE_MASK
}

/// Round `addr` up to a page boundary; `None` past the top of the
/// address space.
#[inline]
pub const fn page_align_up(addr: u64) -> Option<u64> {
    match addr.checked_add(TARGET_PAGE_SIZE - 1) {
        Some(a) => Some(a & TARGET_PAGE_MASK),
        None => None,
    }
}

bitflags! {
    /// Per-page protection and bookkeeping bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageFlags: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const EXEC = 0x04;
        const VALID = 0x08;
        /// Accessible from the unprivileged MMU mode.
        const USER = 0x10;
        /// The page was mapped writable. `WRITE` may be temporarily
        /// cleared while translated code from the page exists.
        const WRITE_ORG = 0x20;
        /// Reserved by the host; never accessible to the guest.
        const RESERVED = 0x40;

        const RW = Self::READ.bits() | Self::WRITE.bits();
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Run {
    end: u64,
    flags: PageFlags,
}

/// Interval map from guest page ranges to [`PageFlags`].
///
/// Runs are keyed by their start address, never overlap, and adjacent
/// runs with identical flags are merged.
#[derive(Debug, Default)]
pub struct PageFlagsTable {
    runs: BTreeMap<u64, Run>,
}

impl PageFlagsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split the run containing `addr` so that a run starts at `addr`.
    fn split_at(&mut self, addr: u64) {
        let Some((&start, &run)) = self.runs.range(..addr).next_back() else {
            return;
        };
        if run.end > addr {
            self.runs.insert(start, Run { end: addr, flags: run.flags });
            self.runs.insert(addr, run);
        }
    }

    fn remove_range(&mut self, start: u64, end: u64) {
        self.split_at(start);
        self.split_at(end);
        let keys: Vec<u64> = self.runs.range(start..end).map(|(&k, _)| k).collect();
        for k in keys {
            self.runs.remove(&k);
        }
    }

    /// Merge the run starting at `addr` with its neighbours when their
    /// flags agree.
    fn coalesce(&mut self, addr: u64) {
        let Some(&run) = self.runs.get(&addr) else {
            return;
        };
        let mut start = addr;
        let mut end = run.end;
        if let Some((&pstart, &prev)) = self.runs.range(..addr).next_back() {
            if prev.end == addr && prev.flags == run.flags {
                self.runs.remove(&addr);
                start = pstart;
            }
        }
        if let Some(&next) = self.runs.get(&end) {
            if next.flags == run.flags {
                self.runs.remove(&end);
                end = next.end;
            }
        }
        self.runs.insert(start, Run { end, flags: run.flags });
    }

    /// Page-aligned bounds of `[start, end)`. An `end` that rounds up
    /// past the top of the address space is rejected.
    fn normalize(start: u64, end: u64) -> Result<(u64, u64), RangeError> {
        assert!(start < end, "empty page range {start:#x}..{end:#x}");
        let end = page_align_up(end).ok_or(RangeError(end))?;
        Ok((page_align_down(start), end))
    }

    /// Set the flags of every page in `[start, end)`.
    ///
    /// `WRITE` implies `WRITE_ORG`. Returns the sub-ranges whose pages
    /// were not writable before and are now, so callers can drop code
    /// translated while the page was write-protected. Nothing changes
    /// when the range cannot be page-aligned.
    pub fn set_flags(&mut self, start: u64, end: u64, mut flags: PageFlags) -> Result<Vec<Range<u64>>, RangeError> {
        let (start, end) = Self::normalize(start, end)?;
        if flags.contains(PageFlags::WRITE) {
            flags |= PageFlags::WRITE_ORG;
        }
        let mut became_writable = Vec::new();
        if flags.contains(PageFlags::WRITE) {
            for (s, e, old) in self.iter_range(start, end) {
                if !old.contains(PageFlags::WRITE) && old.contains(PageFlags::VALID) {
                    became_writable.push(s..e);
                }
            }
        }
        self.remove_range(start, end);
        if !flags.is_empty() {
            self.runs.insert(start, Run { end, flags });
            self.coalesce(start);
        }
        Ok(became_writable)
    }

    /// Flags of the page containing `addr` (empty when unmapped).
    pub fn get_flags(&self, addr: u64) -> PageFlags {
        match self.runs.range(..=addr).next_back() {
            Some((_, run)) if run.end > addr => run.flags,
            _ => PageFlags::empty(),
        }
    }

    /// Forget everything about `[start, end)` (unmap or re-map).
    pub fn reset(&mut self, start: u64, end: u64) -> Result<(), RangeError> {
        let (start, end) = Self::normalize(start, end)?;
        self.remove_range(start, end);
        Ok(())
    }

    /// Mapped runs intersecting `[start, end)`, clipped to the range.
    pub fn iter_range(&self, start: u64, end: u64) -> Vec<(u64, u64, PageFlags)> {
        let mut out = Vec::new();
        if let Some((_, run)) = self.runs.range(..start).next_back() {
            if run.end > start {
                out.push((start, run.end.min(end), run.flags));
            }
        }
        for (&s, run) in self.runs.range(start..end) {
            out.push((s, run.end.min(end), run.flags));
        }
        out
    }

    /// All runs, in address order.
    pub fn runs(&self) -> impl Iterator<Item = (u64, u64, PageFlags)> + '_ {
        self.runs.iter().map(|(&s, r)| (s, r.end, r.flags))
    }

    /// Check that every page of `[start, start+len)` is valid and has
    /// `flags`. A `WRITE` request is satisfied by `WRITE_ORG`; the
    /// returned pages are the ones currently write-protected for code,
    /// which the caller must unprotect before writing.
    pub fn check_range(&self, start: u64, len: u64, flags: PageFlags) -> Result<Vec<u64>, RangeError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let last = start.checked_add(len - 1).ok_or(RangeError(start))?;
        let mut protected = Vec::new();
        let mut addr = page_align_down(start);
        loop {
            let p = self.get_flags(addr);
            if !p.contains(PageFlags::VALID) || p.contains(PageFlags::RESERVED) {
                return Err(RangeError(addr.max(start)));
            }
            if flags.contains(PageFlags::READ) && !p.contains(PageFlags::READ) {
                return Err(RangeError(addr.max(start)));
            }
            if flags.contains(PageFlags::EXEC) && !p.contains(PageFlags::EXEC) {
                return Err(RangeError(addr.max(start)));
            }
            if flags.contains(PageFlags::WRITE) {
                if !p.contains(PageFlags::WRITE_ORG) {
                    return Err(RangeError(addr.max(start)));
                }
                if !p.contains(PageFlags::WRITE) {
                    protected.push(addr);
                }
            }
            if addr >= page_align_down(last) {
                break;
            }
            addr += TARGET_PAGE_SIZE;
        }
        Ok(protected)
    }

    fn update_page(&mut self, page: u64, f: impl FnOnce(PageFlags) -> PageFlags) -> bool {
        let old = self.get_flags(page);
        let new = f(old);
        if new == old {
            return false;
        }
        self.split_at(page);
        self.split_at(page + TARGET_PAGE_SIZE);
        self.runs.insert(page, Run { end: page + TARGET_PAGE_SIZE, flags: new });
        self.coalesce(page);
        true
    }

    /// Write-protect a page that now holds translated code. Returns
    /// true if the page was writable.
    pub fn protect_code(&mut self, page: u64) -> bool {
        self.update_page(page_align_down(page), |f| {
            if f.contains(PageFlags::WRITE) {
                f - PageFlags::WRITE
            } else {
                f
            }
        })
    }

    /// Restore `WRITE` on a code-protected page. Returns true if the
    /// page was protected.
    pub fn unprotect(&mut self, page: u64) -> bool {
        self.update_page(page_align_down(page), |f| {
            if f.contains(PageFlags::WRITE_ORG) && !f.contains(PageFlags::WRITE) {
                f | PageFlags::WRITE
            } else {
                f
            }
        })
    }

    /// Restore `WRITE` on every code-protected page.
    pub fn unprotect_all(&mut self) {
        let protected: Vec<(u64, u64)> = self
            .runs()
            .filter(|(_, _, f)| f.contains(PageFlags::WRITE_ORG) && !f.contains(PageFlags::WRITE))
            .map(|(s, e, _)| (s, e))
            .collect();
        for (s, e) in protected {
            if let Some(run) = self.runs.get_mut(&s) {
                debug_assert_eq!(run.end, e);
                run.flags |= PageFlags::WRITE;
            }
            self.coalesce(s);
        }
    }
}
