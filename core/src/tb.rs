use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::search;

/// Chaining state of a TB, protected by `TranslationBlock::jmp`.
///
/// Never hold two TBs' `jmp` locks at once.
#[derive(Debug, Default)]
pub struct TbJmpState {
    /// Incoming edges: `(source tb, slot)` pairs whose `goto_tb`
    /// currently jumps into this TB.
    pub jmp_list: Vec<(usize, usize)>,
    /// Outgoing edges: destination TB for each `goto_tb` slot.
    pub jmp_dest: [Option<usize>; 2],
    /// Last destination reached through an indirect exit.
    pub exit_target: Option<usize>,
}

/// One translated block. Published blocks only change through the
/// `invalid` flag and the `jmp` chaining state.
#[derive(Debug)]
pub struct TranslationBlock {
    /// Guest PC where this TB starts.
    pub pc: u64,
    /// CPU state flags that affect translation (privilege level, ISA mode).
    pub flags: u32,
    /// Compile flags (instruction budget, single-step, no-chain).
    pub cflags: u32,
    /// Guest bytes covered.
    pub size: u32,
    pub icount: u16,

    /// Offset into the code arena where host code starts.
    pub host_offset: usize,
    pub host_size: usize,

    /// Arena offset of the 64-bit link word of each `goto_tb` slot.
    pub jmp_insn_offset: [Option<u32>; 2],

    /// Guest pages the code was read from (second one only when the
    /// last instruction straddles a page boundary).
    pub page_addr: [Option<u64>; 2],

    /// Encoded guest-PC search table (see `search`).
    pub search: Box<[u8]>,

    pub invalid: AtomicBool,
    pub jmp: Mutex<TbJmpState>,
}

/// `cflags` bits; part of the lookup key.
pub mod cflags {
    /// Mask for the instruction count limit (0 = default budget).
    pub const CF_COUNT_MASK: u32 = 0x0000_FFFF;
    /// Never chain this TB to another with `goto_tb`.
    pub const CF_NO_GOTO_TB: u32 = 0x0001_0000;
    /// One instruction, then report `SingleStep`.
    pub const CF_SINGLE_STEP: u32 = 0x0002_0000;
}

/// Values passed to `exit_tb`.
pub mod exit {
    /// Exit through `goto_tb` slot 0 (chainable).
    pub const TB_EXIT_IDX0: u32 = 0;
    /// Exit through `goto_tb` slot 1 (chainable).
    pub const TB_EXIT_IDX1: u32 = 1;
    /// Indirect exit; the next PC is only known at run time.
    pub const TB_EXIT_NOCHAIN: u32 = 2;
    /// First guest exception number.
    pub const EXCP_BASE: u32 = 0x10;
    /// Environment call (`ecall`).
    pub const EXCP_ECALL: u32 = EXCP_BASE;
    /// Breakpoint instruction (`ebreak`).
    pub const EXCP_EBREAK: u32 = EXCP_BASE + 1;
}

/// Default instruction budget when `CF_COUNT_MASK` is zero.
pub const TCG_MAX_INSNS: u32 = 512;

impl TranslationBlock {
    pub fn new(pc: u64, flags: u32, cflags: u32) -> Self {
        Self {
            pc,
            flags,
            cflags,
            size: 0,
            icount: 0,
            host_offset: 0,
            host_size: 0,
            jmp_insn_offset: [None; 2],
            page_addr: [None; 2],
            search: Box::default(),
            invalid: AtomicBool::new(false),
            jmp: Mutex::new(TbJmpState::default()),
        }
    }

    /// Bucket of the shared TB hash for a lookup key.
    pub fn hash(pc: u64, flags: u32, cflags: u32) -> usize {
        let h = pc.wrapping_mul(0x9e3779b97f4a7c15) ^ (flags as u64) ^ ((cflags as u64) << 32);
        let h = h ^ (h >> 29);
        (h as usize) & (TB_HASH_SIZE - 1)
    }

    /// Instruction budget encoded in `cflags`.
    pub fn max_insns(cflags: u32) -> u32 {
        let count = cflags & cflags::CF_COUNT_MASK;
        if count == 0 {
            TCG_MAX_INSNS
        } else {
            count
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    /// Whether this TB answers a lookup for the given key.
    pub fn matches(&self, pc: u64, flags: u32, cflags: u32) -> bool {
        self.pc == pc && self.flags == flags && self.cflags == cflags && !self.is_invalid()
    }

    /// Guest address just past the block; 0 for a block that ends at
    /// the top of the address space.
    pub fn end_pc(&self) -> u64 {
        self.pc.wrapping_add(self.size as u64)
    }

    /// Whether the guest bytes `[start, end)` overlap this TB's code.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        if self.size == 0 || start >= end {
            return false;
        }
        let last = self.pc.saturating_add(self.size as u64 - 1);
        self.pc < end && start <= last
    }

    /// Guest PC of the instruction that contains host offset
    /// `host_pc` (absolute arena offset).
    pub fn restore_pc(&self, host_pc: usize) -> Option<u64> {
        let off = host_pc.checked_sub(self.host_offset)?;
        search::find_insn(&self.search, self.pc, off as u32).map(|(pc, _)| pc)
    }

    /// Guest PC of the instruction after the one containing `host_pc`.
    pub fn next_pc_after(&self, host_pc: usize) -> Option<u64> {
        let off = host_pc.checked_sub(self.host_offset)?;
        let (_, next) = search::find_insn(&self.search, self.pc, off as u32)?;
        Some(next.unwrap_or_else(|| self.end_pc()))
    }
}

pub const TB_HASH_SIZE: usize = 1 << 15;
pub const TB_JMP_CACHE_SIZE: usize = 1 << 12;

/// Per-vCPU direct-mapped pc → TB cache in front of the shared hash,
/// indexed by `(pc >> 2) & (TB_JMP_CACHE_SIZE - 1)`. Entries may go
/// stale; callers check the key and validity of the TB they get back.
pub struct JumpCache {
    entries: Box<[Option<usize>]>,
}

impl JumpCache {
    pub fn new() -> Self {
        Self {
            entries: vec![None; TB_JMP_CACHE_SIZE].into_boxed_slice(),
        }
    }

    fn index(pc: u64) -> usize {
        (pc as usize >> 2) & (TB_JMP_CACHE_SIZE - 1)
    }

    pub fn lookup(&self, pc: u64) -> Option<usize> {
        self.entries[Self::index(pc)]
    }

    pub fn insert(&mut self, pc: u64, tb_idx: usize) {
        self.entries[Self::index(pc)] = Some(tb_idx);
    }

    pub fn remove(&mut self, pc: u64) {
        self.entries[Self::index(pc)] = None;
    }

    pub fn invalidate(&mut self) {
        self.entries.fill(None);
    }
}

impl Default for JumpCache {
    fn default() -> Self {
        Self::new()
    }
}
