//! Portable threaded-code host ("TCI").
//!
//! IR ops lower to a compact bytecode in the shared arena, which an
//! interpreter then walks. Each instruction starts with the IR opcode
//! byte and the op type byte:
//!
//! ```text
//! movi      d:loc imm:u64
//! <unary>   d:loc s:loc
//! <binary>  d:loc a:loc b:loc
//! setcond   d:loc a:loc b:loc cond:u8
//! movcond   d:loc c1:loc c2:loc v1:loc v2:loc cond:u8
//! qemu_ld   d:loc addr:loc memop:u16 mmu:u8
//! qemu_st   v:loc addr:loc memop:u16 mmu:u8
//! br        target:u32
//! brcond    a:loc b:loc cond:u8 target:u32
//! goto_tb   slot:u8 <pad to 8> link:u64
//! exit_tb   val:u32
//! exit_check icount:u16
//! ```
//!
//! A `loc` is a u16: with [`LOC_GLOBAL`] set it names a slot of the
//! guest register file, otherwise a frame slot (the temp index).
//! Branch targets are absolute arena offsets. A `goto_tb` link word is
//! zero when unlinked, else `(dst_tb + 1) << 32 | dst_host_offset`.

mod interp;
mod lower;

use std::sync::atomic::Ordering;

use log::trace;
use smtcg_core::Context;

use crate::code_buffer::CodeBuffer;
use crate::{CodeGenError, ExecEnv, HostCodeGen, LoweredTb, TbExit};

/// Marks a register-file operand.
pub const LOC_GLOBAL: u16 = 0x8000;
/// Opcode byte of the TCI-only load-immediate.
pub const TCI_MOVI: u8 = 0xf0;
/// Largest frame slot a `loc` can address.
pub const MAX_FRAME_SLOTS: usize = LOC_GLOBAL as usize;

/// Encode a chaining link word.
#[inline]
pub fn encode_link(tb: usize, host_offset: usize) -> u64 {
    ((tb as u64 + 1) << 32) | host_offset as u64
}

/// Decode a chaining link word.
#[inline]
pub fn decode_link(word: u64) -> Option<(usize, usize)> {
    if word == 0 {
        None
    } else {
        Some(((word >> 32) as usize - 1, (word & 0xffff_ffff) as usize))
    }
}

/// The TCI code generator. Stateless: everything lives in the arena.
#[derive(Debug, Default, Clone, Copy)]
pub struct TciCodeGen;

impl TciCodeGen {
    pub fn new() -> Self {
        Self
    }
}

impl HostCodeGen for TciCodeGen {
    fn name(&self) -> &'static str {
        "tci"
    }

    fn lower(&self, ctx: &mut Context, buf: &CodeBuffer) -> Result<LoweredTb, CodeGenError> {
        lower::lower(ctx, buf)
    }

    fn patch_jump(&self, buf: &CodeBuffer, link_offset: usize, target: Option<(usize, usize)>) {
        let word = target.map_or(0, |(tb, off)| encode_link(tb, off));
        buf.link(link_offset).store(word, Ordering::Release);
        trace!("tci patch link @{link_offset:#x} -> {target:?}");
    }

    fn exec(&self, buf: &CodeBuffer, tb: usize, host_offset: usize, env: &mut ExecEnv<'_>) -> TbExit {
        interp::run(buf, tb, host_offset, env)
    }
}
