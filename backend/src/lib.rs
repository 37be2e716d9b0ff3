pub mod code_buffer;
pub mod tci;
pub mod translate;

use std::sync::atomic::AtomicBool;

use smtcg_core::Context;
use smtcg_mmu::{MemAccess, MmuFault};
use thiserror::Error;

pub use code_buffer::{CodeBuffer, CodeWriter};
pub use tci::TciCodeGen;
pub use translate::{translate, Translated};

/// Errors from lowering IR into the code arena.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeGenError {
    /// The arena has no room left; the caller must flush and retry.
    #[error("code buffer full ({capacity} bytes)")]
    BufferFull { capacity: usize },
    #[error("op {0} has no host lowering")]
    UnsupportedOp(&'static str),
    #[error("block uses {0} temps, more than the host encoding can address")]
    TooManyTemps(usize),
}

/// Layout of one lowered block in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoweredTb {
    pub host_offset: usize,
    pub host_size: usize,
    /// Arena offsets of the `goto_tb` link words, per exit slot.
    pub jmp_link_offset: [Option<u32>; 2],
}

/// How generated code returned to the dispatcher.
///
/// `tb` is the block executing when control left generated code, which
/// differs from the entry block once chained jumps were taken.
/// `host_pc` is an absolute arena offset inside `tb`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TbExit {
    /// Left through an unlinked `goto_tb` slot; the guest pc is stored.
    Chain { tb: usize, slot: usize },
    /// Indirect exit; the guest pc is stored.
    NoChain { tb: usize },
    /// Exit request seen at block entry; nothing of `tb` ran.
    Requested { tb: usize },
    /// Instruction budget exhausted at block entry; nothing of `tb` ran.
    BudgetExhausted { tb: usize },
    /// Guest exception raised by generated code; the guest pc is stored.
    Exception { tb: usize, excp: u32 },
    /// A guest memory access faulted.
    Fault { tb: usize, host_pc: usize, fault: MmuFault },
    /// A store invalidated translated code; the store has completed.
    CodeModified { tb: usize, host_pc: usize },
}

/// Everything generated code can touch while it runs.
pub struct ExecEnv<'a> {
    /// Guest register file, indexed by global `slot`.
    pub regs: &'a mut [u64],
    pub mem: MemAccess<'a>,
    /// Set by other threads to make the vCPU leave generated code.
    pub exit_request: &'a AtomicBool,
    /// Remaining guest instructions, if bounded.
    pub budget: Option<u64>,
    /// Guest instructions of every block entered.
    pub executed: u64,
    /// Scratch slots for block-local temps.
    pub frame: &'a mut [u64],
}

/// A host code generator: lowers IR into the arena and runs it.
pub trait HostCodeGen: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower `ctx` (a complete block) into the arena. Also fills
    /// `ctx.insn_pcs`/`ctx.insn_ends`.
    fn lower(&self, ctx: &mut Context, buf: &CodeBuffer) -> Result<LoweredTb, CodeGenError>;

    /// Point the link word at `link_offset` to block `target`
    /// (`(tb index, host offset)`), or reset it when `None`.
    ///
    /// Takes `&self` and `&CodeBuffer` so chaining can happen
    /// concurrently from multiple vCPU threads.
    fn patch_jump(&self, buf: &CodeBuffer, link_offset: usize, target: Option<(usize, usize)>);

    /// Run block `tb` starting at `host_offset` until control leaves
    /// generated code.
    fn exec(&self, buf: &CodeBuffer, tb: usize, host_offset: usize, env: &mut ExecEnv<'_>) -> TbExit;
}
