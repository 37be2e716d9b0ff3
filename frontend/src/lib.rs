//! Guest frontends: instruction decoding and IR generation.
//!
//! The engine sees a guest through two object-safe traits:
//! [`GuestFrontend`] builds IR for a block and [`GuestCpu`] is the
//! architectural state it runs against. Frontends share the
//! [`translator_loop`] driver, which owns the block-ending rules.

pub mod riscv;

use smtcg_core::{Context, TempIdx};
use smtcg_mmu::{MmuFault, TARGET_PAGE_MASK};
use thiserror::Error;

pub use riscv::{RiscvCpu, RiscvFrontend};

/// Translation failure for the first instruction of a block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("cannot decode instruction at {pc:#x}: {reason}")]
    DecodeTrap { pc: u64, reason: String },
    #[error("instruction fetch at {pc:#x} failed: {fault}")]
    Fetch { pc: u64, fault: MmuFault },
}

/// A guest-visible fault, handed to the CPU model for trap delivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuestFault {
    #[error(transparent)]
    Mmu(#[from] MmuFault),
    #[error("illegal instruction at {pc:#x}: {reason}")]
    DecodeTrap { pc: u64, reason: String },
}

impl From<TranslateError> for GuestFault {
    fn from(e: TranslateError) -> Self {
        match e {
            TranslateError::DecodeTrap { pc, reason } => GuestFault::DecodeTrap { pc, reason },
            TranslateError::Fetch { fault, .. } => GuestFault::Mmu(fault),
        }
    }
}

/// What the dispatcher does after delivering a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// The CPU redirected itself to its trap vector; keep running.
    Continue,
    /// Return the fault to the caller of the run loop.
    Exit,
}

/// CPU-state interface consumed by the dispatcher.
pub trait GuestCpu: Send {
    fn get_pc(&self) -> u64;
    fn set_pc(&mut self, pc: u64);
    /// Translation-relevant state (privilege, ISA mode), part of the
    /// block key.
    fn get_flags(&self) -> u32;
    /// MMU mode used for data and code accesses.
    fn mmu_index(&self) -> usize;
    /// Register file, indexed by the `slot` of the frontend's IR
    /// globals.
    fn regs_mut(&mut self) -> &mut [u64];
    /// Deliver a fault raised by the instruction at `pc`.
    fn on_fault(&mut self, pc: u64, fault: &GuestFault) -> FaultAction;
    /// Called at a block boundary while interrupts `mask` are pending.
    /// Returns true if the dispatcher should exit with the interrupt
    /// still pending, false if the CPU took it.
    fn on_interrupt_pending(&mut self, mask: u32) -> bool;
}

/// Reads guest instruction bytes for the translator.
pub trait InsnFetch {
    /// Little-endian instruction unit of `size` bytes at `pc`.
    fn fetch(&mut self, pc: u64, size: u32) -> Result<u64, MmuFault>;
}

impl<F: FnMut(u64, u32) -> Result<u64, MmuFault>> InsnFetch for F {
    fn fetch(&mut self, pc: u64, size: u32) -> Result<u64, MmuFault> {
        self(pc, size)
    }
}

/// Shape of a translated block, as seen by the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestBlock {
    pub pc: u64,
    /// Guest bytes covered.
    pub size: u32,
    pub icount: u32,
}

/// Pluggable "decode guest instructions into IR" capability.
pub trait GuestFrontend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Register the guest register file as IR globals. Called once per
    /// fresh `Context`; globals survive `Context::reset`.
    fn init_context(&self, ir: &mut Context);

    /// Number of register-file slots `GuestCpu::regs_mut` must provide.
    fn nb_regs(&self) -> usize;

    /// Build the op stream for the block at `pc` into a reset `ir`.
    fn translate(
        &self,
        ir: &mut Context,
        pc: u64,
        flags: u32,
        cflags: u32,
        fetch: &mut dyn InsnFetch,
    ) -> Result<GuestBlock, TranslateError>;
}

/// Why the block being built stops after the current instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisasJumpType {
    /// Keep decoding.
    Next,
    /// Stopped for a budget, page or decode boundary; fall through.
    TooMany,
    /// Unconditional branch / exit, no fall-through.
    NoReturn,
}

/// Architecture-neutral part of a frontend's per-block state
/// (QEMU's `DisasContextBase`).
pub struct DisasContextBase {
    pub pc_first: u64,
    /// Where decoding resumes.
    pub pc_next: u64,
    pub is_jmp: DisasJumpType,
    /// Instructions emitted so far.
    pub num_insns: u32,
    /// Budget from the `cflags` count field.
    pub max_insns: u32,
    pub cflags: u32,
}

impl DisasContextBase {
    pub fn new(pc: u64, cflags: u32) -> Self {
        Self {
            pc_first: pc,
            pc_next: pc,
            is_jmp: DisasJumpType::Next,
            num_insns: 0,
            max_insns: smtcg_core::TranslationBlock::max_insns(cflags),
            cflags,
        }
    }

    /// Whether a direct, patchable jump to `dest` is allowed.
    pub fn use_goto_tb(&self, dest: u64) -> bool {
        self.cflags & smtcg_core::tb::cflags::CF_NO_GOTO_TB == 0
            && dest & TARGET_PAGE_MASK == self.pc_first & TARGET_PAGE_MASK
    }
}

/// Hooks a frontend plugs into [`translator_loop`].
pub trait TranslatorOps {
    type DisasContext;
    type Insn;

    fn init_disas_context(ctx: &mut Self::DisasContext, ir: &mut Context);

    /// Runs after the block's exit check has been emitted.
    fn tb_start(ctx: &mut Self::DisasContext, ir: &mut Context);

    /// Fetch and decode the instruction at `base().pc_next` without
    /// emitting anything.
    fn decode_insn(ctx: &mut Self::DisasContext, fetch: &mut dyn InsnFetch) -> Result<Self::Insn, TranslateError>;

    fn insn_start(ctx: &mut Self::DisasContext, ir: &mut Context);

    /// Emit IR for `insn`, advance `pc_next` and set `is_jmp` if the
    /// instruction ends the block.
    fn translate_insn(ctx: &mut Self::DisasContext, ir: &mut Context, insn: Self::Insn);

    /// Emit the block exit for whatever `is_jmp` says.
    fn tb_stop(ctx: &mut Self::DisasContext, ir: &mut Context);

    fn base(ctx: &Self::DisasContext) -> &DisasContextBase;
    fn base_mut(ctx: &mut Self::DisasContext) -> &mut DisasContextBase;
}

/// Decode and translate until the block ends (QEMU's
/// `translator_loop()`). Every block starts with an exit check whose
/// instruction count is filled in once the block is complete. Blocks
/// never run past the end of their first page.
pub fn translator_loop<T: TranslatorOps>(
    ctx: &mut T::DisasContext,
    ir: &mut Context,
    fetch: &mut dyn InsnFetch,
) -> Result<(), TranslateError> {
    T::init_disas_context(ctx, ir);
    let check = ir.gen_exit_check();
    T::tb_start(ctx, ir);
    let first_page = T::base(ctx).pc_first & TARGET_PAGE_MASK;

    loop {
        let pc = T::base(ctx).pc_next;
        let insn = match T::decode_insn(ctx, fetch) {
            Ok(insn) => insn,
            Err(e) if T::base(ctx).num_insns == 0 => return Err(e),
            Err(e) => {
                log::debug!("block ends before {pc:#x}: {e}");
                T::base_mut(ctx).is_jmp = DisasJumpType::TooMany;
                break;
            }
        };
        T::insn_start(ctx, ir);
        T::translate_insn(ctx, ir, insn);

        let base = T::base(ctx);
        if base.is_jmp != DisasJumpType::Next {
            break;
        }
        if base.num_insns >= base.max_insns || base.pc_next & TARGET_PAGE_MASK != first_page {
            T::base_mut(ctx).is_jmp = DisasJumpType::TooMany;
            break;
        }
    }

    T::tb_stop(ctx, ir);
    ir.op_mut(check).args[0] = TempIdx(T::base(ctx).num_insns);
    Ok(())
}
