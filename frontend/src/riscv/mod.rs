//! RISC-V frontend: RV64IM instruction translation.

pub mod cpu;
pub mod decode;
mod trans;

use smtcg_core::{Context, TempIdx, Type};
use smtcg_mmu::{MmuAccessType, MmuFault};

use crate::{
    DisasContextBase, DisasJumpType, GuestBlock, GuestFrontend, InsnFetch, TranslateError,
    TranslatorOps,
};
use cpu::{NUM_GPRS, NUM_REGS, PC_SLOT};
use decode::Insn;

pub use cpu::{Priv, RiscvCpu};

const GPR_NAMES: [&str; NUM_GPRS] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

// ---------------------------------------------------------------
// Disassembly context
// ---------------------------------------------------------------

/// RISC-V disassembly context (extends `DisasContextBase`).
pub struct RiscvDisasContext {
    /// Generic base fields (pc, is_jmp, counters).
    pub base: DisasContextBase,
    /// IR temps for guest GPRs x0-x31 (globals).
    pub gpr: [TempIdx; NUM_GPRS],
    /// IR temp for the guest PC (global).
    pub pc: TempIdx,
    /// MMU mode for loads and stores.
    pub mem_idx: u32,
}

impl RiscvDisasContext {
    /// Context for a block at `pc`. Assumes the register globals were
    /// registered by [`RiscvFrontend::init_context`], in slot order.
    pub fn new(pc: u64, flags: u32, cflags: u32) -> Self {
        let mut gpr = [TempIdx(0); NUM_GPRS];
        for (i, t) in gpr.iter_mut().enumerate() {
            *t = TempIdx(i as u32);
        }
        Self {
            base: DisasContextBase::new(pc, cflags),
            gpr,
            pc: TempIdx(PC_SLOT as u32),
            mem_idx: flags,
        }
    }
}

// ---------------------------------------------------------------
// TranslatorOps implementation
// ---------------------------------------------------------------

/// Marker type for the RISC-V translator.
pub struct RiscvTranslator;

impl TranslatorOps for RiscvTranslator {
    type DisasContext = RiscvDisasContext;
    type Insn = Insn;

    fn init_disas_context(_ctx: &mut RiscvDisasContext, _ir: &mut Context) {}

    fn tb_start(_ctx: &mut RiscvDisasContext, _ir: &mut Context) {}

    fn decode_insn(
        ctx: &mut RiscvDisasContext,
        fetch: &mut dyn InsnFetch,
    ) -> Result<Insn, TranslateError> {
        let pc = ctx.base.pc_next;
        if pc & 3 != 0 {
            return Err(TranslateError::Fetch {
                pc,
                fault: MmuFault::Unaligned {
                    addr: pc,
                    access: MmuAccessType::InstFetch,
                },
            });
        }
        let word = fetch
            .fetch(pc, 4)
            .map_err(|fault| TranslateError::Fetch { pc, fault })? as u32;
        decode::decode(word).ok_or_else(|| TranslateError::DecodeTrap {
            pc,
            reason: format!("unsupported encoding {word:#010x}"),
        })
    }

    fn insn_start(ctx: &mut RiscvDisasContext, ir: &mut Context) {
        ir.gen_insn_start(ctx.base.pc_next);
        ctx.base.num_insns += 1;
    }

    fn translate_insn(ctx: &mut RiscvDisasContext, ir: &mut Context, insn: Insn) {
        ctx.trans(ir, insn);
        ctx.base.pc_next = ctx.base.pc_next.wrapping_add(4);
    }

    fn tb_stop(ctx: &mut RiscvDisasContext, ir: &mut Context) {
        match ctx.base.is_jmp {
            DisasJumpType::NoReturn => {
                // TB already terminated by the instruction.
            }
            DisasJumpType::Next | DisasJumpType::TooMany => {
                let next = ctx.base.pc_next;
                ctx.gen_fallthrough(ir, next);
            }
        }
    }

    fn base(ctx: &RiscvDisasContext) -> &DisasContextBase {
        &ctx.base
    }

    fn base_mut(ctx: &mut RiscvDisasContext) -> &mut DisasContextBase {
        &mut ctx.base
    }
}

// ---------------------------------------------------------------
// Frontend capability
// ---------------------------------------------------------------

/// The RV64IM guest. Block flags are the privilege level, which is
/// also the MMU mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct RiscvFrontend;

impl GuestFrontend for RiscvFrontend {
    fn name(&self) -> &'static str {
        "riscv64"
    }

    fn init_context(&self, ir: &mut Context) {
        for (i, name) in GPR_NAMES.iter().enumerate() {
            ir.new_global(Type::I64, i as u32, name);
        }
        ir.new_global(Type::I64, PC_SLOT as u32, "pc");
    }

    fn nb_regs(&self) -> usize {
        NUM_REGS
    }

    fn translate(
        &self,
        ir: &mut Context,
        pc: u64,
        flags: u32,
        cflags: u32,
        fetch: &mut dyn InsnFetch,
    ) -> Result<GuestBlock, TranslateError> {
        let mut ctx = RiscvDisasContext::new(pc, flags, cflags);
        crate::translator_loop::<RiscvTranslator>(&mut ctx, ir, fetch)?;
        Ok(GuestBlock {
            pc,
            size: ctx.base.pc_next.wrapping_sub(pc) as u32,
            icount: ctx.base.num_insns,
        })
    }
}
