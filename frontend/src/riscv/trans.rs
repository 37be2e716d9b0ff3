//! RISC-V instruction translation: IR generation.
//!
//! Follows QEMU's gen_xxx helper pattern: repetitive instruction
//! translation logic is factored into `gen_arith` and `gen_arith_w`,
//! each dispatching through a `BinOp` function pointer.

use smtcg_core::tb::exit::{EXCP_EBREAK, EXCP_ECALL, TB_EXIT_NOCHAIN};
use smtcg_core::{Cond, Context, TempIdx, Type};

use super::decode::{AluOp, Insn};
use super::RiscvDisasContext;
use crate::DisasJumpType;

/// Binary IR operation: `fn(ir, ty, dst, lhs, rhs) -> dst`.
type BinOp = fn(&mut Context, Type, TempIdx, TempIdx, TempIdx) -> TempIdx;

fn binop(op: AluOp) -> Option<BinOp> {
    Some(match op {
        AluOp::Add => Context::gen_add,
        AluOp::Sub => Context::gen_sub,
        AluOp::Sll => Context::gen_shl,
        AluOp::Xor => Context::gen_xor,
        AluOp::Srl => Context::gen_shr,
        AluOp::Sra => Context::gen_sar,
        AluOp::Or => Context::gen_or,
        AluOp::And => Context::gen_and,
        AluOp::Mul => Context::gen_mul,
        AluOp::Mulh => Context::gen_mulsh,
        AluOp::Mulhu => Context::gen_muluh,
        AluOp::Div => Context::gen_divs,
        AluOp::Divu => Context::gen_divu,
        AluOp::Rem => Context::gen_rems,
        AluOp::Remu => Context::gen_remu,
        AluOp::Slt | AluOp::Sltu | AluOp::Mulhsu => return None,
    })
}

/// `mulhsu`: signed × unsigned high half, from the unsigned one.
fn gen_mulhsu(ir: &mut Context, ty: Type, d: TempIdx, a: TempIdx, b: TempIdx) -> TempIdx {
    let hi = ir.new_temp(ty);
    ir.gen_muluh(ty, hi, a, b);
    let sign = ir.new_temp(ty);
    ir.gen_sari(ty, sign, a, ty.size_bits() - 1);
    ir.gen_and(ty, sign, sign, b);
    ir.gen_sub(ty, d, hi, sign)
}

impl RiscvDisasContext {
    // -- GPR access ----------------------------------------

    /// Read GPR `idx`; x0 yields a constant zero.
    fn gpr_or_zero(&self, ir: &mut Context, idx: usize) -> TempIdx {
        if idx == 0 {
            ir.new_const(Type::I64, 0)
        } else {
            self.gpr[idx]
        }
    }

    /// Write `val` into GPR `rd`; writes to x0 discarded.
    fn gen_set_gpr(&self, ir: &mut Context, rd: usize, val: TempIdx) {
        if rd != 0 {
            ir.gen_mov(Type::I64, self.gpr[rd], val);
        }
    }

    /// Sign-extend low 32 bits into a 64-bit GPR.
    fn gen_set_gpr_sx32(&self, ir: &mut Context, rd: usize, val: TempIdx) {
        if rd != 0 {
            ir.gen_ext_i32_i64(self.gpr[rd], val);
        }
    }

    fn gen_set_pc_imm(&self, ir: &mut Context, pc: u64) {
        let c = ir.new_const(Type::I64, pc);
        ir.gen_mov(Type::I64, self.pc, c);
    }

    // -- ALU helpers ---------------------------------------

    /// 64-bit ALU: `rd = op(s1, s2)`.
    fn gen_arith(&self, ir: &mut Context, op: AluOp, rd: usize, s1: TempIdx, s2: TempIdx) {
        let d = ir.new_temp(Type::I64);
        match op {
            AluOp::Slt => {
                ir.gen_setcond(Type::I64, d, s1, s2, Cond::Lt);
            }
            AluOp::Sltu => {
                ir.gen_setcond(Type::I64, d, s1, s2, Cond::Ltu);
            }
            AluOp::Mulhsu => {
                gen_mulhsu(ir, Type::I64, d, s1, s2);
            }
            _ => {
                if let Some(f) = binop(op) {
                    f(ir, Type::I64, d, s1, s2);
                }
            }
        }
        self.gen_set_gpr(ir, rd, d);
    }

    /// W-suffix ALU: computed on the low 32 bits, result sign-extended.
    /// Shifts and divisions need a real 32-bit op; add, sub and mul use
    /// the 64-bit op and keep the low half.
    fn gen_arith_w(&self, ir: &mut Context, op: AluOp, rd: usize, s1: TempIdx, s2: TempIdx) {
        let Some(f) = binop(op) else {
            return;
        };
        match op {
            AluOp::Add | AluOp::Sub | AluOp::Mul => {
                let d = ir.new_temp(Type::I64);
                f(ir, Type::I64, d, s1, s2);
                self.gen_set_gpr_sx32(ir, rd, d);
            }
            _ => {
                let a32 = ir.new_temp(Type::I32);
                ir.gen_extrl_i64_i32(a32, s1);
                let b32 = ir.new_temp(Type::I32);
                ir.gen_extrl_i64_i32(b32, s2);
                let d32 = ir.new_temp(Type::I32);
                f(ir, Type::I32, d32, a32, b32);
                self.gen_set_gpr_sx32(ir, rd, d32);
            }
        }
    }

    // -- Control flow helpers ------------------------------

    /// Leave the block towards `dest` through exit slot `n`, chaining
    /// when allowed.
    fn gen_goto_tb(&self, ir: &mut Context, n: u32, dest: u64) {
        if self.base.use_goto_tb(dest) {
            ir.gen_goto_tb(n);
            self.gen_set_pc_imm(ir, dest);
            ir.gen_exit_tb(n);
        } else {
            self.gen_set_pc_imm(ir, dest);
            ir.gen_exit_tb(TB_EXIT_NOCHAIN);
        }
    }

    /// Block epilogue when translation stopped between instructions.
    pub(super) fn gen_fallthrough(&self, ir: &mut Context, next: u64) {
        self.gen_goto_tb(ir, 0, next);
    }

    /// Conditional branch that terminates the TB.
    fn gen_branch(&mut self, ir: &mut Context, cond: Cond, rs1: usize, rs2: usize, imm: i64) {
        let src1 = self.gpr_or_zero(ir, rs1);
        let src2 = self.gpr_or_zero(ir, rs2);
        let pc = self.base.pc_next;

        let taken = ir.new_label();
        ir.gen_brcond(Type::I64, src1, src2, cond, taken);
        self.gen_goto_tb(ir, 0, pc.wrapping_add(4));
        ir.gen_set_label(taken);
        self.gen_goto_tb(ir, 1, pc.wrapping_add(imm as u64));

        self.base.is_jmp = DisasJumpType::NoReturn;
    }

    fn gen_exception(&mut self, ir: &mut Context, excp: u32) {
        self.gen_set_pc_imm(ir, self.base.pc_next);
        ir.gen_exit_tb(excp);
        self.base.is_jmp = DisasJumpType::NoReturn;
    }

    /// Guest address `rs1 + imm`.
    fn gen_addr(&self, ir: &mut Context, rs1: usize, imm: i64) -> TempIdx {
        let base = self.gpr_or_zero(ir, rs1);
        if imm == 0 {
            return base;
        }
        let addr = ir.new_temp(Type::I64);
        ir.gen_addi(Type::I64, addr, base, imm)
    }

    // -- Dispatch ------------------------------------------

    /// Emit IR for one instruction at `base.pc_next`. Does not advance
    /// the PC.
    pub(super) fn trans(&mut self, ir: &mut Context, insn: Insn) {
        let pc = self.base.pc_next;
        match insn {
            Insn::Lui { rd, imm } => {
                let c = ir.new_const(Type::I64, imm as u64);
                self.gen_set_gpr(ir, rd, c);
            }
            Insn::Auipc { rd, imm } => {
                let c = ir.new_const(Type::I64, pc.wrapping_add(imm as u64));
                self.gen_set_gpr(ir, rd, c);
            }
            Insn::Jal { rd, imm } => {
                let link = ir.new_const(Type::I64, pc.wrapping_add(4));
                self.gen_set_gpr(ir, rd, link);
                self.gen_goto_tb(ir, 0, pc.wrapping_add(imm as u64));
                self.base.is_jmp = DisasJumpType::NoReturn;
            }
            Insn::Jalr { rd, rs1, imm } => {
                let src = self.gpr_or_zero(ir, rs1);
                let target = ir.new_temp(Type::I64);
                ir.gen_addi(Type::I64, target, src, imm);
                ir.gen_andi(Type::I64, target, target, !1);
                let link = ir.new_const(Type::I64, pc.wrapping_add(4));
                self.gen_set_gpr(ir, rd, link);
                ir.gen_mov(Type::I64, self.pc, target);
                ir.gen_exit_tb(TB_EXIT_NOCHAIN);
                self.base.is_jmp = DisasJumpType::NoReturn;
            }
            Insn::Branch { cond, rs1, rs2, imm } => self.gen_branch(ir, cond, rs1, rs2, imm),
            Insn::Load { rd, rs1, imm, memop } => {
                let addr = self.gen_addr(ir, rs1, imm);
                let d = ir.new_temp(Type::I64);
                ir.gen_qemu_ld(Type::I64, d, addr, memop, self.mem_idx);
                self.gen_set_gpr(ir, rd, d);
            }
            Insn::Store { rs1, rs2, imm, memop } => {
                let addr = self.gen_addr(ir, rs1, imm);
                let val = self.gpr_or_zero(ir, rs2);
                ir.gen_qemu_st(Type::I64, val, addr, memop, self.mem_idx);
            }
            Insn::OpImm { op, rd, rs1, imm } => {
                let src = self.gpr_or_zero(ir, rs1);
                let c = ir.new_const(Type::I64, imm as u64);
                self.gen_arith(ir, op, rd, src, c);
            }
            Insn::OpImm32 { op, rd, rs1, imm } => {
                let src = self.gpr_or_zero(ir, rs1);
                let c = ir.new_const(Type::I64, imm as u64);
                self.gen_arith_w(ir, op, rd, src, c);
            }
            Insn::Op { op, rd, rs1, rs2 } => {
                let s1 = self.gpr_or_zero(ir, rs1);
                let s2 = self.gpr_or_zero(ir, rs2);
                self.gen_arith(ir, op, rd, s1, s2);
            }
            Insn::Op32 { op, rd, rs1, rs2 } => {
                let s1 = self.gpr_or_zero(ir, rs1);
                let s2 = self.gpr_or_zero(ir, rs2);
                self.gen_arith_w(ir, op, rd, s1, s2);
            }
            Insn::Fence => {}
            Insn::FenceI => {
                // Later instructions must be fetched afresh.
                self.gen_set_pc_imm(ir, pc.wrapping_add(4));
                ir.gen_exit_tb(TB_EXIT_NOCHAIN);
                self.base.is_jmp = DisasJumpType::NoReturn;
            }
            Insn::Ecall => self.gen_exception(ir, EXCP_ECALL),
            Insn::Ebreak => self.gen_exception(ir, EXCP_EBREAK),
        }
    }
}
