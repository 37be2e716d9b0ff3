//! `gen_*` emitters: one per opcode plus a few immediate shorthands.
//! Each returns its destination so calls can be chained.

use crate::context::Context;
use crate::op::{Op, OpIdx};
use crate::opcode::Opcode;
use crate::temp::TempIdx;
use crate::types::{Cond, MemOp, Type};

/// Constant arguments travel in the arg array as raw `TempIdx` values.
fn carg(val: u32) -> TempIdx {
    TempIdx(val)
}

macro_rules! binary_ops {
    ($($fn_name:ident => $opc:ident),* $(,)?) => {
        $(
            pub fn $fn_name(&mut self, ty: Type, d: TempIdx, a: TempIdx, b: TempIdx) -> TempIdx {
                self.emit(Opcode::$opc, ty, &[d, a, b]);
                d
            }
        )*
    };
}

impl Context {
    fn emit(&mut self, opc: Opcode, ty: Type, args: &[TempIdx]) -> OpIdx {
        let idx = self.next_op_idx();
        self.emit_op(Op::with_args(idx, opc, ty, args))
    }

    binary_ops! {
        gen_add => Add,
        gen_sub => Sub,
        gen_mul => Mul,
        gen_divs => DivS,
        gen_divu => DivU,
        gen_rems => RemS,
        gen_remu => RemU,
        gen_mulsh => MulSH,
        gen_muluh => MulUH,
        gen_and => And,
        gen_or => Or,
        gen_xor => Xor,
        gen_shl => Shl,
        gen_shr => Shr,
        gen_sar => Sar,
    }

    pub fn gen_mov(&mut self, ty: Type, d: TempIdx, s: TempIdx) -> TempIdx {
        self.emit(Opcode::Mov, ty, &[d, s]);
        d
    }

    pub fn gen_movi(&mut self, ty: Type, d: TempIdx, imm: u64) -> TempIdx {
        let c = self.new_const(ty, imm);
        self.gen_mov(ty, d, c)
    }

    /// d = (a cond b) as 0/1
    pub fn gen_setcond(&mut self, ty: Type, d: TempIdx, a: TempIdx, b: TempIdx, cond: Cond) -> TempIdx {
        self.emit(Opcode::SetCond, ty, &[d, a, b, carg(cond as u32)]);
        d
    }

    pub fn gen_addi(&mut self, ty: Type, d: TempIdx, a: TempIdx, imm: i64) -> TempIdx {
        let c = self.new_const(ty, imm as u64);
        self.gen_add(ty, d, a, c)
    }

    pub fn gen_andi(&mut self, ty: Type, d: TempIdx, a: TempIdx, imm: i64) -> TempIdx {
        let c = self.new_const(ty, imm as u64);
        self.gen_and(ty, d, a, c)
    }

    pub fn gen_sari(&mut self, ty: Type, d: TempIdx, a: TempIdx, sh: u32) -> TempIdx {
        let c = self.new_const(ty, u64::from(sh));
        self.gen_sar(ty, d, a, c)
    }

    /// Sign-extend the low 32 bits of `s`.
    pub fn gen_ext_i32_i64(&mut self, d: TempIdx, s: TempIdx) -> TempIdx {
        self.emit(Opcode::ExtI32I64, Type::I64, &[d, s]);
        d
    }

    pub fn gen_extrl_i64_i32(&mut self, d: TempIdx, s: TempIdx) -> TempIdx {
        self.emit(Opcode::ExtrlI64I32, Type::I32, &[d, s]);
        d
    }

    /// Guest load through the soft TLB of MMU mode `mmu_idx`.
    pub fn gen_qemu_ld(&mut self, ty: Type, d: TempIdx, addr: TempIdx, memop: MemOp, mmu_idx: u32) -> TempIdx {
        self.emit(Opcode::QemuLd, ty, &[d, addr, carg(u32::from(memop.0)), carg(mmu_idx)]);
        d
    }

    pub fn gen_qemu_st(&mut self, ty: Type, val: TempIdx, addr: TempIdx, memop: MemOp, mmu_idx: u32) {
        self.emit(Opcode::QemuSt, ty, &[val, addr, carg(u32::from(memop.0)), carg(mmu_idx)]);
    }

    pub fn gen_brcond(&mut self, ty: Type, a: TempIdx, b: TempIdx, cond: Cond, label_id: u32) {
        self.emit(Opcode::BrCond, ty, &[a, b, carg(cond as u32), carg(label_id)]);
    }

    pub fn gen_set_label(&mut self, label_id: u32) {
        self.emit(Opcode::SetLabel, Type::I64, &[carg(label_id)]);
    }

    /// Chainable jump through link slot 0 or 1.
    pub fn gen_goto_tb(&mut self, slot: u32) {
        self.emit(Opcode::GotoTb, Type::I64, &[carg(slot)]);
    }

    pub fn gen_exit_tb(&mut self, val: u32) {
        self.emit(Opcode::ExitTb, Type::I64, &[carg(val)]);
    }

    /// Block-entry check of the exit request and budget. The icount
    /// argument is patched once the block length is known.
    pub fn gen_exit_check(&mut self) -> OpIdx {
        self.emit(Opcode::ExitCheck, Type::I64, &[carg(0)])
    }

    pub fn gen_insn_start(&mut self, pc: u64) {
        self.emit(Opcode::InsnStart, Type::I64, &[carg(pc as u32), carg((pc >> 32) as u32)]);
    }
}
