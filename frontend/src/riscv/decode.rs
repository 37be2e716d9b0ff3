//! RV64IM instruction decoder.

use smtcg_core::{Cond, MemOp};

/// Register-register and register-immediate ALU operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    Sll,
    Slt,
    Sltu,
    Xor,
    Srl,
    Sra,
    Or,
    And,
    Mul,
    Mulh,
    Mulhsu,
    Mulhu,
    Div,
    Divu,
    Rem,
    Remu,
}

/// A decoded instruction. Register fields are indices 0-31.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    Lui { rd: usize, imm: i64 },
    Auipc { rd: usize, imm: i64 },
    Jal { rd: usize, imm: i64 },
    Jalr { rd: usize, rs1: usize, imm: i64 },
    Branch { cond: Cond, rs1: usize, rs2: usize, imm: i64 },
    Load { rd: usize, rs1: usize, imm: i64, memop: MemOp },
    Store { rs1: usize, rs2: usize, imm: i64, memop: MemOp },
    OpImm { op: AluOp, rd: usize, rs1: usize, imm: i64 },
    /// `*iw`: operates on the low 32 bits, sign-extends the result.
    OpImm32 { op: AluOp, rd: usize, rs1: usize, imm: i64 },
    Op { op: AluOp, rd: usize, rs1: usize, rs2: usize },
    /// `*w`: operates on the low 32 bits, sign-extends the result.
    Op32 { op: AluOp, rd: usize, rs1: usize, rs2: usize },
    Fence,
    FenceI,
    Ecall,
    Ebreak,
}

#[inline]
fn rd(insn: u32) -> usize {
    ((insn >> 7) & 0x1f) as usize
}

#[inline]
fn rs1(insn: u32) -> usize {
    ((insn >> 15) & 0x1f) as usize
}

#[inline]
fn rs2(insn: u32) -> usize {
    ((insn >> 20) & 0x1f) as usize
}

#[inline]
fn funct3(insn: u32) -> u32 {
    (insn >> 12) & 7
}

#[inline]
fn funct7(insn: u32) -> u32 {
    insn >> 25
}

fn imm_i(insn: u32) -> i64 {
    (insn as i32 >> 20) as i64
}

fn imm_s(insn: u32) -> i64 {
    (((insn as i32 >> 25) << 5) | ((insn >> 7) & 0x1f) as i32) as i64
}

fn imm_b(insn: u32) -> i64 {
    let v = ((insn as i32 >> 31) << 12)
        | (((insn >> 7) & 1) << 11) as i32
        | (((insn >> 25) & 0x3f) << 5) as i32
        | (((insn >> 8) & 0xf) << 1) as i32;
    v as i64
}

fn imm_u(insn: u32) -> i64 {
    (insn & 0xffff_f000) as i32 as i64
}

fn imm_j(insn: u32) -> i64 {
    let v = ((insn as i32 >> 31) << 20)
        | (insn & 0x000f_f000) as i32
        | (((insn >> 20) & 1) << 11) as i32
        | (((insn >> 21) & 0x3ff) << 1) as i32;
    v as i64
}

/// Decode one 32-bit instruction word. `None` for anything outside
/// RV64IM (including compressed encodings).
pub fn decode(insn: u32) -> Option<Insn> {
    if insn & 3 != 3 {
        return None;
    }
    let f3 = funct3(insn);
    let f7 = funct7(insn);
    Some(match insn & 0x7f {
        0x37 => Insn::Lui { rd: rd(insn), imm: imm_u(insn) },
        0x17 => Insn::Auipc { rd: rd(insn), imm: imm_u(insn) },
        0x6f => Insn::Jal { rd: rd(insn), imm: imm_j(insn) },
        0x67 if f3 == 0 => Insn::Jalr {
            rd: rd(insn),
            rs1: rs1(insn),
            imm: imm_i(insn),
        },
        0x63 => {
            let cond = match f3 {
                0 => Cond::Eq,
                1 => Cond::Ne,
                4 => Cond::Lt,
                5 => Cond::Ge,
                6 => Cond::Ltu,
                7 => Cond::Geu,
                _ => return None,
            };
            Insn::Branch {
                cond,
                rs1: rs1(insn),
                rs2: rs2(insn),
                imm: imm_b(insn),
            }
        }
        0x03 => {
            let memop = match f3 {
                0 => MemOp::sb(),
                1 => MemOp::sw(),
                2 => MemOp::sl(),
                3 => MemOp::uq(),
                4 => MemOp::ub(),
                5 => MemOp::uw(),
                6 => MemOp::ul(),
                _ => return None,
            };
            Insn::Load {
                rd: rd(insn),
                rs1: rs1(insn),
                imm: imm_i(insn),
                memop,
            }
        }
        0x23 => {
            let memop = match f3 {
                0 => MemOp::ub(),
                1 => MemOp::uw(),
                2 => MemOp::ul(),
                3 => MemOp::uq(),
                _ => return None,
            };
            Insn::Store {
                rs1: rs1(insn),
                rs2: rs2(insn),
                imm: imm_s(insn),
                memop,
            }
        }
        0x13 => {
            let (op, imm) = match f3 {
                0 => (AluOp::Add, imm_i(insn)),
                2 => (AluOp::Slt, imm_i(insn)),
                3 => (AluOp::Sltu, imm_i(insn)),
                4 => (AluOp::Xor, imm_i(insn)),
                6 => (AluOp::Or, imm_i(insn)),
                7 => (AluOp::And, imm_i(insn)),
                1 if insn >> 26 == 0 => (AluOp::Sll, ((insn >> 20) & 0x3f) as i64),
                5 if insn >> 26 == 0 => (AluOp::Srl, ((insn >> 20) & 0x3f) as i64),
                5 if insn >> 26 == 0x10 => (AluOp::Sra, ((insn >> 20) & 0x3f) as i64),
                _ => return None,
            };
            Insn::OpImm {
                op,
                rd: rd(insn),
                rs1: rs1(insn),
                imm,
            }
        }
        0x1b => {
            let (op, imm) = match (f3, f7) {
                (0, _) => (AluOp::Add, imm_i(insn)),
                (1, 0) => (AluOp::Sll, rs2(insn) as i64),
                (5, 0) => (AluOp::Srl, rs2(insn) as i64),
                (5, 0x20) => (AluOp::Sra, rs2(insn) as i64),
                _ => return None,
            };
            Insn::OpImm32 {
                op,
                rd: rd(insn),
                rs1: rs1(insn),
                imm,
            }
        }
        0x33 => {
            let op = match (f7, f3) {
                (0, 0) => AluOp::Add,
                (0x20, 0) => AluOp::Sub,
                (0, 1) => AluOp::Sll,
                (0, 2) => AluOp::Slt,
                (0, 3) => AluOp::Sltu,
                (0, 4) => AluOp::Xor,
                (0, 5) => AluOp::Srl,
                (0x20, 5) => AluOp::Sra,
                (0, 6) => AluOp::Or,
                (0, 7) => AluOp::And,
                (1, 0) => AluOp::Mul,
                (1, 1) => AluOp::Mulh,
                (1, 2) => AluOp::Mulhsu,
                (1, 3) => AluOp::Mulhu,
                (1, 4) => AluOp::Div,
                (1, 5) => AluOp::Divu,
                (1, 6) => AluOp::Rem,
                (1, 7) => AluOp::Remu,
                _ => return None,
            };
            Insn::Op {
                op,
                rd: rd(insn),
                rs1: rs1(insn),
                rs2: rs2(insn),
            }
        }
        0x3b => {
            let op = match (f7, f3) {
                (0, 0) => AluOp::Add,
                (0x20, 0) => AluOp::Sub,
                (0, 1) => AluOp::Sll,
                (0, 5) => AluOp::Srl,
                (0x20, 5) => AluOp::Sra,
                (1, 0) => AluOp::Mul,
                (1, 4) => AluOp::Div,
                (1, 5) => AluOp::Divu,
                (1, 6) => AluOp::Rem,
                (1, 7) => AluOp::Remu,
                _ => return None,
            };
            Insn::Op32 {
                op,
                rd: rd(insn),
                rs1: rs1(insn),
                rs2: rs2(insn),
            }
        }
        0x0f => match f3 {
            0 => Insn::Fence,
            1 => Insn::FenceI,
            _ => return None,
        },
        0x73 => match insn {
            0x0000_0073 => Insn::Ecall,
            0x0010_0073 => Insn::Ebreak,
            _ => return None,
        },
        _ => return None,
    })
}
