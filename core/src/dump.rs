//! Human-readable text output for IR ops, in the spirit of QEMU's
//! `tcg_dump_ops()` (`-d op`).

use std::fmt::{self, Write};

use crate::context::Context;
use crate::op::Op;
use crate::opcode::Opcode;
use crate::temp::{TempIdx, TempKind};
use crate::types::{Cond, MemOp, Type};

fn cond_name(c: u32) -> &'static str {
    match Cond::from_u8(c as u8) {
        Some(Cond::Never) => "never",
        Some(Cond::Always) => "always",
        Some(Cond::Eq) => "eq",
        Some(Cond::Ne) => "ne",
        Some(Cond::Lt) => "lt",
        Some(Cond::Ge) => "ge",
        Some(Cond::Le) => "le",
        Some(Cond::Gt) => "gt",
        Some(Cond::Ltu) => "ltu",
        Some(Cond::Geu) => "geu",
        Some(Cond::Leu) => "leu",
        Some(Cond::Gtu) => "gtu",
        Some(Cond::TstEq) => "tsteq",
        Some(Cond::TstNe) => "tstne",
        None => "???",
    }
}

fn memop_name(m: MemOp) -> String {
    let sign = if m.is_signed() { "s" } else { "u" };
    let size = ["b", "w", "l", "q"][m.size() as usize];
    let end = if m.is_big_endian() { "be" } else { "le" };
    if m.a_bits() > 0 {
        format!("{end}{sign}{size}+al{}", 1u32 << m.a_bits())
    } else {
        format!("{end}{sign}{size}")
    }
}

fn fmt_temp(ctx: &Context, idx: TempIdx, w: &mut impl Write) -> fmt::Result {
    let i = idx.0 as usize;
    let t = ctx.temp(idx);
    match t.kind {
        TempKind::Const => write!(w, "$0x{:x}", t.val),
        TempKind::Global => match t.name {
            Some(name) => w.write_str(name),
            None => write!(w, "g{i}"),
        },
        TempKind::Local => write!(w, "tmp{}", i as u32 - ctx.nb_globals()),
    }
}

fn op_name(op: &Op) -> String {
    let name = op.opc.name();
    if op.opc.is_int_polymorphic() {
        let suffix = match op.op_type {
            Type::I32 => "_i32",
            Type::I64 => "_i64",
        };
        format!("{name}{suffix}")
    } else {
        name.to_string()
    }
}

/// Dump all IR ops in `ctx` to the given writer.
pub fn dump_ops(ctx: &Context, w: &mut impl Write) -> fmt::Result {
    for op in ctx.ops() {
        match op.opc {
            Opcode::InsnStart => {
                let pc = ((op.carg(1) as u64) << 32) | op.carg(0) as u64;
                writeln!(w, " ---- 0x{pc:016x}")?;
                continue;
            }
            Opcode::SetLabel => {
                writeln!(w, " L{}:", op.carg(0))?;
                continue;
            }
            _ => {}
        }

        write!(w, " {}", op_name(op))?;
        let mut first = true;
        for &a in op.oargs().iter().chain(op.iargs()) {
            w.write_str(if first { " " } else { ", " })?;
            first = false;
            fmt_temp(ctx, a, w)?;
        }
        let sep = if first { " " } else { ", " };
        match op.opc {
            Opcode::BrCond => write!(w, "{sep}{}, L{}", cond_name(op.carg(0)), op.carg(1))?,
            Opcode::SetCond => write!(w, "{sep}{}", cond_name(op.carg(0)))?,
            Opcode::QemuLd | Opcode::QemuSt => write!(
                w,
                "{sep}{}, mmu{}",
                memop_name(MemOp(op.carg(0) as u16)),
                op.carg(1)
            )?,
            _ => {
                for (i, &c) in op.cargs().iter().enumerate() {
                    w.write_str(if first && i == 0 { " " } else { ", " })?;
                    write!(w, "$0x{:x}", c.0)?;
                }
            }
        }
        writeln!(w)?;
    }
    Ok(())
}

/// Render the op stream into a fresh string, for logging.
pub fn dump_to_string(ctx: &Context) -> String {
    let mut s = String::with_capacity(ctx.num_ops() * 24);
    // Writing into a String cannot fail.
    let _ = dump_ops(ctx, &mut s);
    s
}
