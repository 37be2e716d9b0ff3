use log::trace;
use smtcg_core::{Context, Op, Opcode, TempIdx, TempKind, Type};

use super::{LOC_GLOBAL, MAX_FRAME_SLOTS, TCI_MOVI};
use crate::code_buffer::{CodeBuffer, CodeWriter};
use crate::{CodeGenError, LoweredTb};

fn loc(ctx: &Context, idx: TempIdx) -> u16 {
    let t = ctx.temp(idx);
    match t.kind {
        TempKind::Global => {
            assert!(t.slot < LOC_GLOBAL as u32, "register slot {} out of range", t.slot);
            LOC_GLOBAL | t.slot as u16
        }
        _ => idx.0 as u16,
    }
}

fn header(w: &mut CodeWriter<'_>, op: &Op) {
    w.emit_u8(op.opc as u8);
    w.emit_u8(op.op_type as u8);
}

fn emit_locs(w: &mut CodeWriter<'_>, ctx: &Context, args: &[TempIdx]) {
    for &a in args {
        w.emit_u16(loc(ctx, a));
    }
}

/// Emit a branch target for `label_id`, recording a relocation when
/// the label is not placed yet.
fn emit_label_ref(w: &mut CodeWriter<'_>, ctx: &mut Context, label_id: u32) {
    let label = ctx.label_mut(label_id);
    match label.offset {
        Some(off) => w.emit_u32(off as u32),
        None => {
            label.pending.push(w.offset());
            w.emit_u32(0);
        }
    }
}

fn insn_end(w: &CodeWriter<'_>) -> u32 {
    (w.offset() - w.start()) as u32
}

/// Lower a complete block into the arena.
pub(super) fn lower(ctx: &mut Context, buf: &CodeBuffer) -> Result<LoweredTb, CodeGenError> {
    let nb_temps = ctx.nb_temps() as usize;
    if nb_temps > MAX_FRAME_SLOTS {
        return Err(CodeGenError::TooManyTemps(nb_temps));
    }

    let mut w = buf.writer();
    let mut jmp_link_offset = [None; 2];
    ctx.insn_pcs.clear();
    ctx.insn_ends.clear();

    // Constants are materialized once, at block entry.
    let consts: Vec<(u16, u64)> = ctx.consts().map(|t| (t.idx.0 as u16, t.val)).collect();
    for (slot, val) in consts {
        w.emit_u8(TCI_MOVI);
        w.emit_u8(Type::I64 as u8);
        w.emit_u16(slot);
        w.emit_u64(val);
    }

    for i in 0..ctx.num_ops() {
        let op = ctx.ops()[i].clone();
        match op.opc {
            Opcode::Nop => {}
            Opcode::InsnStart => {
                let pc = ((op.carg(1) as u64) << 32) | op.carg(0) as u64;
                if !ctx.insn_pcs.is_empty() {
                    let end = insn_end(&w);
                    ctx.insn_ends.push(end);
                }
                ctx.insn_pcs.push(pc);
            }
            Opcode::SetLabel => {
                let off = w.offset();
                for at in ctx.label_mut(op.carg(0)).place(off) {
                    w.patch_u32(at, off as u32);
                }
            }
            Opcode::BrCond => {
                header(&mut w, &op);
                emit_locs(&mut w, ctx, op.iargs());
                w.emit_u8(op.carg(0) as u8);
                emit_label_ref(&mut w, ctx, op.carg(1));
            }
            Opcode::GotoTb => {
                let slot = op.carg(0) as usize;
                assert!(slot < 2, "goto_tb slot {slot}");
                header(&mut w, &op);
                w.emit_u8(slot as u8);
                w.align(8);
                jmp_link_offset[slot] = Some(w.offset() as u32);
                w.emit_u64(0);
            }
            Opcode::ExitTb => {
                header(&mut w, &op);
                w.emit_u32(op.carg(0));
            }
            Opcode::ExitCheck => {
                header(&mut w, &op);
                w.emit_u16(op.carg(0) as u16);
            }
            Opcode::QemuLd | Opcode::QemuSt => {
                header(&mut w, &op);
                if op.opc == Opcode::QemuLd {
                    emit_locs(&mut w, ctx, op.oargs());
                }
                emit_locs(&mut w, ctx, op.iargs());
                w.emit_u16(op.carg(0) as u16);
                w.emit_u8(op.carg(1) as u8);
            }
            Opcode::SetCond => {
                header(&mut w, &op);
                emit_locs(&mut w, ctx, op.oargs());
                emit_locs(&mut w, ctx, op.iargs());
                w.emit_u8(op.carg(0) as u8);
            }
            Opcode::Count => return Err(CodeGenError::UnsupportedOp(op.opc.name())),
            _ => {
                header(&mut w, &op);
                emit_locs(&mut w, ctx, op.oargs());
                emit_locs(&mut w, ctx, op.iargs());
            }
        }
    }

    if !ctx.insn_pcs.is_empty() {
        let end = insn_end(&w);
        ctx.insn_ends.push(end);
    }
    for label in ctx.labels() {
        assert!(!label.is_dangling(), "label L{} used but never placed", label.id);
    }

    let (start, end) = w.commit()?;
    trace!(
        "tci lowered {} ops into {:#x}..{:#x} ({} insns)",
        ctx.num_ops(),
        start,
        end,
        ctx.insn_pcs.len()
    );
    Ok(LoweredTb {
        host_offset: start,
        host_size: end - start,
        jmp_link_offset,
    })
}
