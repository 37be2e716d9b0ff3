use std::ptr;
use std::sync::atomic::Ordering;

use log::trace;
use smtcg_core::tb::exit::{TB_EXIT_IDX0, TB_EXIT_IDX1, TB_EXIT_NOCHAIN};
use smtcg_core::{Cond, MemOp, Opcode, Type};
use smtcg_mmu::{MmuAccessType, MmuFault, TARGET_PAGE_MASK, TARGET_PAGE_SIZE};

use super::{decode_link, LOC_GLOBAL, TCI_MOVI};
use crate::code_buffer::CodeBuffer;
use crate::{ExecEnv, TbExit};

struct Cursor<'a> {
    buf: &'a CodeBuffer,
    pos: usize,
}

impl Cursor<'_> {
    #[inline]
    fn u8(&mut self) -> u8 {
        let v = self.buf.read_u8(self.pos);
        self.pos += 1;
        v
    }

    #[inline]
    fn u16(&mut self) -> u16 {
        let v = self.buf.read_u16(self.pos);
        self.pos += 2;
        v
    }

    #[inline]
    fn u32(&mut self) -> u32 {
        let v = self.buf.read_u32(self.pos);
        self.pos += 4;
        v
    }

    #[inline]
    fn u64(&mut self) -> u64 {
        let v = self.buf.read_u64(self.pos);
        self.pos += 8;
        v
    }

    #[inline]
    fn cond(&mut self, at: usize) -> Cond {
        Cond::from_u8(self.u8()).unwrap_or_else(|| corrupt(at))
    }
}

#[cold]
fn corrupt(at: usize) -> ! {
    panic!("corrupt TCI bytecode at arena offset {at:#x}");
}

#[inline]
fn get(env: &ExecEnv<'_>, loc: u16) -> u64 {
    if loc & LOC_GLOBAL != 0 {
        env.regs[(loc & !LOC_GLOBAL) as usize]
    } else {
        env.frame[loc as usize]
    }
}

#[inline]
fn set(env: &mut ExecEnv<'_>, loc: u16, val: u64) {
    if loc & LOC_GLOBAL != 0 {
        env.regs[(loc & !LOC_GLOBAL) as usize] = val;
    } else {
        env.frame[loc as usize] = val;
    }
}

// Division never traps: x / 0 is all ones, x % 0 is x, and the
// signed overflow case wraps.
fn alu64(opc: Opcode, a: u64, b: u64) -> Option<u64> {
    Some(match opc {
        Opcode::Add => a.wrapping_add(b),
        Opcode::Sub => a.wrapping_sub(b),
        Opcode::Mul => a.wrapping_mul(b),
        Opcode::DivS if b == 0 => u64::MAX,
        Opcode::DivS => (a as i64).wrapping_div(b as i64) as u64,
        Opcode::DivU if b == 0 => u64::MAX,
        Opcode::DivU => a / b,
        Opcode::RemS if b == 0 => a,
        Opcode::RemS => (a as i64).wrapping_rem(b as i64) as u64,
        Opcode::RemU if b == 0 => a,
        Opcode::RemU => a % b,
        Opcode::MulSH => ((a as i64 as i128 * b as i64 as i128) >> 64) as u64,
        Opcode::MulUH => ((a as u128 * b as u128) >> 64) as u64,
        Opcode::And => a & b,
        Opcode::Or => a | b,
        Opcode::Xor => a ^ b,
        Opcode::Shl => a << (b & 63),
        Opcode::Shr => a >> (b & 63),
        Opcode::Sar => ((a as i64) >> (b & 63)) as u64,
        _ => return None,
    })
}

fn alu32(opc: Opcode, a: u32, b: u32) -> Option<u32> {
    Some(match opc {
        Opcode::Add => a.wrapping_add(b),
        Opcode::Sub => a.wrapping_sub(b),
        Opcode::Mul => a.wrapping_mul(b),
        Opcode::DivS if b == 0 => u32::MAX,
        Opcode::DivS => (a as i32).wrapping_div(b as i32) as u32,
        Opcode::DivU if b == 0 => u32::MAX,
        Opcode::DivU => a / b,
        Opcode::RemS if b == 0 => a,
        Opcode::RemS => (a as i32).wrapping_rem(b as i32) as u32,
        Opcode::RemU if b == 0 => a,
        Opcode::RemU => a % b,
        Opcode::MulSH => ((a as i32 as i64 * b as i32 as i64) >> 32) as u32,
        Opcode::MulUH => ((a as u64 * b as u64) >> 32) as u32,
        Opcode::And => a & b,
        Opcode::Or => a | b,
        Opcode::Xor => a ^ b,
        Opcode::Shl => a << (b & 31),
        Opcode::Shr => a >> (b & 31),
        Opcode::Sar => ((a as i32) >> (b & 31)) as u32,
        _ => return None,
    })
}

fn unary(opc: Opcode, ty: Type, s: u64) -> Option<u64> {
    Some(match opc {
        Opcode::Mov => ty.truncate(s),
        Opcode::ExtI32I64 => s as u32 as i32 as i64 as u64,
        Opcode::ExtrlI64I32 => s as u32 as u64,
        _ => return None,
    })
}

/// Whether the inline TLB compare may serve this access.
#[inline]
fn fast_path_ok(addr: u64, memop: MemOp) -> bool {
    let a_bits = memop.a_bits();
    let aligned = a_bits == 0 || addr & ((1u64 << a_bits) - 1) == 0;
    let in_page = (addr & !TARGET_PAGE_MASK) + memop.size_bytes() as u64 <= TARGET_PAGE_SIZE;
    aligned && in_page && !memop.is_big_endian()
}

fn guest_load(env: &mut ExecEnv<'_>, addr: u64, memop: MemOp, mmu: usize) -> Result<u64, MmuFault> {
    if fast_path_ok(addr, memop) {
        if let Some(host) = env.mem.tlb.lookup(mmu, addr, MmuAccessType::DataLoad) {
            let mut bytes = [0u8; 8];
            // SAFETY: the TLB entry maps the whole page to live RAM and
            // the access stays inside the page.
            unsafe { ptr::copy_nonoverlapping(host.as_ptr(), bytes.as_mut_ptr(), memop.size_bytes() as usize) };
            return Ok(memop.extend(u64::from_le_bytes(bytes)));
        }
    }
    env.mem.load(mmu, addr, memop)
}

fn guest_store(env: &mut ExecEnv<'_>, addr: u64, memop: MemOp, mmu: usize, val: u64) -> Result<(), MmuFault> {
    if fast_path_ok(addr, memop) {
        if let Some(host) = env.mem.tlb.lookup(mmu, addr, MmuAccessType::DataStore) {
            let bytes = val.to_le_bytes();
            // SAFETY: as in `guest_load`; a write entry without status
            // bits never maps a page holding translated code.
            unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), host.as_ptr(), memop.size_bytes() as usize) };
            return Ok(());
        }
    }
    env.mem.store(mmu, addr, memop, val)
}

/// Interpret from `host_offset` (the start of block `tb`) until
/// control leaves generated code.
pub(super) fn run(buf: &CodeBuffer, mut tb: usize, host_offset: usize, env: &mut ExecEnv<'_>) -> TbExit {
    let mut cur = Cursor { buf, pos: host_offset };
    loop {
        let at = cur.pos;
        let opc_byte = cur.u8();
        let ty = Type::from_u8(cur.u8()).unwrap_or_else(|| corrupt(at));
        if opc_byte == TCI_MOVI {
            let d = cur.u16();
            let v = cur.u64();
            set(env, d, v);
            continue;
        }
        let opc = Opcode::from_u8(opc_byte).unwrap_or_else(|| corrupt(at));
        match opc {
            Opcode::Mov | Opcode::ExtI32I64 | Opcode::ExtrlI64I32 => {
                let d = cur.u16();
                let s = get(env, cur.u16());
                let v = unary(opc, ty, s).unwrap_or_else(|| corrupt(at));
                set(env, d, v);
            }
            Opcode::SetCond => {
                let d = cur.u16();
                let a = get(env, cur.u16());
                let b = get(env, cur.u16());
                let cond = cur.cond(at);
                set(env, d, cond.eval(ty, a, b) as u64);
            }
            Opcode::QemuLd => {
                let d = cur.u16();
                let addr = get(env, cur.u16());
                let memop = MemOp(cur.u16());
                let mmu = cur.u8() as usize;
                match guest_load(env, addr, memop, mmu) {
                    Ok(v) => set(env, d, ty.truncate(v)),
                    Err(fault) => return TbExit::Fault { tb, host_pc: at, fault },
                }
            }
            Opcode::QemuSt => {
                let val = get(env, cur.u16());
                let addr = get(env, cur.u16());
                let memop = MemOp(cur.u16());
                let mmu = cur.u8() as usize;
                if let Err(fault) = guest_store(env, addr, memop, mmu, val) {
                    return TbExit::Fault { tb, host_pc: at, fault };
                }
                if env.mem.code_modified {
                    env.mem.code_modified = false;
                    return TbExit::CodeModified { tb, host_pc: at };
                }
            }
            Opcode::BrCond => {
                let a = get(env, cur.u16());
                let b = get(env, cur.u16());
                let cond = cur.cond(at);
                let target = cur.u32() as usize;
                if cond.eval(ty, a, b) {
                    cur.pos = target;
                }
            }
            Opcode::GotoTb => {
                let _slot = cur.u8();
                cur.pos = (cur.pos + 7) & !7;
                let word = buf.link(cur.pos).load(Ordering::Acquire);
                cur.pos += 8;
                if let Some((dst, dst_off)) = decode_link(word) {
                    trace!("tci chain tb {tb} -> {dst}");
                    tb = dst;
                    cur.pos = dst_off;
                }
            }
            Opcode::ExitTb => {
                let val = cur.u32();
                return match val {
                    TB_EXIT_IDX0 | TB_EXIT_IDX1 => TbExit::Chain {
                        tb,
                        slot: val as usize,
                    },
                    TB_EXIT_NOCHAIN => TbExit::NoChain { tb },
                    excp => TbExit::Exception { tb, excp },
                };
            }
            Opcode::ExitCheck => {
                let icount = cur.u16() as u64;
                if env.exit_request.load(Ordering::Acquire) {
                    return TbExit::Requested { tb };
                }
                if let Some(budget) = env.budget {
                    if budget == 0 {
                        return TbExit::BudgetExhausted { tb };
                    }
                    env.budget = Some(budget.saturating_sub(icount));
                }
                env.executed += icount;
            }
            Opcode::SetLabel | Opcode::Nop | Opcode::InsnStart | Opcode::Count => corrupt(at),
            _ => {
                let d = cur.u16();
                let a = get(env, cur.u16());
                let b = get(env, cur.u16());
                let v = match ty {
                    Type::I64 => alu64(opc, a, b),
                    Type::I32 => alu32(opc, a as u32, b as u32).map(u64::from),
                }
                .unwrap_or_else(|| corrupt(at));
                set(env, d, v);
            }
        }
    }
}
