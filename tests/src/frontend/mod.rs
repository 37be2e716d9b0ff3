//! RV64IM decoding, block shape and single-block execution tests.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use smtcg_backend::tci::MAX_FRAME_SLOTS;
use smtcg_backend::{CodeBuffer, ExecEnv, HostCodeGen, TbExit, TciCodeGen};
use smtcg_core::tb::cflags::CF_NO_GOTO_TB;
use smtcg_core::tb::exit::{EXCP_EBREAK, EXCP_ECALL};
use smtcg_core::{Context, MemOp};
use smtcg_frontend::riscv::cpu::{CAUSE_LOAD_PAGE_FAULT, PC_SLOT};
use smtcg_frontend::riscv::decode::{decode, AluOp, Insn};
use smtcg_frontend::{
    FaultAction, GuestBlock, GuestCpu, GuestFault, GuestFrontend, RiscvCpu, RiscvFrontend, TranslateError,
};
use smtcg_mmu::{CpuTlb, GuestMemory, MemAccess, MemoryMap, MmuAccessType, MmuFault, NoSmc, PageFlags};

use crate::rv::*;

fn image_fetch(base: u64, code: Vec<u8>) -> impl FnMut(u64, u32) -> Result<u64, MmuFault> {
    move |pc, size| {
        let n = size as usize;
        let off = pc
            .checked_sub(base)
            .map(|o| o as usize)
            .filter(|&o| o + n <= code.len())
            .ok_or(MmuFault::Unmapped {
                addr: pc,
                access: MmuAccessType::InstFetch,
            })?;
        let mut b = [0u8; 8];
        b[..n].copy_from_slice(&code[off..off + n]);
        Ok(u64::from_le_bytes(b))
    }
}

fn shape(pc: u64, cflags: u32, insns: &[u32]) -> Result<GuestBlock, TranslateError> {
    let fe = RiscvFrontend;
    let mut ir = Context::new();
    fe.init_context(&mut ir);
    let mut fetch = image_fetch(pc, assemble(insns));
    fe.translate(&mut ir, pc, 0, cflags, &mut fetch)
}

// ── Decoding ────────────────────────────────────────────────

#[test]
fn test_decode_basic_forms() {
    assert_eq!(
        decode(addi(5, 6, -3)),
        Some(Insn::OpImm {
            op: AluOp::Add,
            rd: 5,
            rs1: 6,
            imm: -3
        })
    );
    assert_eq!(decode(lui(1, 0x12345000)), Some(Insn::Lui { rd: 1, imm: 0x12345000 }));
    assert_eq!(decode(jal(1, -8)), Some(Insn::Jal { rd: 1, imm: -8 }));
    assert_eq!(
        decode(sd(3, 2, -16)),
        Some(Insn::Store {
            rs1: 2,
            rs2: 3,
            imm: -16,
            memop: MemOp::uq()
        })
    );
    assert_eq!(decode(ECALL), Some(Insn::Ecall));
    assert_eq!(decode(EBREAK), Some(Insn::Ebreak));
    assert_eq!(decode(FENCE_I), Some(Insn::FenceI));
    assert!(matches!(decode(mul(1, 2, 3)), Some(Insn::Op { op: AluOp::Mul, .. })));
    assert!(matches!(decode(sllw(1, 2, 3)), Some(Insn::Op32 { op: AluOp::Sll, .. })));
}

#[test]
fn test_decode_rejects_compressed_and_unknown() {
    assert_eq!(decode(0x0000_4501), None);
    assert_eq!(decode(0), None);
    assert_eq!(decode(0xffff_ffff), None);
}

// ── Block shape ─────────────────────────────────────────────

#[test]
fn test_block_ends_at_ecall() {
    let b = shape(0x1000, 0, &[addi(1, 0, 1), addi(2, 0, 2), ECALL, addi(3, 0, 3)]).unwrap();
    assert_eq!(b, GuestBlock { pc: 0x1000, size: 12, icount: 3 });
}

#[test]
fn test_block_respects_max_insns() {
    let b = shape(0x1000, 2, &[NOP, NOP, NOP, NOP]).unwrap();
    assert_eq!((b.size, b.icount), (8, 2));
    let b = shape(0x1000, CF_NO_GOTO_TB | 1, &[NOP, NOP]).unwrap();
    assert_eq!(b.icount, 1);
}

#[test]
fn test_block_stops_at_page_end() {
    let b = shape(0xff8, 0, &[NOP; 6]).unwrap();
    assert_eq!((b.size, b.icount), (8, 2));
}

#[test]
fn test_first_insn_decode_trap() {
    assert_eq!(
        shape(0x1000, 0, &[0xffff_ffff]),
        Err(TranslateError::DecodeTrap {
            pc: 0x1000,
            reason: "unsupported encoding 0xffffffff".into()
        })
    );
}

#[test]
fn test_later_decode_failure_ends_block() {
    let b = shape(0x1000, 0, &[NOP, NOP, 0xffff_ffff]).unwrap();
    assert_eq!(b.icount, 2);
}

#[test]
fn test_fetch_faults() {
    assert_eq!(
        shape(0x2000, 0, &[]),
        Err(TranslateError::Fetch {
            pc: 0x2000,
            fault: MmuFault::Unmapped {
                addr: 0x2000,
                access: MmuAccessType::InstFetch
            }
        })
    );
    assert!(matches!(
        shape(0x1002, 0, &[NOP]),
        Err(TranslateError::Fetch {
            fault: MmuFault::Unaligned { .. },
            ..
        })
    ));
    // A fetch fault past the first instruction just ends the block.
    let b = shape(0x1000, 0, &[NOP]).unwrap();
    assert_eq!(b.icount, 1);
}

// ── Single-block execution ──────────────────────────────────

struct Rig {
    _space: Arc<GuestMemory>,
    mem: MemoryMap,
    tlb: CpuTlb,
    buf: CodeBuffer,
    frame: Vec<u64>,
    exit: AtomicBool,
}

impl Rig {
    fn new() -> Self {
        let space = Arc::new(GuestMemory::new(0x10000).unwrap());
        space.map_ram(0, 0x10000, 0).unwrap();
        let mem = MemoryMap::new(space.clone());
        mem.pages_mut()
            .set_flags(0x8000, 0x10000, PageFlags::VALID | PageFlags::RW | PageFlags::USER).unwrap();
        Self {
            _space: space,
            mem,
            tlb: CpuTlb::new(2, 8),
            buf: CodeBuffer::new(1 << 16).unwrap(),
            frame: vec![0; MAX_FRAME_SLOTS],
            exit: AtomicBool::new(false),
        }
    }

    /// Translate the block at `cpu.pc` from `insns` and run it once.
    fn run(&mut self, cpu: &mut RiscvCpu, insns: &[u32]) -> TbExit {
        let pc = cpu.get_pc();
        let fe = RiscvFrontend;
        let mut ir = Context::new();
        fe.init_context(&mut ir);
        let mut fetch = image_fetch(pc, assemble(insns));
        fe.translate(&mut ir, pc, cpu.get_flags(), 0, &mut fetch).unwrap();
        let out = smtcg_backend::translate(&mut ir, pc, &TciCodeGen, &self.buf).unwrap();
        let mut env = ExecEnv {
            regs: cpu.regs_mut(),
            mem: MemAccess::new(&mut self.tlb, &self.mem, &NoSmc),
            exit_request: &self.exit,
            budget: None,
            executed: 0,
            frame: &mut self.frame,
        };
        TciCodeGen.exec(&self.buf, 0, out.host_offset, &mut env)
    }
}

#[test]
fn test_alu_semantics() {
    let mut rig = Rig::new();
    let mut cpu = RiscvCpu::new(0x1000);
    let exit = rig.run(
        &mut cpu,
        &[
            addi(1, 0, 7),
            addi(2, 0, -3),
            mul(3, 1, 2),
            div(4, 1, 0),
            remu(5, 1, 0),
            slt(6, 2, 1),
            addi(0, 0, 99),
            lui(7, 0x7fff_f000),
            addiw(8, 7, 0x7ff),
            addiw(8, 8, 0x7ff),
            addiw(8, 8, 0x7ff),
            addi(9, 0, 1),
            sllw(9, 9, 1),
            slli(10, 9, 32),
            ECALL,
        ],
    );
    assert_eq!(exit, TbExit::Exception { tb: 0, excp: EXCP_ECALL });
    assert_eq!(cpu.gpr(3), (-21i64) as u64);
    assert_eq!(cpu.gpr(4), u64::MAX);
    assert_eq!(cpu.gpr(5), 7);
    assert_eq!(cpu.gpr(6), 1);
    assert_eq!(cpu.gpr(0), 0);
    assert_eq!(cpu.gpr(8), 0xffff_ffff_8000_07fd);
    assert_eq!(cpu.gpr(9), 0x80);
    assert_eq!(cpu.gpr(10), 0x80 << 32);
    // The exception pc names the ecall itself.
    assert_eq!(cpu.get_pc(), 0x1000 + 14 * 4);
}

#[test]
fn test_loads_and_stores() {
    let mut rig = Rig::new();
    let mut cpu = RiscvCpu::new(0x1000);
    cpu.set_gpr(1, 0x8000);
    cpu.set_gpr(2, 0x1122_3344_5566_77f8);
    let exit = rig.run(
        &mut cpu,
        &[sd(2, 1, 8), ld(3, 1, 8), lw(4, 1, 12), lbu(5, 1, 8), sb(0, 1, 9), ld(6, 1, 8), EBREAK],
    );
    assert_eq!(exit, TbExit::Exception { tb: 0, excp: EXCP_EBREAK });
    assert_eq!(cpu.gpr(3), 0x1122_3344_5566_77f8);
    assert_eq!(cpu.gpr(4), 0x1122_3344);
    assert_eq!(cpu.gpr(5), 0xf8);
    assert_eq!(cpu.gpr(6), 0x1122_3344_5566_00f8);
}

#[test]
fn test_load_fault_reaches_cpu() {
    let mut rig = Rig::new();
    let mut cpu = RiscvCpu::new(0x1000);
    let exit = rig.run(&mut cpu, &[addi(1, 0, 0x100), ld(2, 1, 0), ECALL]);
    let TbExit::Fault { fault, .. } = exit else {
        panic!("expected a fault, got {exit:?}");
    };
    let fault = GuestFault::from(fault);
    assert_eq!(cpu.on_fault(0x1004, &fault), FaultAction::Exit);

    cpu.stvec = 0x4000;
    assert_eq!(cpu.on_fault(0x1004, &fault), FaultAction::Continue);
    assert_eq!((cpu.sepc, cpu.scause, cpu.stval), (0x1004, CAUSE_LOAD_PAGE_FAULT, 0x100));
    assert_eq!(cpu.get_pc(), 0x4000);
}

#[test]
fn test_jumps_and_links() {
    let mut rig = Rig::new();

    // Same-page jal chains through slot 0.
    let mut cpu = RiscvCpu::new(0x1000);
    let exit = rig.run(&mut cpu, &[jal(1, 0x40)]);
    assert_eq!(exit, TbExit::Chain { tb: 0, slot: 0 });
    assert_eq!((cpu.gpr(1), cpu.get_pc()), (0x1004, 0x1040));

    // Cross-page jal cannot chain.
    let mut cpu = RiscvCpu::new(0x1000);
    let exit = rig.run(&mut cpu, &[jal(0, 0x1000)]);
    assert_eq!(exit, TbExit::NoChain { tb: 0 });
    assert_eq!(cpu.get_pc(), 0x2000);

    // jalr clears bit 0 and always exits indirectly.
    let mut cpu = RiscvCpu::new(0x1000);
    cpu.set_gpr(5, 0x3001);
    let exit = rig.run(&mut cpu, &[jalr(1, 5, 4)]);
    assert_eq!(exit, TbExit::NoChain { tb: 0 });
    assert_eq!((cpu.gpr(1), cpu.regs[PC_SLOT]), (0x1004, 0x3004));
}

#[test]
fn test_branch_exits_by_direction() {
    let mut rig = Rig::new();
    let mut cpu = RiscvCpu::new(0x1000);
    cpu.set_gpr(1, 1);
    let exit = rig.run(&mut cpu, &[beq(1, 0, 0x20)]);
    assert_eq!(exit, TbExit::Chain { tb: 0, slot: 0 });
    assert_eq!(cpu.get_pc(), 0x1004);

    let mut cpu = RiscvCpu::new(0x1000);
    cpu.set_gpr(1, 1);
    let exit = rig.run(&mut cpu, &[bne(1, 0, 0x20)]);
    assert_eq!(exit, TbExit::Chain { tb: 0, slot: 1 });
    assert_eq!(cpu.get_pc(), 0x1020);
}

#[test]
fn test_fence_i_ends_block() {
    let mut rig = Rig::new();
    let mut cpu = RiscvCpu::new(0x1000);
    let exit = rig.run(&mut cpu, &[addi(1, 0, 1), FENCE_I, addi(1, 0, 2)]);
    assert_eq!(exit, TbExit::NoChain { tb: 0 });
    assert_eq!((cpu.gpr(1), cpu.get_pc()), (1, 0x1008));
}
