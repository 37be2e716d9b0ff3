//! Per-vCPU dispatcher: find or translate the block at the guest pc,
//! run it, chain it to its successor and report why it stopped.
//!
//! Reference: `~/qemu/accel/tcg/cpu-exec.c`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, trace};
use smtcg_backend::tci::MAX_FRAME_SLOTS;
use smtcg_backend::{translate, CodeGenError, ExecEnv, TbExit};
use smtcg_core::tb::cflags::{CF_NO_GOTO_TB, CF_SINGLE_STEP};
use smtcg_core::{Context, JumpCache, TranslationBlock};
use smtcg_frontend::{FaultAction, GuestCpu, GuestFault};
use smtcg_mmu::{CpuTlb, MemAccess};

use crate::cpu::{CpuWork, VCpu};
use crate::exclusive::ExecSection;
use crate::fetch::CodeFetch;
use crate::stats::ExecStats;
use crate::tb_store::TbInsert;
use crate::Engine;

/// Why the dispatcher returned to its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// A block ran to completion; keep going.
    Normal,
    /// Guest exception raised by generated code (`ecall`, `ebreak`).
    Exception(u32),
    /// A fault the CPU model asked to see (`FaultAction::Exit`).
    Fault(GuestFault),
    /// Interrupts pending that the CPU model did not take.
    Interrupt(u32),
    /// Another thread called [`VCpu::kick`].
    Kicked,
    /// Another thread called [`VCpu::request_stop`].
    Stopped,
    /// About to execute a debugger breakpoint at this pc.
    Breakpoint(u64),
    /// One instruction executed in single-step mode.
    SingleStep,
    /// The instruction budget ran out; the pc is at the next block.
    BudgetExhausted,
    /// The vCPU is halted.
    Halted,
}

/// How the previous block left generated code, for linking it to the
/// block that runs next.
#[derive(Debug, Clone, Copy)]
enum LastExit {
    Chain(usize, usize),
    Indirect(usize),
}

enum GenError {
    /// Arena or TB slab exhausted.
    Full,
    Fault(GuestFault),
}

/// Drives one vCPU. Owns the thread-private state: the TLB, the jump
/// cache, the IR context and the temp frame.
pub struct Dispatcher {
    engine: Arc<Engine>,
    vcpu: VCpu,
    tlb: CpuTlb,
    jump_cache: JumpCache,
    ir: Context,
    frame: Vec<u64>,
    stats: ExecStats,
    flush_seen: u32,
    last_exit: Option<LastExit>,
    /// Breakpoint reported last; execution resumes past it once.
    last_bp: Option<u64>,
    budget: Option<u64>,
}

impl Dispatcher {
    /// Create a vCPU bound to `engine` and register it.
    pub fn new(engine: Arc<Engine>) -> Self {
        let cfg = engine.config();
        let tlb = CpuTlb::new(cfg.nb_mmu_modes, cfg.tlb_bits);
        let vcpu = VCpu::new(engine.alloc_cpu_index(), Arc::clone(tlb.shared()));
        let mut ir = Context::new();
        engine.frontend().init_context(&mut ir);
        engine.exclusive().register(vcpu.clone());
        debug!("vcpu {} created", vcpu.index());
        Self {
            flush_seen: engine.flush_count(),
            engine,
            vcpu,
            tlb,
            jump_cache: JumpCache::new(),
            ir,
            frame: vec![0; MAX_FRAME_SLOTS],
            stats: ExecStats::default(),
            last_exit: None,
            last_bp: None,
            budget: None,
        }
    }

    pub fn vcpu(&self) -> &VCpu {
        &self.vcpu
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn stats(&self) -> ExecStats {
        let mut stats = self.stats;
        stats.tlb = self.tlb.stats;
        stats
    }

    /// Bound the number of guest instructions executed; `None` runs
    /// without limit. Checked at block entry, so a block that starts
    /// with budget left runs to its end.
    pub fn set_budget(&mut self, budget: Option<u64>) {
        self.budget = budget;
    }

    pub fn budget(&self) -> Option<u64> {
        self.budget
    }

    pub fn tlb(&self) -> &CpuTlb {
        &self.tlb
    }

    /// Run blocks until something other than `Normal` happens.
    pub fn cpu_exec(&mut self, cpu: &mut dyn GuestCpu) -> ExitReason {
        loop {
            let reason = self.run_one_iteration(cpu);
            if reason != ExitReason::Normal {
                return reason;
            }
        }
    }

    /// Handle pending requests, then find and run one block (plus any
    /// blocks chained from it).
    pub fn run_one_iteration(&mut self, cpu: &mut dyn GuestCpu) -> ExitReason {
        let engine = Arc::clone(&self.engine);
        if let Some(reason) = self.handle_boundary(cpu) {
            self.last_exit = None;
            return reason;
        }
        let mut last_exit = self.last_exit.take();

        let pc = cpu.get_pc();
        if engine.has_breakpoint(pc) && self.last_bp != Some(pc) {
            self.last_bp = Some(pc);
            debug!("vcpu {} breakpoint at {pc:#x}", self.vcpu.index());
            return ExitReason::Breakpoint(pc);
        }
        self.last_bp = None;

        let single_step = self.vcpu.single_step();
        let flags = cpu.get_flags();
        let cflags = if single_step {
            CF_SINGLE_STEP | CF_NO_GOTO_TB | 1
        } else if engine.page_has_breakpoint(pc) {
            1
        } else {
            engine.config().max_insns
        };

        let mut section = engine.exclusive().exec_section(&self.vcpu);
        // No flush can start from here until the section ends, but one
        // may have finished since the previous block left.
        if self.sync_flush(engine.flush_count()) {
            last_exit = None;
        }
        let reason = match self.tb_find(cpu, pc, flags, cflags, last_exit, &mut section) {
            Ok(idx) => self.cpu_tb_exec(&engine, cpu, idx),
            Err(fault) => self.deliver_fault(cpu, pc, fault),
        };
        drop(section);

        if single_step && reason == ExitReason::Normal {
            ExitReason::SingleStep
        } else {
            reason
        }
    }

    /// Catch up with the engine's flush count. Returns true if a flush
    /// happened since the last call.
    fn sync_flush(&mut self, count: u32) -> bool {
        if count == self.flush_seen {
            return false;
        }
        self.flush_seen = count;
        self.jump_cache.invalidate();
        self.last_exit = None;
        self.stats.flushes += 1;
        true
    }

    /// Stop, kick, queued work, halt and interrupts, checked before
    /// every block.
    fn handle_boundary(&mut self, cpu: &mut dyn GuestCpu) -> Option<ExitReason> {
        if self.vcpu.0.exit_request.swap(false, Ordering::AcqRel) {
            for work in self.vcpu.take_work() {
                self.run_work(work);
            }
        }
        if self.vcpu.is_stop_requested() {
            return Some(ExitReason::Stopped);
        }
        if self.vcpu.take_kick() {
            return Some(ExitReason::Kicked);
        }
        if self.vcpu.is_halted() {
            return Some(ExitReason::Halted);
        }
        let pending = self.vcpu.interrupt_request();
        if pending != 0 {
            if cpu.on_interrupt_pending(pending) {
                return Some(ExitReason::Interrupt(pending));
            }
            self.vcpu.reset_interrupt(pending);
            // The pc moved to the trap vector: not a successor.
            self.last_exit = None;
        }
        None
    }

    fn run_work(&mut self, work: CpuWork) {
        trace!("vcpu {} work {work:?}", self.vcpu.index());
        match work {
            CpuWork::TlbFlush => self.tlb.flush(),
            CpuWork::TlbFlushByMode(mask) => {
                for mode in 0..self.tlb.nb_modes() {
                    if mask & (1 << mode) != 0 {
                        self.tlb.flush_mode(mode);
                    }
                }
            }
            CpuWork::TlbFlushPage(addr) => self.tlb.flush_page(addr),
            CpuWork::TlbFlushRange(start, end) => self.tlb.invalidate_range(start, end),
            CpuWork::JumpCacheFlush => self.jump_cache.invalidate(),
            CpuWork::Run(f) => f(&mut self.tlb),
        }
    }

    /// Jump cache, then the shared hash table, then translation.
    fn tb_find(
        &mut self,
        cpu: &mut dyn GuestCpu,
        pc: u64,
        flags: u32,
        cflags: u32,
        last_exit: Option<LastExit>,
        section: &mut ExecSection<'_>,
    ) -> Result<usize, GuestFault> {
        let engine = Arc::clone(&self.engine);
        let tbs = engine.tb_store();
        let generation = self.flush_seen;

        let mut found = None;
        if let Some(LastExit::Indirect(src)) = last_exit {
            let target = tbs.get(src).jmp.lock().exit_target;
            if let Some(dst) = target.filter(|&d| tbs.get(d).matches(pc, flags, cflags)) {
                self.stats.jc_hits += 1;
                found = Some(dst);
            }
        }
        if found.is_none() {
            if let Some(idx) = self.jump_cache.lookup(pc).filter(|&i| tbs.get(i).matches(pc, flags, cflags)) {
                self.stats.jc_hits += 1;
                found = Some(idx);
            } else if let Some(idx) = engine.tb_lookup(pc, flags, cflags) {
                self.stats.hash_hits += 1;
                found = Some(idx);
            }
        }
        let idx = match found {
            Some(idx) => idx,
            None => self.tb_gen_code_retry(cpu, pc, flags, cflags, section)?,
        };
        self.jump_cache.insert(pc, idx);

        // A flush in tb_gen_code_retry freed the block `last_exit` names.
        if self.flush_seen == generation {
            match last_exit {
                Some(LastExit::Chain(src, slot)) if !engine.page_has_breakpoint(pc) => {
                    if engine.tb_add_jump(src, slot, idx) {
                        self.stats.chain_links += 1;
                    }
                }
                Some(LastExit::Indirect(src)) => tbs.get(src).jmp.lock().exit_target = Some(idx),
                _ => {}
            }
        }
        Ok(idx)
    }

    /// Translate, flushing the code cache once if it is full.
    fn tb_gen_code_retry(
        &mut self,
        cpu: &mut dyn GuestCpu,
        pc: u64,
        flags: u32,
        cflags: u32,
        section: &mut ExecSection<'_>,
    ) -> Result<usize, GuestFault> {
        let engine = Arc::clone(&self.engine);
        let observed = self.flush_seen;
        match self.tb_gen_code(cpu, pc, flags, cflags) {
            Ok(idx) => return Ok(idx),
            Err(GenError::Fault(f)) => return Err(f),
            Err(GenError::Full) => {}
        }

        section.suspend(|| engine.tb_flush_exhausted(observed));
        self.sync_flush(engine.flush_count());

        match self.tb_gen_code(cpu, pc, flags, cflags) {
            Ok(idx) => Ok(idx),
            Err(GenError::Fault(f)) => Err(f),
            Err(GenError::Full) => panic!("block at {pc:#x} does not fit in an empty code cache"),
        }
    }

    fn tb_gen_code(
        &mut self,
        cpu: &mut dyn GuestCpu,
        pc: u64,
        flags: u32,
        cflags: u32,
    ) -> Result<usize, GenError> {
        let engine = Arc::clone(&self.engine);
        self.ir.reset();

        let mut fetch = CodeFetch::new(MemAccess::new(&mut self.tlb, engine.mem(), &*engine), cpu.mmu_index());
        let block = engine
            .frontend()
            .translate(&mut self.ir, pc, flags, cflags, &mut fetch)
            .map_err(|e| GenError::Fault(e.into()))?;
        let page_addr = fetch.pages;
        drop(fetch);

        let out = match translate(&mut self.ir, pc, engine.backend(), engine.code_buf()) {
            Ok(out) => out,
            Err(CodeGenError::BufferFull { .. }) => return Err(GenError::Full),
            Err(e) => panic!("host code generation failed for block at {pc:#x}: {e}"),
        };

        let mut tb = TranslationBlock::new(pc, flags, cflags);
        tb.size = block.size;
        tb.icount = block.icount as u16;
        tb.host_offset = out.host_offset;
        tb.host_size = out.host_size;
        tb.jmp_insn_offset = out.jmp_link_offset;
        tb.page_addr = page_addr;
        tb.search = out.search.into_boxed_slice();

        match engine.tb_link(tb) {
            TbInsert::Inserted(idx) => {
                self.stats.translations += 1;
                trace!(
                    "vcpu {} new tb {idx} pc={pc:#x} size={:#x} insns={}",
                    self.vcpu.index(),
                    block.size,
                    block.icount
                );
                Ok(idx)
            }
            TbInsert::Existing(idx, tb) => {
                engine.code_buf().try_rollback(tb.host_offset, tb.host_offset + tb.host_size);
                self.stats.dup_translations += 1;
                Ok(idx)
            }
            TbInsert::Full(_) => Err(GenError::Full),
        }
    }

    fn deliver_fault(&mut self, cpu: &mut dyn GuestCpu, pc: u64, fault: GuestFault) -> ExitReason {
        self.stats.exit_fault += 1;
        debug!("vcpu {} fault at {pc:#x}: {fault}", self.vcpu.index());
        cpu.set_pc(pc);
        match cpu.on_fault(pc, &fault) {
            FaultAction::Continue => ExitReason::Normal,
            FaultAction::Exit => ExitReason::Fault(fault),
        }
    }

    fn cpu_tb_exec(&mut self, engine: &Engine, cpu: &mut dyn GuestCpu, idx: usize) -> ExitReason {
        let tbs = engine.tb_store();
        trace!("vcpu {} exec tb {idx} pc={:#x}", self.vcpu.index(), tbs.get(idx).pc);

        let (exit, executed, budget) = {
            let mut env = ExecEnv {
                regs: cpu.regs_mut(),
                mem: MemAccess::new(&mut self.tlb, engine.mem(), engine),
                exit_request: &self.vcpu.0.exit_request,
                budget: self.budget,
                executed: 0,
                frame: &mut self.frame,
            };
            let exit = engine
                .backend()
                .exec(engine.code_buf(), idx, tbs.get(idx).host_offset, &mut env);
            (exit, env.executed, env.budget)
        };
        self.stats.insns += executed;
        self.budget = budget;

        match exit {
            TbExit::Chain { tb, slot } => {
                self.stats.exit_chain += 1;
                self.last_exit = Some(LastExit::Chain(tb, slot));
                ExitReason::Normal
            }
            TbExit::NoChain { tb } => {
                self.stats.exit_nochain += 1;
                self.last_exit = Some(LastExit::Indirect(tb));
                ExitReason::Normal
            }
            TbExit::Requested { tb } => {
                self.stats.exit_requested += 1;
                cpu.set_pc(tbs.get(tb).pc);
                ExitReason::Normal
            }
            TbExit::BudgetExhausted { tb } => {
                self.stats.exit_budget += 1;
                cpu.set_pc(tbs.get(tb).pc);
                ExitReason::BudgetExhausted
            }
            TbExit::Exception { excp, .. } => {
                self.stats.exit_exception += 1;
                ExitReason::Exception(excp)
            }
            TbExit::Fault { tb, host_pc, fault } => {
                let tb = tbs.get(tb);
                let pc = tb.restore_pc(host_pc).unwrap_or(tb.pc);
                self.deliver_fault(cpu, pc, fault.into())
            }
            TbExit::CodeModified { tb, host_pc } => {
                self.stats.exit_smc += 1;
                let tb = tbs.get(tb);
                let next = tb.next_pc_after(host_pc).unwrap_or_else(|| tb.end_pc());
                debug!("vcpu {} code modified, resuming at {next:#x}", self.vcpu.index());
                cpu.set_pc(next);
                ExitReason::Normal
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.engine.exclusive().unregister(self.vcpu.index());
        self.vcpu.request_stop();
    }
}
