//! RISC-V CPU state.

use smtcg_mmu::{MmuAccessType, MmuFault, MMU_KERNEL_IDX, MMU_USER_IDX};

use crate::{FaultAction, GuestCpu, GuestFault};

/// Number of general-purpose registers (x0-x31).
pub const NUM_GPRS: usize = 32;
/// Register-file slot of the program counter.
pub const PC_SLOT: usize = NUM_GPRS;
/// Register-file slots exposed to generated code.
pub const NUM_REGS: usize = NUM_GPRS + 1;

// Exception causes (scause).
pub const CAUSE_MISALIGNED_FETCH: u64 = 0;
pub const CAUSE_ILLEGAL_INSN: u64 = 2;
pub const CAUSE_MISALIGNED_LOAD: u64 = 4;
pub const CAUSE_MISALIGNED_STORE: u64 = 6;
pub const CAUSE_FETCH_PAGE_FAULT: u64 = 12;
pub const CAUSE_LOAD_PAGE_FAULT: u64 = 13;
pub const CAUSE_STORE_PAGE_FAULT: u64 = 15;
/// Interrupt bit of scause.
pub const CAUSE_INTERRUPT: u64 = 1 << 63;
/// Supervisor external interrupt.
pub const IRQ_S_EXT: u64 = 9;

/// Privilege level; also the block flags and the MMU mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priv {
    #[default]
    User = 0,
    Supervisor = 1,
}

/// RISC-V CPU architectural state (RV64IM).
///
/// `regs[0..32]` are x0-x31 (x0 is kept zero by the frontend), and
/// `regs[PC_SLOT]` is the program counter. Trap CSRs are only visible
/// to the embedding; when `stvec` is zero, faults and interrupts are
/// returned to the caller instead of being taken.
#[derive(Debug, Clone)]
pub struct RiscvCpu {
    pub regs: [u64; NUM_REGS],
    pub priv_level: Priv,
    pub stvec: u64,
    pub sepc: u64,
    pub scause: u64,
    pub stval: u64,
}

impl RiscvCpu {
    pub fn new(pc: u64) -> Self {
        let mut regs = [0u64; NUM_REGS];
        regs[PC_SLOT] = pc;
        Self {
            regs,
            priv_level: Priv::User,
            stvec: 0,
            sepc: 0,
            scause: 0,
            stval: 0,
        }
    }

    pub fn gpr(&self, i: usize) -> u64 {
        self.regs[i]
    }

    pub fn set_gpr(&mut self, i: usize, val: u64) {
        if i != 0 {
            self.regs[i] = val;
        }
    }

    /// Enter the trap vector with the given cause.
    pub fn take_trap(&mut self, cause: u64, epc: u64, tval: u64) {
        self.sepc = epc;
        self.scause = cause;
        self.stval = tval;
        self.regs[PC_SLOT] = self.stvec;
        self.priv_level = Priv::Supervisor;
    }

    fn fault_cause(fault: &GuestFault) -> (u64, u64) {
        match fault {
            GuestFault::DecodeTrap { .. } => (CAUSE_ILLEGAL_INSN, 0),
            GuestFault::Mmu(f) => {
                let cause = match (f, f.access()) {
                    (MmuFault::Unaligned { .. }, MmuAccessType::DataLoad) => CAUSE_MISALIGNED_LOAD,
                    (MmuFault::Unaligned { .. }, MmuAccessType::DataStore) => CAUSE_MISALIGNED_STORE,
                    (MmuFault::Unaligned { .. }, MmuAccessType::InstFetch) => CAUSE_MISALIGNED_FETCH,
                    (_, MmuAccessType::DataLoad) => CAUSE_LOAD_PAGE_FAULT,
                    (_, MmuAccessType::DataStore) => CAUSE_STORE_PAGE_FAULT,
                    (_, MmuAccessType::InstFetch) => CAUSE_FETCH_PAGE_FAULT,
                };
                (cause, f.addr())
            }
        }
    }
}

impl Default for RiscvCpu {
    fn default() -> Self {
        Self::new(0)
    }
}

impl GuestCpu for RiscvCpu {
    fn get_pc(&self) -> u64 {
        self.regs[PC_SLOT]
    }

    fn set_pc(&mut self, pc: u64) {
        self.regs[PC_SLOT] = pc;
    }

    fn get_flags(&self) -> u32 {
        self.priv_level as u32
    }

    fn mmu_index(&self) -> usize {
        match self.priv_level {
            Priv::User => MMU_USER_IDX,
            Priv::Supervisor => MMU_KERNEL_IDX,
        }
    }

    fn regs_mut(&mut self) -> &mut [u64] {
        &mut self.regs
    }

    fn on_fault(&mut self, pc: u64, fault: &GuestFault) -> FaultAction {
        if self.stvec == 0 {
            return FaultAction::Exit;
        }
        let (cause, tval) = Self::fault_cause(fault);
        self.take_trap(cause, pc, tval);
        FaultAction::Continue
    }

    fn on_interrupt_pending(&mut self, _mask: u32) -> bool {
        if self.stvec == 0 {
            return true;
        }
        let pc = self.get_pc();
        self.take_trap(CAUSE_INTERRUPT | IRQ_S_EXT, pc, 0);
        false
    }
}
