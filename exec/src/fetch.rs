use smtcg_core::MemOp;
use smtcg_frontend::InsnFetch;
use smtcg_mmu::{MemAccess, MmuFault, TARGET_PAGE_MASK};

/// Instruction fetch for the translator, through the vCPU's TLB with
/// execute permission. Records the guest pages the block reads.
pub(crate) struct CodeFetch<'a> {
    mem: MemAccess<'a>,
    mode: usize,
    pub(crate) pages: [Option<u64>; 2],
}

impl<'a> CodeFetch<'a> {
    pub(crate) fn new(mem: MemAccess<'a>, mode: usize) -> Self {
        Self {
            mem,
            mode,
            pages: [None; 2],
        }
    }

    fn note_page(&mut self, addr: u64) {
        let page = addr & TARGET_PAGE_MASK;
        match self.pages {
            [None, _] => self.pages[0] = Some(page),
            [Some(p), _] if p == page => {}
            [Some(_), None] => self.pages[1] = Some(page),
            _ => {}
        }
    }
}

impl InsnFetch for CodeFetch<'_> {
    fn fetch(&mut self, pc: u64, size: u32) -> Result<u64, MmuFault> {
        let memop = match size {
            1 => MemOp::ub(),
            2 => MemOp::uw(),
            4 => MemOp::ul(),
            _ => MemOp::uq(),
        };
        let val = self.mem.fetch(self.mode, pc, memop)?;
        self.note_page(pc);
        self.note_page(pc.wrapping_add(size as u64 - 1));
        Ok(val)
    }
}
