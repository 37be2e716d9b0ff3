use std::collections::HashMap;

use crate::label::Label;
use crate::op::{Op, OpIdx};
use crate::temp::{Temp, TempIdx, TempKind};
use crate::types::{Type, TYPE_COUNT};

/// Values a single block may allocate, globals included.
pub const MAX_TEMPS: usize = 1024;

/// IR under construction for one translation block.
///
/// Guest registers are registered once as globals and survive
/// [`reset`](Self::reset); everything else is per block. The lowering
/// pass fills `insn_pcs` and `insn_ends`, from which the guest-pc
/// search table is built.
pub struct Context {
    temps: Vec<Temp>,
    ops: Vec<Op>,
    labels: Vec<Label>,
    nb_globals: u32,
    /// Constant dedup, one map per type.
    consts: [HashMap<u64, TempIdx>; TYPE_COUNT],

    /// Guest pc of each instruction, in order.
    pub insn_pcs: Vec<u64>,
    /// Host code offset, relative to the block start, where each
    /// instruction's code ends.
    pub insn_ends: Vec<u32>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            temps: Vec::with_capacity(128),
            ops: Vec::with_capacity(512),
            labels: Vec::new(),
            nb_globals: 0,
            consts: Default::default(),
            insn_pcs: Vec::new(),
            insn_ends: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.temps.truncate(self.nb_globals as usize);
        self.ops.clear();
        self.labels.clear();
        self.consts.iter_mut().for_each(HashMap::clear);
        self.insn_pcs.clear();
        self.insn_ends.clear();
    }

    pub fn nb_globals(&self) -> u32 {
        self.nb_globals
    }

    pub fn nb_temps(&self) -> u32 {
        self.temps.len() as u32
    }

    fn alloc(&mut self, make: impl FnOnce(TempIdx) -> Temp) -> TempIdx {
        assert!(self.temps.len() < MAX_TEMPS, "block needs more than {MAX_TEMPS} values");
        let idx = TempIdx(self.temps.len() as u32);
        self.temps.push(make(idx));
        idx
    }

    pub fn new_temp(&mut self, ty: Type) -> TempIdx {
        self.alloc(|idx| Temp::local(idx, ty))
    }

    /// Constant of `ty`; equal values share one temp.
    pub fn new_const(&mut self, ty: Type, val: u64) -> TempIdx {
        let val = ty.truncate(val);
        if let Some(&idx) = self.consts[ty as usize].get(&val) {
            return idx;
        }
        let idx = self.alloc(|idx| Temp::constant(idx, ty, val));
        self.consts[ty as usize].insert(val, idx);
        idx
    }

    /// Bind a global to register file `slot`. Globals come first: call
    /// this before allocating anything else.
    pub fn new_global(&mut self, ty: Type, slot: u32, name: &'static str) -> TempIdx {
        assert_eq!(self.nb_temps(), self.nb_globals, "globals must precede other temps");
        let idx = self.alloc(|idx| Temp::global(idx, ty, slot, name));
        self.nb_globals += 1;
        idx
    }

    pub fn temp(&self, idx: TempIdx) -> &Temp {
        &self.temps[idx.0 as usize]
    }

    pub fn consts(&self) -> impl Iterator<Item = &Temp> {
        self.temps[self.nb_globals as usize..]
            .iter()
            .filter(|t| t.kind == TempKind::Const)
    }

    pub fn emit_op(&mut self, op: Op) -> OpIdx {
        let idx = op.idx;
        self.ops.push(op);
        idx
    }

    pub fn next_op_idx(&self) -> OpIdx {
        OpIdx(self.ops.len() as u32)
    }

    pub fn op(&self, idx: OpIdx) -> &Op {
        &self.ops[idx.0 as usize]
    }

    pub fn op_mut(&mut self, idx: OpIdx) -> &mut Op {
        &mut self.ops[idx.0 as usize]
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn new_label(&mut self) -> u32 {
        let id = self.labels.len() as u32;
        self.labels.push(Label::new(id));
        id
    }

    pub fn label_mut(&mut self, id: u32) -> &mut Label {
        &mut self.labels[id as usize]
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
