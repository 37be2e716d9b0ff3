use crate::opcode::Opcode;
use crate::temp::TempIdx;
use crate::types::Type;

/// Maximum number of arguments (outputs + inputs + constants) per op.
pub const MAX_OP_ARGS: usize = 6;

/// Index of an op within the Context's op list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpIdx(pub u32);

/// A single IR operation.
///
/// Arguments are laid out as `[outputs..., inputs..., constants...]`,
/// with counts given by the opcode's `OpDef`. Constant arguments
/// (conditions, labels, memops, exit codes) are stored as raw
/// `TempIdx` values.
#[derive(Debug, Clone)]
pub struct Op {
    pub idx: OpIdx,
    pub opc: Opcode,
    /// Operation type for type-polymorphic opcodes.
    pub op_type: Type,
    pub args: [TempIdx; MAX_OP_ARGS],
    pub nargs: u8,
}

impl Op {
    pub fn new(idx: OpIdx, opc: Opcode, op_type: Type) -> Self {
        Self {
            idx,
            opc,
            op_type,
            args: [TempIdx(0); MAX_OP_ARGS],
            nargs: 0,
        }
    }

    pub fn with_args(idx: OpIdx, opc: Opcode, op_type: Type, args: &[TempIdx]) -> Self {
        assert!(args.len() <= MAX_OP_ARGS, "too many op args");
        let mut op = Self::new(idx, opc, op_type);
        op.args[..args.len()].copy_from_slice(args);
        op.nargs = args.len() as u8;
        op
    }

    pub fn oargs(&self) -> &[TempIdx] {
        &self.args[..self.opc.def().nb_oargs as usize]
    }

    pub fn iargs(&self) -> &[TempIdx] {
        let def = self.opc.def();
        let start = def.nb_oargs as usize;
        &self.args[start..start + def.nb_iargs as usize]
    }

    pub fn cargs(&self) -> &[TempIdx] {
        let def = self.opc.def();
        let start = (def.nb_oargs + def.nb_iargs) as usize;
        &self.args[start..def.nb_args() as usize]
    }

    /// Constant argument `n` as a raw integer.
    pub fn carg(&self, n: usize) -> u32 {
        self.cargs()[n].0
    }
}
