use bitflags::bitflags;

bitflags! {
    /// Static properties of an opcode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlags: u8 {
        /// Operates on I32 or I64, as given by `Op::op_type`.
        const INT = 0x01;
        /// Control may not fall through to the next op.
        const BB_END = 0x02;
        /// Leaves the block.
        const BB_EXIT = 0x04;
        /// Touches guest memory or the vCPU; never dropped.
        const SIDE_EFFECTS = 0x08;
    }
}

/// Argument counts and flags of one opcode.
#[derive(Debug, Clone, Copy)]
pub struct OpDef {
    pub name: &'static str,
    pub nb_oargs: u8,
    pub nb_iargs: u8,
    pub nb_cargs: u8,
    pub flags: OpFlags,
}

impl OpDef {
    pub const fn nb_args(&self) -> u8 {
        self.nb_oargs + self.nb_iargs + self.nb_cargs
    }
}

macro_rules! opcodes {
    ($($variant:ident = $name:literal: $o:literal, $i:literal, $c:literal, $flags:expr;)*) => {
        /// IR opcodes. Integer ops carry their width in `Op::op_type`.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($variant,)*
        }

        const ALL_OPCODES: &[Opcode] = &[$(Opcode::$variant,)*];

        /// Definitions indexed by `Opcode as usize`.
        pub static OPCODE_DEFS: &[OpDef] = &[
            $(OpDef { name: $name, nb_oargs: $o, nb_iargs: $i, nb_cargs: $c, flags: $flags },)*
        ];
    };
}

const INT: OpFlags = OpFlags::INT;
const SE: OpFlags = OpFlags::SIDE_EFFECTS;
const NONE: OpFlags = OpFlags::empty();

// Constant args: setcond (cond), qemu_ld/st (memop, mmu index), brcond
// (cond, label), set_label (label), goto_tb (slot), exit_tb (exit
// value), exit_check (icount), insn_start (pc lo, pc hi).
opcodes! {
    Mov = "mov": 1, 1, 0, INT;
    SetCond = "setcond": 1, 2, 1, INT;
    Add = "add": 1, 2, 0, INT;
    Sub = "sub": 1, 2, 0, INT;
    Mul = "mul": 1, 2, 0, INT;
    DivS = "div": 1, 2, 0, INT;
    DivU = "divu": 1, 2, 0, INT;
    RemS = "rem": 1, 2, 0, INT;
    RemU = "remu": 1, 2, 0, INT;
    MulSH = "mulsh": 1, 2, 0, INT;
    MulUH = "muluh": 1, 2, 0, INT;
    And = "and": 1, 2, 0, INT;
    Or = "or": 1, 2, 0, INT;
    Xor = "xor": 1, 2, 0, INT;
    Shl = "shl": 1, 2, 0, INT;
    Shr = "shr": 1, 2, 0, INT;
    Sar = "sar": 1, 2, 0, INT;
    ExtI32I64 = "ext_i32_i64": 1, 1, 0, NONE;
    ExtrlI64I32 = "extrl_i64_i32": 1, 1, 0, NONE;
    QemuLd = "qemu_ld": 1, 1, 2, INT.union(SE);
    QemuSt = "qemu_st": 0, 2, 2, INT.union(SE);
    BrCond = "brcond": 0, 2, 2, INT.union(OpFlags::BB_END);
    SetLabel = "set_label": 0, 0, 1, OpFlags::BB_END;
    GotoTb = "goto_tb": 0, 0, 1, OpFlags::BB_EXIT.union(SE);
    ExitTb = "exit_tb": 0, 0, 1, OpFlags::BB_EXIT.union(SE);
    ExitCheck = "exit_check": 0, 0, 1, SE;
    Nop = "nop": 0, 0, 0, NONE;
    InsnStart = "insn_start": 0, 0, 2, SE;
    // Never emitted; any discriminant from here on is invalid.
    Count = "count": 0, 0, 0, NONE;
}

impl Opcode {
    /// Decode a raw discriminant; `Count` and above are rejected.
    pub fn from_u8(v: u8) -> Option<Opcode> {
        ALL_OPCODES.get(v as usize).copied().filter(|&op| op != Opcode::Count)
    }

    pub fn def(self) -> &'static OpDef {
        &OPCODE_DEFS[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.def().name
    }

    pub fn is_int_polymorphic(self) -> bool {
        self.def().flags.contains(OpFlags::INT)
    }

    pub fn ends_bb(self) -> bool {
        self.def().flags.intersects(OpFlags::BB_END | OpFlags::BB_EXIT)
    }
}
