use crate::types::Type;

/// Storage class of an IR value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TempKind {
    /// Scratch value private to the block being translated.
    Local,
    /// Guest register: lives in a slot of the register file and keeps
    /// its value from block to block.
    Global,
    /// Immediate, materialized once at block entry.
    Const,
}

/// Handle on a value of the current [`Context`](crate::Context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TempIdx(pub u32);

#[derive(Debug, Clone)]
pub struct Temp {
    pub idx: TempIdx,
    pub ty: Type,
    pub kind: TempKind,
    /// Value of a `Const`.
    pub val: u64,
    /// Register file slot of a `Global`.
    pub slot: u32,
    pub name: Option<&'static str>,
}

impl Temp {
    pub fn local(idx: TempIdx, ty: Type) -> Self {
        Self {
            idx,
            ty,
            kind: TempKind::Local,
            val: 0,
            slot: 0,
            name: None,
        }
    }

    pub fn constant(idx: TempIdx, ty: Type, val: u64) -> Self {
        Self {
            kind: TempKind::Const,
            val: ty.truncate(val),
            ..Self::local(idx, ty)
        }
    }

    pub fn global(idx: TempIdx, ty: Type, slot: u32, name: &'static str) -> Self {
        Self {
            kind: TempKind::Global,
            slot,
            name: Some(name),
            ..Self::local(idx, ty)
        }
    }

    pub fn is_const(&self) -> bool {
        self.kind == TempKind::Const
    }

    pub fn is_global(&self) -> bool {
        self.kind == TempKind::Global
    }
}
