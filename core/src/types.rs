/// IR value types.
///
/// Only the two integer widths the guest frontends need are modelled.
/// 32-bit values live zero-extended in 64-bit slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Type {
    I32 = 0,
    I64 = 1,
}

pub const TYPE_COUNT: usize = 2;

impl Type {
    pub const fn size_bits(self) -> u32 {
        match self {
            Type::I32 => 32,
            Type::I64 => 64,
        }
    }

    /// Truncate a raw 64-bit value to this type's width.
    #[inline]
    pub const fn truncate(self, val: u64) -> u64 {
        match self {
            Type::I32 => val as u32 as u64,
            Type::I64 => val,
        }
    }

    pub fn from_u8(v: u8) -> Option<Type> {
        match v {
            0 => Some(Type::I32),
            1 => Some(Type::I64),
            _ => None,
        }
    }
}

/// Comparison condition for `brcond` and `setcond`.
///
/// Numeric encoding follows QEMU's `TCGCond`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    Never = 0,
    Always = 1,
    Eq = 8,
    Ne = 9,
    Lt = 10,
    Ge = 11,
    Le = 12,
    Gt = 13,
    Ltu = 14,
    Geu = 15,
    Leu = 16,
    Gtu = 17,
    TstEq = 18,
    TstNe = 19,
}

impl Cond {
    const ALL: [Cond; 14] = [
        Cond::Never,
        Cond::Always,
        Cond::Eq,
        Cond::Ne,
        Cond::Lt,
        Cond::Ge,
        Cond::Le,
        Cond::Gt,
        Cond::Ltu,
        Cond::Geu,
        Cond::Leu,
        Cond::Gtu,
        Cond::TstEq,
        Cond::TstNe,
    ];

    pub fn from_u8(v: u8) -> Option<Cond> {
        Self::ALL.into_iter().find(|&c| c as u8 == v)
    }

    /// Evaluate the condition on two values of type `ty`.
    pub fn eval(self, ty: Type, a: u64, b: u64) -> bool {
        let (a, b) = (ty.truncate(a), ty.truncate(b));
        let (sa, sb) = match ty {
            Type::I32 => (a as u32 as i32 as i64, b as u32 as i32 as i64),
            Type::I64 => (a as i64, b as i64),
        };
        match self {
            Cond::Never => false,
            Cond::Always => true,
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::Lt => sa < sb,
            Cond::Ge => sa >= sb,
            Cond::Le => sa <= sb,
            Cond::Gt => sa > sb,
            Cond::Ltu => a < b,
            Cond::Geu => a >= b,
            Cond::Leu => a <= b,
            Cond::Gtu => a > b,
            Cond::TstEq => a & b == 0,
            Cond::TstNe => a & b != 0,
        }
    }
}

/// Memory operation descriptor for guest loads and stores.
///
/// Bit layout:
/// - `[1:0]` access size (log2 bytes)
/// - `[2]`   sign-extend the loaded value
/// - `[3]`   big-endian guest access
/// - `[6:4]` required alignment (log2 bytes, 0 = none)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemOp(pub u16);

impl MemOp {
    pub const SIZE_8: u16 = 0;
    pub const SIZE_16: u16 = 1;
    pub const SIZE_32: u16 = 2;
    pub const SIZE_64: u16 = 3;
    pub const SIZE_MASK: u16 = 3;

    pub const SIGN: u16 = 1 << 2;
    pub const BE: u16 = 1 << 3;

    pub const ALIGN_SHIFT: u16 = 4;
    pub const ALIGN_MASK: u16 = 7 << Self::ALIGN_SHIFT;

    pub const fn ub() -> Self {
        Self(Self::SIZE_8)
    }
    pub const fn sb() -> Self {
        Self(Self::SIZE_8 | Self::SIGN)
    }
    pub const fn uw() -> Self {
        Self(Self::SIZE_16)
    }
    pub const fn sw() -> Self {
        Self(Self::SIZE_16 | Self::SIGN)
    }
    pub const fn ul() -> Self {
        Self(Self::SIZE_32)
    }
    pub const fn sl() -> Self {
        Self(Self::SIZE_32 | Self::SIGN)
    }
    pub const fn uq() -> Self {
        Self(Self::SIZE_64)
    }

    /// Require natural alignment for this access.
    pub const fn aligned(self) -> Self {
        let size = self.0 & Self::SIZE_MASK;
        Self((self.0 & !Self::ALIGN_MASK) | (size << Self::ALIGN_SHIFT))
    }

    pub const fn size(self) -> u16 {
        self.0 & Self::SIZE_MASK
    }

    pub const fn size_bytes(self) -> u32 {
        1 << (self.0 & Self::SIZE_MASK)
    }

    pub const fn is_signed(self) -> bool {
        self.0 & Self::SIGN != 0
    }

    pub const fn is_big_endian(self) -> bool {
        self.0 & Self::BE != 0
    }

    /// log2 of the required alignment.
    pub const fn a_bits(self) -> u32 {
        ((self.0 & Self::ALIGN_MASK) >> Self::ALIGN_SHIFT) as u32
    }

    /// Sign- or zero-extend a raw loaded value according to size/sign bits.
    pub fn extend(self, raw: u64) -> u64 {
        let bits = self.size_bytes() * 8;
        if bits == 64 {
            return raw;
        }
        let raw = raw & ((1u64 << bits) - 1);
        if self.is_signed() {
            let shift = 64 - bits;
            (((raw << shift) as i64) >> shift) as u64
        } else {
            raw
        }
    }
}
