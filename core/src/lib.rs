//! Architecture-neutral IR and translated-block records.
//!
//! The IR mirrors QEMU's TCG: a [`Context`] holds temps, ops and labels
//! for one translation block; frontends fill it through the `gen_*`
//! builder methods and a host backend lowers it into the code arena.

pub mod context;
pub mod dump;
pub mod ir_builder;
pub mod label;
pub mod op;
pub mod opcode;
pub mod search;
pub mod tb;
pub mod temp;
pub mod types;

pub use context::Context;
pub use label::Label;
pub use op::{Op, OpIdx, MAX_OP_ARGS};
pub use opcode::{OpDef, OpFlags, Opcode, OPCODE_DEFS};
pub use tb::{JumpCache, TbJmpState, TranslationBlock, TB_HASH_SIZE, TB_JMP_CACHE_SIZE};
pub use temp::{Temp, TempIdx, TempKind};
pub use types::{Cond, MemOp, Type};
