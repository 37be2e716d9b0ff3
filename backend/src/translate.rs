use log::{log_enabled, trace, Level};
use smtcg_core::dump::dump_to_string;
use smtcg_core::search::encode_search;
use smtcg_core::Context;

use crate::code_buffer::CodeBuffer;
use crate::{CodeGenError, HostCodeGen};

/// Result of lowering one block.
#[derive(Debug, Clone)]
pub struct Translated {
    pub host_offset: usize,
    pub host_size: usize,
    pub jmp_link_offset: [Option<u32>; 2],
    /// Encoded guest-PC search table.
    pub search: Vec<u8>,
    /// Guest instructions covered.
    pub icount: usize,
}

/// Full translation pipeline: lower the op stream of a block starting
/// at guest `tb_pc` and build its search table.
pub fn translate(
    ctx: &mut Context,
    tb_pc: u64,
    backend: &dyn HostCodeGen,
    buf: &CodeBuffer,
) -> Result<Translated, CodeGenError> {
    if log_enabled!(target: "smtcg::op", Level::Trace) {
        trace!(target: "smtcg::op", "IN: pc={tb_pc:#x}\n{}", dump_to_string(ctx));
    }
    let lowered = backend.lower(ctx, buf)?;
    let search = encode_search(tb_pc, &ctx.insn_pcs, &ctx.insn_ends);
    trace!(
        "{} translated pc={:#x} host={:#x}+{:#x} insns={}",
        backend.name(),
        tb_pc,
        lowered.host_offset,
        lowered.host_size,
        ctx.insn_pcs.len()
    );
    Ok(Translated {
        host_offset: lowered.host_offset,
        host_size: lowered.host_size,
        jmp_link_offset: lowered.jmp_link_offset,
        search,
        icount: ctx.insn_pcs.len(),
    })
}
