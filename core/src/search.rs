//! Guest-PC search table.
//!
//! Each TB carries one row per guest instruction: the instruction's PC
//! and the host-code offset (relative to the TB start) where its
//! generated code ends. Rows are delta-encoded against the previous row
//! (the first against the TB's own PC and offset 0) using sleb128, as
//! QEMU's `encode_search` does.

/// Append `val` as signed LEB128.
pub fn encode_sleb128(out: &mut Vec<u8>, mut val: i64) {
    loop {
        let byte = (val & 0x7f) as u8;
        val >>= 7;
        let done = (val == 0 && byte & 0x40 == 0) || (val == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decode a signed LEB128 value, advancing `pos`.
pub fn decode_sleb128(buf: &[u8], pos: &mut usize) -> Option<i64> {
    let mut val: i64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos)?;
        *pos += 1;
        if shift < 64 {
            val |= ((byte & 0x7f) as i64) << shift;
        }
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 64 && byte & 0x40 != 0 {
                val |= -1i64 << shift;
            }
            return Some(val);
        }
    }
}

/// Build the encoded table for a TB starting at `tb_pc`.
pub fn encode_search(tb_pc: u64, insn_pcs: &[u64], end_offs: &[u32]) -> Vec<u8> {
    debug_assert_eq!(insn_pcs.len(), end_offs.len());
    let mut out = Vec::with_capacity(insn_pcs.len() * 3);
    let mut prev_pc = tb_pc;
    let mut prev_end = 0u32;
    for (&pc, &end) in insn_pcs.iter().zip(end_offs) {
        encode_sleb128(&mut out, pc.wrapping_sub(prev_pc) as i64);
        encode_sleb128(&mut out, end as i64 - prev_end as i64);
        prev_pc = pc;
        prev_end = end;
    }
    out
}

fn rows(table: &[u8], tb_pc: u64) -> impl Iterator<Item = (u64, u32)> + '_ {
    let mut pos = 0usize;
    let mut pc = tb_pc;
    let mut end = 0i64;
    std::iter::from_fn(move || {
        let dpc = decode_sleb128(table, &mut pos)?;
        let dend = decode_sleb128(table, &mut pos)?;
        pc = pc.wrapping_add(dpc as u64);
        end += dend;
        Some((pc, end as u32))
    })
}

/// Find the instruction whose host code contains `host_off`.
///
/// Returns its guest PC and the PC of the following instruction in the
/// same TB, if any.
pub fn find_insn(table: &[u8], tb_pc: u64, host_off: u32) -> Option<(u64, Option<u64>)> {
    let mut it = rows(table, tb_pc);
    while let Some((pc, end)) = it.next() {
        if host_off < end {
            return Some((pc, it.next().map(|(next, _)| next)));
        }
    }
    None
}

/// Number of instructions recorded in the table.
pub fn insn_count(table: &[u8], tb_pc: u64) -> usize {
    rows(table, tb_pc).count()
}
