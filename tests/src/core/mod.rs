//! IR context, op, label, search-table and TB record tests.

use smtcg_core::search::{decode_sleb128, encode_search, encode_sleb128, find_insn, insn_count};
use smtcg_core::tb::cflags::{CF_COUNT_MASK, CF_NO_GOTO_TB};
use smtcg_core::tb::TCG_MAX_INSNS;
use smtcg_core::{Context, JumpCache, Op, OpIdx, Opcode, TempIdx, TempKind, TranslationBlock, Type};

#[test]
fn test_globals_survive_reset() {
    let mut ctx = Context::new();
    let a = ctx.new_global(Type::I64, 0, "a");
    let b = ctx.new_global(Type::I64, 1, "b");
    assert_eq!((a, b), (TempIdx(0), TempIdx(1)));
    let t = ctx.new_temp(Type::I64);
    ctx.gen_add(Type::I64, t, a, b);
    assert_eq!(ctx.num_ops(), 1);

    ctx.reset();
    assert_eq!(ctx.nb_globals(), 2);
    assert_eq!(ctx.nb_temps(), 2);
    assert_eq!(ctx.num_ops(), 0);
    assert!(ctx.temp(a).is_global());
}

#[test]
fn test_const_temps() {
    let mut ctx = Context::new();
    let c = ctx.new_const(Type::I64, 42);
    assert!(ctx.temp(c).is_const());
    assert_eq!(ctx.temp(c).kind, TempKind::Const);
    assert_eq!(ctx.consts().count(), 1);
}

#[test]
fn test_op_arg_slices() {
    let args = [TempIdx(10), TempIdx(20), TempIdx(30)];
    let op = Op::with_args(OpIdx(0), Opcode::Add, Type::I64, &args);
    assert_eq!(op.oargs(), &[TempIdx(10)]);
    assert_eq!(op.iargs(), &[TempIdx(20), TempIdx(30)]);
    assert!(op.cargs().is_empty());
}

#[test]
fn test_brcond_carries_label() {
    let mut ctx = Context::new();
    let a = ctx.new_global(Type::I64, 0, "a");
    let l = ctx.new_label();
    ctx.gen_brcond(Type::I64, a, a, smtcg_core::Cond::Eq, l);
    ctx.gen_set_label(l);
    let op = &ctx.ops()[0];
    assert_eq!(op.opc, Opcode::BrCond);
    assert_eq!(op.iargs().len(), 2);
    assert_eq!(op.carg(1), l);
}

#[test]
fn test_opcode_table_round_trip() {
    for v in 0..=u8::MAX {
        if let Some(opc) = Opcode::from_u8(v) {
            assert_eq!(opc as u8, v);
            assert!(!opc.name().is_empty());
        }
    }
    assert!(Opcode::ExitTb.ends_bb());
    assert!(!Opcode::Add.ends_bb());
}

#[test]
fn test_sleb128_values() {
    for v in [0i64, 1, -1, 63, 64, -64, -65, 1 << 40, i64::MIN, i64::MAX] {
        let mut buf = Vec::new();
        encode_sleb128(&mut buf, v);
        let mut pos = 0;
        assert_eq!(decode_sleb128(&buf, &mut pos), Some(v));
        assert_eq!(pos, buf.len());
    }
}

#[test]
fn test_search_table_lookup() {
    // Three insns at 0x1000, 0x1004, 0x1008 ending at host offsets 10, 25, 40.
    let table = encode_search(0x1000, &[0x1000, 0x1004, 0x1008], &[10, 25, 40]);
    assert_eq!(insn_count(&table, 0x1000), 3);
    assert_eq!(find_insn(&table, 0x1000, 0), Some((0x1000, Some(0x1004))));
    assert_eq!(find_insn(&table, 0x1000, 24), Some((0x1004, Some(0x1008))));
    assert_eq!(find_insn(&table, 0x1000, 39), Some((0x1008, None)));
    assert_eq!(find_insn(&table, 0x1000, 40), None);
}

#[test]
fn test_tb_restore_pc() {
    let mut tb = TranslationBlock::new(0x2000, 0, 0);
    tb.host_offset = 0x100;
    tb.size = 8;
    tb.search = encode_search(0x2000, &[0x2000, 0x2004], &[16, 32]).into_boxed_slice();
    assert_eq!(tb.restore_pc(0x100 + 20), Some(0x2004));
    assert_eq!(tb.next_pc_after(0x100 + 4), Some(0x2004));
    assert_eq!(tb.next_pc_after(0x100 + 20), Some(0x2008));
    assert_eq!(tb.restore_pc(0x80), None);
}

#[test]
fn test_tb_key_and_overlap() {
    let mut tb = TranslationBlock::new(0x1000, 1, 0);
    tb.size = 0x10;
    assert!(tb.matches(0x1000, 1, 0));
    assert!(!tb.matches(0x1000, 0, 0));
    assert!(!tb.matches(0x1000, 1, CF_NO_GOTO_TB));
    assert!(tb.overlaps(0x1008, 0x1009));
    assert!(!tb.overlaps(0x1010, 0x1020));
    assert!(!tb.overlaps(0x0ff0, 0x1000));
    tb.invalid.store(true, std::sync::atomic::Ordering::Release);
    assert!(!tb.matches(0x1000, 1, 0));
}

#[test]
fn test_tb_at_top_of_address_space() {
    let pc = u64::MAX - 7;
    let mut tb = TranslationBlock::new(pc, 0, 0);
    tb.host_offset = 0x100;
    tb.size = 8;
    tb.search = encode_search(pc, &[pc, pc + 4], &[16, 32]).into_boxed_slice();
    assert_eq!(tb.end_pc(), 0);
    assert!(tb.overlaps(u64::MAX - 1, u64::MAX));
    assert!(tb.overlaps(0, u64::MAX));
    assert!(!tb.overlaps(0x1000, pc));
    assert_eq!(tb.next_pc_after(0x100 + 4), Some(pc + 4));
    // The last insn has no successor inside the block.
    assert_eq!(tb.next_pc_after(0x100 + 20), Some(0));
}

#[test]
fn test_max_insns_from_cflags() {
    assert_eq!(TranslationBlock::max_insns(0), TCG_MAX_INSNS);
    assert_eq!(TranslationBlock::max_insns(1), 1);
    assert_eq!(TranslationBlock::max_insns(CF_NO_GOTO_TB | 7), 7);
    assert_eq!(TranslationBlock::max_insns(CF_COUNT_MASK), CF_COUNT_MASK);
}

#[test]
fn test_hash_spreads_keys() {
    let a = TranslationBlock::hash(0x1000, 0, 0);
    let b = TranslationBlock::hash(0x1004, 0, 0);
    let c = TranslationBlock::hash(0x1000, 1, 0);
    assert!(a != b || a != c);
    assert!(a < smtcg_core::TB_HASH_SIZE);
}

#[test]
fn test_jump_cache() {
    let mut jc = JumpCache::new();
    assert_eq!(jc.lookup(0x1000), None);
    jc.insert(0x1000, 3);
    assert_eq!(jc.lookup(0x1000), Some(3));
    jc.remove(0x1000);
    assert_eq!(jc.lookup(0x1000), None);
    jc.insert(0x2000, 4);
    jc.invalidate();
    assert_eq!(jc.lookup(0x2000), None);
}

#[test]
fn test_dump_names_globals() {
    let mut ctx = Context::new();
    let a = ctx.new_global(Type::I64, 0, "a0");
    let t = ctx.new_temp(Type::I64);
    ctx.gen_addi(Type::I64, t, a, 5);
    let s = smtcg_core::dump::dump_to_string(&ctx);
    assert!(s.contains("a0"), "{s}");
    assert!(s.contains("add"), "{s}");
}
