//! Bytecode Emitter Integration Tests
//!
//! Tests for:
//! - Short-circuit branch emission for AND/OR
//! - The comparison opcode text-offset identity
//! - Affinity rule coverage across operators
//! - BETWEEN, CASE and IN lowering shapes

use quarry::{
    affinity_of, Affinity, BinaryOp, ColumnRef, Emitter, ExprKind, ExprList, ExprPool,
    FunctionRegistry, Opcode, ParseContext, Program, Token, UnaryOp,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn fixture() -> (ParseContext, ExprPool, FunctionRegistry, Program) {
    (
        ParseContext::new(""),
        ExprPool::new(),
        FunctionRegistry::with_builtins(),
        Program::new(),
    )
}

fn column(pool: &mut ExprPool, col: i32, affinity: Affinity) -> quarry::ExprId {
    pool.leaf(
        ExprKind::Column(ColumnRef::new(0, 0, col, affinity)),
        Token::owned("c"),
    )
}

fn int(pool: &mut ExprPool, text: &'static str) -> quarry::ExprId {
    pool.leaf(ExprKind::Integer, Token::owned(text))
}

fn count_opcode(prog: &Program, op: Opcode) -> usize {
    prog.insns().iter().filter(|i| i.opcode == op).count()
}

// ============================================================================
// Short-Circuit Branching
// ============================================================================

#[test]
fn test_and_branch_false_evaluates_each_operand_once() {
    let (mut ctx, mut pool, registry, mut prog) = fixture();
    let a = column(&mut pool, 0, Affinity::Numeric);
    let one = int(&mut pool, "1");
    let left = pool.binary(BinaryOp::Lt, a, one, Token::owned("<"));

    let b = column(&mut pool, 1, Affinity::Numeric);
    let two = int(&mut pool, "2");
    let right = pool.binary(BinaryOp::Lt, b, two, Token::owned("<"));

    let and = pool.binary(BinaryOp::And, left, right, Token::owned("and"));

    let target = prog.allocate_label();
    let mut emitter = Emitter::new(&mut ctx, &pool, &registry, &mut prog);
    emitter.emit_branch_false(and, target, false);
    prog.resolve_label(target);
    prog.seal().unwrap();

    // each operand's column is loaded exactly once: a false left operand
    // jumps straight to the target without touching the right operand
    assert_eq!(count_opcode(&prog, Opcode::Column), 2);
    // both fused comparison jumps aim at the same target
    let end = prog.len() as i32;
    let jumps: Vec<i32> = prog
        .insns()
        .iter()
        .filter(|i| i.opcode == Opcode::Ge)
        .map(|i| i.p2)
        .collect();
    assert_eq!(jumps, vec![end, end]);
}

#[test]
fn test_and_branch_true_short_circuits_through_label() {
    let (mut ctx, mut pool, registry, mut prog) = fixture();
    let a = column(&mut pool, 0, Affinity::Numeric);
    let one = int(&mut pool, "1");
    let left = pool.binary(BinaryOp::Lt, a, one, Token::owned("<"));

    let b = column(&mut pool, 1, Affinity::Numeric);
    let two = int(&mut pool, "2");
    let right = pool.binary(BinaryOp::Lt, b, two, Token::owned("<"));

    let and = pool.binary(BinaryOp::And, left, right, Token::owned("and"));

    let target = prog.allocate_label();
    let mut emitter = Emitter::new(&mut ctx, &pool, &registry, &mut prog);
    emitter.emit_branch_true(and, target, false);
    let past_and = prog.current_addr();
    prog.resolve_label(target);
    prog.seal().unwrap();

    assert_eq!(count_opcode(&prog, Opcode::Column), 2);
    // the left comparison is negated and jumps past the right operand
    let left_jump = prog
        .insns()
        .iter()
        .find(|i| i.opcode == Opcode::Ge)
        .expect("negated left comparison");
    assert_eq!(left_jump.p2, past_and);
    // the right comparison jumps to the caller's target
    let right_jump = prog
        .insns()
        .iter()
        .find(|i| i.opcode == Opcode::Lt)
        .expect("right comparison");
    assert_eq!(right_jump.p2, past_and);
}

#[test]
fn test_or_branch_true_jumps_from_either_operand() {
    let (mut ctx, mut pool, registry, mut prog) = fixture();
    let a = column(&mut pool, 0, Affinity::Numeric);
    let one = int(&mut pool, "1");
    let left = pool.binary(BinaryOp::Gt, a, one, Token::owned(">"));
    let b = column(&mut pool, 1, Affinity::Numeric);
    let two = int(&mut pool, "2");
    let right = pool.binary(BinaryOp::Gt, b, two, Token::owned(">"));
    let or = pool.binary(BinaryOp::Or, left, right, Token::owned("or"));

    let target = prog.allocate_label();
    let mut emitter = Emitter::new(&mut ctx, &pool, &registry, &mut prog);
    emitter.emit_branch_true(or, target, false);
    prog.resolve_label(target);
    prog.seal().unwrap();

    let end = prog.len() as i32;
    let jumps: Vec<i32> = prog
        .insns()
        .iter()
        .filter(|i| i.opcode == Opcode::Gt)
        .map(|i| i.p2)
        .collect();
    assert_eq!(jumps, vec![end, end]);
    assert_eq!(count_opcode(&prog, Opcode::Column), 2);
}

#[test]
fn test_not_flips_branch_polarity() {
    let (mut ctx, mut pool, registry, mut prog) = fixture();
    let a = column(&mut pool, 0, Affinity::Numeric);
    let one = int(&mut pool, "1");
    let cmp = pool.binary(BinaryOp::Eq, a, one, Token::owned("="));
    let not = pool.unary(UnaryOp::Not, cmp, Token::owned("not"));

    let target = prog.allocate_label();
    let mut emitter = Emitter::new(&mut ctx, &pool, &registry, &mut prog);
    emitter.emit_branch_true(not, target, false);
    prog.resolve_label(target);
    prog.seal().unwrap();

    // branch-true of NOT(=) is the fused != jump
    assert_eq!(count_opcode(&prog, Opcode::Ne), 1);
    assert_eq!(count_opcode(&prog, Opcode::Eq), 0);
}

// ============================================================================
// Comparison Opcode Family
// ============================================================================

#[test]
fn test_text_variant_offset_is_six() {
    for op in Opcode::NUMERIC_COMPARISONS {
        assert_eq!(op.text_variant() as u8 - op as u8, 6);
    }
}

#[test]
fn test_branch_comparison_keeps_affinity_bias() {
    let (mut ctx, mut pool, registry, mut prog) = fixture();
    let a = column(&mut pool, 0, Affinity::Text);
    let b = column(&mut pool, 1, Affinity::Text);
    let cmp = pool.binary(BinaryOp::Eq, a, b, Token::owned("="));

    let target = prog.allocate_label();
    let mut emitter = Emitter::new(&mut ctx, &pool, &registry, &mut prog);
    emitter.emit_branch_false(cmp, target, true);
    prog.resolve_label(target);
    prog.seal().unwrap();

    // negated text equality stays in the text family
    let jump = prog
        .insns()
        .iter()
        .find(|i| i.opcode == Opcode::StrNe)
        .expect("negated text comparison");
    assert_eq!(jump.p1, 1, "jump-if-null flag is carried in p1");
}

// ============================================================================
// Affinity Rules
// ============================================================================

#[test]
fn test_affinity_rule_table() {
    let (ctx, mut pool, registry, _) = fixture();
    let num = column(&mut pool, 0, Affinity::Numeric);
    let txt = column(&mut pool, 1, Affinity::Text);

    let arithmetic = [
        BinaryOp::Add,
        BinaryOp::Subtract,
        BinaryOp::Multiply,
        BinaryOp::Divide,
        BinaryOp::Remainder,
        BinaryOp::BitAnd,
        BinaryOp::BitOr,
        BinaryOp::ShiftLeft,
        BinaryOp::ShiftRight,
        BinaryOp::Like,
        BinaryOp::Glob,
        BinaryOp::And,
        BinaryOp::Or,
    ];
    for op in arithmetic {
        for (l, r) in [(num, num), (num, txt), (txt, num), (txt, txt)] {
            let e = pool.binary(op, l, r, Token::owned("op"));
            assert_eq!(
                affinity_of(&pool, &registry, &ctx.src, e),
                Affinity::Numeric,
                "{op:?} must be numeric for every child pair"
            );
        }
    }

    // concat is text regardless of children
    for (l, r) in [(num, num), (txt, txt)] {
        let e = pool.binary(BinaryOp::Concat, l, r, Token::owned("||"));
        assert_eq!(affinity_of(&pool, &registry, &ctx.src, e), Affinity::Text);
    }

    // comparison: numeric left wins, else follow the right operand
    let comparisons = [
        BinaryOp::Eq,
        BinaryOp::Ne,
        BinaryOp::Lt,
        BinaryOp::Le,
        BinaryOp::Gt,
        BinaryOp::Ge,
    ];
    for op in comparisons {
        let cases = [
            (num, num, Affinity::Numeric),
            (num, txt, Affinity::Numeric),
            (txt, num, Affinity::Numeric),
            (txt, txt, Affinity::Text),
        ];
        for (l, r, want) in cases {
            let e = pool.binary(op, l, r, Token::owned("cmp"));
            assert_eq!(affinity_of(&pool, &registry, &ctx.src, e), want, "{op:?}");
        }
    }

    // null-test and between are numeric; string/null/variable literals text
    let nt = pool.node_with(
        ExprKind::NullTest {
            operand: txt,
            negated: false,
        },
        Token::owned("isnull"),
    );
    assert_eq!(affinity_of(&pool, &registry, &ctx.src, nt), Affinity::Numeric);

    let between = pool.node_with(
        ExprKind::Between {
            operand: txt,
            lower: txt,
            upper: txt,
        },
        Token::owned("between"),
    );
    assert_eq!(
        affinity_of(&pool, &registry, &ctx.src, between),
        Affinity::Numeric
    );

    for kind in [ExprKind::Null, ExprKind::String, ExprKind::Variable] {
        let e = pool.leaf(kind, Token::owned("lit"));
        assert_eq!(affinity_of(&pool, &registry, &ctx.src, e), Affinity::Text);
    }

    // alias follows its inner expression
    let alias = pool.node_with(ExprKind::Alias { inner: num }, Token::owned("k"));
    assert_eq!(
        affinity_of(&pool, &registry, &ctx.src, alias),
        Affinity::Numeric
    );
}

// ============================================================================
// Structural Lowering
// ============================================================================

#[test]
fn test_between_lowering_shape() {
    // x BETWEEN 2 AND 4 => Column, Dup, Integer 2, Ge, Pull 1, Integer 4, Le, And
    let (mut ctx, mut pool, registry, mut prog) = fixture();
    let x = column(&mut pool, 0, Affinity::Numeric);
    let two = int(&mut pool, "2");
    let four = int(&mut pool, "4");
    let between = pool.node_with(
        ExprKind::Between {
            operand: x,
            lower: two,
            upper: four,
        },
        Token::owned("between"),
    );

    let mut emitter = Emitter::new(&mut ctx, &pool, &registry, &mut prog);
    emitter.emit_value(between);
    prog.seal().unwrap();

    assert_eq!(
        prog.opcodes(),
        vec![
            Opcode::Column,
            Opcode::Dup,
            Opcode::Integer,
            Opcode::Ge,
            Opcode::Pull,
            Opcode::Integer,
            Opcode::Le,
            Opcode::And,
        ]
    );
    assert_eq!(prog.insn(2).p1, 2);
    assert_eq!(prog.insn(4).p1, 1);
    assert_eq!(prog.insn(5).p1, 4);
}

#[test]
fn test_case_lowering_with_base() {
    // CASE x WHEN 1 THEN 10 ELSE 20 END
    let (mut ctx, mut pool, registry, mut prog) = fixture();
    let x = column(&mut pool, 0, Affinity::Numeric);
    let one = int(&mut pool, "1");
    let ten = int(&mut pool, "10");
    let twenty = int(&mut pool, "20");
    let case = pool.node_with(
        ExprKind::Case {
            base: Some(x),
            whens: vec![(one, ten)],
            else_expr: Some(twenty),
        },
        Token::owned("case"),
    );

    let mut emitter = Emitter::new(&mut ctx, &pool, &registry, &mut prog);
    emitter.emit_value(case);
    prog.seal().unwrap();

    assert_eq!(
        prog.opcodes(),
        vec![
            Opcode::Column,  // base
            Opcode::Dup,     // duplicate base for the test
            Opcode::Integer, // when
            Opcode::Ne,      // no match -> next pair
            Opcode::Pop,     // drop base on match
            Opcode::Integer, // then
            Opcode::Goto,    // -> end
            Opcode::Pop,     // drop base after last pair
            Opcode::Integer, // else
        ]
    );
    // the failed test jumps past the Goto, to the final Pop
    assert_eq!(prog.insn(3).p2, 7);
    // the Goto lands one past the else
    assert_eq!(prog.insn(6).p2, 9);
}

#[test]
fn test_in_list_lowering_with_null_short_circuit() {
    let (mut ctx, mut pool, registry, mut prog) = fixture();
    let x = column(&mut pool, 0, Affinity::Numeric);
    let mut items = ExprList::new();
    let one = int(&mut pool, "1");
    items.push(one, None);
    let in_expr = pool.node_with(
        ExprKind::InList {
            lhs: x,
            items,
            set_id: Some(5),
        },
        Token::owned("in"),
    );

    let mut emitter = Emitter::new(&mut ctx, &pool, &registry, &mut prog);
    emitter.emit_value(in_expr);
    prog.seal().unwrap();

    assert_eq!(
        prog.opcodes(),
        vec![
            Opcode::Integer,  // push 1
            Opcode::Column,   // lhs
            Opcode::NotNull,  // non-null lhs skips the null path
            Opcode::Pop,      // null path: pop both
            Opcode::Null,     // push null
            Opcode::Goto,     // -> end
            Opcode::SetFound, // membership probe
            Opcode::AddImm,   // miss decrements to 0
        ]
    );
    let not_null = prog.insn(2);
    assert_eq!(not_null.p1, -1, "lhs is examined without popping");
    assert_eq!(not_null.p2, 6, "skips to the membership probe");
    assert_eq!(prog.insn(6).p1, 5, "probe carries the set identifier");
    assert_eq!(prog.insn(6).p2, 8, "hit jumps past the decrement");
    assert_eq!(prog.insn(5).p2, 8);
}

#[test]
fn test_concat_and_function_lowering() {
    let (mut ctx, mut pool, registry, mut prog) = fixture();
    let a = column(&mut pool, 0, Affinity::Text);
    let b = column(&mut pool, 1, Affinity::Text);
    let cat = pool.binary(BinaryOp::Concat, a, b, Token::owned("||"));

    let mut args = ExprList::new();
    args.push(cat, None);
    let call = pool.function(args, Token::owned("upper"));

    let mut emitter = Emitter::new(&mut ctx, &pool, &registry, &mut prog);
    emitter.emit_value(call);
    prog.seal().unwrap();

    assert_eq!(
        prog.opcodes(),
        vec![Opcode::Column, Opcode::Column, Opcode::Concat, Opcode::Function]
    );
    assert_eq!(prog.insn(2).p1, 2);
    assert_eq!(prog.insn(3).p1, 1, "one argument");
}

#[test]
fn test_unresolved_label_is_rejected_at_seal() {
    let (mut ctx, mut pool, registry, mut prog) = fixture();
    let a = column(&mut pool, 0, Affinity::Numeric);
    let one = int(&mut pool, "1");
    let cmp = pool.binary(BinaryOp::Lt, a, one, Token::owned("<"));

    let dangling = prog.allocate_label();
    let mut emitter = Emitter::new(&mut ctx, &pool, &registry, &mut prog);
    emitter.emit_branch_true(cmp, dangling, false);
    assert!(prog.seal().is_err());
}
