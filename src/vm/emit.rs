//! Bytecode Emission
//!
//! Lowers resolved expression trees onto the VM's operand stack. Two entry
//! points: [`Emitter::emit_value`] leaves the expression's value on top of
//! stack; [`Emitter::emit_branch_true`] / [`Emitter::emit_branch_false`]
//! evaluate the expression as a boolean and jump, short-circuiting `AND` and
//! `OR` so the right operand is never evaluated on a branch the left operand
//! already decided.
//!
//! Emission is a no-op once the parse context carries any error.

use crate::catalog::FunctionRegistry;
use crate::expr::check::affinity_of;
use crate::expr::{
    dequote, Affinity, BinaryOp, ExprId, ExprKind, ExprList, ExprPool, RaiseAction, UnaryOp,
};
use crate::parse::ParseContext;
use tracing::trace;

use super::opcode::{Opcode, HALT_CONSTRAINT};
use super::program::{Label, Program};

/// Expression-to-bytecode lowering over a program buffer
pub struct Emitter<'a> {
    pub ctx: &'a mut ParseContext,
    pub pool: &'a ExprPool,
    pub registry: &'a FunctionRegistry,
    pub prog: &'a mut Program,
    /// Jump target for `RAISE(IGNORE)`; present only inside trigger bodies
    trigger_ignore: Option<Label>,
}

impl<'a> Emitter<'a> {
    pub fn new(
        ctx: &'a mut ParseContext,
        pool: &'a ExprPool,
        registry: &'a FunctionRegistry,
        prog: &'a mut Program,
    ) -> Self {
        Emitter {
            ctx,
            pool,
            registry,
            prog,
            trigger_ignore: None,
        }
    }

    pub fn with_trigger_ignore(mut self, label: Label) -> Self {
        self.trigger_ignore = Some(label);
        self
    }

    // ------------------------------------------------------------------
    // Value form
    // ------------------------------------------------------------------

    /// Evaluate `id`, leaving its value on top of stack
    pub fn emit_value(&mut self, id: ExprId) {
        if self.ctx.has_errors() {
            return;
        }
        self.value(id);
    }

    /// Emit each list element's value in order. With `include_affinities`,
    /// each value is followed by its affinity name, and the returned count
    /// is `2n` instead of `n`.
    pub fn emit_list(&mut self, list: &ExprList, include_affinities: bool) -> usize {
        if self.ctx.has_errors() {
            return 0;
        }
        let mut pushed = 0;
        for item in list.iter() {
            self.value(item.expr);
            pushed += 1;
            if include_affinities {
                let name = self.affinity(item.expr).name();
                self.prog
                    .emit_p3(Opcode::Str, 0, 0, Some(name.to_string()));
                pushed += 1;
            }
        }
        pushed
    }

    fn value(&mut self, id: ExprId) {
        match self.pool.kind(id).clone() {
            ExprKind::Null => {
                self.prog.emit(Opcode::Null, 0, 0);
            }
            ExprKind::Integer => {
                let text = self.token_text(id);
                self.integer_literal(&text);
            }
            ExprKind::Float => {
                let text = self.token_text(id);
                self.prog.emit_p3(Opcode::Str, 0, 0, Some(text));
            }
            ExprKind::String => {
                let text = self.token_text(id);
                self.prog.emit_p3(Opcode::Str, 0, 0, Some(dequote(&text)));
            }
            ExprKind::Variable => {
                let text = self.token_text(id);
                let number = text
                    .strip_prefix('?')
                    .and_then(|rest| rest.parse::<i32>().ok())
                    .unwrap_or_else(|| self.ctx.allocate_variable());
                self.prog.emit_p3(Opcode::Variable, number, 0, Some(text));
            }
            ExprKind::Column(c) => {
                if self.ctx.use_agg {
                    self.prog.emit(Opcode::AggGet, 0, c.agg_slot);
                } else if c.column_index < 0 {
                    self.prog.emit(Opcode::Recno, c.table_cursor, 0);
                } else {
                    self.prog
                        .emit(Opcode::Column, c.table_cursor, c.column_index);
                }
            }
            ExprKind::Alias { inner } => self.value(inner),
            ExprKind::Id | ExprKind::Dot { .. } => {
                let text = self.token_text(id);
                self.ctx.error(format!("unresolved identifier: {text}"));
            }
            ExprKind::Binary { op, left, right } => self.binary_value(id, op, left, right),
            ExprKind::Unary { op, operand } => self.unary_value(op, operand),
            ExprKind::NullTest { operand, negated } => {
                // 1 is pushed first; the conditional jump skips the
                // decrement when the test holds, leaving the 1.
                self.prog.emit(Opcode::Integer, 1, 0);
                self.value(operand);
                let cond = if negated {
                    Opcode::NotNull
                } else {
                    Opcode::IsNull
                };
                let addr = self.prog.current_addr();
                self.prog.emit(cond, 1, addr + 2);
                self.prog.emit(Opcode::AddImm, -1, 0);
            }
            ExprKind::Function { args } => {
                let name = self.token_text(id);
                self.function_call(&name, &args);
            }
            ExprKind::AggFunction { agg_slot, .. } => {
                self.prog.emit(Opcode::AggGet, 0, agg_slot);
            }
            ExprKind::Select { mem_cell, .. } => match mem_cell {
                Some(cell) => {
                    self.prog.emit(Opcode::MemLoad, cell, 0);
                }
                None => self.ctx.error("scalar subquery was not resolved"),
            },
            ExprKind::InList { lhs, set_id, .. } => match set_id {
                Some(set) => self.membership(lhs, Opcode::SetFound, set as i32),
                None => self.ctx.error("IN list was not resolved"),
            },
            ExprKind::InSelect { lhs, cursor, .. } => match cursor {
                Some(cur) => self.membership(lhs, Opcode::Found, cur),
                None => self.ctx.error("IN subquery was not resolved"),
            },
            ExprKind::Between {
                operand,
                lower,
                upper,
            } => {
                self.value(operand);
                self.prog.emit(Opcode::Dup, 0, 0);
                self.value(lower);
                let ge = self.comparison_opcode(Opcode::Ge, operand, lower);
                self.prog.emit(ge, 0, 0);
                self.prog.emit(Opcode::Pull, 1, 0);
                self.value(upper);
                let le = self.comparison_opcode(Opcode::Le, operand, upper);
                self.prog.emit(le, 0, 0);
                self.prog.emit(Opcode::And, 0, 0);
            }
            ExprKind::Case {
                base,
                whens,
                else_expr,
            } => self.case_value(base, &whens, else_expr),
            ExprKind::Raise { action } => self.raise(id, action),
        }
    }

    /// Integer literal with the 32-bit-fit heuristic: oversized literals
    /// fall back to string form
    fn integer_literal(&mut self, text: &str) {
        match text.parse::<i32>() {
            Ok(v) => {
                self.prog.emit_p3(Opcode::Integer, v, 0, Some(text.to_string()));
            }
            Err(_) => {
                self.prog.emit_p3(Opcode::Str, 0, 0, Some(text.to_string()));
            }
        }
    }

    fn binary_value(&mut self, id: ExprId, op: BinaryOp, left: ExprId, right: ExprId) {
        match op {
            BinaryOp::Add
            | BinaryOp::Subtract
            | BinaryOp::Multiply
            | BinaryOp::Divide
            | BinaryOp::Remainder
            | BinaryOp::BitAnd
            | BinaryOp::BitOr
            | BinaryOp::And
            | BinaryOp::Or => {
                self.value(left);
                self.value(right);
                self.prog.emit(arith_opcode(op), 0, 0);
            }
            // shifts push their operands right to left
            BinaryOp::ShiftLeft | BinaryOp::ShiftRight => {
                self.value(right);
                self.value(left);
                self.prog.emit(arith_opcode(op), 0, 0);
            }
            BinaryOp::Concat => {
                self.value(left);
                self.value(right);
                self.prog.emit(Opcode::Concat, 2, 0);
            }
            BinaryOp::Like | BinaryOp::Glob => {
                let name = if op == BinaryOp::Like { "like" } else { "glob" };
                let mut args = ExprList::new();
                args.push(left, None);
                args.push(right, None);
                self.function_call(name, &args);
            }
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt
            | BinaryOp::Ge => {
                self.value(left);
                self.value(right);
                let opcode = self.comparison_for(id, op);
                self.prog.emit(opcode, 0, 0);
            }
        }
    }

    fn unary_value(&mut self, op: UnaryOp, operand: ExprId) {
        match op {
            UnaryOp::Negate => match self.pool.kind(operand) {
                // fold the sign into a literal numeric token
                ExprKind::Integer => {
                    let text = format!("-{}", self.token_text(operand));
                    self.integer_literal(&text);
                }
                ExprKind::Float => {
                    let text = format!("-{}", self.token_text(operand));
                    self.prog.emit_p3(Opcode::Str, 0, 0, Some(text));
                }
                _ => {
                    self.value(operand);
                    self.prog.emit(Opcode::Negative, 0, 0);
                }
            },
            UnaryOp::Not => {
                self.value(operand);
                self.prog.emit(Opcode::Not, 0, 0);
            }
            UnaryOp::BitNot => {
                self.value(operand);
                self.prog.emit(Opcode::BitNot, 0, 0);
            }
            // unary plus is a no-op at emission time
            UnaryOp::Plus => self.value(operand),
        }
    }

    fn function_call(&mut self, name: &str, args: &ExprList) {
        let Some(fid) = self.registry.lookup(name, args.len() as i32) else {
            self.ctx.error(format!("no such function: {name}"));
            return;
        };
        let wants_types = self.registry.def(fid).wants_arg_types;
        for item in args.iter() {
            self.value(item.expr);
            if wants_types {
                let affinity = self.affinity(item.expr).name();
                self.prog
                    .emit_p3(Opcode::Str, 0, 0, Some(affinity.to_string()));
            }
        }
        trace!(function = name, n_args = args.len(), "emit function call");
        self.prog
            .emit(Opcode::Function, args.len() as i32, fid.index() as i32);
    }

    /// `lhs IN <set>` with the null short-circuit: a NULL left operand pops
    /// both pushed values and yields NULL
    fn membership(&mut self, lhs: ExprId, probe: Opcode, probe_p1: i32) {
        let end = self.prog.allocate_label();
        self.prog.emit(Opcode::Integer, 1, 0);
        self.value(lhs);
        let addr = self.prog.current_addr();
        // negative p1: examine without popping; the probe consumes the key
        self.prog.emit(Opcode::NotNull, -1, addr + 4);
        self.prog.emit(Opcode::Pop, 2, 0);
        self.prog.emit(Opcode::Null, 0, 0);
        self.prog.emit(Opcode::Goto, 0, end.raw());
        self.prog.emit(probe, probe_p1, end.raw());
        self.prog.emit(Opcode::AddImm, -1, 0);
        self.prog.resolve_label(end);
    }

    fn case_value(
        &mut self,
        base: Option<ExprId>,
        whens: &[(ExprId, ExprId)],
        else_expr: Option<ExprId>,
    ) {
        let end = self.prog.allocate_label();
        if let Some(base) = base {
            self.value(base);
        }
        for (when, then) in whens {
            let jump_addr = if let Some(base) = base {
                self.prog.emit(Opcode::Dup, 0, 0);
                self.value(*when);
                let ne = self.comparison_opcode(Opcode::Ne, base, *when);
                self.prog.emit(ne, 1, 0)
            } else {
                self.value(*when);
                self.prog.emit(Opcode::IfNot, 1, 0)
            };
            if base.is_some() {
                self.prog.emit(Opcode::Pop, 1, 0);
            }
            self.value(*then);
            self.prog.emit(Opcode::Goto, 0, end.raw());
            // the failed test resumes at the next pair
            let next = self.prog.current_addr();
            self.prog
                .change_p2(jump_addr, next)
                .expect("patching an instruction this emitter just wrote");
        }
        if base.is_some() {
            self.prog.emit(Opcode::Pop, 1, 0);
        }
        match else_expr {
            Some(e) => self.value(e),
            None => {
                self.prog.emit(Opcode::Null, 0, 0);
            }
        }
        self.prog.resolve_label(end);
    }

    fn raise(&mut self, id: ExprId, action: RaiseAction) {
        if self.trigger_ignore.is_none() {
            self.ctx
                .error("RAISE() may only be used within a trigger-program");
            return;
        }
        match action {
            RaiseAction::Ignore => {
                let target = self.trigger_ignore.expect("checked above");
                self.prog.emit(Opcode::Goto, 0, target.raw());
            }
            RaiseAction::Rollback | RaiseAction::Abort | RaiseAction::Fail => {
                let message = self.token_text(id);
                let on_error = match action {
                    RaiseAction::Rollback => 1,
                    RaiseAction::Abort => 2,
                    _ => 3,
                };
                self.prog
                    .emit_p3(Opcode::Halt, HALT_CONSTRAINT, on_error, Some(message));
            }
        }
    }

    // ------------------------------------------------------------------
    // Branch form
    // ------------------------------------------------------------------

    /// Jump to `target` when `id` evaluates true; `jump_if_null` also takes
    /// the jump when the value is NULL
    pub fn emit_branch_true(&mut self, id: ExprId, target: Label, jump_if_null: bool) {
        if self.ctx.has_errors() {
            return;
        }
        self.branch_true(id, target, jump_if_null);
    }

    /// Jump to `target` when `id` evaluates false
    pub fn emit_branch_false(&mut self, id: ExprId, target: Label, jump_if_null: bool) {
        if self.ctx.has_errors() {
            return;
        }
        self.branch_false(id, target, jump_if_null);
    }

    fn branch_true(&mut self, id: ExprId, target: Label, jump_if_null: bool) {
        match self.pool.kind(id).clone() {
            ExprKind::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => {
                // a false left operand decides the conjunction
                let fall_through = self.prog.allocate_label();
                self.branch_false(left, fall_through, !jump_if_null);
                self.branch_true(right, target, jump_if_null);
                self.prog.resolve_label(fall_through);
            }
            ExprKind::Binary {
                op: BinaryOp::Or,
                left,
                right,
            } => {
                self.branch_true(left, target, jump_if_null);
                self.branch_true(right, target, jump_if_null);
            }
            ExprKind::Unary {
                op: UnaryOp::Not,
                operand,
            } => self.branch_false(operand, target, jump_if_null),
            ExprKind::Binary { op, left, right } if op.is_comparison() => {
                self.comparison_branch(id, op, left, right, target, jump_if_null, false);
            }
            ExprKind::NullTest { operand, negated } => {
                self.value(operand);
                let cond = if negated {
                    Opcode::NotNull
                } else {
                    Opcode::IsNull
                };
                self.prog.emit(cond, 1, target.raw());
            }
            _ => {
                self.value(id);
                self.prog
                    .emit(Opcode::If, i32::from(jump_if_null), target.raw());
            }
        }
    }

    fn branch_false(&mut self, id: ExprId, target: Label, jump_if_null: bool) {
        match self.pool.kind(id).clone() {
            ExprKind::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => {
                self.branch_false(left, target, jump_if_null);
                self.branch_false(right, target, jump_if_null);
            }
            ExprKind::Binary {
                op: BinaryOp::Or,
                left,
                right,
            } => {
                // a true left operand decides the disjunction
                let fall_through = self.prog.allocate_label();
                self.branch_true(left, fall_through, !jump_if_null);
                self.branch_false(right, target, jump_if_null);
                self.prog.resolve_label(fall_through);
            }
            ExprKind::Unary {
                op: UnaryOp::Not,
                operand,
            } => self.branch_true(operand, target, jump_if_null),
            ExprKind::Binary { op, left, right } if op.is_comparison() => {
                self.comparison_branch(id, op, left, right, target, jump_if_null, true);
            }
            ExprKind::NullTest { operand, negated } => {
                self.value(operand);
                let cond = if negated {
                    Opcode::IsNull
                } else {
                    Opcode::NotNull
                };
                self.prog.emit(cond, 1, target.raw());
            }
            _ => {
                self.value(id);
                self.prog
                    .emit(Opcode::IfNot, i32::from(jump_if_null), target.raw());
            }
        }
    }

    /// Fused comparison jump: `op p1=jump-if-null, p2=target`, with no
    /// boolean left on the stack
    fn comparison_branch(
        &mut self,
        id: ExprId,
        op: BinaryOp,
        left: ExprId,
        right: ExprId,
        target: Label,
        jump_if_null: bool,
        negate: bool,
    ) {
        self.value(left);
        self.value(right);
        let mut opcode = self.comparison_for(id, op);
        if negate {
            opcode = negate_preserving_affinity(opcode);
        }
        self.prog
            .emit(opcode, i32::from(jump_if_null), target.raw());
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn token_text(&self, id: ExprId) -> String {
        self.pool.node(id).token.text(&self.ctx.src).to_string()
    }

    fn affinity(&self, id: ExprId) -> Affinity {
        affinity_of(self.pool, self.registry, &self.ctx.src, id)
    }

    /// Comparison opcode for a whole comparison node, affinity-biased on
    /// file format 4 and later
    fn comparison_for(&self, node: ExprId, op: BinaryOp) -> Opcode {
        let base = comparison_base(op);
        if self.ctx.file_format >= 4 && self.affinity(node) == Affinity::Text {
            base.text_variant()
        } else {
            base
        }
    }

    /// Same bias for the synthetic comparisons inside BETWEEN and CASE,
    /// derived from the operand pair
    fn comparison_opcode(&self, base: Opcode, left: ExprId, right: ExprId) -> Opcode {
        if self.ctx.file_format >= 4 {
            let affinity = if self.affinity(left) == Affinity::Numeric {
                Affinity::Numeric
            } else {
                self.affinity(right)
            };
            if affinity == Affinity::Text {
                return base.text_variant();
            }
        }
        base
    }
}

fn arith_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Subtract => Opcode::Subtract,
        BinaryOp::Multiply => Opcode::Multiply,
        BinaryOp::Divide => Opcode::Divide,
        BinaryOp::Remainder => Opcode::Remainder,
        BinaryOp::BitAnd => Opcode::BitAnd,
        BinaryOp::BitOr => Opcode::BitOr,
        BinaryOp::ShiftLeft => Opcode::ShiftLeft,
        BinaryOp::ShiftRight => Opcode::ShiftRight,
        BinaryOp::And => Opcode::And,
        BinaryOp::Or => Opcode::Or,
        _ => Opcode::Noop,
    }
}

fn comparison_base(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Eq => Opcode::Eq,
        BinaryOp::Ne => Opcode::Ne,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Le => Opcode::Le,
        BinaryOp::Gt => Opcode::Gt,
        BinaryOp::Ge => Opcode::Ge,
        _ => Opcode::Noop,
    }
}

/// Negate a comparison while keeping its numeric/text family
fn negate_preserving_affinity(op: Opcode) -> Opcode {
    match op {
        Opcode::StrEq => Opcode::StrNe,
        Opcode::StrNe => Opcode::StrEq,
        Opcode::StrLt => Opcode::StrGe,
        Opcode::StrGe => Opcode::StrLt,
        Opcode::StrLe => Opcode::StrGt,
        Opcode::StrGt => Opcode::StrLe,
        other => other.negated_comparison(),
    }
}
