//! Expression Checking
//!
//! Three post-resolution passes:
//!
//! - [`check`] validates function existence and arity and polices aggregate
//!   placement (no aggregates where they are not allowed, no aggregates
//!   nested inside aggregate arguments).
//! - [`analyze_aggregates`] populates the parse context's aggregate table:
//!   column references used under aggregation get non-aggregate slots, each
//!   distinct aggregate call gets an aggregate slot with its function
//!   binding resolved once, and qualifying `Function` nodes are rewritten to
//!   `AggFunction`.
//! - [`affinity_of`] infers the numeric-vs-text affinity of any node from a
//!   fixed rule table. The function is pure, so repeated application is
//!   trivially idempotent.

use super::{Affinity, BinaryOp, ExprId, ExprKind, ExprPool, UnaryOp};
use crate::catalog::FunctionRegistry;
use crate::parse::{AggEntry, ParseContext};

/// Validate function calls and aggregate placement below `expr`.
/// Returns `(errors added, aggregate seen)`.
pub fn check(
    ctx: &mut ParseContext,
    pool: &mut ExprPool,
    registry: &FunctionRegistry,
    expr: ExprId,
    allow_aggregates: bool,
) -> (usize, bool) {
    let before = ctx.error_count();
    let mut has_agg = false;
    check_node(ctx, pool, registry, expr, allow_aggregates, &mut has_agg);
    (ctx.error_count() - before, has_agg)
}

fn check_node(
    ctx: &mut ParseContext,
    pool: &mut ExprPool,
    registry: &FunctionRegistry,
    id: ExprId,
    allow_aggregates: bool,
    has_agg: &mut bool,
) {
    match pool.kind(id).clone() {
        ExprKind::Function { args } => {
            let name = pool.node(id).token.text(&ctx.src).to_string();
            let n = args.len() as i32;
            let mut arg_allow = allow_aggregates;
            match registry.lookup(&name, n) {
                None => {
                    if registry.has_name(&name) {
                        ctx.error(format!("wrong number of arguments to function {name}()"));
                    } else {
                        ctx.error(format!("no such function: {name}"));
                    }
                }
                Some(fid) => {
                    if registry.def(fid).is_aggregate {
                        if allow_aggregates {
                            *has_agg = true;
                            // nested aggregates are forbidden
                            arg_allow = false;
                        } else {
                            ctx.error(format!("misuse of aggregate function {name}()"));
                        }
                    }
                }
            }
            for item in args.iter() {
                check_node(ctx, pool, registry, item.expr, arg_allow, has_agg);
            }
        }
        ExprKind::AggFunction { args, .. } => {
            if allow_aggregates {
                *has_agg = true;
            } else {
                let name = pool.node(id).token.text(&ctx.src).to_string();
                ctx.error(format!("misuse of aggregate function {name}()"));
            }
            for item in args.iter() {
                check_node(ctx, pool, registry, item.expr, false, has_agg);
            }
        }
        ExprKind::Dot { left, right } | ExprKind::Binary { left, right, .. } => {
            check_node(ctx, pool, registry, left, allow_aggregates, has_agg);
            check_node(ctx, pool, registry, right, allow_aggregates, has_agg);
        }
        ExprKind::Alias { inner } => {
            check_node(ctx, pool, registry, inner, allow_aggregates, has_agg);
        }
        ExprKind::Unary { operand, .. } | ExprKind::NullTest { operand, .. } => {
            check_node(ctx, pool, registry, operand, allow_aggregates, has_agg);
        }
        ExprKind::InList { lhs, items, .. } => {
            check_node(ctx, pool, registry, lhs, allow_aggregates, has_agg);
            for item in items.iter() {
                check_node(ctx, pool, registry, item.expr, allow_aggregates, has_agg);
            }
        }
        ExprKind::InSelect { lhs, .. } => {
            check_node(ctx, pool, registry, lhs, allow_aggregates, has_agg);
        }
        ExprKind::Between {
            operand,
            lower,
            upper,
        } => {
            check_node(ctx, pool, registry, operand, allow_aggregates, has_agg);
            check_node(ctx, pool, registry, lower, allow_aggregates, has_agg);
            check_node(ctx, pool, registry, upper, allow_aggregates, has_agg);
        }
        ExprKind::Case {
            base,
            whens,
            else_expr,
        } => {
            if let Some(b) = base {
                check_node(ctx, pool, registry, b, allow_aggregates, has_agg);
            }
            for (w, t) in whens {
                check_node(ctx, pool, registry, w, allow_aggregates, has_agg);
                check_node(ctx, pool, registry, t, allow_aggregates, has_agg);
            }
            if let Some(e) = else_expr {
                check_node(ctx, pool, registry, e, allow_aggregates, has_agg);
            }
        }
        _ => {}
    }
}

/// Populate the aggregate table for the finalisation pass.
/// Returns the number of errors recorded.
pub fn analyze_aggregates(
    ctx: &mut ParseContext,
    pool: &mut ExprPool,
    registry: &FunctionRegistry,
    expr: ExprId,
) -> usize {
    let before = ctx.error_count();
    analyze_node(ctx, pool, registry, expr);
    ctx.error_count() - before
}

fn analyze_node(
    ctx: &mut ParseContext,
    pool: &mut ExprPool,
    registry: &FunctionRegistry,
    id: ExprId,
) {
    match pool.kind(id).clone() {
        ExprKind::Column(colref) => {
            let slot = find_slot(ctx, pool, id).unwrap_or_else(|| {
                ctx.push_agg_entry(AggEntry {
                    expr: id,
                    is_aggregate: false,
                    binding: None,
                })
            });
            let mut colref = colref;
            colref.agg_slot = slot;
            pool.node_mut(id).kind = ExprKind::Column(colref);
        }
        ExprKind::Function { args } => {
            let name = pool.node(id).token.text(&ctx.src).to_string();
            let binding = registry
                .lookup(&name, args.len() as i32)
                .filter(|fid| registry.def(*fid).is_aggregate);
            if let Some(binding) = binding {
                // Rewrite before the slot search so duplicates of this call
                // compare equal against previously rewritten entries.
                pool.node_mut(id).kind = ExprKind::AggFunction {
                    args: args.clone(),
                    binding,
                    agg_slot: -1,
                };
                let slot = find_slot(ctx, pool, id).unwrap_or_else(|| {
                    ctx.push_agg_entry(AggEntry {
                        expr: id,
                        is_aggregate: true,
                        binding: Some(binding),
                    })
                });
                if let ExprKind::AggFunction { agg_slot, .. } = &mut pool.node_mut(id).kind {
                    *agg_slot = slot;
                }
            }
            for item in args.iter() {
                analyze_node(ctx, pool, registry, item.expr);
            }
        }
        ExprKind::AggFunction { args, binding, .. } => {
            let slot = find_slot(ctx, pool, id).unwrap_or_else(|| {
                ctx.push_agg_entry(AggEntry {
                    expr: id,
                    is_aggregate: true,
                    binding: Some(binding),
                })
            });
            if let ExprKind::AggFunction { agg_slot, .. } = &mut pool.node_mut(id).kind {
                *agg_slot = slot;
            }
            for item in args.iter() {
                analyze_node(ctx, pool, registry, item.expr);
            }
        }
        ExprKind::Dot { left, right } | ExprKind::Binary { left, right, .. } => {
            analyze_node(ctx, pool, registry, left);
            analyze_node(ctx, pool, registry, right);
        }
        ExprKind::Alias { inner } => analyze_node(ctx, pool, registry, inner),
        ExprKind::Unary { operand, .. } | ExprKind::NullTest { operand, .. } => {
            analyze_node(ctx, pool, registry, operand);
        }
        ExprKind::InList { lhs, items, .. } => {
            analyze_node(ctx, pool, registry, lhs);
            for item in items.iter() {
                analyze_node(ctx, pool, registry, item.expr);
            }
        }
        ExprKind::InSelect { lhs, .. } => analyze_node(ctx, pool, registry, lhs),
        ExprKind::Between {
            operand,
            lower,
            upper,
        } => {
            analyze_node(ctx, pool, registry, operand);
            analyze_node(ctx, pool, registry, lower);
            analyze_node(ctx, pool, registry, upper);
        }
        ExprKind::Case {
            base,
            whens,
            else_expr,
        } => {
            if let Some(b) = base {
                analyze_node(ctx, pool, registry, b);
            }
            for (w, t) in whens {
                analyze_node(ctx, pool, registry, w);
                analyze_node(ctx, pool, registry, t);
            }
            if let Some(e) = else_expr {
                analyze_node(ctx, pool, registry, e);
            }
        }
        _ => {}
    }
}

/// Existing aggregate-table slot holding a structurally equal expression
fn find_slot(ctx: &ParseContext, pool: &ExprPool, id: ExprId) -> Option<i32> {
    ctx.agg_table()
        .iter()
        .position(|entry| pool.exprs_equal(entry.expr, id, &ctx.src))
        .map(|i| i as i32)
}

/// Infer the comparison affinity of a node from the fixed rule table
pub fn affinity_of(pool: &ExprPool, registry: &FunctionRegistry, src: &str, id: ExprId) -> Affinity {
    match pool.kind(id) {
        ExprKind::Integer | ExprKind::Float => Affinity::Numeric,
        ExprKind::Null | ExprKind::String | ExprKind::Variable => Affinity::Text,
        ExprKind::Id | ExprKind::Dot { .. } => Affinity::Text,
        ExprKind::Column(c) => c.affinity,
        ExprKind::Alias { inner } => affinity_of(pool, registry, src, *inner),
        ExprKind::Binary { op, left, right } => match op {
            BinaryOp::Add
            | BinaryOp::Subtract
            | BinaryOp::Multiply
            | BinaryOp::Divide
            | BinaryOp::Remainder
            | BinaryOp::BitAnd
            | BinaryOp::BitOr
            | BinaryOp::ShiftLeft
            | BinaryOp::ShiftRight
            | BinaryOp::Like
            | BinaryOp::Glob
            | BinaryOp::And
            | BinaryOp::Or => Affinity::Numeric,
            BinaryOp::Concat => Affinity::Text,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt
            | BinaryOp::Ge => {
                if affinity_of(pool, registry, src, *left) == Affinity::Numeric {
                    Affinity::Numeric
                } else {
                    affinity_of(pool, registry, src, *right)
                }
            }
        },
        ExprKind::Unary { op, operand } => match op {
            UnaryOp::Plus => affinity_of(pool, registry, src, *operand),
            UnaryOp::Negate | UnaryOp::Not | UnaryOp::BitNot => Affinity::Numeric,
        },
        ExprKind::NullTest { .. }
        | ExprKind::Between { .. }
        | ExprKind::InList { .. }
        | ExprKind::InSelect { .. } => Affinity::Numeric,
        ExprKind::Function { args } => {
            let name = pool.node(id).token.text(src);
            registry
                .lookup(name, args.len() as i32)
                .map_or(Affinity::Text, |fid| registry.def(fid).result_affinity)
        }
        ExprKind::AggFunction { binding, .. } => registry.def(*binding).result_affinity,
        ExprKind::Select { select, .. } => select
            .columns
            .items()
            .first()
            .map_or(Affinity::Numeric, |item| {
                affinity_of(pool, registry, src, item.expr)
            }),
        ExprKind::Case {
            whens, else_expr, ..
        } => {
            let else_numeric = else_expr
                .map(|e| affinity_of(pool, registry, src, e) == Affinity::Numeric)
                .unwrap_or(false);
            let then_numeric = whens
                .iter()
                .any(|(_, t)| affinity_of(pool, registry, src, *t) == Affinity::Numeric);
            if else_numeric || then_numeric {
                Affinity::Numeric
            } else {
                Affinity::Text
            }
        }
        ExprKind::Raise { .. } => Affinity::Text,
    }
}
