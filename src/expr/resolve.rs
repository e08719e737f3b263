//! Identifier Resolution
//!
//! Binds bare and dotted identifiers to `(database, table, column)` slots
//! against the statement's source-table list, rewrites result-alias
//! references, and allocates the runtime resources (`IN` sets, subquery
//! cursors, scalar-subquery memory cells) the emitter will target.
//!
//! Resolution mutates nodes in place and accumulates formatted errors on the
//! parse context; the return value is the number of errors added, so callers
//! can chain passes and report everything at once.

use super::{
    dequote, is_double_quoted, Affinity, ColumnRef, ExprId, ExprKind, ExprList, ExprPool,
};
use crate::catalog::{AccessPolicy, SourceTable, TriggerScope};
use crate::parse::ParseContext;

/// Everything in scope for identifier binding
pub struct NameScope<'a> {
    /// Tables brought into scope by the FROM clause, in order
    pub tables: &'a [SourceTable],
    /// Result-set expressions whose aliases may be referenced (e.g. by
    /// WHERE in the original statement position)
    pub result_aliases: Option<&'a ExprList>,
    /// Trigger pseudo-tables, when resolving inside a trigger body
    pub trigger: Option<&'a TriggerScope>,
    /// Host access-check hook
    pub access: Option<&'a dyn AccessPolicy>,
}

impl<'a> NameScope<'a> {
    pub fn new(tables: &'a [SourceTable]) -> Self {
        NameScope {
            tables,
            result_aliases: None,
            trigger: None,
            access: None,
        }
    }

    pub fn with_aliases(mut self, aliases: &'a ExprList) -> Self {
        self.result_aliases = Some(aliases);
        self
    }

    pub fn with_trigger(mut self, trigger: &'a TriggerScope) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_access(mut self, access: &'a dyn AccessPolicy) -> Self {
        self.access = Some(access);
        self
    }
}

/// Resolve every identifier in the tree rooted at `expr`.
/// Returns the number of errors recorded on `ctx`.
pub fn resolve(
    ctx: &mut ParseContext,
    pool: &mut ExprPool,
    scope: &NameScope<'_>,
    expr: ExprId,
) -> usize {
    let before = ctx.error_count();
    resolve_node(ctx, pool, scope, expr);
    ctx.error_count() - before
}

fn resolve_node(ctx: &mut ParseContext, pool: &mut ExprPool, scope: &NameScope<'_>, id: ExprId) {
    match pool.kind(id).clone() {
        ExprKind::Id | ExprKind::Dot { .. } => bind_identifier(ctx, pool, scope, id),
        ExprKind::String => {
            // A double-quoted string is tried as an identifier first; if it
            // binds nowhere it stays a plain string literal.
            let lexeme = pool.node(id).token.text(&ctx.src);
            if is_double_quoted(lexeme) {
                bind_identifier(ctx, pool, scope, id);
            }
        }
        ExprKind::Column(_) | ExprKind::Alias { .. } => {
            // already resolved; a second pass leaves them untouched
        }
        ExprKind::Binary { left, right, .. } => {
            resolve_node(ctx, pool, scope, left);
            resolve_node(ctx, pool, scope, right);
        }
        ExprKind::Unary { operand, .. } | ExprKind::NullTest { operand, .. } => {
            resolve_node(ctx, pool, scope, operand);
        }
        ExprKind::Function { args } | ExprKind::AggFunction { args, .. } => {
            for item in args.iter() {
                resolve_node(ctx, pool, scope, item.expr);
            }
        }
        ExprKind::InList { lhs, items, .. } => {
            resolve_node(ctx, pool, scope, lhs);
            for item in items.iter() {
                resolve_node(ctx, pool, scope, item.expr);
            }
            resolve_in_list(ctx, pool, id, &items);
        }
        ExprKind::InSelect { lhs, .. } => {
            resolve_node(ctx, pool, scope, lhs);
            // Evaluated into a temporary set at execute time; reserve the
            // cursor that set will live under.
            if let ExprKind::InSelect { cursor, .. } = &mut pool.node_mut(id).kind {
                if cursor.is_none() {
                    *cursor = Some(ctx.allocate_cursor());
                }
            }
        }
        ExprKind::Select { .. } => {
            // Scalar subquery leaves its single value in a memory cell.
            if let ExprKind::Select { mem_cell, .. } = &mut pool.node_mut(id).kind {
                if mem_cell.is_none() {
                    *mem_cell = Some(ctx.allocate_mem_cell());
                }
            }
        }
        ExprKind::Between {
            operand,
            lower,
            upper,
        } => {
            resolve_node(ctx, pool, scope, operand);
            resolve_node(ctx, pool, scope, lower);
            resolve_node(ctx, pool, scope, upper);
        }
        ExprKind::Case {
            base,
            whens,
            else_expr,
        } => {
            if let Some(b) = base {
                resolve_node(ctx, pool, scope, b);
            }
            for (w, t) in whens {
                resolve_node(ctx, pool, scope, w);
                resolve_node(ctx, pool, scope, t);
            }
            if let Some(e) = else_expr {
                resolve_node(ctx, pool, scope, e);
            }
        }
        ExprKind::Null
        | ExprKind::Integer
        | ExprKind::Float
        | ExprKind::Variable
        | ExprKind::Raise { .. } => {}
    }
}

/// A value-list `IN` needs every element constant, then a set identifier
/// for the runtime membership probe.
fn resolve_in_list(ctx: &mut ParseContext, pool: &mut ExprPool, id: ExprId, items: &ExprList) {
    let mut ok = true;
    for item in items.iter() {
        if !pool.is_constant(item.expr) {
            ctx.error("right-hand side of IN operator must be constant");
            ok = false;
        }
    }
    if ok {
        if let ExprKind::InList { set_id, .. } = &mut pool.node_mut(id).kind {
            if set_id.is_none() {
                *set_id = Some(ctx.allocate_set_id());
            }
        }
    }
}

/// The three dequoted name parts of an identifier expression
struct NameParts {
    database: Option<String>,
    table: Option<String>,
    column: String,
    /// True when the column part was written as a double-quoted string
    quoted_column: bool,
}

fn split_name(ctx: &ParseContext, pool: &ExprPool, id: ExprId) -> Option<NameParts> {
    let text = |id: ExprId| pool.node(id).token.text(&ctx.src).to_string();
    let part = |id: ExprId| dequote(&text(id));

    match pool.kind(id) {
        ExprKind::Id => Some(NameParts {
            database: None,
            table: None,
            column: part(id),
            quoted_column: false,
        }),
        ExprKind::String => Some(NameParts {
            database: None,
            table: None,
            column: part(id),
            quoted_column: is_double_quoted(&text(id)),
        }),
        ExprKind::Dot { left, right } => match (pool.kind(*left), pool.kind(*right)) {
            // table.column
            (ExprKind::Id, ExprKind::Id | ExprKind::String) => Some(NameParts {
                database: None,
                table: Some(part(*left)),
                column: part(*right),
                quoted_column: false,
            }),
            // database.table.column
            (ExprKind::Id, ExprKind::Dot { left: t, right: c }) => Some(NameParts {
                database: Some(part(*left)),
                table: Some(part(*t)),
                column: part(*c),
                quoted_column: false,
            }),
            (ExprKind::Dot { left: d, right: t }, ExprKind::Id | ExprKind::String) => {
                Some(NameParts {
                    database: Some(part(*d)),
                    table: Some(part(*t)),
                    column: part(*right),
                    quoted_column: false,
                })
            }
            _ => None,
        },
        _ => None,
    }
}

impl NameParts {
    /// `db.table.column` with only the parts that were written
    fn qualified(&self) -> String {
        let mut out = String::new();
        if let Some(db) = &self.database {
            out.push_str(db);
            out.push('.');
        }
        if let Some(t) = &self.table {
            out.push_str(t);
            out.push('.');
        }
        out.push_str(&self.column);
        out
    }
}

fn is_row_id_name(name: &str) -> bool {
    name.eq_ignore_ascii_case("_rowid_")
        || name.eq_ignore_ascii_case("rowid")
        || name.eq_ignore_ascii_case("oid")
}

fn bind_identifier(ctx: &mut ParseContext, pool: &mut ExprPool, scope: &NameScope<'_>, id: ExprId) {
    let Some(parts) = split_name(ctx, pool, id) else {
        ctx.error("malformed identifier expression");
        return;
    };

    // Walk the source list counting table and column matches. Alias names
    // override schema names; a database qualifier filters further.
    let mut cnt_tab = 0usize;
    let mut cnt = 0usize;
    let mut hit: Option<(usize, usize)> = None; // (source index, column index)
    let mut only_tab: Option<usize> = None;

    for (si, st) in scope.tables.iter().enumerate() {
        if let Some(t) = &parts.table {
            if !st.effective_name().eq_ignore_ascii_case(t) {
                continue;
            }
            if let Some(db) = &parts.database {
                if !st.database.eq_ignore_ascii_case(db) {
                    continue;
                }
            }
        }
        cnt_tab += 1;
        only_tab = Some(si);
        if let Some(ci) = st.table.column_index(&parts.column) {
            cnt += 1;
            if hit.is_none() {
                hit = Some((si, ci));
            }
        }
    }

    if let Some((si, ci)) = hit {
        if cnt > 1 {
            ctx.error(format!("ambiguous column name: {}", parts.qualified()));
            return;
        }
        bind_to_source(ctx, pool, scope, id, si, ci as i32, &parts);
        return;
    }

    // Trigger bodies see the pinned new/old pseudo-rows.
    if let (Some(trigger), Some(t)) = (scope.trigger, parts.table.as_deref()) {
        let pseudo_cursor = if t.eq_ignore_ascii_case("new") {
            trigger.new_cursor
        } else if t.eq_ignore_ascii_case("old") {
            trigger.old_cursor
        } else {
            None
        };
        if let Some(cursor) = pseudo_cursor {
            if let Some(ci) = trigger.table.column_index(&parts.column) {
                let affinity = trigger.table.columns[ci].affinity;
                let column_index = if trigger.table.int_pk == Some(ci) {
                    -1
                } else {
                    ci as i32
                };
                rewrite_to_column(pool, id, ColumnRef::new(0, cursor, column_index, affinity));
                check_access(ctx, scope, "main", &trigger.table.name, &parts);
                return;
            }
        }
    }

    // The row identifier answers to three spellings when exactly one
    // candidate table is in scope.
    if cnt == 0 && is_row_id_name(&parts.column) && cnt_tab == 1 {
        let si = only_tab.unwrap_or(0);
        let st = &scope.tables[si];
        rewrite_to_column(
            pool,
            id,
            ColumnRef::new(st.db_index, st.cursor, -1, Affinity::Numeric),
        );
        check_access(ctx, scope, &st.database.clone(), &st.table.name.clone(), &parts);
        return;
    }

    // An unqualified name may refer to an aliased result column; the node
    // becomes an alias wrapper around a private copy of that expression.
    if parts.database.is_none() && parts.table.is_none() {
        if let Some(aliases) = scope.result_aliases {
            let found = aliases
                .iter()
                .find(|item| {
                    item.alias
                        .as_deref()
                        .is_some_and(|a| a.eq_ignore_ascii_case(&parts.column))
                })
                .map(|item| item.expr);
            if let Some(aliased) = found {
                let inner = pool.deep_copy(aliased, &ctx.src);
                pool.node_mut(id).kind = ExprKind::Alias { inner };
                return;
            }
        }
    }

    // A double-quoted lexeme that matched nothing stays a string literal.
    if parts.quoted_column && parts.table.is_none() {
        return;
    }

    if cnt > 1 {
        ctx.error(format!("ambiguous column name: {}", parts.qualified()));
    } else {
        ctx.error(format!("no such column: {}", parts.qualified()));
    }
}

fn bind_to_source(
    ctx: &mut ParseContext,
    pool: &mut ExprPool,
    scope: &NameScope<'_>,
    id: ExprId,
    source_index: usize,
    column_index: i32,
    parts: &NameParts,
) {
    let st = &scope.tables[source_index];
    let ci = column_index as usize;
    let affinity = st.table.columns[ci].affinity;
    // An integer primary key is an alias for the row identifier.
    let column_index = if st.table.int_pk == Some(ci) {
        -1
    } else {
        column_index
    };
    let colref = ColumnRef::new(st.db_index, st.cursor, column_index, affinity);
    let database = st.database.clone();
    let table_name = st.table.name.clone();
    rewrite_to_column(pool, id, colref);
    check_access(ctx, scope, &database, &table_name, parts);
}

/// Rewrite the node in place, releasing any identifier children
fn rewrite_to_column(pool: &mut ExprPool, id: ExprId, colref: ColumnRef) {
    pool.node_mut(id).kind = ExprKind::Column(colref);
}

fn check_access(
    ctx: &mut ParseContext,
    scope: &NameScope<'_>,
    database: &str,
    table: &str,
    parts: &NameParts,
) {
    if let Some(policy) = scope.access {
        let column = if is_row_id_name(&parts.column) {
            "ROWID"
        } else {
            parts.column.as_str()
        };
        if !policy.can_read_column(database, table, column) {
            ctx.error(format!(
                "access to {database}.{table}.{column} is prohibited"
            ));
        }
    }
}
