//! Catalog: schema and function metadata for the expression compiler
//!
//! Tracks table schemas (column names and declared affinities), the SQL
//! function registry consulted by the checker and emitter, and the optional
//! host access-check hook invoked when a column reference is bound.

use crate::expr::Affinity;
use std::sync::Arc;

// ============================================================================
// Tables
// ============================================================================

/// One declared column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub affinity: Affinity,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, affinity: Affinity) -> Self {
        ColumnSchema {
            name: name.into(),
            affinity,
        }
    }
}

/// A table schema as the resolver sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    /// Column aliased to the row identifier, if the table declared an
    /// integer primary key
    pub int_pk: Option<usize>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        TableSchema {
            name: name.into(),
            columns,
            int_pk: None,
        }
    }

    pub fn with_int_pk(mut self, column: usize) -> Self {
        self.int_pk = Some(column);
        self
    }

    /// Case-insensitive column lookup
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// One entry of the resolver's source-table list: a table pulled into scope
/// by a FROM clause, with its cursor and optional alias
#[derive(Debug, Clone)]
pub struct SourceTable {
    pub table: Arc<TableSchema>,
    /// Alias from `FROM t AS a`; overrides the schema name for matching
    pub alias: Option<String>,
    pub database: String,
    pub db_index: i32,
    pub cursor: i32,
}

impl SourceTable {
    pub fn new(table: Arc<TableSchema>, cursor: i32) -> Self {
        SourceTable {
            table,
            alias: None,
            database: "main".to_string(),
            db_index: 0,
            cursor,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>, db_index: i32) -> Self {
        self.database = database.into();
        self.db_index = db_index;
        self
    }

    /// The name this table answers to in identifier resolution
    pub fn effective_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table.name)
    }
}

/// Pinned `new`/`old` pseudo-tables available inside a trigger body
#[derive(Debug, Clone)]
pub struct TriggerScope {
    pub table: Arc<TableSchema>,
    /// Cursor holding the `new` pseudo-row, if the trigger exposes one
    pub new_cursor: Option<i32>,
    /// Cursor holding the `old` pseudo-row, if the trigger exposes one
    pub old_cursor: Option<i32>,
    /// Jump target for `RAISE(IGNORE)`
    pub ignore_label: crate::vm::Label,
}

// ============================================================================
// Functions
// ============================================================================

/// Index into the [`FunctionRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub(crate) u32);

impl FunctionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A registered SQL function
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    /// Expected argument count; -1 accepts any count
    pub arity: i32,
    pub is_aggregate: bool,
    /// When set, the emitter pushes each argument's affinity name after
    /// the argument value
    pub wants_arg_types: bool,
    pub result_affinity: Affinity,
}

/// Name + arity lookup table for SQL functions
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    defs: Vec<FunctionDef>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        FunctionRegistry { defs: Vec::new() }
    }

    /// Registry pre-loaded with the built-in SQL functions
    pub fn with_builtins() -> Self {
        let mut reg = FunctionRegistry::new();
        let scalar = |name: &str, arity: i32, affinity: Affinity| FunctionDef {
            name: name.to_string(),
            arity,
            is_aggregate: false,
            wants_arg_types: false,
            result_affinity: affinity,
        };
        let agg = |name: &str, arity: i32| FunctionDef {
            name: name.to_string(),
            arity,
            is_aggregate: true,
            wants_arg_types: false,
            result_affinity: Affinity::Numeric,
        };

        reg.register(scalar("length", 1, Affinity::Numeric));
        reg.register(scalar("substr", 3, Affinity::Text));
        reg.register(scalar("abs", 1, Affinity::Numeric));
        reg.register(scalar("round", -1, Affinity::Numeric));
        reg.register(scalar("upper", 1, Affinity::Text));
        reg.register(scalar("lower", 1, Affinity::Text));
        reg.register(scalar("coalesce", -1, Affinity::Text));
        reg.register(scalar("ifnull", 2, Affinity::Text));
        reg.register(scalar("like", 2, Affinity::Numeric));
        reg.register(scalar("glob", 2, Affinity::Numeric));
        reg.register(scalar("random", 0, Affinity::Numeric));
        reg.register(FunctionDef {
            name: "typeof".to_string(),
            arity: 1,
            is_aggregate: false,
            wants_arg_types: true,
            result_affinity: Affinity::Text,
        });
        // min/max are scalar at two or more arguments, aggregate at one
        reg.register(scalar("min", -1, Affinity::Numeric));
        reg.register(scalar("max", -1, Affinity::Numeric));
        reg.register(agg("min", 1));
        reg.register(agg("max", 1));
        reg.register(agg("count", -1));
        reg.register(agg("sum", 1));
        reg.register(agg("avg", 1));
        reg
    }

    pub fn register(&mut self, def: FunctionDef) -> FunctionId {
        let id = FunctionId(self.defs.len() as u32);
        self.defs.push(def);
        id
    }

    pub fn def(&self, id: FunctionId) -> &FunctionDef {
        &self.defs[id.index()]
    }

    /// Find a function by name at exactly `n_args`, falling back to a
    /// variadic registration. Aggregate registrations are preferred only
    /// when they match arity exactly, mirroring min/max duality.
    pub fn lookup(&self, name: &str, n_args: i32) -> Option<FunctionId> {
        let matches = |def: &FunctionDef, arity: i32| {
            def.name.eq_ignore_ascii_case(name) && def.arity == arity
        };
        // exact-arity aggregate first, then exact scalar, then variadic
        self.position(|d| matches(d, n_args) && d.is_aggregate)
            .or_else(|| self.position(|d| matches(d, n_args)))
            .or_else(|| self.position(|d| matches(d, -1)))
    }

    /// True when any registration carries this name, at any arity
    pub fn has_name(&self, name: &str) -> bool {
        self.defs.iter().any(|d| d.name.eq_ignore_ascii_case(name))
    }

    fn position(&self, pred: impl Fn(&FunctionDef) -> bool) -> Option<FunctionId> {
        self.defs
            .iter()
            .position(|d| pred(d))
            .map(|i| FunctionId(i as u32))
    }
}

// ============================================================================
// Access hook
// ============================================================================

/// Host veto over column reads, consulted as each reference is bound
pub trait AccessPolicy {
    /// Return false to deny the read
    fn can_read_column(&self, database: &str, table: &str, column: &str) -> bool;
}

/// Policy that admits everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn can_read_column(&self, _database: &str, _table: &str, _column: &str) -> bool {
        true
    }
}
