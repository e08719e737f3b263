//! # Quarry Database Core
//!
//! The core of a relational database engine: the compilation pipeline that
//! turns parsed SQL expression trees into stack-machine bytecode, and the
//! external merge sorter used when result volume outgrows memory.
//!
//! ## Pipeline Architecture
//!
//! ### Expression compilation
//! ```text
//! SQL Expression Tree (from the parser)
//!     ↓
//! [Resolver]     → identifiers bound to (database, table, column) slots
//!     ↓
//! [Checker]      → aggregate classification, arity checks, affinity
//!     ↓
//! [Emitter]      → (opcode, p1, p2, p3?) program + label table
//!     ↓
//! Virtual machine (external)
//! ```
//!
//! ### Sorting
//! ```text
//! write(record)* → in-memory runs → PMA spill files
//!     ↓ rewind
//! tournament-tree merge (optionally hierarchical + multi-threaded)
//!     ↓
//! rowkey / advance / compare
//! ```
//!
//! The two halves meet only in the emitted bytecode: `SortPut`,
//! `SortNext` and `SortKey` are the opcodes the statement compiler emits
//! against a sorter cursor.
//!
//! ## Usage
//!
//! ### Compiling an expression
//! ```rust,ignore
//! use quarry::{Emitter, ExprPool, FunctionRegistry, NameScope, ParseContext, Program};
//!
//! let mut ctx = ParseContext::new("x + 1");
//! let mut pool = ExprPool::new();
//! // ... parser builds nodes into the pool ...
//! let registry = FunctionRegistry::with_builtins();
//! let scope = NameScope::new(&tables);
//! quarry::resolve(&mut ctx, &mut pool, &scope, expr);
//!
//! let mut prog = Program::new();
//! Emitter::new(&mut ctx, &pool, &registry, &mut prog).emit_value(expr);
//! prog.seal()?;
//! ```
//!
//! ### Sorting records
//! ```rust,ignore
//! use quarry::{Sorter, SorterConfig, TypedKeyComparator};
//! use std::sync::Arc;
//!
//! let mut sorter = Sorter::new(&config.sorter, Arc::new(TypedKeyComparator::new(2)), 2);
//! for key in keys {
//!     sorter.write(&key)?;
//! }
//! let mut eof = sorter.rewind()?;
//! while !eof {
//!     consume(sorter.rowkey()?);
//!     eof = !sorter.advance()?;
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `expr` | Expression tree arena, resolver, checker |
//! | `catalog` | Table schemas, function registry, access hook |
//! | `parse` | Per-statement compilation state and error plumbing |
//! | `vm` | Opcode table, program buffer, bytecode emitter |
//! | `sort` | PMA spill files, tournament-tree merge, worker threads |
//! | `budget` | Cooperative memory accounting |
//! | `config` | Hierarchical configuration (quarry.toml + env) |

pub mod budget;
pub mod catalog;
pub mod config;
pub mod expr;
pub mod parse;
pub mod sort;
pub mod vm;

// Re-export the compiler surface
pub use crate::catalog::{
    AccessPolicy, AllowAll, ColumnSchema, FunctionDef, FunctionId, FunctionRegistry, SourceTable,
    TableSchema, TriggerScope,
};
pub use crate::expr::check::{affinity_of, analyze_aggregates, check};
pub use crate::expr::resolve::{resolve, NameScope};
pub use crate::expr::{
    Affinity, BinaryOp, ColumnRef, ExprId, ExprKind, ExprList, ExprPool, RaiseAction, SortOrder,
    Token, UnaryOp,
};
pub use crate::parse::{AggEntry, ParseContext};
pub use crate::vm::{CompileError, Emitter, Insn, Label, Opcode, Program};

// Re-export the sorter surface
pub use crate::budget::MemoryBudget;
pub use crate::config::{Config, SorterConfig};
pub use crate::sort::{
    decode_key, encode_key, KeyComparator, SortError, SortField, SortResult, Sorter, StdTempStore,
    TempHandle, TempStore, TypedKeyComparator, UnpackedRecord,
};
