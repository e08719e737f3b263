//! # Virtual Machine Targeting
//!
//! The compiler's back half: the opcode table the stack machine executes,
//! the program buffer with label fixup, and the expression emitter.
//!
//! ## Pipeline Position
//!
//! ```text
//! Resolved/checked ExprPool -> [Emitter] -> Program (sealed) -> VM
//! ```
//!
//! The VM itself lives outside this crate; the contract is the instruction
//! format `(opcode, p1, p2, p3?)` plus the invariant that each text
//! comparison opcode is exactly `COMPARISON_TEXT_OFFSET` above its numeric
//! counterpart.

pub mod emit;
pub mod opcode;
pub mod program;

pub use emit::Emitter;
pub use opcode::{Opcode, COMPARISON_TEXT_OFFSET, HALT_CONSTRAINT};
pub use program::{CompileError, Insn, Label, Program};
