#![doc = include_str!("../README.md")]

//! Equivalence-checking intermediate representation.
//!
//! This crate defines the control-flow-graph program model compared by the
//! equivalence engine, identifiers for program state and natural loops, the
//! graph and dataflow analyses the engine relies on, and program patching.

pub mod analysis;
pub mod error;
pub mod expr;
pub mod graph;
pub mod location;
pub mod patch;
pub mod program;
#[cfg(any(test, feature = "proptest"))]
pub mod proptest_generators;

pub use error::IrError;
pub use expr::{Expr, Sort, Value, Var};
pub use location::{Loop, ProgramValueLocation};
pub use program::{
    Annotation, AssertMeta, AssertTag, Block, BlockId, Cmd, CmdPointer, EventKind, ExitPayload,
    Program, ProgramBuilder,
};
