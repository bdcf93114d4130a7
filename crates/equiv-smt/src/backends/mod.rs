//! Solver backends speaking SMT-LIB2 to an external process.

pub mod process;
pub mod smtlib_printer;

pub use process::{ProcessSolver, SolverDialect, SolverError};
