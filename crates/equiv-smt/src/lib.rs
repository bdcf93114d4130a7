#![doc = include_str!("../README.md")]

//! SMT encoding and solver integration for program equivalence checking.
//!
//! This crate provides a solver-agnostic term language, an SMT-LIB2 process
//! backend for z3 and cvc5, an encoder from acyclic IR programs to SMT
//! assertions, and the [`verifier::ProgramVerifier`] boundary the engine
//! submits finished programs to.

pub mod backends;
pub mod encoder;
pub mod sexp;
pub mod solver;
pub mod sorts;
pub mod terms;
pub mod verifier;

pub use backends::{ProcessSolver, SolverDialect, SolverError};
pub use encoder::{encode_program, EncodeError, ProgramEncoding};
pub use verifier::{
    FailedAssert, ProgramModel, ProgramVerifier, SmtProgramVerifier, SmtVerifierOptions, Verdict,
    VerifyError,
};
