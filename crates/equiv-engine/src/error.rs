//! Engine error type.

use equiv_ir::IrError;
use equiv_smt::VerifyError;
use thiserror::Error;

/// Unrecoverable engine failures. Expected program shapes the engine cannot
/// handle are reported as `Option`/`EquivalenceResult::GaveUp` instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("IR error: {0}")]
    Ir(#[from] IrError),
    #[error("Instrumentation error: {0}")]
    Instrumentation(String),
    #[error("Rule generation error: {0}")]
    RuleGeneration(String),
    #[error("Solver error: {0}")]
    Verify(#[from] VerifyError),
    #[error("Invariant violation: {0}")]
    Invariant(String),
    #[error("Report error: {0}")]
    Report(#[from] std::io::Error),
    #[error("Options error: {0}")]
    Options(serde_json::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
