//! Engine configuration and deadline utilities.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use equiv_smt::{SmtProgramVerifier, SmtVerifierOptions, SolverDialect};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Which solver binary the process backend drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverChoice {
    #[default]
    Z3,
    Cvc5,
}

impl From<SolverChoice> for SolverDialect {
    fn from(choice: SolverChoice) -> Self {
        match choice {
            SolverChoice::Z3 => SolverDialect::Z3,
            SolverChoice::Cvc5 => SolverDialect::Cvc5,
        }
    }
}

/// Options of one top-level equivalence query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EquivalenceOptions {
    pub solver: SolverChoice,
    /// Per-query solver timeout in seconds (0 = none).
    pub timeout_secs: u64,
    /// Wall-clock budget of the whole query in seconds (0 = none).
    pub deadline_secs: u64,
    /// Words of an event buffer captured for exact extraction.
    pub exact_buffer_words: usize,
    /// Length of the write history kept per tracked buffer.
    pub max_tracked_writes: usize,
    /// Unrolling bound for loops that could not be summarized.
    pub loop_unroll: usize,
    pub summarize_loops: bool,
    /// Directory receiving one SMT transcript per solver query.
    pub dump_smt: Option<PathBuf>,
    /// File receiving the plain-text trace of a counterexample; stdout when unset.
    pub trace_dump: Option<PathBuf>,
    /// Path of the HTML report.
    pub report: Option<PathBuf>,
}

impl Default for EquivalenceOptions {
    fn default() -> Self {
        Self {
            solver: SolverChoice::Z3,
            timeout_secs: 60,
            deadline_secs: 0,
            exact_buffer_words: 4,
            max_tracked_writes: 8,
            loop_unroll: 2,
            summarize_loops: true,
            dump_smt: None,
            trace_dump: None,
            report: None,
        }
    }
}

impl EquivalenceOptions {
    pub fn from_json_file(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(EngineError::Options)
    }

    /// Process-backed verifier configured from these options.
    pub fn verifier(&self) -> SmtProgramVerifier {
        SmtProgramVerifier::new(SmtVerifierOptions {
            dialect: self.solver.into(),
            command: None,
            timeout: overall_timeout_duration(self.timeout_secs),
            dump_dir: self.dump_smt.clone(),
            sanity_check: true,
        })
    }

    pub fn deadline(&self) -> Option<Instant> {
        deadline_from_timeout_secs(self.deadline_secs)
    }
}

pub(crate) fn deadline_exceeded(deadline: Option<Instant>) -> bool {
    match deadline {
        Some(deadline) => Instant::now() >= deadline,
        None => false,
    }
}

pub(crate) fn overall_timeout_duration(timeout_secs: u64) -> Option<Duration> {
    if timeout_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(timeout_secs))
    }
}

pub(crate) fn deadline_from_timeout_secs(timeout_secs: u64) -> Option<Instant> {
    overall_timeout_duration(timeout_secs).and_then(|t| Instant::now().checked_add(t))
}

/// Seconds left until `deadline`, rounded up; `Some(0)` once it has passed.
pub(crate) fn remaining_timeout_secs(deadline: Option<Instant>) -> Option<u64> {
    let deadline = deadline?;
    if Instant::now() >= deadline {
        return Some(0);
    }
    let remaining = deadline.saturating_duration_since(Instant::now());
    let secs = remaining.as_secs();
    let rounded_up = if remaining.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    };
    Some(rounded_up.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_exceeded_none_returns_false() {
        assert!(!deadline_exceeded(None));
    }

    #[test]
    fn deadline_exceeded_past_returns_true() {
        let past = Instant::now() - Duration::from_secs(1);
        assert!(deadline_exceeded(Some(past)));
    }

    #[test]
    fn zero_timeout_means_unbounded() {
        assert!(overall_timeout_duration(0).is_none());
        assert!(deadline_from_timeout_secs(0).is_none());
        assert_eq!(overall_timeout_duration(30), Some(Duration::from_secs(30)));
    }

    #[test]
    fn remaining_timeout_secs_past_deadline_returns_zero() {
        let past = Instant::now() - Duration::from_secs(5);
        assert_eq!(remaining_timeout_secs(Some(past)), Some(0));
        assert_eq!(remaining_timeout_secs(None), None);
    }

    #[test]
    fn remaining_timeout_secs_minimum_is_one() {
        let close_future = Instant::now() + Duration::from_millis(50);
        let remaining = remaining_timeout_secs(Some(close_future)).expect("deadline set");
        assert!(remaining >= 1);
    }

    #[test]
    fn options_load_from_partial_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("options.json");
        std::fs::write(&path, r#"{"solver": "cvc5", "loop_unroll": 5}"#).expect("write options");
        let options = EquivalenceOptions::from_json_file(&path).expect("valid options");
        assert_eq!(options.solver, SolverChoice::Cvc5);
        assert_eq!(options.loop_unroll, 5);
        assert_eq!(options.exact_buffer_words, 4);
        assert!(options.summarize_loops);
    }

    #[test]
    fn malformed_options_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("options.json");
        std::fs::write(&path, "{ not json").expect("write options");
        match EquivalenceOptions::from_json_file(&path) {
            Err(crate::error::EngineError::Options(_)) => {}
            other => panic!("Expected Options error, got: {other:?}"),
        }
    }
}
