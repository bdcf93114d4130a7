//! The boundary between the equivalence engine and the solver: submit a
//! finished program, get back a verdict and, on SAT, a model.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use equiv_ir::{AssertMeta, BlockId, CmdPointer, Program, Value, Var};
use num_bigint::BigInt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backends::{ProcessSolver, SolverDialect, SolverError};
use crate::encoder::{encode_program, EncodeError, ProgramEncoding};
use crate::solver::{ModelValue, SatResult, SmtSolver};
use crate::sorts::SmtSort;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("encoding failed: {0}")]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Solver(#[from] SolverError),
    #[error("failed to write solver dump: {0}")]
    Dump(std::io::Error),
}

/// An assertion that fails in a model.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedAssert {
    pub ptr: CmdPointer,
    pub msg: String,
    pub meta: AssertMeta,
}

/// Valuation witnessing a failing assertion: variable values at the end of
/// the witnessed path, the blocks on it, and the assertions that fail.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgramModel {
    values: HashMap<Var, Value>,
    reached: HashSet<BlockId>,
    failed: Vec<FailedAssert>,
}

impl ProgramModel {
    pub fn new(
        values: HashMap<Var, Value>,
        reached: HashSet<BlockId>,
        failed: Vec<FailedAssert>,
    ) -> Self {
        Self {
            values,
            reached,
            failed,
        }
    }

    pub fn value(&self, var: &Var) -> Option<&Value> {
        self.values.get(var)
    }

    pub fn int(&self, var: &Var) -> Option<&BigInt> {
        self.values.get(var).and_then(Value::as_int)
    }

    pub fn bool(&self, var: &Var) -> Option<bool> {
        self.values.get(var).and_then(Value::as_bool)
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.reached.contains(&block)
    }

    /// Failing assertions, in topological block order.
    pub fn failed_asserts(&self) -> &[FailedAssert] {
        &self.failed
    }

    pub fn values(&self) -> impl Iterator<Item = (&Var, &Value)> {
        self.values.iter()
    }
}

/// Solver verdict on "some assertion of the program can fail".
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Unsat,
    Sat(ProgramModel),
    Timeout,
    Unknown(String),
    /// The path constraints alone are unsatisfiable.
    SanityFail,
}

impl Verdict {
    pub fn is_unsat(&self) -> bool {
        matches!(self, Verdict::Unsat)
    }

    pub fn model(&self) -> Option<&ProgramModel> {
        match self {
            Verdict::Sat(m) => Some(m),
            _ => None,
        }
    }

    /// Short name for logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            Verdict::Unsat => "UNSAT",
            Verdict::Sat(_) => "SAT",
            Verdict::Timeout => "TIMEOUT",
            Verdict::Unknown(_) => "UNKNOWN",
            Verdict::SanityFail => "SANITY_FAIL",
        }
    }

    fn from_unknown(reason: String) -> Self {
        let lower = reason.to_lowercase();
        if ["timeout", "canceled", "cancelled", "resource", "interrupted"]
            .iter()
            .any(|k| lower.contains(k))
        {
            Verdict::Timeout
        } else {
            Verdict::Unknown(reason)
        }
    }
}

/// Checks whether any assertion of a program can fail.
pub trait ProgramVerifier: Send + Sync {
    fn verify(&self, program: &Program, rule: &str) -> Result<Verdict, VerifyError>;
}

/// Options of the process-backed verifier.
#[derive(Debug, Clone)]
pub struct SmtVerifierOptions {
    pub dialect: SolverDialect,
    /// Solver binary; defaults to the dialect's usual command.
    pub command: Option<String>,
    /// Per-query timeout; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Directory receiving one `.smt2` transcript per query.
    pub dump_dir: Option<PathBuf>,
    /// Check the path constraints for satisfiability before the query.
    pub sanity_check: bool,
}

impl Default for SmtVerifierOptions {
    fn default() -> Self {
        Self {
            dialect: SolverDialect::Z3,
            command: None,
            timeout: Some(Duration::from_secs(60)),
            dump_dir: None,
            sanity_check: true,
        }
    }
}

/// [`ProgramVerifier`] that encodes programs with [`encode_program`] and
/// runs a fresh solver process per query.
#[derive(Debug, Clone, Default)]
pub struct SmtProgramVerifier {
    options: SmtVerifierOptions,
}

impl SmtProgramVerifier {
    pub fn new(options: SmtVerifierOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SmtVerifierOptions {
        &self.options
    }

    fn spawn(&self) -> Result<ProcessSolver, SolverError> {
        let dialect = self.options.dialect;
        let command = self
            .options
            .command
            .clone()
            .unwrap_or_else(|| dialect.default_command().to_string());
        ProcessSolver::with_command_and_timeout(dialect, &command, self.options.timeout)
    }

    fn run(
        &self,
        solver: &mut ProcessSolver,
        enc: &ProgramEncoding,
        program: &Program,
    ) -> Result<Verdict, SolverError> {
        for (name, arity) in &enc.functions {
            solver.declare_fun(name, *arity)?;
        }
        for (name, sort) in &enc.declarations {
            solver.declare_var(name, sort)?;
        }
        for a in &enc.assertions {
            solver.assert(a)?;
        }
        if self.options.sanity_check {
            match solver.check_sat()? {
                SatResult::Sat => {}
                SatResult::Unsat => return Ok(Verdict::SanityFail),
                SatResult::Unknown(reason) => return Ok(Verdict::from_unknown(reason)),
            }
        }
        solver.assert(&enc.vc())?;
        match solver.check_sat()? {
            SatResult::Unsat => Ok(Verdict::Unsat),
            SatResult::Unknown(reason) => Ok(Verdict::from_unknown(reason)),
            SatResult::Sat => Ok(Verdict::Sat(read_model(solver, enc, program)?)),
        }
    }
}

fn read_model(
    solver: &mut ProcessSolver,
    enc: &ProgramEncoding,
    program: &Program,
) -> Result<ProgramModel, SolverError> {
    let mut flags: Vec<(&str, &SmtSort)> = Vec::new();
    for name in enc.reach.values() {
        flags.push((name.as_str(), &SmtSort::Bool));
    }
    for a in &enc.asserts {
        flags.push((a.fail.as_str(), &SmtSort::Bool));
    }
    let flag_values = solver.get_values(&flags)?;
    let holds = |name: &str| matches!(flag_values.get(name), Some(ModelValue::Bool(true)));

    let reached: HashSet<BlockId> = enc
        .reach
        .iter()
        .filter(|(_, name)| holds(name.as_str()))
        .map(|(b, _)| *b)
        .collect();
    let failed: Vec<FailedAssert> = enc
        .asserts
        .iter()
        .filter(|a| holds(a.fail.as_str()))
        .map(|a| FailedAssert {
            ptr: a.ptr,
            msg: a.msg.clone(),
            meta: a.meta.clone(),
        })
        .collect();

    let mut values = HashMap::new();
    let Some(last) = enc.order.iter().rev().find(|b| reached.contains(b)) else {
        return Ok(ProgramModel::new(values, reached, failed));
    };
    let mut symbols: Vec<(String, Var, SmtSort)> = Vec::new();
    for var in program.vars() {
        let sort = SmtSort::from(var.sort);
        if sort == SmtSort::IntArray {
            continue;
        }
        if let Some(symbol) = enc.symbol_at_exit(*last, &var) {
            symbols.push((symbol, var, sort));
        }
    }
    let query: Vec<(&str, &SmtSort)> = symbols.iter().map(|(s, _, t)| (s.as_str(), t)).collect();
    let raw = solver.get_values(&query)?;
    for (symbol, var, _) in &symbols {
        match raw.get(symbol) {
            Some(ModelValue::Int(n)) => {
                values.insert(var.clone(), Value::Int(n.clone()));
            }
            Some(ModelValue::Bool(b)) => {
                values.insert(var.clone(), Value::Bool(*b));
            }
            None => {}
        }
    }
    Ok(ProgramModel::new(values, reached, failed))
}

impl ProgramVerifier for SmtProgramVerifier {
    fn verify(&self, program: &Program, rule: &str) -> Result<Verdict, VerifyError> {
        let start = Instant::now();
        let enc = encode_program(program)?;
        debug!(
            rule,
            blocks = enc.order.len(),
            declarations = enc.declarations.len(),
            assertions = enc.assertions.len(),
            "encoded program"
        );
        let mut solver = self.spawn()?;
        if self.options.dump_dir.is_some() {
            solver.record_transcript();
        }
        let outcome = self.run(&mut solver, &enc, program);
        if let (Some(dir), Some(text)) = (&self.options.dump_dir, solver.transcript()) {
            std::fs::create_dir_all(dir).map_err(VerifyError::Dump)?;
            let path = dir.join(format!("{}.smt2", sanitize(rule)));
            std::fs::write(&path, text).map_err(VerifyError::Dump)?;
            debug!(path = %path.display(), "wrote solver transcript");
        }
        let verdict = match outcome {
            Ok(v) => v,
            Err(SolverError::SolverError(msg)) if msg.to_lowercase().contains("timeout") => {
                warn!(rule, %msg, "solver reported a timeout as an error");
                Verdict::Timeout
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            rule,
            verdict = verdict.name(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "solver query finished"
        );
        Ok(verdict)
    }
}

fn sanitize(rule: &str) -> String {
    rule.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use equiv_ir::AssertTag;

    #[test]
    fn unknown_reasons_mentioning_limits_are_timeouts() {
        assert_eq!(Verdict::from_unknown("timeout".into()), Verdict::Timeout);
        assert_eq!(Verdict::from_unknown("canceled".into()), Verdict::Timeout);
        assert_eq!(
            Verdict::from_unknown("(incomplete quantifiers)".into()),
            Verdict::Unknown("(incomplete quantifiers)".into())
        );
    }

    #[test]
    fn model_accessors() {
        let x = Var::int("x").with_call(1);
        let flag = Var::bool("flag");
        let mut values = HashMap::new();
        values.insert(x.clone(), Value::Int(BigInt::from(3)));
        values.insert(flag.clone(), Value::Bool(true));
        let failed = vec![FailedAssert {
            ptr: CmdPointer::new(BlockId::new(0).with_call(3), 1),
            msg: "trace".into(),
            meta: AssertMeta::tagged(AssertTag::TraceEquivalence),
        }];
        let model = ProgramModel::new(values, HashSet::from([BlockId::new(0)]), failed);
        assert_eq!(model.int(&x), Some(&BigInt::from(3)));
        assert_eq!(model.bool(&flag), Some(true));
        assert_eq!(model.int(&flag), None);
        assert!(model.is_reachable(BlockId::new(0)));
        assert!(!model.is_reachable(BlockId::new(1)));
        assert_eq!(model.failed_asserts().len(), 1);
    }

    #[test]
    fn rule_names_become_file_names() {
        assert_eq!(sanitize("loop:B3@1 invariant"), "loop_B3_1_invariant");
    }
}
