use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backends::smtlib_printer::{quote_symbol, sort_to_smtlib, to_smtlib, unquote_symbol};
use crate::sexp::{paren_depth, parse_all, Sexp};
use crate::solver::{Model, ModelValue, SatResult, SmtSolver};
use crate::sorts::SmtSort;
use crate::terms::SmtTerm;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("solver I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("solver not found: {0}")]
    NotFound(String),
    #[error("solver error: {0}")]
    SolverError(String),
    #[error("Failed to parse solver output: {0}")]
    ParseError(String),
}

/// Command-line conventions of the supported solvers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverDialect {
    Z3,
    Cvc5,
}

impl SolverDialect {
    pub fn default_command(self) -> &'static str {
        match self {
            SolverDialect::Z3 => "z3",
            SolverDialect::Cvc5 => "cvc5",
        }
    }

    fn args(self, timeout: Option<Duration>) -> Vec<String> {
        let mut args: Vec<String> = match self {
            SolverDialect::Z3 => vec!["-in".into(), "-smt2".into()],
            SolverDialect::Cvc5 => vec![
                "--lang".into(),
                "smt2".into(),
                "--incremental".into(),
                "--produce-models".into(),
            ],
        };
        if let Some(t) = timeout {
            let ms = t.as_millis().max(1);
            match self {
                SolverDialect::Z3 => args.push(format!("-t:{ms}")),
                SolverDialect::Cvc5 => args.push(format!("--tlimit-per={ms}")),
            }
        }
        args
    }
}

impl fmt::Display for SolverDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_command())
    }
}

/// An SMT solver running as a child process in incremental mode.
pub struct ProcessSolver {
    dialect: SolverDialect,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr: BufReader<ChildStderr>,
    vars: HashMap<String, SmtSort>,
    transcript: Option<Vec<String>>,
}

impl ProcessSolver {
    pub fn new(dialect: SolverDialect) -> Result<Self, SolverError> {
        Self::with_command_and_timeout(dialect, dialect.default_command(), None)
    }

    pub fn with_timeout(dialect: SolverDialect, timeout: Duration) -> Result<Self, SolverError> {
        let timeout = (!timeout.is_zero()).then_some(timeout);
        Self::with_command_and_timeout(dialect, dialect.default_command(), timeout)
    }

    pub fn with_command_and_timeout(
        dialect: SolverDialect,
        cmd: &str,
        timeout: Option<Duration>,
    ) -> Result<Self, SolverError> {
        let mut child = Command::new(cmd)
            .args(dialect.args(timeout))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SolverError::NotFound(format!("{cmd}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SolverError::SolverError("failed to capture solver stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SolverError::SolverError("failed to capture solver stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SolverError::SolverError("failed to capture solver stderr".into()))?;

        let mut solver = Self {
            dialect,
            child,
            stdin,
            stdout: BufReader::new(stdout),
            stderr: BufReader::new(stderr),
            vars: HashMap::new(),
            transcript: None,
        };
        solver.preamble()?;
        Ok(solver)
    }

    /// Is the solver binary for `dialect` runnable?
    pub fn available(dialect: SolverDialect) -> bool {
        Command::new(dialect.default_command())
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    pub fn dialect(&self) -> SolverDialect {
        self.dialect
    }

    /// Start recording every command sent to the solver.
    pub fn record_transcript(&mut self) {
        self.transcript.get_or_insert_with(Vec::new);
    }

    /// Commands sent since recording started, one per line.
    pub fn transcript(&self) -> Option<String> {
        self.transcript.as_ref().map(|t| {
            let mut out = t.join("\n");
            out.push('\n');
            out
        })
    }

    fn preamble(&mut self) -> Result<(), SolverError> {
        if self.dialect == SolverDialect::Z3 {
            self.send_command_no_response("(set-option :produce-models true)")?;
        }
        self.send_command_no_response("(set-logic ALL)")
    }

    fn send_command_no_response(&mut self, cmd: &str) -> Result<(), SolverError> {
        if let Some(t) = self.transcript.as_mut() {
            t.push(cmd.to_string());
        }
        writeln!(self.stdin, "{cmd}")?;
        self.stdin.flush()?;
        Ok(())
    }

    /// Send a command and read one balanced response.
    fn send_command(&mut self, cmd: &str) -> Result<Sexp, SolverError> {
        self.send_command_no_response(cmd)?;
        self.read_response(cmd)
    }

    fn read_response(&mut self, cmd: &str) -> Result<Sexp, SolverError> {
        let mut response = String::new();
        loop {
            let mut line = String::new();
            let n = self.stdout.read_line(&mut line)?;
            if n == 0 {
                let mut stderr = String::new();
                let _ = self.stderr.read_to_string(&mut stderr);
                return Err(SolverError::SolverError(format!(
                    "No response from {} for command `{cmd}`. stderr: {}",
                    self.dialect,
                    stderr.trim()
                )));
            }
            response.push_str(&line);
            if !response.trim().is_empty() && paren_depth(&response) <= 0 {
                break;
            }
        }
        let mut parsed =
            parse_all(&response).map_err(|e| SolverError::ParseError(e.to_string()))?;
        match parsed.pop() {
            Some(sexp) => match sexp.as_error() {
                Some(msg) => Err(SolverError::SolverError(msg)),
                None => Ok(sexp),
            },
            None => Err(SolverError::ParseError(format!("empty response to `{cmd}`"))),
        }
    }

    /// Values of the given symbols in the current model.
    pub fn get_values(
        &mut self,
        names: &[(&str, &SmtSort)],
    ) -> Result<HashMap<String, ModelValue>, SolverError> {
        let mut values = HashMap::new();
        if names.is_empty() {
            return Ok(values);
        }
        let sorts: HashMap<&str, &SmtSort> = names.iter().copied().collect();
        let quoted: Vec<String> = names.iter().map(|(n, _)| quote_symbol(n)).collect();
        let response = self.send_command(&format!("(get-value ({}))", quoted.join(" ")))?;
        let pairs = response
            .as_list()
            .ok_or_else(|| SolverError::ParseError(response.to_string()))?;
        for pair in pairs {
            let Some([name, value]) = pair.as_list() else {
                return Err(SolverError::ParseError(pair.to_string()));
            };
            let Some(name) = name.as_atom().map(|n| unquote_symbol(n).to_string()) else {
                continue;
            };
            let parsed = match sorts.get(name.as_str()) {
                Some(SmtSort::Bool) => value.as_bool().map(ModelValue::Bool),
                Some(SmtSort::Int) => value.as_int().map(ModelValue::Int),
                _ => None,
            };
            if let Some(v) = parsed {
                values.insert(name, v);
            }
        }
        Ok(values)
    }

    /// The solver's explanation for its last `unknown` answer.
    pub fn reason_unknown(&mut self) -> Result<String, SolverError> {
        let response = self.send_command("(get-info :reason-unknown)")?;
        let reason = response
            .as_list()
            .and_then(|items| items.get(1))
            .map(|s| match s {
                Sexp::Str(m) | Sexp::Atom(m) => m.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| response.to_string());
        Ok(reason)
    }

    fn parse_sat(&mut self, response: &Sexp) -> Result<SatResult, SolverError> {
        match response.as_atom() {
            Some("sat") => Ok(SatResult::Sat),
            Some("unsat") => Ok(SatResult::Unsat),
            Some("unknown") | Some("timeout") => {
                let reason = self
                    .reason_unknown()
                    .unwrap_or_else(|_| "unknown".to_string());
                Ok(SatResult::Unknown(reason))
            }
            _ => Err(SolverError::SolverError(response.to_string())),
        }
    }
}

impl Drop for ProcessSolver {
    fn drop(&mut self) {
        let _ = writeln!(self.stdin, "(exit)");
        let _ = self.stdin.flush();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl SmtSolver for ProcessSolver {
    type Error = SolverError;

    fn declare_var(&mut self, name: &str, sort: &SmtSort) -> Result<(), SolverError> {
        let sort_str = sort_to_smtlib(sort);
        self.send_command_no_response(&format!("(declare-const {} {sort_str})", quote_symbol(name)))?;
        self.vars.insert(name.to_string(), sort.clone());
        Ok(())
    }

    fn declare_fun(&mut self, name: &str, arity: usize) -> Result<(), SolverError> {
        let args = vec!["Int"; arity].join(" ");
        self.send_command_no_response(&format!("(declare-fun {} ({args}) Int)", quote_symbol(name)))
    }

    fn assert(&mut self, term: &SmtTerm) -> Result<(), SolverError> {
        let smt_str = to_smtlib(term);
        self.send_command_no_response(&format!("(assert {smt_str})"))
    }

    fn push(&mut self) -> Result<(), SolverError> {
        self.send_command_no_response("(push 1)")
    }

    fn pop(&mut self) -> Result<(), SolverError> {
        self.send_command_no_response("(pop 1)")
    }

    fn check_sat(&mut self) -> Result<SatResult, SolverError> {
        let response = self.send_command("(check-sat)")?;
        self.parse_sat(&response)
    }

    fn check_sat_with_model(
        &mut self,
        var_names: &[(&str, &SmtSort)],
    ) -> Result<(SatResult, Option<Model>), SolverError> {
        let result = self.check_sat()?;
        if result != SatResult::Sat {
            return Ok((result, None));
        }
        let values = self.get_values(var_names)?;
        Ok((SatResult::Sat, Some(Model { values })))
    }

    fn reset(&mut self) -> Result<(), SolverError> {
        self.send_command_no_response("(reset)")?;
        self.vars.clear();
        self.preamble()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_arguments() {
        let z3 = SolverDialect::Z3.args(Some(Duration::from_secs(2)));
        assert_eq!(z3, vec!["-in", "-smt2", "-t:2000"]);
        let cvc5 = SolverDialect::Cvc5.args(None);
        assert!(cvc5.contains(&"--incremental".to_string()));
        assert!(!cvc5.iter().any(|a| a.starts_with("--tlimit")));
    }

    #[test]
    fn missing_binary_is_not_found() {
        match ProcessSolver::with_command_and_timeout(
            SolverDialect::Z3,
            "definitely-not-a-solver-binary",
            None,
        ) {
            Err(SolverError::NotFound(msg)) => {
                assert!(msg.contains("definitely-not-a-solver-binary"))
            }
            Err(other) => panic!("Expected NotFound, got: {other:?}"),
            Ok(_) => panic!("Expected NotFound, got a running solver"),
        }
    }

    #[test]
    fn dialect_serializes_lowercase() {
        assert_eq!(SolverDialect::Cvc5.to_string(), "cvc5");
    }
}
