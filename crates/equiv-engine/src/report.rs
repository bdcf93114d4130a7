//! Reports of an equivalence query.
//!
//! A report is plain serde data. It is written as JSON, embedded in a
//! static HTML page, or rendered as a plain-text trace.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;

use equiv_ir::Program;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::checker::RuleOutput;
use crate::error::EngineResult;
use crate::explain::CounterExample;
use crate::loops::SummarizedLoop;
use crate::refinement::RefinementStep;

/// Final answer of a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReportOutcome {
    Equivalent,
    NotEquivalent { counterexample: Box<CounterExample> },
    Inconclusive { reason: String },
}

impl ReportOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            ReportOutcome::Equivalent => "equivalent",
            ReportOutcome::NotEquivalent { .. } => "not equivalent",
            ReportOutcome::Inconclusive { .. } => "inconclusive",
        }
    }
}

/// Identity of a compared program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgramSummary {
    pub name: String,
    pub blocks: usize,
    /// SHA-256 of the program's JSON form.
    pub sha256: String,
}

impl ProgramSummary {
    pub fn of(program: &Program) -> EngineResult<Self> {
        Ok(Self {
            name: program.name.clone(),
            blocks: program.blocks.len(),
            sha256: program_fingerprint(program)?,
        })
    }
}

pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    format!("{:x}", hasher.finalize())
}

pub fn program_fingerprint(program: &Program) -> EngineResult<String> {
    Ok(sha256_hex(serde_json::to_vec(program)?))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EquivalenceReport {
    pub a: ProgramSummary,
    pub b: ProgramSummary,
    pub outcome: ReportOutcome,
    pub summarized_loops: Vec<SummarizedLoop>,
    /// Whether loops left after summarization were unrolled.
    pub unrolled_loops: bool,
    pub checks: Vec<RuleOutput>,
    pub refinements: Vec<RefinementStep>,
    pub elapsed_ms: u64,
}

impl EquivalenceReport {
    pub fn is_equivalent(&self) -> bool {
        matches!(self.outcome, ReportOutcome::Equivalent)
    }

    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Plain-text rendering: verdict, checks, and the counterexample trace.
    pub fn trace_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} vs {}: {}", self.a.name, self.b.name, self.outcome.name());
        for l in &self.summarized_loops {
            let _ = writeln!(
                out,
                "summarized loop {} (A at {}, B at {}): {} input(s), {} output(s)",
                l.index, l.a_head, l.b_head, l.inputs, l.outputs
            );
        }
        for check in &self.checks {
            let _ = writeln!(out, "check {}: {}", check.rule, check.verdict);
        }
        for r in &self.refinements {
            let _ = writeln!(out, "refinement after {}: {} {}", r.rule, r.kind, r.detail);
        }
        match &self.outcome {
            ReportOutcome::NotEquivalent { counterexample } => out.push_str(&counterexample.pretty()),
            ReportOutcome::Inconclusive { reason } => {
                let _ = writeln!(out, "reason: {reason}");
            }
            ReportOutcome::Equivalent => {}
        }
        out
    }

    /// Write the trace to `path`, or to stdout without one.
    pub fn dump_trace(&self, path: Option<&Path>) -> EngineResult<()> {
        let text = self.trace_text();
        match path {
            Some(path) => {
                std::fs::write(path, text)?;
                info!(path = %path.display(), "wrote trace dump");
            }
            None => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(text.as_bytes())?;
                stdout.flush()?;
            }
        }
        Ok(())
    }

    pub fn to_html(&self) -> EngineResult<String> {
        // `</` must not appear inside the script element
        let json = serde_json::to_string(self)?.replace("</", "<\\/");
        let mut html = String::new();
        let _ = writeln!(html, "<!DOCTYPE html>");
        let _ = writeln!(html, "<html><head><meta charset=\"utf-8\">");
        let _ = writeln!(
            html,
            "<title>{} vs {}</title></head><body>",
            escape_html(&self.a.name),
            escape_html(&self.b.name)
        );
        let _ = writeln!(html, "<h1>{}</h1>", escape_html(self.outcome.name()));
        let _ = writeln!(html, "<pre id=\"trace\">{}</pre>", escape_html(&self.trace_text()));
        let _ = writeln!(html, "<script type=\"application/json\" id=\"report\">{json}</script>");
        let _ = writeln!(html, "</body></html>");
        Ok(html)
    }

    pub fn write_html_report(&self, path: &Path) -> EngineResult<()> {
        std::fs::write(path, self.to_html()?)?;
        info!(path = %path.display(), outcome = self.outcome.name(), "wrote report");
        Ok(())
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcome: ReportOutcome) -> EquivalenceReport {
        let summary = |name: &str| ProgramSummary {
            name: name.to_string(),
            blocks: 1,
            sha256: sha256_hex(name),
        };
        EquivalenceReport {
            a: summary("a</script>"),
            b: summary("b"),
            outcome,
            summarized_loops: Vec::new(),
            unrolled_loops: false,
            checks: vec![RuleOutput {
                rule: "calls-unified".to_string(),
                verdict: "UNSAT".to_string(),
                failed_asserts: Vec::new(),
                reached_blocks: 0,
            }],
            refinements: Vec::new(),
            elapsed_ms: 3,
        }
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    fn returning(name: &str, k: i64) -> Program {
        use equiv_ir::{Cmd, ExitPayload, Expr, ProgramBuilder, Var};
        let x = Var::int("x");
        let mut b = ProgramBuilder::new(name);
        let entry = b.new_block();
        let exit = b.new_block();
        b.param(x.clone());
        b.push(entry, Cmd::jump(exit));
        b.push(
            exit,
            Cmd::Return {
                payload: ExitPayload::Values(vec![Expr::var(&x).add(Expr::int(k))]),
            },
        );
        b.build().expect("well formed")
    }

    #[test]
    fn programs_have_stable_fingerprints() {
        let p = returning("p", 1);
        let summary = ProgramSummary::of(&p).expect("fingerprinted");
        assert_eq!(summary.blocks, 2);
        assert_eq!(summary.sha256.len(), 64);
        assert_eq!(summary.sha256, program_fingerprint(&p.clone()).expect("fingerprinted"));
        assert_ne!(summary.sha256, program_fingerprint(&returning("p", 2)).expect("fingerprinted"));
    }

    #[test]
    fn json_is_tagged_by_status() {
        let r = report(ReportOutcome::Inconclusive {
            reason: "timeout".to_string(),
        });
        let value: serde_json::Value = serde_json::from_str(&r.to_json().expect("json")).expect("parse");
        assert_eq!(value["outcome"]["status"], "inconclusive");
        assert_eq!(value["outcome"]["reason"], "timeout");
        assert_eq!(value["checks"][0]["verdict"], "UNSAT");
    }

    #[test]
    fn html_embeds_escaped_json() {
        let r = report(ReportOutcome::Equivalent);
        let html = r.to_html().expect("html");
        assert!(html.contains("<script type=\"application/json\" id=\"report\">"));
        assert!(!html.contains("a</script>"));
        assert!(html.contains("a&lt;/script&gt;"));
    }

    #[test]
    fn trace_dump_goes_to_the_requested_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trace.txt");
        let r = report(ReportOutcome::Inconclusive {
            reason: "deadline exceeded".to_string(),
        });
        r.dump_trace(Some(&path)).expect("dumped");
        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("inconclusive"));
        assert!(text.contains("check calls-unified: UNSAT"));
        assert!(text.contains("reason: deadline exceeded"));

        let html_path = dir.path().join("report.html");
        r.write_html_report(&html_path).expect("written");
        assert!(std::fs::read_to_string(html_path).expect("read").starts_with("<!DOCTYPE html>"));
    }
}
