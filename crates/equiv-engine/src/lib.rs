#![doc = include_str!("../README.md")]

//! Program equivalence engine.
//!
//! [`check_equivalence`] runs loop summarization and then the full
//! equivalence loop of [`equivalence::FullEquivalence`] under the standard
//! exploration strategy, and condenses the outcome into an
//! [`report::EquivalenceReport`].

pub mod checker;
pub mod equivalence;
pub mod error;
pub mod explain;
pub mod exploration;
pub mod instrumentation;
pub mod loops;
pub mod options;
pub mod proof_manager;
pub mod refinement;
pub mod report;
pub mod rule_generator;

use std::time::Instant;

use equiv_ir::graph::is_acyclic;
use equiv_ir::patch::unroll_loops;
use equiv_ir::Program;
use equiv_smt::ProgramVerifier;
use tracing::{info, warn};

pub use equivalence::{EquivalenceLimits, EquivalenceResult, FullEquivalence};
pub use error::{EngineError, EngineResult};
pub use explain::{CexExplainer, CounterExample, StandardExplainer};
pub use exploration::{ExplorationManager, StandardExplorationStrategy};
pub use options::{EquivalenceOptions, SolverChoice};
pub use report::{EquivalenceReport, ReportOutcome};
pub use rule_generator::{CallingConvention, RuleGenerator, Side, StandardConvention};

use instrumentation::TraceInstrumenter;
use loops::LoopSummarizer;
use report::ProgramSummary;

/// Decide whether `a` and `b` are equivalent.
///
/// Writes the HTML report when `options.report` is set, and the trace of a
/// counterexample to `options.trace_dump` (stdout when unset).
pub fn check_equivalence(
    a: &Program,
    b: &Program,
    options: &EquivalenceOptions,
    verifier: &dyn ProgramVerifier,
) -> EngineResult<EquivalenceReport> {
    let started = Instant::now();
    let limits = EquivalenceLimits::from_options(options);
    let instrumenter = TraceInstrumenter;
    let a_summary = ProgramSummary::of(a)?;
    let b_summary = ProgramSummary::of(b)?;

    let (mut a_work, mut b_work) = (a.clone(), b.clone());
    let mut summarized_loops = Vec::new();
    if options.summarize_loops {
        let mut summarizer = LoopSummarizer::new(verifier, &instrumenter, limits);
        (a_work, b_work) = summarizer.try_summarize_loops(a_work, b_work)?;
        summarized_loops = summarizer.summarized().to_vec();
    }
    let unrolled_loops = !is_acyclic(&a_work) || !is_acyclic(&b_work);
    if unrolled_loops {
        warn!(bound = options.loop_unroll, "unrolling loops that were not summarized");
        a_work = unroll_loops(&a_work, options.loop_unroll);
        b_work = unroll_loops(&b_work, options.loop_unroll);
    }

    let convention = StandardConvention;
    let mut equivalence = FullEquivalence::new(
        verifier,
        &instrumenter,
        &convention,
        a_work,
        b_work,
        StandardExplainer,
        limits,
    );
    let result = equivalence.equivalence_loop(Box::new(StandardExplorationStrategy::entry()))?;
    let outcome = match result {
        EquivalenceResult::Verified(_) => ReportOutcome::Equivalent,
        EquivalenceResult::ExplainedCounterExample(cex) => ReportOutcome::NotEquivalent {
            counterexample: Box::new(cex),
        },
        EquivalenceResult::GaveUp { message, .. } => ReportOutcome::Inconclusive { reason: message },
    };
    let report = EquivalenceReport {
        a: a_summary,
        b: b_summary,
        outcome,
        summarized_loops,
        unrolled_loops,
        checks: equivalence.checks().to_vec(),
        refinements: equivalence.refinements().to_vec(),
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };
    info!(
        a = %report.a.name,
        b = %report.b.name,
        outcome = report.outcome.name(),
        checks = report.checks.len(),
        "equivalence query finished"
    );
    if let Some(path) = &options.report {
        report.write_html_report(path)?;
    }
    if matches!(report.outcome, ReportOutcome::NotEquivalent { .. }) {
        report.dump_trace(options.trace_dump.as_deref())?;
    }
    Ok(report)
}
