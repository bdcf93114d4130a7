//! The full equivalence loop.
//!
//! Each round asks the exploration manager what to check, runs the check
//! and interprets the verdict. Trace counterexamples are minimized when the
//! configuration allows it, then refined; a refinement records new facts in
//! the [`PairwiseProofManager`] and the same configuration is retried. The
//! loop stops with a proof, an explained counterexample, or an inconclusive
//! result.

use std::collections::BTreeSet;
use std::time::Instant;

use equiv_ir::{Annotation, AssertTag, Cmd, CmdPointer, Program, Var};
use equiv_smt::{ProgramVerifier, Verdict};
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use tracing::{debug, info, warn};

use crate::checker::{CheckResult, RuleOutput, TraceEquivalenceChecker, VcGenerator};
use crate::error::EngineResult;
use crate::explain::CexExplainer;
use crate::exploration::{EquivalenceCheckConfiguration, ExplorationManager, Minimizer};
use crate::instrumentation::Instrumenter;
use crate::options::{deadline_exceeded, EquivalenceOptions};
use crate::proof_manager::PairwiseProofManager;
use crate::refinement::{CounterExampleRefiner, RefinementResult, RefinementStep};
use crate::rule_generator::CallingConvention;

/// Outcome of an equivalence query.
#[derive(Debug)]
pub enum EquivalenceResult<R> {
    /// Every check the exploration asked for was UNSAT. Holds the last one.
    Verified(Box<CheckResult>),
    ExplainedCounterExample(R),
    /// The solver answered but the answer could not be turned into a proof
    /// or an explained counterexample.
    GaveUp {
        message: String,
        check: Option<Box<CheckResult>>,
    },
}

impl<R> EquivalenceResult<R> {
    pub fn is_verified(&self) -> bool {
        matches!(self, EquivalenceResult::Verified(_))
    }

    pub fn pp(&self) -> String {
        match self {
            EquivalenceResult::Verified(_) => "Verified".to_string(),
            EquivalenceResult::ExplainedCounterExample(_) => "NotEquiv".to_string(),
            EquivalenceResult::GaveUp { message, .. } => format!("GaveUp({message})"),
        }
    }

    fn gave_up(message: impl Into<String>, check: CheckResult) -> Self {
        EquivalenceResult::GaveUp {
            message: message.into(),
            check: Some(Box::new(check)),
        }
    }
}

/// A failing storage comparison: the two values read at `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDiff {
    pub failing: CmdPointer,
    pub a_value: Var,
    pub b_value: Var,
    pub key: Var,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Classification {
    GaveUp(String),
    Storage(StorageDiff),
    Trace { index: BigInt, failing: CmdPointer },
}

/// A SAT result that survived minimization.
enum MinimizedSat {
    Storage(CheckResult, StorageDiff),
    Trace(CheckResult, BigInt),
}

enum MinimizationOutcome {
    /// No shorter counterexample exists.
    Unsat,
    GaveUp(String),
    Found(MinimizedSat),
}

/// Classify a SAT check by its first failing tagged assertion.
fn classify(check: &CheckResult) -> Classification {
    let Some(model) = check.model() else {
        return Classification::GaveUp("no model for a SAT result".to_string());
    };
    let failing = model.failed_asserts().iter().find(|f| {
        matches!(
            f.meta.tag,
            Some(AssertTag::TraceEquivalence) | Some(AssertTag::StorageComparison { .. })
        )
    });
    let Some(failing) = failing else {
        return Classification::GaveUp("Couldn't find failing assertion in counterexample".to_string());
    };
    if let Some(AssertTag::StorageComparison {
        a_value,
        b_value,
        key,
    }) = &failing.meta.tag
    {
        return Classification::Storage(StorageDiff {
            failing: failing.ptr,
            a_value: a_value.clone(),
            b_value: b_value.clone(),
            key: key.clone(),
        });
    }
    let indices: BTreeSet<&BigInt> = check
        .rule
        .commands()
        .filter_map(|(_, cmd)| match cmd {
            Cmd::Annotation(Annotation::IndexHolder(v)) => model.int(v),
            _ => None,
        })
        .collect();
    let mut it = indices.into_iter();
    match (it.next(), it.next()) {
        (Some(index), None) => Classification::Trace {
            index: index.clone(),
            failing: failing.ptr,
        },
        _ => {
            info!(rule = %check.rule.name, "couldn't find single event id");
            Classification::GaveUp("Couldn't find single event id".to_string())
        }
    }
}

/// Budget and precision limits of one loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EquivalenceLimits {
    pub exact_buffer_words: usize,
    pub max_tracked_writes: usize,
    pub deadline: Option<Instant>,
}

impl Default for EquivalenceLimits {
    fn default() -> Self {
        Self {
            exact_buffer_words: 4,
            max_tracked_writes: 8,
            deadline: None,
        }
    }
}

impl EquivalenceLimits {
    pub fn from_options(options: &EquivalenceOptions) -> Self {
        Self {
            exact_buffer_words: options.exact_buffer_words,
            max_tracked_writes: options.max_tracked_writes,
            deadline: options.deadline(),
        }
    }
}

/// Equivalence of two programs under one calling convention.
pub struct FullEquivalence<'a, E> {
    checker: TraceEquivalenceChecker<'a>,
    a: Program,
    b: Program,
    explainer: E,
    limits: EquivalenceLimits,
    pairwise: PairwiseProofManager,
    checks: Vec<RuleOutput>,
    refinements: Vec<RefinementStep>,
}

impl<'a, E: CexExplainer> FullEquivalence<'a, E> {
    pub fn new(
        verifier: &'a dyn ProgramVerifier,
        instrumenter: &'a dyn Instrumenter,
        convention: &'a dyn CallingConvention,
        a: Program,
        b: Program,
        explainer: E,
        limits: EquivalenceLimits,
    ) -> Self {
        Self {
            checker: TraceEquivalenceChecker::new(verifier, instrumenter, convention),
            a,
            b,
            explainer,
            limits,
            pairwise: PairwiseProofManager::new(),
            checks: Vec::new(),
            refinements: Vec::new(),
        }
    }

    pub fn pairwise(&self) -> &PairwiseProofManager {
        &self.pairwise
    }

    /// Summaries of every check run so far, in order.
    pub fn checks(&self) -> &[RuleOutput] {
        &self.checks
    }

    pub fn refinements(&self) -> &[RefinementStep] {
        &self.refinements
    }

    fn basic_check(
        &mut self,
        config: &EquivalenceCheckConfiguration,
        rule_name: &str,
        vc: &dyn VcGenerator,
    ) -> EngineResult<CheckResult> {
        let check = self.checker.instrument_and_check(
            rule_name,
            (&self.a, &config.a_control),
            (&self.b, &config.b_control),
            vc,
        )?;
        self.checks.push(check.rule_output().clone());
        Ok(check)
    }

    /// Look for a divergence at a trace position below `bound`.
    fn minimization_loop(
        &mut self,
        bound: &BigInt,
        config: &EquivalenceCheckConfiguration,
        min: &Minimizer,
    ) -> EngineResult<MinimizationOutcome> {
        let Some(max_len) = bound.to_u32() else {
            return Ok(MinimizationOutcome::GaveUp("trace index out of range".to_string()));
        };
        let rule = format!("{}-min-{max_len}", config.rule_name);
        let check = self.basic_check(config, &rule, min.generator(max_len).as_ref())?;
        match &check.verdict {
            Verdict::Unsat => Ok(MinimizationOutcome::Unsat),
            Verdict::Timeout => Ok(MinimizationOutcome::GaveUp("minimization timeout".to_string())),
            Verdict::Sat(_) => match classify(&check) {
                Classification::GaveUp(why) => Ok(MinimizationOutcome::GaveUp(why)),
                Classification::Storage(diff) => {
                    Ok(MinimizationOutcome::Found(MinimizedSat::Storage(check, diff)))
                }
                Classification::Trace { index, .. } if &index >= bound => Ok(MinimizationOutcome::GaveUp(
                    format!("bounded check diverged at {index}, not below {bound}"),
                )),
                Classification::Trace { index, .. } => {
                    Ok(MinimizationOutcome::Found(self.try_minimize(config, min, check, index)?))
                }
            },
            other => Ok(MinimizationOutcome::GaveUp(format!(
                "Unrecognized solver result: {}",
                other.name()
            ))),
        }
    }

    /// The smallest trace divergence reachable from `check`.
    fn try_minimize(
        &mut self,
        config: &EquivalenceCheckConfiguration,
        min: &Minimizer,
        check: CheckResult,
        index: BigInt,
    ) -> EngineResult<MinimizedSat> {
        match self.minimization_loop(&index, config, min)? {
            MinimizationOutcome::Found(smaller) => Ok(smaller),
            MinimizationOutcome::Unsat => {
                debug!(%index, "no shorter counterexample");
                Ok(MinimizedSat::Trace(check, index))
            }
            MinimizationOutcome::GaveUp(why) => {
                debug!(%index, why, "minimization stopped");
                Ok(MinimizedSat::Trace(check, index))
            }
        }
    }

    /// Record a refinement. False when it added nothing.
    fn apply_refinement(&mut self, refinement: &RefinementResult) -> bool {
        match refinement {
            RefinementResult::BufferRefinement { site_a, site_b } => {
                self.pairwise.register_pairwise_proof(*site_a, *site_b)
            }
            RefinementResult::MemoryCellRefinement { refine_a, refine_b } => {
                let a = refine_a.is_some_and(|(site, depth)| {
                    self.pairwise.register_a_load_override(site, depth)
                });
                let b = refine_b.is_some_and(|(site, depth)| {
                    self.pairwise.register_b_load_override(site, depth)
                });
                a || b
            }
            RefinementResult::GaveUp(_) | RefinementResult::UnrefinableCex { .. } => false,
        }
    }

    /// Run the loop from `manager` until it reaches a conclusion.
    pub fn equivalence_loop(
        &mut self,
        manager: Box<dyn ExplorationManager>,
    ) -> EngineResult<EquivalenceResult<E::Explanation>> {
        let mut manager = manager;
        loop {
            if deadline_exceeded(self.limits.deadline) {
                warn!("equivalence deadline exceeded");
                return Ok(EquivalenceResult::GaveUp {
                    message: "deadline exceeded".to_string(),
                    check: None,
                });
            }
            let config = manager
                .next_config(&self.pairwise)
                .with_limits(self.limits.exact_buffer_words, self.limits.max_tracked_writes);
            let rule = config.rule_name.clone();
            let check = self.basic_check(&config, &rule, config.vc.as_ref())?;

            match &check.verdict {
                Verdict::Unsat => match manager.on_success(&check) {
                    Some(next) => manager = next,
                    None => return Ok(EquivalenceResult::Verified(Box::new(check))),
                },
                Verdict::Timeout => match manager.on_timeout(&check) {
                    Some(next) => manager = next,
                    None => return Ok(EquivalenceResult::gave_up("timeout", check)),
                },
                Verdict::Unknown(_) | Verdict::SanityFail => {
                    let message = format!("unexpected solver response {}", check.verdict.name());
                    return Ok(EquivalenceResult::gave_up(message, check));
                }
                Verdict::Sat(_) => {
                    let (check, index) = match classify(&check) {
                        Classification::GaveUp(why) => {
                            return Ok(EquivalenceResult::gave_up(why, check));
                        }
                        Classification::Storage(diff) => {
                            let explained = self.explainer.explain_storage(&check, &diff);
                            return Ok(EquivalenceResult::ExplainedCounterExample(explained));
                        }
                        Classification::Trace { index, failing } => {
                            debug!(rule = %rule, %index, %failing, "trace divergence");
                            match config.minimizer {
                                Some(min) => match self.try_minimize(&config, &min, check, index)? {
                                    MinimizedSat::Storage(check, diff) => {
                                        let explained = self.explainer.explain_storage(&check, &diff);
                                        return Ok(EquivalenceResult::ExplainedCounterExample(explained));
                                    }
                                    MinimizedSat::Trace(check, index) => (check, index),
                                },
                                None => (check, index),
                            }
                        }
                    };

                    let refinement =
                        CounterExampleRefiner::new(&self.checker, &config).try_refine(&check, &index)?;
                    info!(rule = %rule, %index, ?refinement, "refinement finished");
                    self.refinements.push(RefinementStep::new(&rule, &refinement));
                    match refinement {
                        RefinementResult::GaveUp(why) => {
                            return Ok(EquivalenceResult::gave_up(why, check));
                        }
                        RefinementResult::UnrefinableCex { a, b } => {
                            let explained =
                                self.explainer
                                    .explain_trace(config.target, a.as_ref(), b.as_ref(), &check);
                            return Ok(EquivalenceResult::ExplainedCounterExample(explained));
                        }
                        ref refined => {
                            if !self.apply_refinement(refined) {
                                return Ok(EquivalenceResult::gave_up(
                                    "couldn't actually do requested refinement",
                                    check,
                                ));
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explain::StandardExplainer;
    use crate::exploration::StandardExplorationStrategy;
    use crate::instrumentation::TraceInstrumenter;
    use crate::rule_generator::StandardConvention;
    use equiv_ir::{EventKind, ExitPayload, Expr, ProgramBuilder};
    use equiv_smt::VerifyError;
    use std::sync::Mutex;

    /// Answers queries from a script, UNSAT once it runs out.
    struct Scripted {
        answers: Mutex<Vec<Verdict>>,
        rules: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(mut answers: Vec<Verdict>) -> Self {
            answers.reverse();
            Self {
                answers: Mutex::new(answers),
                rules: Mutex::new(Vec::new()),
            }
        }

        fn rules(&self) -> Vec<String> {
            self.rules.lock().expect("lock").clone()
        }
    }

    impl ProgramVerifier for Scripted {
        fn verify(&self, _: &Program, rule: &str) -> Result<Verdict, VerifyError> {
            self.rules.lock().expect("lock").push(rule.to_string());
            Ok(self.answers.lock().expect("lock").pop().unwrap_or(Verdict::Unsat))
        }
    }

    fn emitting() -> Program {
        let mut b = ProgramBuilder::new("emitting");
        let entry = b.new_block();
        b.push(
            entry,
            Cmd::Event {
                kind: EventKind::Log,
                offset: Expr::int(0),
                length: Expr::int(32),
                context: vec![],
            },
        );
        b.push(entry, Cmd::Return { payload: ExitPayload::Values(vec![]) });
        b.build().expect("well formed")
    }

    fn run(verifier: &Scripted) -> EquivalenceResult<crate::explain::CounterExample> {
        let mut eq = FullEquivalence::new(
            verifier,
            &TraceInstrumenter,
            &StandardConvention,
            emitting(),
            emitting(),
            StandardExplainer,
            EquivalenceLimits::default(),
        );
        eq.equivalence_loop(Box::new(StandardExplorationStrategy::entry()))
            .expect("no engine error")
    }

    #[test]
    fn all_unsat_walks_every_facet() {
        let verifier = Scripted::new(vec![]);
        let result = run(&verifier);
        assert!(result.is_verified());
        assert_eq!(
            verifier.rules(),
            vec!["calls-unified", "logs-unified", "exits-unified"]
        );
    }

    #[test]
    fn timeout_on_calls_goes_to_tiers() {
        let verifier = Scripted::new(vec![Verdict::Timeout]);
        let result = run(&verifier);
        assert!(result.is_verified());
        let rules = verifier.rules();
        assert_eq!(rules[0], "calls-unified");
        assert_eq!(rules[1], "calls-tier-0");
    }

    #[test]
    fn unknown_gives_up() {
        let verifier = Scripted::new(vec![Verdict::Unknown("incomplete".to_string())]);
        match run(&verifier) {
            EquivalenceResult::GaveUp { message, check } => {
                assert_eq!(message, "unexpected solver response UNKNOWN");
                assert!(check.is_some());
            }
            other => panic!("Expected GaveUp, got: {}", other.pp()),
        }
    }

    #[test]
    fn sat_without_tagged_failure_gives_up() {
        let model = equiv_smt::ProgramModel::default();
        let verifier = Scripted::new(vec![Verdict::Sat(model)]);
        match run(&verifier) {
            EquivalenceResult::GaveUp { message, .. } => {
                assert_eq!(message, "Couldn't find failing assertion in counterexample");
            }
            other => panic!("Expected GaveUp, got: {}", other.pp()),
        }
    }

    #[test]
    fn expired_deadline_stops_before_querying() {
        let verifier = Scripted::new(vec![]);
        let mut eq = FullEquivalence::new(
            &verifier,
            &TraceInstrumenter,
            &StandardConvention,
            emitting(),
            emitting(),
            StandardExplainer,
            EquivalenceLimits {
                deadline: Instant::now().checked_sub(std::time::Duration::from_secs(1)),
                ..EquivalenceLimits::default()
            },
        );
        let result = eq
            .equivalence_loop(Box::new(StandardExplorationStrategy::entry()))
            .expect("no engine error");
        assert_eq!(result.pp(), "GaveUp(deadline exceeded)");
        assert!(verifier.rules().is_empty());
    }
}
