//! Deciding what to compare next.
//!
//! The standard strategy compares the cheapest facet of behaviour first:
//! external calls, then logs, then exits together with the final storage.
//! Each facet is first checked with a single query covering every trace
//! position. When that query times out the facet is checked one trace
//! position (or one exit site of A) at a time.

use std::fmt;

use equiv_ir::CmdPointer;
use tracing::info;

use crate::checker::{
    BoundedLogOrCallTracer, CheckResult, LogOrCallTracer, ProgramExitTracer, VcGenerator,
};
use crate::instrumentation::{InclusionMode, InstrumentationControl, TraceTarget};
use crate::proof_manager::PairwiseProofManager;
use crate::rule_generator::Side;

/// Produces VCs comparing only trace positions below a bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Minimizer {
    pub target: TraceTarget,
}

impl Minimizer {
    pub fn generator(&self, max_trace_length: u32) -> Box<dyn VcGenerator> {
        Box::new(BoundedLogOrCallTracer {
            target: self.target,
            bound: max_trace_length,
        })
    }
}

/// Everything needed to run one trace check.
pub struct EquivalenceCheckConfiguration {
    pub rule_name: String,
    pub target: TraceTarget,
    pub vc: Box<dyn VcGenerator>,
    pub minimizer: Option<Minimizer>,
    pub a_control: InstrumentationControl,
    pub b_control: InstrumentationControl,
}

impl fmt::Debug for EquivalenceCheckConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EquivalenceCheckConfiguration")
            .field("rule_name", &self.rule_name)
            .field("target", &self.target)
            .field("vc", &self.vc.describe())
            .field("minimizer", &self.minimizer)
            .finish()
    }
}

impl EquivalenceCheckConfiguration {
    /// Standard configuration: both sides instrumented from the proof
    /// manager's view with the same target and mode.
    pub fn standard(
        rule_name: impl Into<String>,
        p: &PairwiseProofManager,
        target: TraceTarget,
        mode: InclusionMode,
        vc: Box<dyn VcGenerator>,
        minimizer: Option<Minimizer>,
    ) -> Self {
        Self {
            rule_name: rule_name.into(),
            target,
            vc,
            minimizer,
            a_control: p.control(Side::A, target, mode.clone()),
            b_control: p.control(Side::B, target, mode),
        }
    }

    pub fn with_limits(mut self, exact_buffer_words: usize, max_tracked_writes: usize) -> Self {
        self.a_control = self
            .a_control
            .with_limits(exact_buffer_words, max_tracked_writes);
        self.b_control = self
            .b_control
            .with_limits(exact_buffer_words, max_tracked_writes);
        self
    }
}

/// A state of an exploration strategy. `None` from a transition means
/// there is nothing left to check.
pub trait ExplorationManager: Send + Sync + fmt::Debug {
    fn next_config(&self, p: &PairwiseProofManager) -> EquivalenceCheckConfiguration;

    fn on_success(&self, check: &CheckResult) -> Option<Box<dyn ExplorationManager>>;

    fn on_timeout(&self, check: &CheckResult) -> Option<Box<dyn ExplorationManager>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StandardExplorationStrategy {
    LogOrTraceUnified(TraceTarget),
    /// Compare only the `tier`-th event of the target.
    LogOrTraceTiered { target: TraceTarget, tier: u32 },
    ExitSiteTracerUnified,
    /// Compare exits with A forced to leave through `sites[index]`.
    ExitSiteTracerPointerwise { sites: Vec<CmdPointer>, index: usize },
}

impl Default for StandardExplorationStrategy {
    fn default() -> Self {
        Self::entry()
    }
}

impl StandardExplorationStrategy {
    pub fn entry() -> Self {
        StandardExplorationStrategy::LogOrTraceUnified(TraceTarget::Calls)
    }

    /// Where a facet continues once all its events are proven equal.
    fn after_facet(target: TraceTarget) -> Option<Self> {
        match target {
            TraceTarget::Calls => Some(Self::LogOrTraceUnified(TraceTarget::Log)),
            TraceTarget::Log => Some(Self::ExitSiteTracerUnified),
            TraceTarget::Results => None,
        }
    }

    pub fn after_success(&self, check: &CheckResult) -> Option<Self> {
        match self {
            Self::LogOrTraceUnified(target) => Self::after_facet(*target),
            Self::LogOrTraceTiered { target, tier } => {
                let more_work = check.a.result.may_record() || check.b.result.may_record();
                if more_work {
                    Some(Self::LogOrTraceTiered {
                        target: *target,
                        tier: tier + 1,
                    })
                } else {
                    Self::after_facet(*target)
                }
            }
            Self::ExitSiteTracerUnified => None,
            Self::ExitSiteTracerPointerwise { sites, index } => {
                if index + 1 >= sites.len() {
                    None
                } else {
                    Some(Self::ExitSiteTracerPointerwise {
                        sites: sites.clone(),
                        index: index + 1,
                    })
                }
            }
        }
    }

    pub fn after_timeout(&self, check: &CheckResult) -> Option<Self> {
        match self {
            Self::LogOrTraceUnified(target) => Some(Self::LogOrTraceTiered {
                target: *target,
                tier: 0,
            }),
            Self::LogOrTraceTiered { .. } => None,
            Self::ExitSiteTracerUnified => {
                let sites = check.a.original.halting_sites();
                if sites.is_empty() {
                    None
                } else {
                    Some(Self::ExitSiteTracerPointerwise { sites, index: 0 })
                }
            }
            Self::ExitSiteTracerPointerwise { .. } => None,
        }
    }

    fn rule_name(&self) -> String {
        match self {
            Self::LogOrTraceUnified(target) => format!("{target}-unified"),
            Self::LogOrTraceTiered { target, tier } => format!("{target}-tier-{tier}"),
            Self::ExitSiteTracerUnified => "exits-unified".to_string(),
            Self::ExitSiteTracerPointerwise { index, .. } => format!("exit-site-{index}"),
        }
    }
}

impl ExplorationManager for StandardExplorationStrategy {
    fn next_config(&self, p: &PairwiseProofManager) -> EquivalenceCheckConfiguration {
        let name = self.rule_name();
        match self {
            Self::LogOrTraceUnified(target) => EquivalenceCheckConfiguration::standard(
                name,
                p,
                *target,
                InclusionMode::Unified,
                Box::new(LogOrCallTracer::new(*target)),
                Some(Minimizer { target: *target }),
            ),
            // only the tier-th event is recorded, so earlier divergences
            // were already found at lower tiers
            Self::LogOrTraceTiered { target, tier } => EquivalenceCheckConfiguration::standard(
                name,
                p,
                *target,
                InclusionMode::Until(*tier),
                Box::new(LogOrCallTracer::new(*target)),
                None,
            ),
            Self::ExitSiteTracerUnified => EquivalenceCheckConfiguration::standard(
                name,
                p,
                TraceTarget::Results,
                InclusionMode::Unified,
                Box::new(ProgramExitTracer),
                None,
            ),
            Self::ExitSiteTracerPointerwise { sites, index } => {
                let mut config = EquivalenceCheckConfiguration::standard(
                    name,
                    p,
                    TraceTarget::Results,
                    InclusionMode::Unified,
                    Box::new(ProgramExitTracer),
                    None,
                );
                if let Some(site) = sites.get(*index) {
                    config.a_control.mode = InclusionMode::UntilExactly([*site].into());
                }
                config
            }
        }
    }

    fn on_success(&self, check: &CheckResult) -> Option<Box<dyn ExplorationManager>> {
        let next = self.after_success(check);
        info!(from = ?self, to = ?next, "exploration step succeeded");
        next.map(|n| Box::new(n) as Box<dyn ExplorationManager>)
    }

    fn on_timeout(&self, check: &CheckResult) -> Option<Box<dyn ExplorationManager>> {
        let next = self.after_timeout(check);
        info!(from = ?self, to = ?next, "exploration step timed out");
        next.map(|n| Box::new(n) as Box<dyn ExplorationManager>)
    }
}
