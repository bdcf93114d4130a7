//! Counterexample refinement.
//!
//! A trace counterexample may be an artifact of imprecise modelling: a load
//! returned a havocked value, or two buffers with equal contents got
//! different identities. The refiner locates the diverging events, decides
//! which kind of imprecision (if any) produced the divergence, and says how
//! to make the next attempt more precise.

pub mod buffer_equality;
mod memory;
pub mod static_buffer;

use equiv_ir::{Annotation, Cmd, CmdPointer};
use num_bigint::BigInt;
use serde::Serialize;
use tracing::debug;

use crate::checker::{CheckResult, TraceEquivalenceChecker};
use crate::error::{EngineError, EngineResult};
use crate::exploration::EquivalenceCheckConfiguration;
use crate::instrumentation::{SiteInfo, TraceTarget};
use crate::rule_generator::Side;

pub use buffer_equality::StaticBufferEqualityChecker;
pub use memory::{precise_buffer_bytes, word_bytes, MemoryImprecisionAnalyzer};
pub use static_buffer::{
    decompose_history, BufferWrite, ObservedWrite, StaticBufferRefinement, WriteOffsets,
};

/// A trace event of one side, located in a counterexample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub side: Side,
    /// The site in the original program.
    pub original_site: CmdPointer,
    /// The trace marker in the checked rule program.
    pub rule_site: CmdPointer,
    pub info: SiteInfo,
}

/// The event `side` recorded at trace position `index` in the model of
/// `check`, if there is exactly one.
pub fn extract_event_data(check: &CheckResult, side: Side, index: &BigInt) -> Option<TraceEvent> {
    let model = check.model()?;
    let inst = check.side(side);
    let mut found = check
        .rule
        .commands()
        .filter(|(ptr, _)| ptr.block.call == inst.call_id && model.is_reachable(ptr.block))
        .filter_map(|(ptr, cmd)| match cmd {
            Cmd::Annotation(Annotation::TraceIndexMarker { site, index: v })
                if model.int(v) == Some(index) =>
            {
                Some((ptr, *site))
            }
            _ => None,
        });
    let (rule_site, id) = found.next()?;
    if found.next().is_some() {
        return None;
    }
    let (original_site, info) = inst.result.site_by_id(id)?;
    Some(TraceEvent {
        side,
        original_site,
        rule_site,
        info: info.clone(),
    })
}

/// Outcome of refining one counterexample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefinementResult {
    /// Re-run with the load at each given site modelled with the given
    /// precision window. At least one side is set.
    MemoryCellRefinement {
        refine_a: Option<(CmdPointer, u32)>,
        refine_b: Option<(CmdPointer, u32)>,
    },
    /// The buffers read at `site_a` and `site_b` were proven equal.
    BufferRefinement {
        site_a: CmdPointer,
        site_b: CmdPointer,
    },
    GaveUp(String),
    /// The divergence is real. A missing side did not have an event at
    /// the diverging position.
    UnrefinableCex {
        a: Option<TraceEvent>,
        b: Option<TraceEvent>,
    },
}

/// Summary of a refinement for reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefinementStep {
    pub rule: String,
    pub kind: String,
    pub detail: String,
}

impl RefinementStep {
    pub fn new(rule: &str, result: &RefinementResult) -> Self {
        let (kind, detail) = match result {
            RefinementResult::MemoryCellRefinement { refine_a, refine_b } => (
                "memory-cell",
                format!("A: {refine_a:?}, B: {refine_b:?}"),
            ),
            RefinementResult::BufferRefinement { site_a, site_b } => {
                ("buffer", format!("{site_a} ~ {site_b}"))
            }
            RefinementResult::GaveUp(why) => ("gave-up", why.clone()),
            RefinementResult::UnrefinableCex { a, b } => (
                "unrefinable",
                format!(
                    "A: {:?}, B: {:?}",
                    a.as_ref().map(|e| e.original_site),
                    b.as_ref().map(|e| e.original_site)
                ),
            ),
        };
        Self {
            rule: rule.to_string(),
            kind: kind.to_string(),
            detail,
        }
    }
}

/// Refines trace counterexamples found under one configuration.
pub struct CounterExampleRefiner<'c, 'a> {
    checker: &'c TraceEquivalenceChecker<'a>,
    config: &'c EquivalenceCheckConfiguration,
}

impl<'c, 'a> CounterExampleRefiner<'c, 'a> {
    pub fn new(checker: &'c TraceEquivalenceChecker<'a>, config: &'c EquivalenceCheckConfiguration) -> Self {
        Self { checker, config }
    }

    pub fn try_refine(&self, check: &CheckResult, index: &BigInt) -> EngineResult<RefinementResult> {
        let Some(model) = check.model() else {
            return Ok(RefinementResult::GaveUp("no model to refine".to_string()));
        };
        let a_event = extract_event_data(check, Side::A, index);
        let b_event = extract_event_data(check, Side::B, index);
        if a_event.is_none() && b_event.is_none() {
            return Ok(RefinementResult::GaveUp(
                "Both event information is missing".to_string(),
            ));
        }

        let refine_a = MemoryImprecisionAnalyzer::analyze(model, &check.a);
        let refine_b = MemoryImprecisionAnalyzer::analyze(model, &check.b);
        debug!(?refine_a, ?refine_b, "memory imprecision analysis");
        if refine_a.is_some() || refine_b.is_some() {
            return Ok(RefinementResult::MemoryCellRefinement { refine_a, refine_b });
        }

        let (a, b) = match (a_event, b_event) {
            (Some(a), Some(b)) => (a, b),
            (a, b) => {
                if self.config.target == TraceTarget::Results {
                    return Err(EngineError::Invariant(
                        "an exit trace position is recorded by one side only".to_string(),
                    ));
                }
                return Ok(RefinementResult::UnrefinableCex { a, b });
            }
        };

        let hash = |e: &TraceEvent, call: u32| {
            e.info
                .buffer
                .as_ref()
                .and_then(|buf| model.int(&buf.hash.indexed(call)))
        };
        // equal hashes are taken as a genuine divergence without trying
        // the static path
        let hashes_differ = matches!(
            (hash(&a, check.a.call_id), hash(&b, check.b.call_id)),
            (Some(x), Some(y)) if x != y
        );
        if !hashes_differ {
            return Ok(RefinementResult::UnrefinableCex {
                a: Some(a),
                b: Some(b),
            });
        }

        let bytes = |e: &TraceEvent, call: u32| {
            e.info
                .buffer
                .as_ref()
                .and_then(|buf| precise_buffer_bytes(model, buf, call))
        };
        let exact_same = match (bytes(&a, check.a.call_id), bytes(&b, check.b.call_id)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        };
        if !exact_same {
            return Ok(RefinementResult::UnrefinableCex {
                a: Some(a),
                b: Some(b),
            });
        }
        debug!(a = %a.original_site, b = %b.original_site, "buffers agree in the model, trying static refinement");

        let Some((a_writes, b_writes)) = StaticBufferRefinement::new(self.checker).try_refine_buffers(
            (&check.a, &a, &self.config.a_control),
            (&check.b, &b, &self.config.b_control),
        )?
        else {
            return Ok(RefinementResult::UnrefinableCex {
                a: Some(a),
                b: Some(b),
            });
        };
        let Some(equality) = StaticBufferEqualityChecker::new(a_writes, b_writes) else {
            return Ok(RefinementResult::UnrefinableCex {
                a: Some(a),
                b: Some(b),
            });
        };
        let result = equality.check_static_equivalence(
            self.checker,
            &check.a.original,
            &check.b.original,
            self.config,
        )?;
        if result.verdict.is_unsat() {
            Ok(RefinementResult::BufferRefinement {
                site_a: a.original_site,
                site_b: b.original_site,
            })
        } else {
            debug!(verdict = result.verdict.name(), "static buffers not proven equal");
            Ok(RefinementResult::UnrefinableCex {
                a: Some(a),
                b: Some(b),
            })
        }
    }
}
