//! Human-readable explanations of counterexamples.
//!
//! Numbers are rendered as decimal strings so explanations serialize to
//! JSON without precision loss.

use std::fmt::Write as _;

use equiv_ir::{CmdPointer, Value, Var};
use equiv_smt::ProgramModel;
use num_bigint::BigInt;
use serde::Serialize;

use crate::checker::{CheckResult, Instrumentation};
use crate::equivalence::StorageDiff;
use crate::instrumentation::{SiteInfo, SiteKind, TraceTarget};
use crate::refinement::{precise_buffer_bytes, TraceEvent};
use crate::rule_generator::{shared_arg, Side};

/// Turns a counterexample into an explanation of type `Explanation`.
pub trait CexExplainer {
    type Explanation;

    fn explain_storage(&self, check: &CheckResult, diff: &StorageDiff) -> Self::Explanation;

    /// At most one of `a` and `b` is `None`: that side had no event at the
    /// diverging trace position.
    fn explain_trace(
        &self,
        target: TraceTarget,
        a: Option<&TraceEvent>,
        b: Option<&TraceEvent>,
        check: &CheckResult,
    ) -> Self::Explanation;
}

/// One recorded event with its model values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventWithData {
    pub site: String,
    pub site_id: u32,
    pub kind: String,
    pub index: Option<String>,
    pub signature: Option<String>,
    pub buffer_length: Option<String>,
    /// Hex of the buffer contents when they could be extracted.
    pub buffer: Option<String>,
}

impl EventWithData {
    fn from_site(model: &ProgramModel, call: u32, site: CmdPointer, info: &SiteInfo) -> Self {
        let int = |v: &Var| model.int(&v.indexed(call)).map(ToString::to_string);
        let record = info.record.as_ref();
        let capture = info.buffer.as_ref();
        Self {
            site: site.to_string(),
            site_id: info.id,
            kind: kind_name(&info.kind),
            index: record.and_then(|r| int(&r.index)),
            signature: record.and_then(|r| int(&r.signature)),
            buffer_length: capture.and_then(|c| int(&c.length)),
            buffer: capture
                .and_then(|c| precise_buffer_bytes(model, c, call))
                .map(|bytes| hex(&bytes)),
        }
    }
}

fn kind_name(kind: &SiteKind) -> String {
    match kind {
        SiteKind::Event(k) => k.to_string(),
        SiteKind::Exit(e) => format!("exit {e:?}").to_lowercase(),
        SiteKind::Copy => "copy".to_string(),
        SiteKind::Load => "load".to_string(),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

fn value_string(v: &Value) -> String {
    match v {
        Value::Int(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedValue {
    pub name: String,
    pub value: Option<String>,
}

/// The inputs both programs were run with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InputExplanation {
    pub arguments: Vec<NamedValue>,
    pub environment: Vec<NamedValue>,
}

impl InputExplanation {
    pub fn from_model(model: &ProgramModel, check: &CheckResult) -> Self {
        let arguments = check
            .a
            .original
            .params
            .iter()
            .enumerate()
            .map(|(i, p)| NamedValue {
                name: p.name.clone(),
                value: model.value(&shared_arg(i, p.sort)).map(value_string),
            })
            .collect();
        let environment = check
            .rule
            .environment
            .iter()
            .map(|v| NamedValue {
                name: v.name.clone(),
                value: model.value(v).map(value_string),
            })
            .collect();
        Self {
            arguments,
            environment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MismatchExplanation {
    MissingInA { event_in_b: EventWithData },
    MissingInB { event_in_a: EventWithData },
    DifferentEvents { event_in_a: EventWithData, event_in_b: EventWithData },
    StorageExplanation { slot: Option<String>, a_value: Option<String>, b_value: Option<String> },
}

/// Default explanation: the mismatch, the events before it and the inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterExample {
    pub rule: String,
    pub target: Option<TraceTarget>,
    pub mismatch: MismatchExplanation,
    pub prior_events_a: Vec<EventWithData>,
    pub prior_events_b: Vec<EventWithData>,
    pub inputs: InputExplanation,
}

impl CounterExample {
    /// Plain-text rendering used by the trace dump.
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Counterexample for {}", self.rule);
        let event = |out: &mut String, label: &str, e: &EventWithData| {
            let _ = writeln!(
                out,
                "  {label}: {} at {} (index {}, signature {})",
                e.kind,
                e.site,
                e.index.as_deref().unwrap_or("?"),
                e.signature.as_deref().unwrap_or("?")
            );
            if let Some(buffer) = &e.buffer {
                let _ = writeln!(out, "    buffer: 0x{buffer}");
            }
        };
        match &self.mismatch {
            MismatchExplanation::MissingInA { event_in_b } => {
                let _ = writeln!(out, "Only B performed this event:");
                event(&mut out, "B", event_in_b);
            }
            MismatchExplanation::MissingInB { event_in_a } => {
                let _ = writeln!(out, "Only A performed this event:");
                event(&mut out, "A", event_in_a);
            }
            MismatchExplanation::DifferentEvents {
                event_in_a,
                event_in_b,
            } => {
                let _ = writeln!(out, "The events differ:");
                event(&mut out, "A", event_in_a);
                event(&mut out, "B", event_in_b);
            }
            MismatchExplanation::StorageExplanation {
                slot,
                a_value,
                b_value,
            } => {
                let _ = writeln!(
                    out,
                    "Storage differs at slot {}: A has {}, B has {}",
                    slot.as_deref().unwrap_or("?"),
                    a_value.as_deref().unwrap_or("?"),
                    b_value.as_deref().unwrap_or("?")
                );
            }
        }
        for (label, prior) in [("A", &self.prior_events_a), ("B", &self.prior_events_b)] {
            if !prior.is_empty() {
                let _ = writeln!(out, "{label} had {} event(s) before this one:", prior.len());
                for e in prior {
                    event(&mut out, label, e);
                }
            }
        }
        let _ = writeln!(out, "Inputs:");
        if self.inputs.arguments.is_empty() && self.inputs.environment.is_empty() {
            let _ = writeln!(out, "  none");
        }
        for v in self.inputs.arguments.iter().chain(&self.inputs.environment) {
            let _ = writeln!(out, "  {} = {}", v.name, v.value.as_deref().unwrap_or("?"));
        }
        out
    }
}

/// Recorded events of `side` strictly before trace position `before`,
/// ordered by position.
pub fn prior_events(model: &ProgramModel, side: &Instrumentation, before: &BigInt) -> Vec<EventWithData> {
    let call = side.call_id;
    let mut events: Vec<(BigInt, EventWithData)> = side
        .result
        .sites
        .iter()
        .filter_map(|(ptr, info)| {
            let record = info.record.as_ref()?;
            if model.bool(&record.hit.indexed(call)) != Some(true) {
                return None;
            }
            let index = model.int(&record.index.indexed(call))?;
            (index < before).then(|| (index.clone(), EventWithData::from_site(model, call, *ptr, info)))
        })
        .collect();
    events.sort_by(|x, y| x.0.cmp(&y.0));
    events.into_iter().map(|(_, e)| e).collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardExplainer;

impl StandardExplainer {
    fn event(check: &CheckResult, e: &TraceEvent) -> Option<EventWithData> {
        let model = check.model()?;
        let call = check.side(e.side).call_id;
        Some(EventWithData::from_site(model, call, e.original_site, &e.info))
    }

    fn index_of(check: &CheckResult, e: &TraceEvent) -> Option<BigInt> {
        let record = e.info.record.as_ref()?;
        let call = check.side(e.side).call_id;
        check.model()?.int(&record.index.indexed(call)).cloned()
    }
}

fn unknown_event(side: Side) -> EventWithData {
    EventWithData {
        site: format!("unknown site of {side}"),
        site_id: 0,
        kind: "unknown".to_string(),
        index: None,
        signature: None,
        buffer_length: None,
        buffer: None,
    }
}

impl CexExplainer for StandardExplainer {
    type Explanation = CounterExample;

    fn explain_storage(&self, check: &CheckResult, diff: &StorageDiff) -> CounterExample {
        let int = |v: &Var| check.model().and_then(|m| m.int(v)).map(ToString::to_string);
        CounterExample {
            rule: check.rule.name.clone(),
            target: None,
            mismatch: MismatchExplanation::StorageExplanation {
                slot: int(&diff.key),
                a_value: int(&diff.a_value),
                b_value: int(&diff.b_value),
            },
            prior_events_a: Vec::new(),
            prior_events_b: Vec::new(),
            inputs: check
                .model()
                .map(|m| InputExplanation::from_model(m, check))
                .unwrap_or_default(),
        }
    }

    fn explain_trace(
        &self,
        target: TraceTarget,
        a: Option<&TraceEvent>,
        b: Option<&TraceEvent>,
        check: &CheckResult,
    ) -> CounterExample {
        let a_data = a.map(|e| Self::event(check, e).unwrap_or_else(|| unknown_event(Side::A)));
        let b_data = b.map(|e| Self::event(check, e).unwrap_or_else(|| unknown_event(Side::B)));
        let mismatch = match (a_data, b_data) {
            (Some(event_in_a), Some(event_in_b)) => MismatchExplanation::DifferentEvents {
                event_in_a,
                event_in_b,
            },
            (Some(event_in_a), None) => MismatchExplanation::MissingInB { event_in_a },
            (None, Some(event_in_b)) => MismatchExplanation::MissingInA { event_in_b },
            (None, None) => MismatchExplanation::DifferentEvents {
                event_in_a: unknown_event(Side::A),
                event_in_b: unknown_event(Side::B),
            },
        };
        let index = a
            .and_then(|e| Self::index_of(check, e))
            .or_else(|| b.and_then(|e| Self::index_of(check, e)));
        let (prior_events_a, prior_events_b, inputs) = match (check.model(), index) {
            (Some(model), Some(index)) => (
                prior_events(model, &check.a, &index),
                prior_events(model, &check.b, &index),
                InputExplanation::from_model(model, check),
            ),
            (Some(model), None) => (
                Vec::new(),
                Vec::new(),
                InputExplanation::from_model(model, check),
            ),
            _ => (Vec::new(), Vec::new(), InputExplanation::default()),
        };
        CounterExample {
            rule: check.rule.name.clone(),
            target: Some(target),
            mismatch,
            prior_events_a,
            prior_events_b,
            inputs,
        }
    }
}
