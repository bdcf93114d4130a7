//! Trace instrumentation.
//!
//! An [`Instrumenter`] rewrites a program so that its observable behaviour
//! (external calls, logs or exits, depending on the [`TraceTarget`]) is
//! recorded into a trace map indexed by event position. Every observable or
//! memory-relevant command of the original program is a *site* with a stable
//! numeric id; the returned [`InstrumentedProgram`] maps original command
//! pointers to the variables the instrumentation introduced for that site.
//!
//! Side state introduced per program (all unindexed, call-indexed later by
//! the rule generator):
//!
//! * `trace!count`, `trace!values`, `trace!revert`: trace length, trace
//!   contents and the reverting-path flag;
//! * `site!{id}!...`: per-site record (hit flag, trace index, signature)
//!   and buffer capture (hash, length, offset, leading words);
//! * `wt!{id}!...`: write history of a tracked buffer;
//! * `load!{id}!...`: havocked load values and their memory shadows.

pub mod inclusion;
mod trace;
mod writes;

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use equiv_ir::{Cmd, CmdPointer, EventKind, ExitPayload, Expr, Program, Var};
use indexmap::IndexMap;
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

pub use trace::TraceInstrumenter;

/// Which facet of behaviour the trace records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraceTarget {
    Calls,
    Log,
    /// Exits: returned values or buffers, reverts and plain stops.
    Results,
}

impl TraceTarget {
    pub fn event_kind(self) -> Option<EventKind> {
        match self {
            TraceTarget::Calls => Some(EventKind::Call),
            TraceTarget::Log => Some(EventKind::Log),
            TraceTarget::Results => None,
        }
    }

    /// Does a site of this kind produce an event of this target?
    pub fn matches(self, kind: &SiteKind) -> bool {
        match (self, kind) {
            (TraceTarget::Results, SiteKind::Exit(_)) => true,
            (t, SiteKind::Event(k)) => t.event_kind() == Some(*k),
            _ => false,
        }
    }
}

impl fmt::Display for TraceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceTarget::Calls => write!(f, "calls"),
            TraceTarget::Log => write!(f, "logs"),
            TraceTarget::Results => write!(f, "results"),
        }
    }
}

/// Which events of the target are recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InclusionMode {
    /// Every event, at its position.
    Unified,
    /// Only the event at position `n`; the program stops right after it.
    Until(u32),
    /// Only events at the given sites. The program stops after a listed
    /// non-halting site, and halting sites that are not listed are blocked.
    UntilExactly(BTreeSet<CmdPointer>),
}

/// Static classification of whether a site may be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InclusionSort {
    DefinitelyIncluded,
    MaybeIncluded,
    DefinitelyExcluded,
}

/// Identity of the buffer read at a use site, overriding its content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferIdentity {
    /// The hash is `id`; `reached` is set when the site executes.
    Forced { id: BigInt, reached: Var },
    /// The hash is `value` of the first case whose flag holds, the computed
    /// hash otherwise.
    Conditional { cases: Vec<(Var, BigInt)> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UseSiteControl {
    /// Record the write history of the buffer read at this site.
    pub track_buffer_contents: bool,
    pub identity: Option<BufferIdentity>,
}

/// Everything an instrumentation pass needs to know about one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationControl {
    pub target: TraceTarget,
    pub mode: InclusionMode,
    pub use_sites: HashMap<CmdPointer, UseSiteControl>,
    /// Loads modelled precisely, with their precision window.
    pub load_windows: HashMap<CmdPointer, u32>,
    pub exact_buffer_words: usize,
    pub max_tracked_writes: usize,
}

impl InstrumentationControl {
    pub fn new(target: TraceTarget, mode: InclusionMode) -> Self {
        Self {
            target,
            mode,
            use_sites: HashMap::new(),
            load_windows: HashMap::new(),
            exact_buffer_words: 4,
            max_tracked_writes: 8,
        }
    }

    pub fn with_use_site(mut self, ptr: CmdPointer, control: UseSiteControl) -> Self {
        self.use_sites.insert(ptr, control);
        self
    }

    pub fn with_limits(mut self, exact_buffer_words: usize, max_tracked_writes: usize) -> Self {
        self.exact_buffer_words = exact_buffer_words;
        self.max_tracked_writes = max_tracked_writes;
        self
    }

    fn tracks(&self, ptr: &CmdPointer) -> bool {
        self.use_sites
            .get(ptr)
            .is_some_and(|c| c.track_buffer_contents)
    }

    fn identity(&self, ptr: &CmdPointer) -> Option<&BufferIdentity> {
        self.use_sites.get(ptr).and_then(|c| c.identity.as_ref())
    }
}

/// Instruments a program for one query.
pub trait Instrumenter: Send + Sync {
    fn instrument(
        &self,
        program: &Program,
        control: &InstrumentationControl,
    ) -> EngineResult<InstrumentedProgram>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitKind {
    /// Return of `n` scalar values.
    Values(usize),
    Buffer,
    Revert,
    /// Falling off the end of the program.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SiteKind {
    Event(EventKind),
    Exit(ExitKind),
    Copy,
    Load,
}

impl SiteKind {
    pub fn is_exit(&self) -> bool {
        matches!(self, SiteKind::Exit(_))
    }
}

/// Trace record of a target site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub hit: Var,
    pub index: Var,
    pub signature: Var,
}

/// Capture of the buffer an event or exit carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferCapture {
    pub hash: Var,
    pub length: Var,
    pub offset: Var,
    /// Leading words of the buffer, most significant byte first.
    pub words: Vec<Var>,
    /// The hash is a function of the contents (constant buffer length).
    pub precise: bool,
}

/// One entry of a write history, latest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRegister {
    /// Offset relative to the buffer start.
    pub offset: Var,
    pub length: Var,
    /// 1 when the write is modelled exactly.
    pub precise: Var,
    /// Site id of the copy that performed the write, 0 for word stores.
    pub source: Var,
    pub value: Var,
}

/// Write history of a tracked buffer, snapshotted at its use site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferWrites {
    pub reached: Var,
    /// Length of the buffer read at the site.
    pub length: Var,
    pub count: Var,
    /// `registers[0]` is the latest write.
    pub registers: Vec<WriteRegister>,
}

/// Havocked load with the value memory actually held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadShadow {
    pub hit: Var,
    pub value: Var,
    pub shadow: Var,
}

/// Per-site bookkeeping of an instrumented program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteInfo {
    pub id: u32,
    pub kind: SiteKind,
    /// Present for sites of the trace target.
    pub inclusion: Option<InclusionSort>,
    pub record: Option<TraceRecord>,
    pub buffer: Option<BufferCapture>,
    pub writes: Option<BufferWrites>,
    pub load: Option<LoadShadow>,
}

/// Trace state variables shared by every instrumented program.
pub fn trace_count() -> Var {
    Var::int("trace!count")
}

pub fn trace_values() -> Var {
    Var::map("trace!values")
}

pub fn revert_flag() -> Var {
    Var::bool("trace!revert")
}

/// Result of instrumenting a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentedProgram {
    pub program: Program,
    pub target: TraceTarget,
    pub mode: InclusionMode,
    /// Keyed by pointers of the original program.
    pub sites: IndexMap<CmdPointer, SiteInfo>,
}

impl InstrumentedProgram {
    /// Trace value at `index` once the program is inlined with `call`.
    pub fn trace_value_at(&self, call: u32, index: Expr) -> Expr {
        Expr::var(&trace_values().indexed(call)).select(index)
    }

    pub fn trace_length(&self, call: u32) -> Expr {
        Expr::var(&trace_count().indexed(call))
    }

    /// Holds on paths ending in a revert.
    pub fn is_reverting(&self, call: u32) -> Expr {
        Expr::var(&revert_flag().indexed(call))
    }

    pub fn site(&self, ptr: CmdPointer) -> Option<&SiteInfo> {
        self.sites.get(&ptr)
    }

    pub fn site_by_id(&self, id: u32) -> Option<(CmdPointer, &SiteInfo)> {
        self.sites
            .iter()
            .find(|(_, s)| s.id == id)
            .map(|(p, s)| (*p, s))
    }

    /// Sites of the trace target, with their inclusion classification.
    pub fn inclusion_report(&self) -> impl Iterator<Item = (CmdPointer, InclusionSort)> + '_ {
        self.sites
            .iter()
            .filter_map(|(p, s)| s.inclusion.map(|i| (*p, i)))
    }

    pub fn may_record(&self) -> bool {
        self.inclusion_report()
            .any(|(_, i)| i != InclusionSort::DefinitelyExcluded)
    }
}

/// Stable site numbering: ids from 1 in program order over events, exits,
/// copies and loads. A program ending in an event, copy or load has no
/// exit site on that path.
pub fn number_sites(program: &Program) -> IndexMap<CmdPointer, (u32, SiteKind)> {
    let halting: BTreeSet<CmdPointer> = program.halting_sites().into_iter().collect();
    let mut out = IndexMap::new();
    let mut next = 1u32;
    for (ptr, cmd) in program.commands() {
        let kind = match cmd {
            Cmd::Event { kind, .. } => Some(SiteKind::Event(*kind)),
            Cmd::MemCopy { .. } => Some(SiteKind::Copy),
            Cmd::MemLoad { .. } => Some(SiteKind::Load),
            _ if halting.contains(&ptr) => Some(SiteKind::Exit(exit_kind(cmd))),
            _ => None,
        };
        if let Some(kind) = kind {
            out.insert(ptr, (next, kind));
            next += 1;
        }
    }
    out
}

fn exit_kind(cmd: &Cmd) -> ExitKind {
    match cmd {
        Cmd::Return {
            payload: ExitPayload::Values(vals),
        } => ExitKind::Values(vals.len()),
        Cmd::Return {
            payload: ExitPayload::Buffer { .. },
        } => ExitKind::Buffer,
        Cmd::Revert => ExitKind::Revert,
        _ => ExitKind::Stop,
    }
}

/// The buffer `(offset, length)` read by a site, if any.
pub fn site_buffer(cmd: &Cmd) -> Option<(Expr, Expr)> {
    match cmd {
        Cmd::Event { offset, length, .. } => Some((offset.clone(), length.clone())),
        Cmd::Return {
            payload: ExitPayload::Buffer { offset, length },
        } => Some((offset.clone(), length.clone())),
        Cmd::MemCopy { src, len, .. } => Some((src.clone(), len.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use equiv_ir::ProgramBuilder;

    #[test]
    fn site_numbering_follows_program_order() {
        let x = Var::int("x");
        let mut b = ProgramBuilder::new("sites");
        let entry = b.new_block();
        let exit = b.new_block();
        b.push(entry, Cmd::MemLoad { lhs: x.clone(), offset: Expr::var(&x) });
        b.push(
            entry,
            Cmd::Event {
                kind: EventKind::Log,
                offset: Expr::int(0),
                length: Expr::int(32),
                context: vec![],
            },
        );
        b.push(entry, Cmd::jump(exit));
        b.push(exit, Cmd::Revert);
        let p = b.build().expect("well formed");
        let sites = number_sites(&p);
        let kinds: Vec<(u32, SiteKind)> = sites.values().copied().collect();
        assert_eq!(
            kinds,
            vec![
                (1, SiteKind::Load),
                (2, SiteKind::Event(EventKind::Log)),
                (3, SiteKind::Exit(ExitKind::Revert)),
            ]
        );
    }

    #[test]
    fn targets_match_their_sites() {
        assert!(TraceTarget::Log.matches(&SiteKind::Event(EventKind::Log)));
        assert!(!TraceTarget::Calls.matches(&SiteKind::Event(EventKind::Log)));
        assert!(TraceTarget::Results.matches(&SiteKind::Exit(ExitKind::Stop)));
        assert!(!TraceTarget::Results.matches(&SiteKind::Copy));
    }
}
