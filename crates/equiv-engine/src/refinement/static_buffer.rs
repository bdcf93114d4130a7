//! Static write decomposition of long buffers.
//!
//! A buffer read at a site is *static* when every execution reaching the
//! site builds it from the same sequence of writes at the same relative
//! offsets. The decomposition is read off one model of an instrumented
//! program (write histories are tracked for the site and for every copy),
//! then confirmed by a second query asserting that every execution has it.

use std::collections::BTreeSet;

use equiv_ir::{Cmd, CmdPointer, Expr, Program, Var};
use equiv_smt::{ProgramModel, Verdict};
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde::Serialize;
use tracing::{debug, warn};

use crate::checker::{Instrumentation, TraceEquivalenceChecker};
use crate::error::{EngineError, EngineResult};
use crate::instrumentation::{
    InclusionMode, InstrumentationControl, InstrumentedProgram, UseSiteControl,
};
use crate::refinement::TraceEvent;
use crate::rule_generator::{vc_program, Side};

pub const WORD_SIZE: usize = 32;
/// Nesting of copies followed when decomposing.
const MAX_COPY_DEPTH: usize = 8;

/// One write of a static decomposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BufferWrite {
    /// A word store.
    WordWrite { relative_offset: i64 },
    /// A copy of a buffer with its own static decomposition.
    LongCopyFrom {
        relative_offset: i64,
        source: Box<WriteOffsets>,
    },
}

impl BufferWrite {
    pub fn relative_offset(&self) -> i64 {
        match self {
            BufferWrite::WordWrite { relative_offset }
            | BufferWrite::LongCopyFrom {
                relative_offset, ..
            } => *relative_offset,
        }
    }

    pub fn length(&self) -> usize {
        match self {
            BufferWrite::WordWrite { .. } => WORD_SIZE,
            BufferWrite::LongCopyFrom { source, .. } => source.static_length,
        }
    }

    pub fn end(&self) -> i64 {
        self.relative_offset() + self.length() as i64
    }
}

/// How the buffer read at `actual_source` is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOffsets {
    /// Site of the original program reading the buffer.
    pub actual_source: CmdPointer,
    /// Writes in program order.
    pub writes: Vec<BufferWrite>,
    pub static_length: usize,
}

impl WriteOffsets {
    /// Every site whose write history the decomposition refers to.
    pub fn sources(&self) -> BTreeSet<CmdPointer> {
        let mut out = BTreeSet::from([self.actual_source]);
        for w in &self.writes {
            if let BufferWrite::LongCopyFrom { source, .. } = w {
                out.extend(source.sources());
            }
        }
        out
    }
}

/// A write history entry as observed in a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedWrite {
    Precise(BufferWrite),
    Imprecise,
}

/// Would `sorted` (ordered by offset) tile `[0, length)`?
fn covers(sorted: &[&BufferWrite], length: usize) -> bool {
    let Some(first) = sorted.first() else {
        return false;
    };
    if first.relative_offset() > 0 {
        return false;
    }
    let mut end = first.end();
    for w in &sorted[1..] {
        if w.relative_offset() > end {
            return false;
        }
        end = end.max(w.end());
    }
    end >= length as i64
}

/// Shortest suffix of the precise tail of `latest_first` that tiles
/// `[0, length)`, in program order.
pub fn decompose_history(latest_first: &[ObservedWrite], length: usize) -> Option<Vec<BufferWrite>> {
    let precise: Vec<&BufferWrite> = latest_first
        .iter()
        .map_while(|w| match w {
            ObservedWrite::Precise(b) => Some(b),
            ObservedWrite::Imprecise => None,
        })
        .collect();
    let mut sorted: Vec<&BufferWrite> = Vec::with_capacity(precise.len());
    for (i, w) in precise.iter().enumerate() {
        let at = sorted.partition_point(|s| s.relative_offset() <= w.relative_offset());
        sorted.insert(at, w);
        if covers(&sorted, length) {
            return Some(precise[..=i].iter().rev().map(|w| (*w).clone()).collect());
        }
    }
    None
}

/// Reads write histories of one instrumented program out of a model.
struct HistoryReader<'m> {
    model: &'m ProgramModel,
    inst: &'m InstrumentedProgram,
    call: u32,
}

impl HistoryReader<'_> {
    fn int(&self, v: &Var) -> Result<BigInt, String> {
        self.model
            .int(&v.indexed(self.call))
            .cloned()
            .ok_or_else(|| format!("no value for {}", v.name))
    }

    fn extract(&self, site_id: u32, depth: usize) -> Result<WriteOffsets, String> {
        if depth > MAX_COPY_DEPTH {
            return Err(format!("copies nested too deeply at site {site_id}"));
        }
        let (ptr, info) = self
            .inst
            .site_by_id(site_id)
            .ok_or_else(|| format!("no use site for {site_id}"))?;
        let writes = info
            .writes
            .as_ref()
            .ok_or_else(|| format!("site {site_id} is not tracked"))?;
        let count = self
            .int(&writes.count)?
            .to_usize()
            .ok_or("write count out of range")?;
        if count == 0 {
            return Err(format!("no writes at all into the buffer of site {site_id}"));
        }
        let length = self
            .int(&writes.length)?
            .to_usize()
            .ok_or("buffer length out of range")?;
        let mut history = Vec::new();
        for reg in writes.registers.iter().take(count) {
            if self.int(&reg.precise)? != BigInt::from(1) {
                debug!(site_id, position = history.len(), "imprecise write, stopping");
                history.push(ObservedWrite::Imprecise);
                break;
            }
            let relative_offset = self
                .int(&reg.offset)?
                .to_i64()
                .ok_or("relative offset out of range")?;
            let source = self
                .int(&reg.source)?
                .to_u32()
                .ok_or("copy source out of range")?;
            let write = if source != 0 {
                let copied = self
                    .extract(source, depth + 1)
                    .map_err(|e| format!("couldn't follow copy from {source}: {e}"))?;
                BufferWrite::LongCopyFrom {
                    relative_offset,
                    source: Box::new(copied),
                }
            } else {
                BufferWrite::WordWrite { relative_offset }
            };
            history.push(ObservedWrite::Precise(write));
        }
        if matches!(history.first(), Some(ObservedWrite::Imprecise)) {
            return Err(format!("no write into the buffer of site {site_id} was precise"));
        }
        let writes = decompose_history(&history, length)
            .ok_or_else(|| format!("precise writes of site {site_id} don't cover the buffer"))?;
        Ok(WriteOffsets {
            actual_source: ptr,
            writes,
            static_length: length,
        })
    }
}

/// Conjunction of facts holding whenever the buffer at `w.actual_source`
/// has decomposition `w`. Variables are unindexed.
fn static_footprint(
    inst: &InstrumentedProgram,
    w: &WriteOffsets,
    out: &mut Vec<Expr>,
) -> Result<(), String> {
    let writes = inst
        .site(w.actual_source)
        .and_then(|s| s.writes.as_ref())
        .ok_or_else(|| format!("no write tracking at {}", w.actual_source))?;
    let n = w.writes.len();
    out.push(Expr::var(&writes.length).eq(Expr::int(w.static_length as u64)));
    out.push(Expr::int(n as u64).le(Expr::var(&writes.count)));
    for (ind, write) in w.writes.iter().enumerate() {
        let reg = writes
            .registers
            .get(n - ind - 1)
            .ok_or("decomposition longer than the tracked history")?;
        out.push(Expr::var(&reg.offset).eq(Expr::int(write.relative_offset())));
        out.push(Expr::var(&reg.precise).eq(Expr::int(1)));
        match write {
            BufferWrite::WordWrite { .. } => {
                out.push(Expr::var(&reg.source).eq(Expr::int(0)));
            }
            BufferWrite::LongCopyFrom { source, .. } => {
                static_footprint(inst, source, out)?;
                let id = inst
                    .site(source.actual_source)
                    .map(|s| s.id)
                    .ok_or_else(|| format!("no site at {}", source.actual_source))?;
                out.push(Expr::var(&reg.source).eq(Expr::int(id)));
            }
        }
    }
    Ok(())
}

/// Instrumentation forcing execution to `site`, tracking its buffer and
/// every copy.
pub fn tracking_control(
    base: &InstrumentationControl,
    program: &Program,
    sites: impl IntoIterator<Item = CmdPointer>,
    stop_at: CmdPointer,
) -> InstrumentationControl {
    let mut control = InstrumentationControl::new(
        base.target,
        InclusionMode::UntilExactly(BTreeSet::from([stop_at])),
    )
    .with_limits(base.exact_buffer_words, base.max_tracked_writes);
    let tracked = UseSiteControl {
        track_buffer_contents: true,
        identity: None,
    };
    for site in sites {
        control = control.with_use_site(site, tracked.clone());
    }
    for (ptr, cmd) in program.commands() {
        if matches!(cmd, Cmd::MemCopy { .. }) {
            control = control.with_use_site(ptr, tracked.clone());
        }
    }
    control
}

/// Extracts and confirms static decompositions.
pub struct StaticBufferRefinement<'c, 'a> {
    checker: &'c TraceEquivalenceChecker<'a>,
}

impl<'c, 'a> StaticBufferRefinement<'c, 'a> {
    pub fn new(checker: &'c TraceEquivalenceChecker<'a>) -> Self {
        Self { checker }
    }

    /// Decomposition of the buffer read at `event` in `program`. `Ok(Err)`
    /// when the buffer is not static.
    pub fn try_refine_buffer(
        &self,
        side: Side,
        program: &Program,
        event: &TraceEvent,
        base: &InstrumentationControl,
    ) -> EngineResult<Result<WriteOffsets, String>> {
        let site = event.original_site;
        let control = tracking_control(base, program, [site], site);
        let inst = self.checker.instrumenter().instrument(program, &control)?;
        let Some(site_id) = inst.site(site).map(|s| s.id) else {
            return Ok(Err(format!("no instrumentation for {site}")));
        };

        let label = format!("static extraction from {} ({side})", program.name);
        let probe = vc_program("probe", vec![Cmd::assert(Expr::ff(), "dummy")]);
        let rule = self.checker.rules().generate_single(&inst.program, &probe, &label)?;
        let verdict = self.checker.verifier().verify(&rule, &label)?;
        let Verdict::Sat(model) = verdict else {
            return Ok(Err(format!(
                "failed getting a model for static offsets: {}",
                verdict.name()
            )));
        };
        let reader = HistoryReader {
            model: &model,
            inst: &inst,
            call: Side::A.call(),
        };
        let offsets = match reader.extract(site_id, 0) {
            Ok(o) => o,
            Err(e) => return Ok(Err(e)),
        };

        let mut facts = Vec::new();
        if let Err(e) = static_footprint(&inst, &offsets, &mut facts) {
            return Ok(Err(e));
        }
        let label = format!("verifying static offsets in {} ({side})", program.name);
        let vc = vc_program(
            "assertion",
            vec![Cmd::assert(Expr::and(facts), "has static footprint")],
        );
        let rule = self.checker.rules().generate_single(&inst.program, &vc, &label)?;
        let verdict = self.checker.verifier().verify(&rule, &label)?;
        if !verdict.is_unsat() {
            return Ok(Err(format!(
                "not actually static offsets: {}",
                verdict.name()
            )));
        }
        debug!(%site, writes = offsets.writes.len(), length = offsets.static_length, "static decomposition confirmed");
        Ok(Ok(offsets))
    }

    /// Both sides' decompositions, computed concurrently. `None` unless both
    /// buffers are static.
    pub fn try_refine_buffers(
        &self,
        a: (&Instrumentation, &TraceEvent, &InstrumentationControl),
        b: (&Instrumentation, &TraceEvent, &InstrumentationControl),
    ) -> EngineResult<Option<(WriteOffsets, WriteOffsets)>> {
        let (a_res, b_res) = std::thread::scope(|s| {
            let a_task = s.spawn(|| self.try_refine_buffer(Side::A, &a.0.original, a.1, a.2));
            let b_task = s.spawn(|| self.try_refine_buffer(Side::B, &b.0.original, b.1, b.2));
            (a_task.join(), b_task.join())
        });
        match (joined(a_res)?, joined(b_res)?) {
            (Ok(a_offsets), Ok(b_offsets)) => Ok(Some((a_offsets, b_offsets))),
            (a_outcome, b_outcome) => {
                if let Err(e) = a_outcome {
                    warn!(program = %a.0.original.name, "failed to refine buffer: {e}");
                }
                if let Err(e) = b_outcome {
                    warn!(program = %b.0.original.name, "failed to refine buffer: {e}");
                }
                Ok(None)
            }
        }
    }
}

type Refined = EngineResult<Result<WriteOffsets, String>>;

fn joined(r: std::thread::Result<Refined>) -> Refined {
    match r {
        Ok(res) => res,
        Err(_) => Err(EngineError::Invariant(
            "static buffer refinement panicked".to_string(),
        )),
    }
}
