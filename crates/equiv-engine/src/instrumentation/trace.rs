//! The default instrumentation pass.

use std::collections::HashMap;

use equiv_ir::analysis::constant_value;
use equiv_ir::{Annotation, Block, BlockId, Cmd, CmdPointer, ExitPayload, Expr, Program, Var};
use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};
use tracing::debug;

use super::inclusion::{plan_sites, SiteAction, SitePlan};
use super::writes::{TrackedBuffer, WriteEvent};
use super::{
    number_sites, revert_flag, site_buffer, trace_count, trace_values, BufferCapture,
    BufferIdentity, ExitKind, InclusionMode, InstrumentationControl, InstrumentedProgram,
    Instrumenter, LoadShadow, SiteInfo, SiteKind, TraceRecord, TraceTarget,
};
use crate::error::EngineResult;

/// Depth of constant propagation used for buffer lengths and load offsets.
pub(crate) const CONSTANT_DEPTH: usize = 8;
/// Longest constant-length buffer hashed by content.
const MAX_HASHED_WORDS: usize = 64;
const WORD: usize = 32;

/// Records the trace of calls, logs or exits into `trace!values`.
///
/// * Buffers of constant length are identified by an uninterpreted hash of
///   their words; other buffers get a havocked hash unless the control
///   supplies an identity for the site.
/// * Under the `Calls` and `Log` targets, loads at non-constant offsets
///   without a precision window return havocked values, shadowed by the
///   value memory actually holds.
/// * Reverting paths restore storage to its entry snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceInstrumenter;

impl Instrumenter for TraceInstrumenter {
    fn instrument(
        &self,
        program: &Program,
        control: &InstrumentationControl,
    ) -> EngineResult<InstrumentedProgram> {
        let out = Rewriter::new(program, control).run()?;
        debug!(
            program = %program.name,
            target = %control.target,
            sites = out.sites.len(),
            blocks = out.program.blocks.len(),
            "instrumented program"
        );
        Ok(out)
    }
}

fn site_var(id: u32, field: &str) -> Var {
    Var::int(format!("site!{id}!{field}"))
}

fn site_flag(id: u32, field: &str) -> Var {
    Var::bool(format!("site!{id}!{field}"))
}

struct Rewriter<'a> {
    program: &'a Program,
    control: &'a InstrumentationControl,
    numbering: IndexMap<CmdPointer, (u32, SiteKind)>,
    plans: HashMap<CmdPointer, SitePlan>,
    trackers: IndexMap<CmdPointer, TrackedBuffer>,
    sites: IndexMap<CmdPointer, SiteInfo>,
    init: Vec<Cmd>,
    blocks: Vec<Block>,
    next_block: u32,
    stop_block: Option<BlockId>,
}

impl<'a> Rewriter<'a> {
    fn new(program: &'a Program, control: &'a InstrumentationControl) -> Self {
        let numbering = number_sites(program);
        let plans = plan_sites(program, &numbering, control.target, &control.mode);
        let sites = numbering
            .iter()
            .map(|(ptr, (id, kind))| {
                let inclusion = plans
                    .get(ptr)
                    .filter(|_| control.target.matches(kind))
                    .map(|p| p.sort);
                (
                    *ptr,
                    SiteInfo {
                        id: *id,
                        kind: *kind,
                        inclusion,
                        record: None,
                        buffer: None,
                        writes: None,
                        load: None,
                    },
                )
            })
            .collect();
        let trackers = numbering
            .iter()
            .filter(|(ptr, _)| control.tracks(ptr))
            .filter(|(ptr, _)| program.cmd(**ptr).and_then(site_buffer).is_some())
            .map(|(ptr, (id, _))| (*ptr, TrackedBuffer::new(*id, control.max_tracked_writes)))
            .collect();
        let next_block = program
            .blocks
            .keys()
            .map(|b| b.id + 1)
            .max()
            .unwrap_or(0);
        Self {
            program,
            control,
            numbering,
            plans,
            trackers,
            sites,
            init: Vec::new(),
            blocks: Vec::new(),
            next_block,
            stop_block: None,
        }
    }

    fn fresh_block(&mut self) -> BlockId {
        let id = BlockId::new(self.next_block);
        self.next_block += 1;
        id
    }

    fn stop_label(&self) -> String {
        match &self.control.mode {
            InclusionMode::Until(n) => format!("early return for trace event {n}"),
            _ => "early return after selected site".to_string(),
        }
    }

    fn stop_block(&mut self) -> BlockId {
        if let Some(b) = self.stop_block {
            return b;
        }
        let id = self.fresh_block();
        let label = self.stop_label();
        self.blocks.push(Block::new(id, vec![Cmd::label(label)]));
        self.stop_block = Some(id);
        id
    }

    fn run(mut self) -> EngineResult<InstrumentedProgram> {
        let storage_init = Var::map("storage!init");
        self.init.extend([
            Cmd::assign(&trace_count(), Expr::int(0)),
            Cmd::assign(&trace_values(), Expr::const_map(Expr::int(0))),
            Cmd::assign(&revert_flag(), Expr::ff()),
            Cmd::assign(&storage_init, Expr::var(&Var::storage())),
        ]);
        for tracker in self.trackers.values() {
            self.init.extend(tracker.init());
        }
        let program = self.program;
        for block in program.blocks.values() {
            self.rewrite_block(block);
        }
        let entry = self.fresh_block();
        let mut init = std::mem::take(&mut self.init);
        init.push(Cmd::jump(self.program.entry));
        let mut blocks: IndexMap<BlockId, Block> = IndexMap::new();
        blocks.insert(entry, Block::new(entry, init));
        for b in self.blocks {
            blocks.insert(b.id, b);
        }
        let program = Program {
            name: self.program.name.clone(),
            entry,
            blocks,
            params: self.program.params.clone(),
            environment: self.program.environment.clone(),
        };
        program.validate()?;
        Ok(InstrumentedProgram {
            program,
            target: self.control.target,
            mode: self.control.mode.clone(),
            sites: self.sites,
        })
    }

    fn rewrite_block(&mut self, block: &Block) {
        let mut cur_id = block.id;
        let mut cur: Vec<Cmd> = Vec::new();
        for (pos, cmd) in block.cmds.iter().enumerate() {
            let ptr = CmdPointer::new(block.id, pos);
            let site = self.numbering.get(&ptr).copied();
            let action = self.plans.get(&ptr).map(|p| p.action);
            if action == Some(SiteAction::Block) {
                cur.push(Cmd::assume(Expr::ff()));
            }
            if let Some(tracker) = self.trackers.get(&ptr) {
                if let Some((offset, length)) = site_buffer(cmd) {
                    cur.extend(tracker.at_site(&offset, &length));
                    let snapshot = tracker.snapshot_vars();
                    if let Some(info) = self.sites.get_mut(&ptr) {
                        info.writes = Some(snapshot);
                    }
                }
            }
            let mut stop: Option<Option<Var>> = None;
            if let Some((id, kind)) = site {
                let targeted = self.control.target.matches(&kind);
                match action {
                    Some(SiteAction::Record {
                        only_at,
                        stop_after,
                    }) if targeted => {
                        let hit = self.record(ptr, id, kind, cmd, only_at, &mut cur);
                        if stop_after {
                            stop = Some(only_at.map(|_| hit));
                        }
                    }
                    Some(SiteAction::Count) if targeted => {
                        cur.push(bump_count());
                    }
                    Some(SiteAction::StopAfter) => stop = Some(None),
                    _ if matches!(kind, SiteKind::Event(_)) && !targeted => {
                        // events of other targets still fix their buffer identity
                        self.capture_if_identified(ptr, id, cmd, &mut cur);
                    }
                    _ => {}
                }
            }
            if matches!(cmd, Cmd::Revert) {
                cur.push(Cmd::assign(
                    &Var::storage(),
                    Expr::var(&Var::map("storage!init")),
                ));
                cur.push(Cmd::assign(&revert_flag(), Expr::tt()));
            }
            match (cmd, site) {
                (Cmd::MemLoad { lhs, offset }, Some((id, SiteKind::Load)))
                    if self.imprecise_load(ptr, offset) =>
                {
                    let shadow = LoadShadow {
                        hit: Var::bool(format!("load!{id}!hit")),
                        value: Var::int(format!("load!{id}!val")),
                        shadow: Var::int(format!("load!{id}!shadow")),
                    };
                    self.init.push(Cmd::assign(&shadow.hit, Expr::ff()));
                    cur.push(Cmd::assign(
                        &shadow.shadow,
                        Expr::var(&Var::memory()).select(offset.clone()),
                    ));
                    cur.push(Cmd::Havoc { lhs: lhs.clone() });
                    cur.push(Cmd::assign(&shadow.value, Expr::var(lhs)));
                    cur.push(Cmd::assign(&shadow.hit, Expr::tt()));
                    if let Some(info) = self.sites.get_mut(&ptr) {
                        info.load = Some(shadow);
                    }
                }
                _ => cur.push(cmd.clone()),
            }
            if let Some(write) = self.write_event(ptr, cmd, site) {
                for tracker in self.trackers.values() {
                    cur.extend(tracker.on_write(&write));
                }
            }
            match stop {
                None => {}
                Some(None) => {
                    let target = self.stop_block();
                    cur.push(Cmd::jump(target));
                    self.blocks.push(Block::new(cur_id, std::mem::take(&mut cur)));
                    return;
                }
                Some(Some(hit)) => {
                    let target = self.stop_block();
                    let cont = self.fresh_block();
                    cur.push(Cmd::branch(Expr::var(&hit), target, cont));
                    self.blocks.push(Block::new(cur_id, std::mem::take(&mut cur)));
                    cur_id = cont;
                }
            }
        }
        self.blocks.push(Block::new(cur_id, cur));
    }

    fn imprecise_load(&self, ptr: CmdPointer, offset: &Expr) -> bool {
        self.control.target != TraceTarget::Results
            && self
                .control
                .load_windows
                .get(&ptr)
                .map_or(true, |w| *w == 0)
            && constant_value(self.program, offset, ptr, CONSTANT_DEPTH).is_none()
    }

    fn write_event(
        &self,
        ptr: CmdPointer,
        cmd: &Cmd,
        site: Option<(u32, SiteKind)>,
    ) -> Option<WriteEvent> {
        match cmd {
            Cmd::MemStore { offset, value } => Some(WriteEvent {
                offset: offset.clone(),
                length: Expr::int(WORD as u64),
                precise: true,
                source: 0,
                value: value.clone(),
            }),
            Cmd::MemCopy { dst, len, .. } => Some(WriteEvent {
                offset: dst.clone(),
                length: len.clone(),
                precise: constant_value(self.program, len, ptr, CONSTANT_DEPTH).is_some(),
                source: site.map_or(0, |(id, _)| id),
                value: Expr::int(0),
            }),
            _ => None,
        }
    }

    /// Emit the record of a target site; returns its hit flag.
    fn record(
        &mut self,
        ptr: CmdPointer,
        id: u32,
        kind: SiteKind,
        cmd: &Cmd,
        only_at: Option<u32>,
        cur: &mut Vec<Cmd>,
    ) -> Var {
        let signature = site_var(id, "sig");
        let sig_expr = match (kind, cmd) {
            (SiteKind::Event(k), Cmd::Event { offset, length, context, .. }) => {
                let capture = self.capture(ptr, id, offset, length, cur);
                let mut args = vec![Expr::var(&capture.hash), Expr::var(&capture.length)];
                args.extend(context.iter().cloned());
                Expr::apply(format!("event!{k}!{}", context.len()), args)
            }
            (SiteKind::Exit(ExitKind::Values(n)), Cmd::Return { payload: ExitPayload::Values(vals) }) => {
                let mut args = vec![Expr::int(n as u64)];
                args.extend(vals.iter().cloned());
                Expr::apply(format!("exit!ret{n}"), args)
            }
            (SiteKind::Exit(ExitKind::Buffer), Cmd::Return { payload: ExitPayload::Buffer { offset, length } }) => {
                let capture = self.capture(ptr, id, offset, length, cur);
                Expr::apply(
                    "exit!buf",
                    vec![Expr::var(&capture.hash), Expr::var(&capture.length)],
                )
            }
            (SiteKind::Exit(ExitKind::Revert), _) => Expr::apply("exit!revert", vec![Expr::int(1)]),
            _ => Expr::apply("exit!stop", vec![Expr::int(0)]),
        };
        cur.push(Cmd::assign(&signature, sig_expr));
        cur.push(Cmd::assume(Expr::var(&signature).ne(Expr::int(0))));

        let record = TraceRecord {
            hit: site_flag(id, "hit"),
            index: site_var(id, "idx"),
            signature,
        };
        self.init.push(Cmd::assign(&record.hit, Expr::ff()));
        self.init.push(Cmd::assign(&record.index, Expr::int(-1)));
        let count = Expr::var(&trace_count());
        let values = Expr::var(&trace_values());
        match only_at {
            None => {
                cur.push(Cmd::assign(&record.hit, Expr::tt()));
                cur.push(Cmd::assign(&record.index, count.clone()));
                cur.push(Cmd::assign(
                    &trace_values(),
                    values.store(count.clone(), Expr::var(&record.signature)),
                ));
            }
            Some(n) => {
                let hit = Expr::var(&record.hit);
                cur.push(Cmd::assign(&record.hit, count.clone().eq(Expr::int(n))));
                cur.push(Cmd::assign(
                    &record.index,
                    Expr::ite(hit.clone(), count.clone(), Expr::int(-1)),
                ));
                cur.push(Cmd::assign(
                    &trace_values(),
                    values.clone().store(
                        count.clone(),
                        Expr::ite(
                            hit,
                            Expr::var(&record.signature),
                            values.select(count),
                        ),
                    ),
                ));
            }
        }
        cur.push(Cmd::Annotation(Annotation::TraceIndexMarker {
            site: id,
            index: record.index.clone(),
        }));
        cur.push(bump_count());
        let hit = record.hit.clone();
        if let Some(info) = self.sites.get_mut(&ptr) {
            info.record = Some(record);
        }
        hit
    }

    fn capture_if_identified(&mut self, ptr: CmdPointer, id: u32, cmd: &Cmd, cur: &mut Vec<Cmd>) {
        let control = self.control;
        if control.identity(&ptr).is_none() {
            return;
        }
        if let Cmd::Event { offset, length, .. } = cmd {
            self.capture(ptr, id, offset, length, cur);
        }
    }

    /// Capture the buffer `[offset, offset + length)` and compute its hash.
    fn capture(
        &mut self,
        ptr: CmdPointer,
        id: u32,
        offset: &Expr,
        length: &Expr,
        cur: &mut Vec<Cmd>,
    ) -> BufferCapture {
        let control = self.control;
        let mem = Expr::var(&Var::memory());
        let word_at = |j: usize| mem.clone().select(offset.clone().add(Expr::int((j * WORD) as u64)));
        let capture = BufferCapture {
            hash: site_var(id, "hash"),
            length: site_var(id, "len"),
            offset: site_var(id, "off"),
            words: (0..control.exact_buffer_words)
                .map(|j| site_var(id, &format!("w{j}")))
                .collect(),
            precise: false,
        };
        cur.push(Cmd::assign(&capture.length, length.clone()));
        cur.push(Cmd::assign(&capture.offset, offset.clone()));
        for (j, w) in capture.words.iter().enumerate() {
            cur.push(Cmd::assign(w, word_at(j)));
        }
        let constant_len = constant_value(self.program, length, ptr, CONSTANT_DEPTH);
        let precise_hash = constant_len.as_ref().and_then(|l| hashed_buffer(l, &word_at));
        let precise = precise_hash.is_some();
        match precise_hash {
            Some(h) => cur.push(Cmd::assign(&capture.hash, h)),
            None => cur.push(Cmd::Havoc {
                lhs: capture.hash.clone(),
            }),
        }
        match control.identity(&ptr) {
            Some(BufferIdentity::Forced { id: forced, reached }) => {
                self.init.push(Cmd::assign(reached, Expr::ff()));
                cur.push(Cmd::assign(&capture.hash, Expr::Int(forced.clone())));
                cur.push(Cmd::assign(reached, Expr::tt()));
            }
            Some(BufferIdentity::Conditional { cases }) => {
                let chosen = cases.iter().rev().fold(Expr::var(&capture.hash), |acc, (flag, v)| {
                    Expr::ite(Expr::var(flag), Expr::Int(v.clone()), acc)
                });
                cur.push(Cmd::assign(&capture.hash, chosen));
            }
            None => {}
        }
        let capture = BufferCapture { precise, ..capture };
        if let Some(info) = self.sites.get_mut(&ptr) {
            info.buffer = Some(capture.clone());
        }
        capture
    }
}

fn bump_count() -> Cmd {
    Cmd::assign(&trace_count(), Expr::var(&trace_count()).add(Expr::int(1)))
}

/// Content hash of a constant-length buffer: an uninterpreted function of
/// its words, the last word cut down to the bytes inside the buffer.
fn hashed_buffer(length: &BigInt, word_at: &impl Fn(usize) -> Expr) -> Option<Expr> {
    if length.is_zero() {
        return Some(Expr::int(0));
    }
    let len = length.to_usize()?;
    let words = len.div_ceil(WORD);
    if words > MAX_HASHED_WORDS {
        return None;
    }
    let tail = len - (words - 1) * WORD;
    let args = (0..words)
        .map(|j| {
            let w = word_at(j);
            if j + 1 == words && tail < WORD {
                w.div(Expr::pow2(8 * (WORD - tail)))
            } else {
                w
            }
        })
        .collect();
    Some(Expr::apply(format!("buf!hash!{words}"), args))
}
