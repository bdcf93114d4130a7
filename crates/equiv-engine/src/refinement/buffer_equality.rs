//! Equality of two statically decomposed buffers.
//!
//! Each buffer is described as one mathematical integer, byte 0 most
//! significant, assembled from the values of the writes that build it.
//! Runs of consecutive bytes taken from the same write become one
//! `(value div 2^lo) mod 2^width * 2^shift` term, so the query stays in
//! linear integer arithmetic over the write values.

use std::collections::BTreeSet;

use equiv_ir::{Cmd, CmdPointer, Expr, Program, Var};

use super::static_buffer::{tracking_control, BufferWrite, WriteOffsets, WORD_SIZE};
use crate::checker::{CheckResult, TraceEquivalenceChecker, VcContext, VcGenerator};
use crate::error::{EngineError, EngineResult};
use crate::exploration::EquivalenceCheckConfiguration;
use crate::instrumentation::InstrumentedProgram;
use crate::rule_generator::{vc_program, Side};

/// The value of one write: the `from_end`-th latest write into the buffer
/// read at `source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct WriteValue {
    source: CmdPointer,
    from_end: usize,
}

/// Byte `byte` (0 = least significant) of a write value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BufferByte {
    value: WriteValue,
    byte: usize,
}

/// Replay the decomposition, recording where every byte comes from.
fn tagged_buffer(w: &WriteOffsets) -> Option<Vec<BufferByte>> {
    let len = w.static_length;
    let mut tagged: Vec<Option<BufferByte>> = vec![None; len];
    let mut put = |at: i64, b: BufferByte| {
        if let Ok(at) = usize::try_from(at) {
            if at < len {
                tagged[at] = Some(b);
            }
        }
    };
    let n = w.writes.len();
    for (ind, write) in w.writes.iter().enumerate() {
        match write {
            BufferWrite::LongCopyFrom {
                relative_offset,
                source,
            } => {
                let Some(src) = tagged_buffer(source) else {
                    continue;
                };
                for (k, b) in src.into_iter().enumerate() {
                    put(relative_offset + k as i64, b);
                }
            }
            BufferWrite::WordWrite { relative_offset } => {
                let value = WriteValue {
                    source: w.actual_source,
                    from_end: n - ind,
                };
                for k in 0..WORD_SIZE {
                    put(
                        relative_offset + k as i64,
                        BufferByte {
                            value,
                            byte: WORD_SIZE - 1 - k,
                        },
                    );
                }
            }
        }
    }
    tagged.into_iter().collect()
}

fn value_var(side: Side, v: &WriteValue) -> Var {
    Var::int(format!(
        "sbe!{side}!{}!{}!{}!{}",
        v.source.block.id, v.source.block.call, v.source.pos, v.from_end
    ))
}

/// The integer denoting the buffer, over `value_var`s of `side`.
fn buffer_term(side: Side, tagged: &[BufferByte]) -> Expr {
    let total = tagged.len();
    let package = |run: BufferByte, start: usize, end: usize| {
        let width = end - start;
        let lowest = run.byte + 1 - width;
        Expr::var(&value_var(side, &run.value))
            .div(Expr::pow2(8 * lowest))
            .modulo(Expr::pow2(8 * width))
            .mul(Expr::pow2(8 * (total - end)))
    };
    let mut terms = Vec::new();
    let mut current: Option<(BufferByte, usize)> = None;
    for (i, b) in tagged.iter().enumerate() {
        match current {
            // bytes of a run descend through one write value
            Some((run, start)) if run.value == b.value && run.byte + start == b.byte + i => {}
            Some((run, start)) => {
                terms.push(package(run, start, i));
                current = Some((*b, i));
            }
            None => current = Some((*b, i)),
        }
    }
    if let Some((run, start)) = current {
        terms.push(package(run, start, total));
    }
    terms
        .into_iter()
        .reduce(Expr::add)
        .unwrap_or_else(|| Expr::int(0))
}

/// Checks that two static decompositions always denote equal buffers.
#[derive(Debug, Clone)]
pub struct StaticBufferEqualityChecker {
    refine_a: WriteOffsets,
    refine_b: WriteOffsets,
    a_values: BTreeSet<WriteValue>,
    b_values: BTreeSet<WriteValue>,
    a_term: Expr,
    b_term: Expr,
}

impl StaticBufferEqualityChecker {
    /// `None` when a decomposition does not cover its buffer.
    pub fn new(refine_a: WriteOffsets, refine_b: WriteOffsets) -> Option<Self> {
        let a = tagged_buffer(&refine_a)?;
        let b = tagged_buffer(&refine_b)?;
        Some(Self {
            a_values: a.iter().map(|t| t.value).collect(),
            b_values: b.iter().map(|t| t.value).collect(),
            a_term: buffer_term(Side::A, &a),
            b_term: buffer_term(Side::B, &b),
            refine_a,
            refine_b,
        })
    }

    fn bind(
        side: Side,
        inst: &InstrumentedProgram,
        ctx: &VcContext,
        values: &BTreeSet<WriteValue>,
    ) -> EngineResult<Vec<Cmd>> {
        values
            .iter()
            .map(|v| {
                let writes = inst
                    .site(v.source)
                    .and_then(|s| s.writes.as_ref())
                    .ok_or_else(|| {
                        EngineError::Instrumentation(format!(
                            "write info for {} is missing",
                            v.source
                        ))
                    })?;
                let reg = writes.registers.get(v.from_end - 1).ok_or_else(|| {
                    EngineError::Instrumentation(format!(
                        "write {} of {} is beyond the tracked history",
                        v.from_end, v.source
                    ))
                })?;
                Ok(Cmd::assign(
                    &value_var(side, v),
                    Expr::var(&reg.value.indexed(ctx.call)),
                ))
            })
            .collect()
    }

    /// Run the equality query on the original programs of `check`.
    pub fn check_static_equivalence(
        &self,
        checker: &TraceEquivalenceChecker<'_>,
        a: &Program,
        b: &Program,
        config: &EquivalenceCheckConfiguration,
    ) -> EngineResult<CheckResult> {
        let a_control = tracking_control(
            &config.a_control,
            a,
            self.a_values.iter().map(|v| v.source),
            self.refine_a.actual_source,
        );
        let b_control = tracking_control(
            &config.b_control,
            b,
            self.b_values.iter().map(|v| v.source),
            self.refine_b.actual_source,
        );
        let rule = format!("{}-static-buffer", config.rule_name);
        checker.instrument_and_check(&rule, (a, &a_control), (b, &b_control), self)
    }
}

impl VcGenerator for StaticBufferEqualityChecker {
    fn describe(&self) -> String {
        format!(
            "static buffers at {} and {}",
            self.refine_a.actual_source, self.refine_b.actual_source
        )
    }

    fn generate_vc(
        &self,
        a: &InstrumentedProgram,
        a_ctx: &VcContext,
        b: &InstrumentedProgram,
        b_ctx: &VcContext,
    ) -> EngineResult<Program> {
        let mut cmds = Self::bind(Side::A, a, a_ctx, &self.a_values)?;
        cmds.extend(Self::bind(Side::B, b, b_ctx, &self.b_values)?);
        let equal = Var::bool("sbe!eq");
        cmds.push(Cmd::assign(&equal, self.a_term.clone().eq(self.b_term.clone())));
        cmds.push(Cmd::assert(Expr::var(&equal), "buffers equal"));
        Ok(vc_program("assertion", cmds))
    }
}
