//! Correlating the state of two loops.
//!
//! Inputs are correlated at loop entry: every input of A is paired with an
//! input of B holding the same value on all executions reaching both
//! loops. Exit values are correlated after an iteration that leaves the
//! loop. Candidate pairings come from counterexample values: a failed
//! pairing's model says which slots actually agreed, and [`Pairings`]
//! enumerates the assignments consistent with those values.

use std::collections::HashSet;

use equiv_ir::{Annotation, Cmd, Expr, Program, ProgramValueLocation, Sort, Var};
use equiv_smt::{ProgramModel, ProgramVerifier, Verdict};
use num_bigint::BigInt;
use num_traits::Zero;
use tracing::{debug, info};

use super::config::AnnotatedLoop;
use super::{loc_sort, truncate_at_loop};
use crate::error::{EngineError, EngineResult};
use crate::rule_generator::{
    vc_program, CallingConvention, FreeMemoryConvention, RuleGenerator, Side, StandardConvention,
};

/// Solver queries spent on one correlation search.
const MAX_CORRELATION_ATTEMPTS: usize = 16;

/// A pairing of A slots with B slots.
pub type Pairing = Vec<(usize, usize)>;

struct Frame {
    options: Vec<Option<usize>>,
    cursor: usize,
    applied: bool,
    terminal: bool,
    yielded: bool,
}

/// Lazily enumerates assignments of A slots to distinct B slots holding the
/// same value. With `allow_skip` an A slot may stay unpaired. An assignment
/// is complete once every A slot is decided or every B slot is used.
pub struct Pairings {
    a: Vec<Option<BigInt>>,
    b: Vec<Option<BigInt>>,
    allow_skip: bool,
    assignment: Vec<Option<usize>>,
    used: Vec<bool>,
    stack: Vec<Frame>,
    started: bool,
}

impl Pairings {
    pub fn new(a: Vec<Option<BigInt>>, b: Vec<Option<BigInt>>, allow_skip: bool) -> Self {
        let used = vec![false; b.len()];
        Self {
            a,
            b,
            allow_skip,
            assignment: Vec::new(),
            used,
            stack: Vec::new(),
            started: false,
        }
    }

    fn push_frame(&mut self) {
        let ind = self.assignment.len();
        let terminal = ind == self.a.len() || self.used.iter().all(|u| *u);
        let mut options = Vec::new();
        if !terminal {
            if let Some(value) = &self.a[ind] {
                for (j, other) in self.b.iter().enumerate() {
                    if !self.used[j] && other.as_ref() == Some(value) {
                        options.push(Some(j));
                    }
                }
            }
            if self.allow_skip {
                options.push(None);
            }
        }
        self.stack.push(Frame {
            options,
            cursor: 0,
            applied: false,
            terminal,
            yielded: false,
        });
    }
}

impl Iterator for Pairings {
    type Item = Vec<Option<usize>>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            self.push_frame();
        }
        loop {
            let frame = self.stack.last_mut()?;
            if frame.terminal {
                if !frame.yielded {
                    frame.yielded = true;
                    let mut out = self.assignment.clone();
                    out.resize(self.a.len(), None);
                    return Some(out);
                }
                self.stack.pop();
                continue;
            }
            if frame.applied {
                frame.applied = false;
                if let Some(Some(j)) = self.assignment.pop() {
                    self.used[j] = false;
                }
            }
            let Some(choice) = frame.options.get(frame.cursor).copied() else {
                self.stack.pop();
                continue;
            };
            frame.cursor += 1;
            frame.applied = true;
            if let Some(j) = choice {
                self.used[j] = true;
            }
            self.assignment.push(choice);
            self.push_frame();
        }
    }
}

pub fn pairs_of(assignment: &[Option<usize>]) -> Pairing {
    assignment
        .iter()
        .enumerate()
        .filter_map(|(i, j)| j.map(|j| (i, j)))
        .collect()
}

fn identity_pairing(a: usize, b: usize) -> Pairing {
    (0..a.min(b)).map(|i| (i, i)).collect()
}

fn holder(prefix: &str, side: Side, i: usize, sort: Sort) -> Var {
    Var::new(format!("{prefix}!{side}!{i}"), sort)
}

fn holder_values(model: &ProgramModel, holders: &[Var], side: Side) -> Vec<Option<BigInt>> {
    holders
        .iter()
        .map(|h| model.int(&h.indexed(side.call())).cloned())
        .collect()
}

/// Reads of `locations` into holders, kept alive for the model.
pub fn holder_reads(prefix: &str, side: Side, locations: &[ProgramValueLocation]) -> (Vec<Var>, Vec<Cmd>) {
    let holders: Vec<Var> = locations
        .iter()
        .enumerate()
        .map(|(i, loc)| holder(prefix, side, i, loc_sort(loc)))
        .collect();
    let mut cmds: Vec<Cmd> = locations
        .iter()
        .zip(&holders)
        .map(|(loc, h)| loc.read_into(h))
        .collect();
    cmds.push(Cmd::Annotation(Annotation::KeepAlive(holders.clone())));
    (holders, cmds)
}

/// Check that every pair of holders agrees at the end of the rule.
fn check_pairs(
    verifier: &dyn ProgramVerifier,
    convention: &dyn CallingConvention,
    (a, a_holders): (&Program, &[Var]),
    (b, b_holders): (&Program, &[Var]),
    pairs: &Pairing,
    name: &str,
) -> EngineResult<Verdict> {
    let equalities = pairs
        .iter()
        .map(|(i, j)| {
            let x = a_holders.get(*i).ok_or_else(|| EngineError::Invariant(format!("no A slot {i}")))?;
            let y = b_holders.get(*j).ok_or_else(|| EngineError::Invariant(format!("no B slot {j}")))?;
            Ok(Expr::var(&x.indexed(Side::A.call())).eq(Expr::var(&y.indexed(Side::B.call()))))
        })
        .collect::<EngineResult<Vec<Expr>>>()?;
    let vc = vc_program("pairing", vec![Cmd::assert(Expr::and(equalities), "paired values agree")]);
    let rule = RuleGenerator::new(convention).generate_rule(a, b, &vc, name)?;
    let verdict = verifier.verify(&rule, name)?;
    debug!(rule = name, verdict = verdict.name(), ?pairs, "pairing check");
    Ok(verdict)
}

/// Loop inputs left after removing provably constant ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinimizedInputs {
    pub a: Vec<ProgramValueLocation>,
    pub b: Vec<ProgramValueLocation>,
    pub a_consts: Vec<(ProgramValueLocation, BigInt)>,
    pub b_consts: Vec<(ProgramValueLocation, BigInt)>,
}

/// The value `loc` always has on entry to `the_loop`: first `0` is tried,
/// then the value of a counterexample.
fn infer_always_constant(
    verifier: &dyn ProgramVerifier,
    program: &Program,
    the_loop: &AnnotatedLoop,
    loc: &ProgramValueLocation,
    name: &str,
) -> EngineResult<Option<BigInt>> {
    let value = Var::new(format!("{name}!value"), loc_sort(loc));
    if value.sort != Sort::Int {
        return Ok(None);
    }
    let mut candidate = BigInt::zero();
    for attempt in 0..2 {
        let probe = truncate_at_loop(
            program,
            the_loop,
            vec![
                loc.read_into(&value),
                Cmd::Annotation(Annotation::KeepAlive(vec![value.clone()])),
                Cmd::assert(
                    Expr::var(&value).eq(Expr::Int(candidate.clone())),
                    "loop input is constant",
                ),
            ],
        );
        let rule = RuleGenerator::new(FreeMemoryConvention).generate_single(
            &probe,
            &vc_program("done", vec![Cmd::label("done")]),
            name,
        )?;
        match verifier.verify(&rule, name)? {
            Verdict::Unsat => return Ok(Some(candidate)),
            Verdict::Sat(model) if attempt == 0 => {
                match model.int(&value.indexed(Side::A.call())) {
                    Some(witness) => candidate = witness.clone(),
                    None => return Ok(None),
                }
            }
            _ => return Ok(None),
        }
    }
    Ok(None)
}

fn infer_constants(
    verifier: &dyn ProgramVerifier,
    label: &str,
    side: Side,
    program: &Program,
    the_loop: &AnnotatedLoop,
) -> EngineResult<Vec<(ProgramValueLocation, BigInt)>> {
    let candidates: Vec<(usize, &ProgramValueLocation)> = the_loop
        .config
        .inputs
        .iter()
        .enumerate()
        .filter(|(_, loc)| !the_loop.config.all_writes.contains(*loc))
        .collect();
    let found = std::thread::scope(|s| {
        let handles: Vec<_> = candidates
            .iter()
            .map(|(i, loc)| {
                let name = format!("{label}-const-{side}-{i}");
                s.spawn(move || infer_always_constant(verifier, program, the_loop, loc, &name))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .map_err(|_| EngineError::Invariant("constant inference panicked".to_string()))?
            })
            .collect::<EngineResult<Vec<Option<BigInt>>>>()
    })?;
    Ok(candidates
        .into_iter()
        .zip(found)
        .filter_map(|((_, loc), c)| c.map(|c| (loc.clone(), c)))
        .collect())
}

/// Equalize the input counts of both loops by dropping constant inputs of
/// the larger one. `None` when the counts still differ.
pub fn minimized_inputs(
    verifier: &dyn ProgramVerifier,
    label: &str,
    (a, a_loop): (&Program, &AnnotatedLoop),
    (b, b_loop): (&Program, &AnnotatedLoop),
) -> EngineResult<Option<MinimizedInputs>> {
    let a_inputs: Vec<ProgramValueLocation> = a_loop.config.inputs.iter().cloned().collect();
    let b_inputs: Vec<ProgramValueLocation> = b_loop.config.inputs.iter().cloned().collect();
    if a_inputs.len() == b_inputs.len() {
        return Ok(Some(MinimizedInputs {
            a: a_inputs,
            b: b_inputs,
            a_consts: Vec::new(),
            b_consts: Vec::new(),
        }));
    }
    let drop_consts = |inputs: Vec<ProgramValueLocation>, consts: &[(ProgramValueLocation, BigInt)]| {
        inputs
            .into_iter()
            .filter(|loc| !consts.iter().any(|(c, _)| c == loc))
            .collect::<Vec<_>>()
    };
    let result = if a_inputs.len() > b_inputs.len() {
        let a_consts = infer_constants(verifier, label, Side::A, a, a_loop)?;
        MinimizedInputs {
            a: drop_consts(a_inputs, &a_consts),
            b: b_inputs,
            a_consts,
            b_consts: Vec::new(),
        }
    } else {
        let b_consts = infer_constants(verifier, label, Side::B, b, b_loop)?;
        MinimizedInputs {
            a: a_inputs,
            b: drop_consts(b_inputs, &b_consts),
            a_consts: Vec::new(),
            b_consts,
        }
    };
    if result.a.len() != result.b.len() {
        info!(
            a = result.a.len(),
            b = result.b.len(),
            "loop input counts differ after removing constants"
        );
        return Ok(None);
    }
    Ok(Some(result))
}

/// Lazy search for input pairings that hold at loop entry.
pub struct InputCorrelation<'q> {
    verifier: &'q dyn ProgramVerifier,
    label: String,
    a_probe: Program,
    b_probe: Program,
    a_holders: Vec<Var>,
    b_holders: Vec<Var>,
    initial: Option<Pairing>,
    pending: Vec<Pairings>,
    tried: HashSet<Pairing>,
    attempts: usize,
}

impl<'q> InputCorrelation<'q> {
    pub fn new(
        verifier: &'q dyn ProgramVerifier,
        label: &str,
        (a, a_loop, a_inputs): (&Program, &AnnotatedLoop, &[ProgramValueLocation]),
        (b, b_loop, b_inputs): (&Program, &AnnotatedLoop, &[ProgramValueLocation]),
    ) -> Self {
        let (a_holders, a_reads) = holder_reads("loop!in", Side::A, a_inputs);
        let (b_holders, b_reads) = holder_reads("loop!in", Side::B, b_inputs);
        Self {
            verifier,
            label: label.to_string(),
            a_probe: truncate_at_loop(a, a_loop, a_reads),
            b_probe: truncate_at_loop(b, b_loop, b_reads),
            initial: Some(identity_pairing(a_holders.len(), b_holders.len())),
            a_holders,
            b_holders,
            pending: Vec::new(),
            tried: HashSet::new(),
            attempts: 0,
        }
    }

    fn sorts_agree(&self, pairs: &Pairing) -> bool {
        pairs.iter().all(|(i, j)| {
            matches!((self.a_holders.get(*i), self.b_holders.get(*j)), (Some(x), Some(y)) if x.sort == y.sort)
        })
    }

    /// The next pairing proven to hold whenever both loops are reached.
    pub fn next_pairing(&mut self) -> EngineResult<Option<Pairing>> {
        loop {
            let candidate = match self.initial.take() {
                Some(c) => c,
                None => {
                    let Some(top) = self.pending.last_mut() else {
                        return Ok(None);
                    };
                    match top.next() {
                        Some(assignment) => pairs_of(&assignment),
                        None => {
                            self.pending.pop();
                            continue;
                        }
                    }
                }
            };
            if candidate.len() != self.a_holders.len()
                || !self.sorts_agree(&candidate)
                || !self.tried.insert(candidate.clone())
            {
                continue;
            }
            if self.attempts >= MAX_CORRELATION_ATTEMPTS {
                info!(label = %self.label, "giving up on input correlation");
                return Ok(None);
            }
            self.attempts += 1;
            let name = format!("{}-inputs-{}", self.label, self.attempts);
            let verdict = check_pairs(
                self.verifier,
                &StandardConvention,
                (&self.a_probe, &self.a_holders),
                (&self.b_probe, &self.b_holders),
                &candidate,
                &name,
            )?;
            match verdict {
                Verdict::Unsat => return Ok(Some(candidate)),
                Verdict::Sat(model) => {
                    let a_vals = holder_values(&model, &self.a_holders, Side::A);
                    let b_vals = holder_values(&model, &self.b_holders, Side::B);
                    self.pending.push(Pairings::new(a_vals, b_vals, false));
                }
                other => debug!(rule = %name, verdict = other.name(), "pairing inconclusive"),
            }
        }
    }
}

/// Pair the exit values read into `a_holders`/`b_holders` by the two
/// iteration programs. Best effort: unpaired values are simply left out.
pub fn correlate_exits(
    verifier: &dyn ProgramVerifier,
    convention: &dyn CallingConvention,
    label: &str,
    (a, a_holders): (&Program, &[Var]),
    (b, b_holders): (&Program, &[Var]),
) -> EngineResult<Pairing> {
    let mut candidate = identity_pairing(a_holders.len(), b_holders.len());
    let mut tried: HashSet<Pairing> = HashSet::new();
    for attempt in 0..MAX_CORRELATION_ATTEMPTS {
        let sorted = candidate.iter().all(|(i, j)| {
            matches!((a_holders.get(*i), b_holders.get(*j)), (Some(x), Some(y)) if x.sort == y.sort)
        });
        tried.insert(candidate.clone());
        let name = format!("{label}-exits-{attempt}");
        let verdict = if sorted {
            check_pairs(verifier, convention, (a, a_holders), (b, b_holders), &candidate, &name)?
        } else {
            Verdict::Unknown("differently sorted pair".to_string())
        };
        match verdict {
            Verdict::Unsat => return Ok(candidate),
            Verdict::Sat(model) => {
                let a_vals = holder_values(&model, a_holders, Side::A);
                let b_vals = holder_values(&model, b_holders, Side::B);
                let next = Pairings::new(a_vals, b_vals, true)
                    .map(|p| pairs_of(&p))
                    .find(|p| !tried.contains(p));
                match next {
                    Some(p) => candidate = p,
                    None => return Ok(Vec::new()),
                }
            }
            _ => return Ok(Vec::new()),
        }
    }
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vals(v: &[Option<i64>]) -> Vec<Option<BigInt>> {
        v.iter().map(|x| x.map(BigInt::from)).collect()
    }

    #[test]
    fn only_value_equal_slots_are_paired() {
        let all: Vec<Pairing> = Pairings::new(vals(&[Some(1), Some(2)]), vals(&[Some(2), Some(1)]), false)
            .map(|p| pairs_of(&p))
            .collect();
        assert_eq!(all, vec![vec![(0, 1), (1, 0)]]);
    }

    #[test]
    fn duplicate_values_give_every_permutation() {
        let all: Vec<Pairing> = Pairings::new(vals(&[Some(0), Some(0)]), vals(&[Some(0), Some(0)]), false)
            .map(|p| pairs_of(&p))
            .collect();
        assert_eq!(all, vec![vec![(0, 0), (1, 1)], vec![(0, 1), (1, 0)]]);
    }

    #[test]
    fn unmatched_slots_need_skipping() {
        let strict: Vec<_> = Pairings::new(vals(&[Some(5), Some(1)]), vals(&[Some(1)]), false).collect();
        assert!(strict.is_empty());
        let lenient: Vec<Pairing> = Pairings::new(vals(&[Some(5), Some(1)]), vals(&[Some(1)]), true)
            .map(|p| pairs_of(&p))
            .collect();
        assert_eq!(lenient.first(), Some(&vec![(1, 0)]));
    }

    #[test]
    fn enumeration_is_lazy_and_stops_when_b_is_used_up() {
        let mut it = Pairings::new(vals(&[Some(7), Some(7), Some(7)]), vals(&[Some(7)]), true);
        assert_eq!(it.next(), Some(vec![Some(0), None, None]));
        // the remaining candidates are produced on demand
        assert_eq!(it.next(), Some(vec![None, Some(0), None]));
        assert_eq!(it.by_ref().count(), 2);
        assert_eq!(it.next(), None);
    }

    #[test]
    fn missing_values_never_pair() {
        let all: Vec<_> = Pairings::new(vals(&[None]), vals(&[None]), false).collect();
        assert!(all.is_empty());
    }
}
