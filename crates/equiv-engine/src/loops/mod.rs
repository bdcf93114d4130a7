//! Loop summarization.
//!
//! The first loop of each program is analysed, the inputs of the two loops
//! are correlated, and a single iteration of each is proven equivalent
//! when started from correlated states. Both loops are then replaced by the
//! same uninterpreted function of their correlated inputs, writing the
//! correlated exit values. The process repeats until no further pair of
//! loops can be summarized.

pub mod condition;
pub mod config;
pub mod correlation;
pub mod exit_matcher;
pub mod iteration;

use equiv_ir::graph::{natural_loops, Dominators};
use equiv_ir::patch::Patcher;
use equiv_ir::{BlockId, Cmd, Expr, Program, ProgramValueLocation, Sort, Var};
use equiv_smt::ProgramVerifier;
use serde::Serialize;
use tracing::{debug, info, warn};

use self::config::{choose_views, extract_primary_loop, AnnotatedLoop};
use self::correlation::{correlate_exits, holder_reads, minimized_inputs, InputCorrelation, MinimizedInputs, Pairing};
use self::exit_matcher::match_exits;
use self::iteration::{extract_iteration, invariance_shape, verify_iteration, IterationBinding, IterationShape};
use crate::equivalence::EquivalenceLimits;
use crate::error::EngineResult;
use crate::instrumentation::Instrumenter;
use crate::options::deadline_exceeded;
use crate::rule_generator::Side;

pub(crate) fn loc_sort(loc: &ProgramValueLocation) -> Sort {
    match loc {
        ProgramValueLocation::MemoryCell(_) => Sort::Int,
        ProgramValueLocation::StackVar(v) => v.sort,
    }
}

/// Replace the loop at `head` by a block running `cmds`: every predecessor
/// of `head` outside the loop jumps to the new block instead.
pub fn replace_loop_in(program: &Program, head: BlockId, cmds: Vec<Cmd>) -> Program {
    let doms = Dominators::compute(program);
    let mut patcher = Patcher::new(program.clone());
    let replacement = patcher.add_block(cmds);
    patcher.reroute_predecessors(head, replacement, |pred| doms.dominates(head, pred));
    patcher.finish()
}

/// `program` restricted to paths into the loop at `keep`: every exit is
/// blocked and every other loop is cut off.
pub fn instrument_no_returns(program: &Program, keep: BlockId) -> Program {
    let mut patcher = Patcher::new(program.clone());
    for site in program.halting_sites() {
        patcher.replace_command(site, vec![Cmd::assume(Expr::ff())]);
    }
    let mut current = patcher.finish();
    for _ in 0..natural_loops(program).len() {
        let Some(other) = natural_loops(&current).into_iter().find(|l| l.head != keep) else {
            break;
        };
        current = replace_loop_in(
            &current,
            other.head,
            vec![Cmd::label("not interested in this loop"), Cmd::assume(Expr::ff())],
        );
    }
    current
}

/// `program` stopped at the entrance of `the_loop`, running `cmds` there.
pub(crate) fn truncate_at_loop(program: &Program, the_loop: &AnnotatedLoop, cmds: Vec<Cmd>) -> Program {
    let head = the_loop.source.head;
    replace_loop_in(&instrument_no_returns(program, head), head, cmds)
}

/// A loop proven equivalent to its counterpart, ready to be deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EquivalentLoop {
    pub head: BlockId,
    /// Inputs in correlation order.
    pub inputs: Vec<ProgramValueLocation>,
    /// Exit values in correlation order.
    pub outputs: Vec<ProgramValueLocation>,
    /// Written at exit but not correlated.
    pub to_havoc: Vec<ProgramValueLocation>,
    /// `(lhs, rhs)`: on exit `lhs` holds what `rhs` held at the loop entrance.
    pub aliases: Vec<(Var, Var)>,
    pub loop_succ: BlockId,
}

fn int_term(v: &Var) -> Expr {
    match v.sort {
        Sort::Bool => Expr::ite(Expr::var(v), Expr::int(1), Expr::int(0)),
        _ => Expr::var(v),
    }
}

/// Replace the loop of `eq` by the summary function `loop!summary!{index}`.
pub fn delete_loop(program: &Program, eq: &EquivalentLoop, index: usize) -> Program {
    let mut cmds = vec![Cmd::label("Start loop summarization")];
    let mut args: Vec<Expr> = Vec::new();
    for (i, loc) in eq.inputs.iter().enumerate() {
        let arg = Var::new(format!("loop!{index}!arg!{i}"), loc_sort(loc));
        cmds.push(loc.read_into(&arg));
        args.push(int_term(&arg));
    }
    for (k, loc) in eq.to_havoc.iter().enumerate() {
        let tmp = Var::new(format!("loop!{index}!havoc!{k}"), loc_sort(loc));
        cmds.push(Cmd::Havoc { lhs: tmp.clone() });
        cmds.push(loc.write(Expr::var(&tmp)));
    }
    let function = format!("loop!summary!{index}");
    for (k, loc) in eq.outputs.iter().enumerate() {
        let mut call_args = args.clone();
        call_args.push(Expr::int(k));
        let value = Expr::apply(function.clone(), call_args);
        let value = match loc_sort(loc) {
            Sort::Bool => value.ne(Expr::int(0)),
            _ => value,
        };
        cmds.push(loc.write(value));
    }
    for (lhs, rhs) in &eq.aliases {
        cmds.push(Cmd::assign(lhs, Expr::var(rhs)));
    }
    cmds.push(Cmd::label("End loop summarization"));
    cmds.push(Cmd::jump(eq.loop_succ));
    replace_loop_in(program, eq.head, cmds)
}

/// What was summarized, for reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummarizedLoop {
    pub index: usize,
    pub a_head: BlockId,
    pub b_head: BlockId,
    pub inputs: usize,
    pub outputs: usize,
}

fn live_exit_writes(program: &Program, the_loop: &AnnotatedLoop) -> Vec<ProgramValueLocation> {
    let liveness = equiv_ir::analysis::Liveness::compute(program);
    the_loop
        .config
        .writes_at_exit
        .iter()
        .filter(|loc| match loc {
            ProgramValueLocation::MemoryCell(_) => true,
            ProgramValueLocation::StackVar(v) => {
                liveness.is_live_before(the_loop.distinguished_exit, v)
                    && !the_loop.config.alias_at_exit.contains_key(v)
            }
        })
        .cloned()
        .collect()
}

fn equivalent_loop(
    the_loop: &AnnotatedLoop,
    inputs: Vec<ProgramValueLocation>,
    outputs: Vec<ProgramValueLocation>,
) -> EquivalentLoop {
    let aliases: Vec<(Var, Var)> = the_loop
        .config
        .alias_at_exit
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let to_havoc = the_loop
        .config
        .writes_at_exit
        .iter()
        .filter(|loc| !outputs.contains(loc))
        .filter(|loc| !loc.as_var().is_some_and(|v| the_loop.config.alias_at_exit.contains_key(v)))
        .cloned()
        .collect();
    EquivalentLoop {
        head: the_loop.source.head,
        inputs,
        outputs,
        to_havoc,
        aliases,
        loop_succ: the_loop.distinguished_exit,
    }
}

/// Repeatedly summarizes the first loops of two programs.
pub struct LoopSummarizer<'a> {
    verifier: &'a dyn ProgramVerifier,
    instrumenter: &'a dyn Instrumenter,
    limits: EquivalenceLimits,
    summarized: Vec<SummarizedLoop>,
}

impl<'a> LoopSummarizer<'a> {
    pub fn new(verifier: &'a dyn ProgramVerifier, instrumenter: &'a dyn Instrumenter, limits: EquivalenceLimits) -> Self {
        Self {
            verifier,
            instrumenter,
            limits,
            summarized: Vec::new(),
        }
    }

    pub fn summarized(&self) -> &[SummarizedLoop] {
        &self.summarized
    }

    /// Summarize loop pairs until one fails. Loops summarized before the
    /// failure stay deleted.
    pub fn try_summarize_loops(&mut self, a: Program, b: Program) -> EngineResult<(Program, Program)> {
        let (mut a, mut b) = (a, b);
        loop {
            if deadline_exceeded(self.limits.deadline) {
                warn!("deadline exceeded during loop summarization");
                break;
            }
            let (Some(a_options), Some(b_options)) = (extract_primary_loop(&a), extract_primary_loop(&b)) else {
                break;
            };
            let (a_loop, b_loop) = choose_views(a_options, b_options);
            let index = self.summarized.len();
            info!(index, a_head = %a_loop.source.head, b_head = %b_loop.source.head, "trying to summarize loops");
            let Some((a_eq, b_eq)) = self.prove_loops(index, (&a, &a_loop), (&b, &b_loop))? else {
                info!(index, "loop summarization failed");
                break;
            };
            self.summarized.push(SummarizedLoop {
                index,
                a_head: a_eq.head,
                b_head: b_eq.head,
                inputs: a_eq.inputs.len(),
                outputs: a_eq.outputs.len(),
            });
            a = delete_loop(&a, &a_eq, index);
            b = delete_loop(&b, &b_eq, index);
        }
        Ok((a, b))
    }

    fn prove_loops(
        &self,
        index: usize,
        (a, a_loop): (&Program, &AnnotatedLoop),
        (b, b_loop): (&Program, &AnnotatedLoop),
    ) -> EngineResult<Option<(EquivalentLoop, EquivalentLoop)>> {
        let label = format!("loop-{index}");
        let Some(inputs) = minimized_inputs(self.verifier, &label, (a, a_loop), (b, b_loop))? else {
            return Ok(None);
        };
        let mut correlation = InputCorrelation::new(
            self.verifier,
            &label,
            (a, a_loop, &inputs.a),
            (b, b_loop, &inputs.b),
        );
        while let Some(pairs) = correlation.next_pairing()? {
            if deadline_exceeded(self.limits.deadline) {
                return Ok(None);
            }
            debug!(label, ?pairs, "inputs correlated");
            if let Some(found) = self.prove_with_pairing(&label, &inputs, &pairs, (a, a_loop), (b, b_loop))? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    fn prove_with_pairing(
        &self,
        label: &str,
        inputs: &MinimizedInputs,
        pairs: &Pairing,
        (a, a_loop): (&Program, &AnnotatedLoop),
        (b, b_loop): (&Program, &AnnotatedLoop),
    ) -> EngineResult<Option<(EquivalentLoop, EquivalentLoop)>> {
        let binding = IterationBinding::new(inputs, pairs, a_loop, b_loop);
        let a_body = extract_iteration(
            a,
            a_loop,
            invariance_shape(Side::A, &binding.a.inputs),
            &format!("{label}-iteration-a"),
        );
        let b_body = extract_iteration(
            b,
            b_loop,
            invariance_shape(Side::B, &binding.b.inputs),
            &format!("{label}-iteration-b"),
        );
        let matching = match_exits(self.verifier, &binding, label, &a_body, &b_body)?;
        let proven = verify_iteration(
            self.verifier,
            self.instrumenter,
            &binding,
            (&a_body, &b_body),
            matching,
            self.limits,
        )?;
        if !proven {
            debug!(label, ?pairs, "iterations differ under this pairing");
            return Ok(None);
        }

        let a_live = live_exit_writes(a, a_loop);
        let b_live = live_exit_writes(b, b_loop);
        let (a_holders, a_reads) = holder_reads("loop!out", Side::A, &a_live);
        let (b_holders, b_reads) = holder_reads("loop!out", Side::B, &b_live);
        let exit_shape = |reads: Vec<Cmd>| IterationShape {
            on_exit: reads,
            on_backjump: vec![Cmd::assume(Expr::ff())],
            block_other_exits: true,
        };
        let a_exit = extract_iteration(a, a_loop, exit_shape(a_reads), &format!("{label}-exit-a"));
        let b_exit = extract_iteration(b, b_loop, exit_shape(b_reads), &format!("{label}-exit-b"));
        let exits = correlate_exits(
            self.verifier,
            &binding,
            label,
            (&a_exit, &a_holders),
            (&b_exit, &b_holders),
        )?;
        info!(label, outputs = exits.len(), "loop exits correlated");

        let a_outputs = exits.iter().filter_map(|(i, _)| a_live.get(*i).cloned()).collect();
        let b_outputs = exits.iter().filter_map(|(_, j)| b_live.get(*j).cloned()).collect();
        Ok(Some((
            equivalent_loop(a_loop, binding.a.inputs.clone(), a_outputs),
            equivalent_loop(b_loop, binding.b.inputs.clone(), b_outputs),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use equiv_ir::graph::is_acyclic;
    use equiv_ir::{ExitPayload, ProgramBuilder};

    /// `x := 0; while (x < n) { x += 1 }; return x`
    fn count_to_n() -> Program {
        let x = Var::int("x");
        let n = Var::int("n");
        let mut b = ProgramBuilder::new("count");
        let entry = b.new_block();
        let head = b.new_block();
        let body = b.new_block();
        let exit = b.new_block();
        b.param(n.clone());
        b.push(entry, Cmd::assign(&x, Expr::int(0)));
        b.push(entry, Cmd::jump(head));
        b.push(head, Cmd::branch(Expr::var(&x).lt(Expr::var(&n)), body, exit));
        b.push(body, Cmd::assign(&x, Expr::var(&x).add(Expr::int(1))));
        b.push(body, Cmd::jump(head));
        b.push(exit, Cmd::Return { payload: ExitPayload::Values(vec![Expr::var(&x)]) });
        b.build().expect("well formed")
    }

    #[test]
    fn deleting_a_loop_leaves_an_acyclic_program() {
        let p = count_to_n();
        let x = ProgramValueLocation::StackVar(Var::int("x"));
        let n = ProgramValueLocation::StackVar(Var::int("n"));
        let eq = EquivalentLoop {
            head: BlockId::new(1),
            inputs: vec![x.clone(), n],
            outputs: vec![x],
            to_havoc: Vec::new(),
            aliases: Vec::new(),
            loop_succ: BlockId::new(3),
        };
        let summarized = delete_loop(&p, &eq, 0);
        assert!(is_acyclic(&summarized));
        assert!(summarized.block(BlockId::new(1)).is_err());
        assert!(summarized.block(BlockId::new(3)).is_ok());
        let applies = summarized
            .commands()
            .filter(|(_, c)| c.rhs_exprs().iter().any(|e| matches!(e, Expr::Apply(f, _) if f == "loop!summary!0")))
            .count();
        assert_eq!(applies, 1);
    }

    #[test]
    fn no_return_programs_stop_at_the_loop() {
        let p = count_to_n();
        let truncated = instrument_no_returns(&p, BlockId::new(1));
        let exit = truncated.block(BlockId::new(3)).expect("exit kept");
        assert_eq!(exit.cmds.last(), Some(&Cmd::assume(Expr::ff())));
        // the kept loop is still there
        assert_eq!(natural_loops(&truncated).len(), 1);
    }

    #[test]
    fn other_loops_are_cut_off() {
        let p = count_to_n();
        let truncated = instrument_no_returns(&p, BlockId::new(0));
        assert!(natural_loops(&truncated).is_empty());
    }

    #[test]
    fn aliases_are_not_havocked() {
        let source = equiv_ir::Loop {
            head: BlockId::new(1),
            body: [BlockId::new(1), BlockId::new(2)].into(),
        };
        let y = Var::int("y");
        let w = Var::int("w");
        let config = config::LoopConfig {
            head: BlockId::new(1),
            inputs: Default::default(),
            writes_at_exit: [ProgramValueLocation::StackVar(y.clone()), ProgramValueLocation::MemoryCell(0.into())].into(),
            alias_at_exit: [(y.clone(), w.clone())].into(),
            invariant: Default::default(),
            all_writes: Default::default(),
        };
        let annotated = AnnotatedLoop {
            source,
            distinguished_exit: BlockId::new(3),
            config,
        };
        let eq = equivalent_loop(&annotated, Vec::new(), Vec::new());
        assert_eq!(eq.aliases, vec![(y, w)]);
        assert_eq!(eq.to_havoc, vec![ProgramValueLocation::MemoryCell(0.into())]);
    }
}
