//! One loop iteration as a standalone program, and the proof that two
//! iterations started in correlated states behave the same.

use std::collections::{BTreeSet, HashSet};

use equiv_ir::{Block, BlockId, Cmd, CmdPointer, ExitPayload, Expr, Program, ProgramValueLocation, Var};
use equiv_smt::ProgramVerifier;
use indexmap::IndexMap;
use num_bigint::BigInt;
use tracing::{debug, info};

use super::config::{AnnotatedLoop, LoopInvariant};
use super::correlation::{MinimizedInputs, Pairing};
use super::loc_sort;
use crate::checker::{CheckResult, ProgramExitTracer};
use crate::equivalence::{EquivalenceLimits, FullEquivalence, StorageDiff};
use crate::error::EngineResult;
use crate::explain::CexExplainer;
use crate::exploration::{
    EquivalenceCheckConfiguration, ExplorationManager, StandardExplorationStrategy,
};
use crate::instrumentation::{InclusionMode, Instrumenter, TraceTarget};
use crate::proof_manager::PairwiseProofManager;
use crate::refinement::TraceEvent;
use crate::rule_generator::{shared_var, CallingConvention, Side};

/// How one side's iteration starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SideBinding {
    /// Inputs in pairing order.
    pub inputs: Vec<ProgramValueLocation>,
    pub constants: Vec<(ProgramValueLocation, BigInt)>,
    pub invariant: LoopInvariant,
}

/// Starts both iterations from one shared arbitrary state: paired inputs
/// read the same prophecy variable and the loop invariant is assumed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationBinding {
    pub a: SideBinding,
    pub b: SideBinding,
}

/// Shared initial value of the `index`-th paired input.
pub fn prophecy(index: usize, loc: &ProgramValueLocation) -> Var {
    shared_var(&Var::new(format!("loop!init!{index}"), loc_sort(loc)))
}

fn indexed_location(loc: &ProgramValueLocation, call: u32) -> ProgramValueLocation {
    match loc {
        ProgramValueLocation::StackVar(v) => ProgramValueLocation::StackVar(v.indexed(call)),
        cell => cell.clone(),
    }
}

impl IterationBinding {
    pub fn new(inputs: &MinimizedInputs, pairs: &Pairing, a: &AnnotatedLoop, b: &AnnotatedLoop) -> Self {
        Self {
            a: SideBinding {
                inputs: pairs.iter().filter_map(|(i, _)| inputs.a.get(*i).cloned()).collect(),
                constants: inputs.a_consts.clone(),
                invariant: a.config.invariant.clone(),
            },
            b: SideBinding {
                inputs: pairs.iter().filter_map(|(_, j)| inputs.b.get(*j).cloned()).collect(),
                constants: inputs.b_consts.clone(),
                invariant: b.config.invariant.clone(),
            },
        }
    }

    pub fn side(&self, side: Side) -> &SideBinding {
        match side {
            Side::A => &self.a,
            Side::B => &self.b,
        }
    }
}

impl CallingConvention for IterationBinding {
    fn bind_inputs(&self, side: Side, _program: &Program) -> EngineResult<Vec<Cmd>> {
        let binding = self.side(side);
        let call = side.call();
        let mut cmds: Vec<Cmd> = binding
            .inputs
            .iter()
            .enumerate()
            .map(|(i, loc)| indexed_location(loc, call).write(Expr::var(&prophecy(i, loc))))
            .collect();
        for (loc, value) in &binding.constants {
            cmds.push(indexed_location(loc, call).write(Expr::Int(value.clone())));
        }
        cmds.push(Cmd::assume(binding.invariant.as_expr(&|v: &Var| v.indexed(call))));
        Ok(cmds)
    }
}

/// What the synthetic ends of an iteration program do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationShape {
    pub on_exit: Vec<Cmd>,
    pub on_backjump: Vec<Cmd>,
    /// Block every other way of leaving the iteration.
    pub block_other_exits: bool,
}

/// Shape used for proving iterations equal: leaving the loop returns `0`,
/// jumping back returns the post values of the paired inputs and `1`.
pub fn invariance_shape(side: Side, inputs: &[ProgramValueLocation]) -> IterationShape {
    let posts: Vec<Var> = inputs
        .iter()
        .enumerate()
        .map(|(i, loc)| Var::new(format!("loop!post!{side}!{i}"), loc_sort(loc)))
        .collect();
    let mut on_backjump = vec![Cmd::label("backjump")];
    on_backjump.extend(inputs.iter().zip(&posts).map(|(loc, post)| loc.read_into(post)));
    let mut returned: Vec<Expr> = posts.iter().map(Expr::var).collect();
    returned.push(Expr::int(1));
    on_backjump.push(Cmd::Return {
        payload: ExitPayload::Values(returned),
    });
    IterationShape {
        on_exit: vec![
            Cmd::label("loop exit"),
            Cmd::Return {
                payload: ExitPayload::Values(vec![Expr::int(0)]),
            },
        ],
        on_backjump,
        block_other_exits: false,
    }
}

/// One iteration of `the_loop` starting at its effective head. Edges back
/// to the head lead to the backjump block, the exit edge to the exit
/// block. Reverting blocks outside the loop are kept and labelled.
pub fn extract_iteration(program: &Program, the_loop: &AnnotatedLoop, shape: IterationShape, name: &str) -> Program {
    let head = the_loop.config.head;
    let exit = the_loop.distinguished_exit;
    let exit_block = program.fresh_block_id(0);
    let backjump_block = BlockId::new(exit_block.id + 1);
    let redirect = |t: BlockId| {
        if t == head {
            backjump_block
        } else if t == exit {
            exit_block
        } else {
            t
        }
    };

    let mut blocks: IndexMap<BlockId, Block> = IndexMap::new();
    let mut seen: HashSet<BlockId> = HashSet::new();
    let mut work = vec![head];
    while let Some(id) = work.pop() {
        if !seen.insert(id) {
            continue;
        }
        let Ok(block) = program.block(id) else {
            continue;
        };
        let mut cmds: Vec<Cmd> = block.cmds.iter().map(|c| c.map_targets(&redirect)).collect();
        if !the_loop.source.contains(id) {
            cmds.insert(0, Cmd::label("synthetic"));
        }
        let successors = block.successors();
        if shape.block_other_exits && successors.is_empty() {
            if matches!(cmds.last(), Some(Cmd::Return { .. } | Cmd::Revert)) {
                cmds.pop();
            }
            cmds.push(Cmd::assume(Expr::ff()));
        }
        work.extend(successors.into_iter().filter(|s| *s != head && *s != exit));
        blocks.insert(id, Block::new(id, cmds));
    }
    blocks.insert(exit_block, Block::new(exit_block, shape.on_exit));
    blocks.insert(backjump_block, Block::new(backjump_block, shape.on_backjump));
    Program {
        name: name.to_string(),
        entry: head,
        blocks,
        params: Vec::new(),
        environment: program.environment.clone(),
    }
}

/// Exit comparison following a precomputed exit matching: for every exit
/// site of A, only the matched sites of B may be taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedExitIteration {
    index: usize,
    matching: Vec<(CmdPointer, BTreeSet<CmdPointer>)>,
}

impl MatchedExitIteration {
    /// `None` when no A site has a match.
    pub fn new(matching: Vec<(CmdPointer, Vec<CmdPointer>)>) -> Option<Self> {
        let matching: Vec<(CmdPointer, BTreeSet<CmdPointer>)> = matching
            .into_iter()
            .filter(|(_, bs)| !bs.is_empty())
            .map(|(a, bs)| (a, bs.into_iter().collect()))
            .collect();
        if matching.is_empty() {
            return None;
        }
        Some(Self { index: 0, matching })
    }

    fn advance(&self) -> Option<Box<dyn ExplorationManager>> {
        (self.index + 1 < self.matching.len()).then(|| {
            Box::new(Self {
                index: self.index + 1,
                matching: self.matching.clone(),
            }) as Box<dyn ExplorationManager>
        })
    }
}

impl ExplorationManager for MatchedExitIteration {
    fn next_config(&self, p: &PairwiseProofManager) -> EquivalenceCheckConfiguration {
        let mut config = EquivalenceCheckConfiguration::standard(
            format!("matched-exit-{}", self.index),
            p,
            TraceTarget::Results,
            InclusionMode::Unified,
            Box::new(ProgramExitTracer),
            None,
        );
        if let Some((a_site, b_sites)) = self.matching.get(self.index) {
            config.a_control.mode = InclusionMode::UntilExactly([*a_site].into());
            config.b_control.mode = InclusionMode::UntilExactly(b_sites.clone());
        }
        config
    }

    fn on_success(&self, _check: &CheckResult) -> Option<Box<dyn ExplorationManager>> {
        self.advance()
    }

    fn on_timeout(&self, _check: &CheckResult) -> Option<Box<dyn ExplorationManager>> {
        None
    }
}

/// Iteration proofs only need a yes or no.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unexplained;

impl CexExplainer for Unexplained {
    type Explanation = ();

    fn explain_storage(&self, _check: &CheckResult, _diff: &StorageDiff) {}

    fn explain_trace(&self, _target: TraceTarget, _a: Option<&TraceEvent>, _b: Option<&TraceEvent>, _check: &CheckResult) {}
}

/// Prove that iterations of both loops started in the same bound state end
/// the same way. Without a matching, exits are compared site by site of A.
pub fn verify_iteration(
    verifier: &dyn ProgramVerifier,
    instrumenter: &dyn Instrumenter,
    binding: &IterationBinding,
    (a_body, b_body): (&Program, &Program),
    matching: Option<Vec<(CmdPointer, Vec<CmdPointer>)>>,
    limits: EquivalenceLimits,
) -> EngineResult<bool> {
    let manager: Box<dyn ExplorationManager> = match matching.and_then(MatchedExitIteration::new) {
        Some(matched) => Box::new(matched),
        None => Box::new(StandardExplorationStrategy::ExitSiteTracerPointerwise {
            sites: a_body.halting_sites(),
            index: 0,
        }),
    };
    debug!(?manager, a = %a_body.name, "verifying loop iteration");
    let mut equivalence = FullEquivalence::new(
        verifier,
        instrumenter,
        binding,
        a_body.clone(),
        b_body.clone(),
        Unexplained,
        limits,
    );
    let result = equivalence.equivalence_loop(manager)?;
    info!(a = %a_body.name, b = %b_body.name, result = %result.pp(), "loop iteration check");
    Ok(result.is_verified())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loops::config::extract_primary_loop;
    use equiv_ir::ProgramBuilder;

    /// `i := 0; while (i < n) { if (i == 7) revert; i += 1 }; return i`
    fn guarded() -> (Program, AnnotatedLoop) {
        let i = Var::int("i");
        let n = Var::int("n");
        let mut b = ProgramBuilder::new("guarded");
        let entry = b.new_block();
        let head = b.new_block();
        let body = b.new_block();
        let fail = b.new_block();
        let step = b.new_block();
        let exit = b.new_block();
        b.param(n.clone());
        b.push(entry, Cmd::assign(&i, Expr::int(0)));
        b.push(entry, Cmd::jump(head));
        b.push(head, Cmd::branch(Expr::var(&i).lt(Expr::var(&n)), body, exit));
        b.push(body, Cmd::branch(Expr::var(&i).eq(Expr::int(7)), fail, step));
        b.push(fail, Cmd::Revert);
        b.push(step, Cmd::assign(&i, Expr::var(&i).add(Expr::int(1))));
        b.push(step, Cmd::jump(head));
        b.push(exit, Cmd::Return { payload: ExitPayload::Values(vec![Expr::var(&i)]) });
        let p = b.build().expect("well formed");
        let options = extract_primary_loop(&p).expect("loop found");
        let annotated = AnnotatedLoop {
            source: options.source,
            distinguished_exit: options.distinguished_exit,
            config: options.main,
        };
        (p, annotated)
    }

    #[test]
    fn iteration_redirects_head_and_exit() {
        let (p, l) = guarded();
        let inputs: Vec<ProgramValueLocation> = l.config.inputs.iter().cloned().collect();
        let body = extract_iteration(&p, &l, invariance_shape(Side::A, &inputs), "iter");
        assert_eq!(body.entry, l.config.head);
        // exit, backjump and revert
        assert_eq!(body.halting_sites().len(), 3);
        let fail = body.block(BlockId::new(3)).expect("revert kept");
        assert_eq!(fail.cmds.first(), Some(&Cmd::label("synthetic")));
        assert!(body.block(BlockId::new(0)).is_err());
        assert!(body.block(BlockId::new(5)).is_err());
    }

    #[test]
    fn blocked_exits_become_assumptions() {
        let (p, l) = guarded();
        let shape = IterationShape {
            on_exit: vec![Cmd::Nop],
            on_backjump: vec![Cmd::assume(Expr::ff())],
            block_other_exits: true,
        };
        let body = extract_iteration(&p, &l, shape, "iter");
        let fail = body.block(BlockId::new(3)).expect("revert block");
        assert_eq!(fail.cmds.last(), Some(&Cmd::assume(Expr::ff())));
    }

    #[test]
    fn binding_shares_prophecies_between_sides() {
        let i = ProgramValueLocation::StackVar(Var::int("i"));
        let k = ProgramValueLocation::StackVar(Var::int("k"));
        let binding = IterationBinding {
            a: SideBinding {
                inputs: vec![i.clone()],
                ..SideBinding::default()
            },
            b: SideBinding {
                inputs: vec![k],
                constants: vec![(ProgramValueLocation::MemoryCell(BigInt::from(64)), BigInt::from(3))],
                ..SideBinding::default()
            },
        };
        let mut empty = ProgramBuilder::new("empty");
        let only = empty.new_block();
        empty.push(only, Cmd::Nop);
        let p = empty.build().expect("well formed");
        let a_cmds = binding.bind_inputs(Side::A, &p).expect("bound");
        let b_cmds = binding.bind_inputs(Side::B, &p).expect("bound");
        let shared = Expr::var(&prophecy(0, &i));
        assert_eq!(a_cmds[0], Cmd::assign(&Var::int("i").indexed(1), shared.clone()));
        assert_eq!(b_cmds[0], Cmd::assign(&Var::int("k").indexed(2), shared));
        assert_eq!(
            b_cmds[1],
            Cmd::MemStore {
                offset: Expr::int(64),
                value: Expr::int(3)
            }
        );
        assert_eq!(b_cmds.last(), Some(&Cmd::assume(Expr::tt())));
    }

    #[test]
    fn matched_exits_drop_unmatched_sites() {
        let a0 = CmdPointer::new(BlockId::new(0), 0);
        let a1 = CmdPointer::new(BlockId::new(1), 0);
        let b0 = CmdPointer::new(BlockId::new(2), 0);
        assert!(MatchedExitIteration::new(vec![(a0, vec![])]).is_none());
        let m = MatchedExitIteration::new(vec![(a0, vec![]), (a1, vec![b0])]).expect("one match");
        assert_eq!(m.matching.len(), 1);
        assert!(m.advance().is_none());
        let config = m.next_config(&PairwiseProofManager::new());
        assert_eq!(config.a_control.mode, InclusionMode::UntilExactly([a1].into()));
        assert_eq!(config.b_control.mode, InclusionMode::UntilExactly([b0].into()));
    }
}
