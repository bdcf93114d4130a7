//! Merging two programs and a verification condition into one checkable
//! program.
//!
//! Side A is inlined with call index 1, side B with call index 2, and the VC
//! fragment runs last with its blocks tagged with call index 3. The VC
//! fragment refers to the sides' state through already indexed variables
//! (see [`crate::instrumentation::InstrumentedProgram::trace_value_at`]); its
//! own variables stay unindexed.

use std::fmt;

use equiv_ir::{Block, BlockId, Cmd, Expr, Program, Sort, Var};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineResult;

const VC_CALL: u32 = 3;
/// Call index of variables shared between the sides. Call indexing leaves
/// already indexed variables alone, so these keep one name in the rule.
pub const SHARED_CALL: u32 = 9;

pub fn shared_var(var: &Var) -> Var {
    var.with_call(SHARED_CALL)
}

/// One of the two compared programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    A,
    B,
}

impl Side {
    /// Call index the side is inlined with.
    pub fn call(self) -> u32 {
        match self {
            Side::A => 1,
            Side::B => 2,
        }
    }

    pub fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::A => write!(f, "A"),
            Side::B => write!(f, "B"),
        }
    }
}

/// How the inputs of an inlined side are bound.
pub trait CallingConvention: Send + Sync {
    /// Commands run right before `program`, already call-indexed for
    /// `side`, starts.
    fn bind_inputs(&self, side: Side, program: &Program) -> EngineResult<Vec<Cmd>>;
}

/// Shared input variable feeding positional parameter `index` of both sides.
pub fn shared_arg(index: usize, sort: Sort) -> Var {
    Var::new(format!("arg!{index}"), sort)
}

/// Positional parameters bound to shared arguments, memory zeroed.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardConvention;

impl CallingConvention for StandardConvention {
    fn bind_inputs(&self, side: Side, program: &Program) -> EngineResult<Vec<Cmd>> {
        let mut cmds = vec![Cmd::assign(
            &Var::memory().indexed(side.call()),
            Expr::const_map(Expr::int(0)),
        )];
        for (i, param) in program.params.iter().enumerate() {
            cmds.push(Cmd::assign(param, Expr::var(&shared_arg(i, param.sort))));
        }
        Ok(cmds)
    }
}

/// Positional parameters bound to shared arguments, memory left arbitrary.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreeMemoryConvention;

impl CallingConvention for FreeMemoryConvention {
    fn bind_inputs(&self, _side: Side, program: &Program) -> EngineResult<Vec<Cmd>> {
        Ok(program
            .params
            .iter()
            .enumerate()
            .map(|(i, param)| Cmd::assign(param, Expr::var(&shared_arg(i, param.sort))))
            .collect())
    }
}

impl<C: CallingConvention + ?Sized> CallingConvention for &C {
    fn bind_inputs(&self, side: Side, program: &Program) -> EngineResult<Vec<Cmd>> {
        (**self).bind_inputs(side, program)
    }
}

/// Builds rule programs under one calling convention.
#[derive(Debug, Clone, Default)]
pub struct RuleGenerator<C> {
    convention: C,
}

impl<C: CallingConvention> RuleGenerator<C> {
    pub fn new(convention: C) -> Self {
        Self { convention }
    }

    pub fn convention(&self) -> &C {
        &self.convention
    }

    /// A, then B, then `vc`. Environment and storage are shared.
    pub fn generate_rule(
        &self,
        a: &Program,
        b: &Program,
        vc: &Program,
        label: &str,
    ) -> EngineResult<Program> {
        let (vc_entry, vc_blocks) = vc_fragment(vc);
        let (b_entry, b_blocks) = self.splice(Side::B, b, vc_entry)?;
        let (a_entry, a_blocks) = self.splice(Side::A, a, b_entry)?;
        let mut blocks = a_blocks;
        blocks.extend(b_blocks);
        blocks.extend(vc_blocks);
        let environment = shared_environment([a, b]);
        finish(label, a_entry, blocks, environment)
    }

    /// Side A alone followed by `vc`.
    pub fn generate_single(&self, a: &Program, vc: &Program, label: &str) -> EngineResult<Program> {
        let (vc_entry, vc_blocks) = vc_fragment(vc);
        let (a_entry, mut blocks) = self.splice(Side::A, a, vc_entry)?;
        blocks.extend(vc_blocks);
        let environment = shared_environment([a]);
        finish(label, a_entry, blocks, environment)
    }

    fn splice(
        &self,
        side: Side,
        program: &Program,
        next: BlockId,
    ) -> EngineResult<(BlockId, IndexMap<BlockId, Block>)> {
        let call = side.call();
        let indexed = program.call_indexed(call);
        let bind = indexed.fresh_block_id(call);
        let mut cmds = vec![Cmd::assign(
            &Var::storage().indexed(call),
            Expr::var(&Var::storage()),
        )];
        for env in &indexed.environment {
            cmds.push(Cmd::assign(env, Expr::var(&Var::new(env.name.clone(), env.sort))));
        }
        cmds.extend(self.convention.bind_inputs(side, &indexed)?);
        cmds.push(Cmd::jump(indexed.entry));
        let mut blocks = IndexMap::new();
        blocks.insert(bind, Block::new(bind, cmds));
        for mut block in indexed.blocks.into_values() {
            if !block.cmds.last().is_some_and(Cmd::is_terminator) {
                block.cmds.push(Cmd::jump(next));
            }
            blocks.insert(block.id, block);
        }
        Ok((bind, blocks))
    }
}

fn vc_fragment(vc: &Program) -> (BlockId, IndexMap<BlockId, Block>) {
    let retag = |b: BlockId| b.with_call(VC_CALL);
    let blocks = vc
        .blocks
        .values()
        .map(|b| {
            let id = retag(b.id);
            let cmds = b.cmds.iter().map(|c| c.map_targets(&retag)).collect();
            (id, Block::new(id, cmds))
        })
        .collect();
    (retag(vc.entry), blocks)
}

fn shared_environment<'p>(programs: impl IntoIterator<Item = &'p Program>) -> Vec<Var> {
    let vars: IndexSet<Var> = programs
        .into_iter()
        .flat_map(|p| p.environment.iter().cloned())
        .collect();
    vars.into_iter().collect()
}

fn finish(
    label: &str,
    entry: BlockId,
    blocks: IndexMap<BlockId, Block>,
    environment: Vec<Var>,
) -> EngineResult<Program> {
    let program = Program {
        name: label.to_string(),
        entry,
        blocks,
        params: Vec::new(),
        environment,
    };
    program.validate()?;
    debug!(rule = label, blocks = program.blocks.len(), "generated rule program");
    Ok(program)
}

/// A VC fragment consisting of one block.
pub fn vc_program(name: &str, cmds: Vec<Cmd>) -> Program {
    let entry = BlockId::new(0);
    let mut blocks = IndexMap::new();
    blocks.insert(entry, Block::new(entry, cmds));
    Program {
        name: name.to_string(),
        entry,
        blocks,
        params: Vec::new(),
        environment: Vec::new(),
    }
}
