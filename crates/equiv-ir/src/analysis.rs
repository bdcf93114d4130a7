//! Dataflow analyses: liveness, reaching definitions, constant definitions
//! and branch path conditions.

use std::collections::HashMap;

use indexmap::IndexSet;
use num_bigint::BigInt;

use crate::expr::{Expr, Value, Var};
use crate::graph::reverse_postorder;
use crate::program::{BlockId, Cmd, CmdPointer, Program};

/// Live variables at the start of every block.
#[derive(Debug, Clone)]
pub struct Liveness {
    live_in: HashMap<BlockId, IndexSet<Var>>,
}

impl Liveness {
    pub fn compute(program: &Program) -> Self {
        let mut order = reverse_postorder(program);
        order.reverse();
        let mut live_in: HashMap<BlockId, IndexSet<Var>> = HashMap::new();
        let mut changed = true;
        while changed {
            changed = false;
            for b in &order {
                let mut live: IndexSet<Var> = IndexSet::new();
                for succ in program.successors(*b) {
                    if let Some(s) = live_in.get(&succ) {
                        live.extend(s.iter().cloned());
                    }
                }
                if let Some(block) = program.blocks.get(b) {
                    for cmd in block.cmds.iter().rev() {
                        transfer(cmd, &mut live);
                    }
                }
                if live_in.get(b) != Some(&live) {
                    live_in.insert(*b, live);
                    changed = true;
                }
            }
        }
        Self { live_in }
    }

    pub fn is_live_before(&self, block: BlockId, var: &Var) -> bool {
        self.live_in
            .get(&block)
            .is_some_and(|vars| vars.contains(var))
    }

    pub fn live_before(&self, block: BlockId) -> IndexSet<Var> {
        self.live_in.get(&block).cloned().unwrap_or_default()
    }
}

fn transfer(cmd: &Cmd, live: &mut IndexSet<Var>) {
    for d in cmd.defs() {
        live.shift_remove(&d);
    }
    live.extend(cmd.uses());
}

/// Definition sites of `var` that may reach `at`. `None` stands for the
/// variable's initial value (no definition on some path).
pub fn reaching_defs(program: &Program, var: &Var, at: CmdPointer) -> IndexSet<Option<CmdPointer>> {
    let order = reverse_postorder(program);
    let preds = program.predecessors();
    let last_def = |b: BlockId, limit: usize| -> Option<CmdPointer> {
        let block = program.blocks.get(&b)?;
        block
            .cmds
            .iter()
            .take(limit)
            .enumerate()
            .filter(|(_, c)| c.defs().contains(var))
            .map(|(pos, _)| CmdPointer::new(b, pos))
            .last()
    };
    let mut outs: HashMap<BlockId, IndexSet<Option<CmdPointer>>> = HashMap::new();
    let block_in = |b: BlockId, outs: &HashMap<BlockId, IndexSet<Option<CmdPointer>>>| {
        let mut acc: IndexSet<Option<CmdPointer>> = IndexSet::new();
        if b == program.entry {
            acc.insert(None);
        }
        for p in preds.get(&b).into_iter().flatten() {
            if let Some(o) = outs.get(p) {
                acc.extend(o.iter().copied());
            }
        }
        acc
    };
    let mut changed = true;
    while changed {
        changed = false;
        for b in &order {
            let len = program.blocks.get(b).map_or(0, |blk| blk.cmds.len());
            let out = match last_def(*b, len) {
                Some(ptr) => IndexSet::from([Some(ptr)]),
                None => block_in(*b, &outs),
            };
            if outs.get(b) != Some(&out) {
                outs.insert(*b, out);
                changed = true;
            }
        }
    }
    match last_def(at.block, at.pos) {
        Some(ptr) => IndexSet::from([Some(ptr)]),
        None => block_in(at.block, &outs),
    }
}

/// Constant value of `var` at `at`, when every reaching definition assigns
/// the same constant (following assignment chains up to `depth` levels).
pub fn constant_value_of(program: &Program, var: &Var, at: CmdPointer, depth: usize) -> Option<BigInt> {
    if depth == 0 {
        return None;
    }
    let defs = reaching_defs(program, var, at);
    let mut value: Option<BigInt> = None;
    for def in defs {
        let ptr = def?;
        let Some(Cmd::Assign { rhs, .. }) = program.cmd(ptr) else {
            return None;
        };
        let folded = constant_value(program, rhs, ptr, depth - 1)?;
        match &value {
            Some(v) if *v != folded => return None,
            Some(_) => {}
            None => value = Some(folded),
        }
    }
    value
}

/// Constant value of `expr` evaluated at `at`.
pub fn constant_value(program: &Program, expr: &Expr, at: CmdPointer, depth: usize) -> Option<BigInt> {
    let substituted = substitute_constants(program, expr, at, depth);
    match substituted.eval_const()? {
        Value::Int(n) => Some(n),
        Value::Bool(_) => None,
    }
}

/// Replace variables of `expr` by their constant values at `at` where known.
pub fn substitute_constants(program: &Program, expr: &Expr, at: CmdPointer, depth: usize) -> Expr {
    expr.substitute(&|v: &Var| constant_value_of(program, v, at, depth).map(Expr::Int))
}

const MAX_COPY_CHAIN: usize = 8;

/// Variables that hold at `target` the value `var` has at `source`.
///
/// Follows the chain of plain copies `var := w` that uniquely define `var`
/// at `source`. A variable of the chain qualifies when the definitions
/// reaching `target` are exactly those the copy read. `var` itself is not
/// reported.
pub fn copies_at(program: &Program, target: CmdPointer, source: CmdPointer, var: &Var) -> Vec<Var> {
    let mut out = Vec::new();
    let mut current = var.clone();
    let mut at = source;
    for _ in 0..MAX_COPY_CHAIN {
        let defs = reaching_defs(program, &current, at);
        if current != *var && reaching_defs(program, &current, target) == defs {
            out.push(current.clone());
        }
        let mut it = defs.iter();
        let (Some(Some(ptr)), None) = (it.next(), it.next()) else {
            break;
        };
        let Some(Cmd::Assign {
            rhs: Expr::Var(src), ..
        }) = program.cmd(*ptr)
        else {
            break;
        };
        current = src.clone();
        at = *ptr;
    }
    out
}

/// Outgoing edge condition of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathCondition {
    /// Unconditional edge.
    True,
    /// Edge taken when the condition holds.
    Holds(Expr),
    /// Edge taken when the condition fails.
    Fails(Expr),
}

impl PathCondition {
    pub fn as_expr(&self) -> Expr {
        match self {
            PathCondition::True => Expr::tt(),
            PathCondition::Holds(c) => c.clone(),
            PathCondition::Fails(c) => c.clone().not(),
        }
    }
}

pub fn path_conditions(program: &Program, block: BlockId) -> Vec<(BlockId, PathCondition)> {
    let Some(last) = program.blocks.get(&block).and_then(|b| b.cmds.last()) else {
        return Vec::new();
    };
    match last {
        Cmd::Jump { target } => vec![(*target, PathCondition::True)],
        Cmd::Branch {
            then_block,
            else_block,
            ..
        } if then_block == else_block => vec![(*then_block, PathCondition::True)],
        Cmd::Branch {
            cond,
            then_block,
            else_block,
        } => vec![
            (*then_block, PathCondition::Holds(cond.clone())),
            (*else_block, PathCondition::Fails(cond.clone())),
        ],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{ExitPayload, ProgramBuilder};

    #[test]
    fn liveness_through_branch() {
        let x = Var::int("x");
        let y = Var::int("y");
        let mut b = ProgramBuilder::new("live");
        let entry = b.new_block();
        let use_x = b.new_block();
        let other = b.new_block();
        b.push(entry, Cmd::assign(&y, Expr::int(1)));
        b.push(entry, Cmd::branch(Expr::var(&y).lt(Expr::int(2)), use_x, other));
        b.push(
            use_x,
            Cmd::Return {
                payload: ExitPayload::Values(vec![Expr::var(&x)]),
            },
        );
        b.push(other, Cmd::Revert);
        let p = b.build().expect("well formed");
        let live = Liveness::compute(&p);
        assert!(live.is_live_before(entry, &x));
        assert!(!live.is_live_before(entry, &y));
        assert!(live.is_live_before(use_x, &x));
        assert!(!live.is_live_before(other, &x));
    }

    #[test]
    fn constant_definitions_follow_copies() {
        let a = Var::int("a");
        let c = Var::int("c");
        let mut b = ProgramBuilder::new("consts");
        let entry = b.new_block();
        let next = b.new_block();
        b.push(entry, Cmd::assign(&a, Expr::int(4)));
        b.push(entry, Cmd::assign(&c, Expr::var(&a).add(Expr::int(1))));
        b.push(entry, Cmd::jump(next));
        b.push(next, Cmd::Nop);
        let p = b.build().expect("well formed");
        let at = CmdPointer::new(next, 0);
        assert_eq!(constant_value_of(&p, &c, at, 4), Some(BigInt::from(5)));
        let defs = reaching_defs(&p, &c, at);
        assert_eq!(defs.len(), 1);
        assert!(defs.contains(&Some(CmdPointer::new(entry, 1))));
        let undefined = Var::int("u");
        assert_eq!(constant_value_of(&p, &undefined, at, 4), None);
    }

    #[test]
    fn copies_survive_until_the_source_is_redefined() {
        let x = Var::int("x");
        let y = Var::int("y");
        let mut b = ProgramBuilder::new("copies");
        let entry = b.new_block();
        let next = b.new_block();
        b.param(x.clone());
        b.push(entry, Cmd::assign(&y, Expr::var(&x)));
        b.push(entry, Cmd::jump(next));
        b.push(next, Cmd::Nop);
        b.push(next, Cmd::assign(&x, Expr::int(3)));
        b.push(next, Cmd::Nop);
        let p = b.build().expect("well formed");
        let use_site = CmdPointer::new(next, 0);
        assert_eq!(copies_at(&p, CmdPointer::new(entry, 0), use_site, &y), vec![x.clone()]);
        // after `x := 3` the copy no longer holds
        assert!(copies_at(&p, CmdPointer::new(next, 2), use_site, &y).is_empty());
    }
}
