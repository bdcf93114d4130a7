//! Symbolic effect of one loop iteration.
//!
//! Starting at the effective head with every variable denoting its value at
//! the start of the iteration (the `!pre` copy of the variable), the
//! analysis runs forward through the body and records, at every edge back
//! to the head, the value of each assigned variable and the conditions that
//! held along the way. States of different back edges are merged: path
//! conditions are intersected and disagreeing values become unconstrained.

use std::collections::VecDeque;

use equiv_ir::analysis::{path_conditions, PathCondition};
use equiv_ir::{BlockId, Cmd, Expr, Loop, Program, Var};
use indexmap::{IndexMap, IndexSet};

/// Upper bound on block visits, far above what a non-nested loop needs.
const MAX_VISITS: usize = 10_000;

/// Value of a variable after one iteration. `None` is unconstrained.
pub type SymbolicState = IndexMap<Var, Option<Expr>>;

/// What holds at a back edge: `pc` is a set of conditions that all held
/// on the way, `state` the symbolic post-iteration values.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateAndPc {
    pub pc: IndexSet<Expr>,
    pub state: SymbolicState,
}

impl StateAndPc {
    fn merge(&self, other: &StateAndPc) -> StateAndPc {
        let pc = self
            .pc
            .iter()
            .filter(|c| other.pc.contains(*c))
            .cloned()
            .collect();
        let mut state = SymbolicState::new();
        for k in self.state.keys().chain(other.state.keys()) {
            let merged = match (self.state.get(k), other.state.get(k)) {
                (Some(Some(x)), Some(Some(y))) if x == y => Some(x.clone()),
                _ => None,
            };
            state.insert(k.clone(), merged);
        }
        StateAndPc { pc, state }
    }
}

/// The value of `v` at the start of the iteration.
pub fn pre_var(v: &Var) -> Var {
    Var {
        name: format!("{}!pre", v.name),
        ..v.clone()
    }
}

/// `e` over `!pre` variables, or `None` when it mentions an unconstrained value.
fn interp(e: &Expr, st: &SymbolicState) -> Option<Expr> {
    if e
        .free_vars()
        .iter()
        .any(|v| matches!(st.get(v), Some(None)))
    {
        return None;
    }
    Some(e.substitute(&|v: &Var| match st.get(v) {
        Some(Some(value)) => Some(value.clone()),
        _ => Some(Expr::var(&pre_var(v))),
    }))
}

fn step_block(program: &Program, block: BlockId, start: &StateAndPc) -> StateAndPc {
    let mut cur = start.clone();
    let Some(b) = program.blocks.get(&block) else {
        return cur;
    };
    for cmd in &b.cmds {
        match cmd {
            Cmd::Assign { lhs, rhs } => {
                let value = interp(rhs, &cur.state);
                cur.state.insert(lhs.clone(), value);
            }
            Cmd::Assume { cond } | Cmd::Assert { cond, .. } => {
                if let Some(c) = interp(cond, &cur.state) {
                    cur.pc.insert(c);
                }
            }
            other => {
                if let Some(lhs) = other.lhs() {
                    cur.state.insert(lhs.clone(), None);
                }
            }
        }
    }
    cur
}

/// Infer the effect of one iteration of `the_loop` entered at `head`.
///
/// The result only mentions variables whose post value is constrained, and
/// is `None` when no path condition survives.
pub fn analyze_loop(program: &Program, the_loop: &Loop, head: BlockId) -> Option<StateAndPc> {
    let mut pre_states: IndexMap<BlockId, StateAndPc> = IndexMap::new();
    pre_states.insert(head, StateAndPc::default());
    let mut back_edges: Vec<StateAndPc> = Vec::new();
    let mut work: VecDeque<BlockId> = VecDeque::from([head]);
    let mut visits = 0;
    while let Some(block) = work.pop_front() {
        visits += 1;
        if visits > MAX_VISITS {
            return None;
        }
        let start = pre_states.get(&block).cloned().unwrap_or_default();
        let end = step_block(program, block, &start);
        for (next, cond) in path_conditions(program, block) {
            if !the_loop.contains(next) {
                continue;
            }
            let mut out = end.clone();
            let edge = match &cond {
                PathCondition::True => None,
                PathCondition::Holds(c) => interp(c, &end.state),
                PathCondition::Fails(c) => interp(c, &end.state).map(Expr::not),
            };
            if let Some(c) = edge {
                out.pc.insert(c);
            }
            if next == head {
                back_edges.push(out);
                continue;
            }
            match pre_states.get(&next) {
                None => {
                    pre_states.insert(next, out);
                    work.push_back(next);
                }
                Some(current) => {
                    let merged = current.merge(&out);
                    if merged != *current {
                        pre_states.insert(next, merged);
                        if !work.contains(&next) {
                            work.push_back(next);
                        }
                    }
                }
            }
        }
    }
    let joined = back_edges.into_iter().reduce(|x, y| x.merge(&y))?;
    if joined.pc.is_empty() {
        return None;
    }
    let state = joined
        .state
        .into_iter()
        .filter(|(_, v)| v.is_some())
        .collect();
    Some(StateAndPc {
        pc: joined.pc,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use equiv_ir::graph::natural_loops;
    use equiv_ir::{ExitPayload, ProgramBuilder};

    /// `while (i < 10) { i += 1; j := havoc }`
    fn counting() -> Program {
        let i = Var::int("i");
        let j = Var::int("j");
        let mut b = ProgramBuilder::new("count");
        let entry = b.new_block();
        let head = b.new_block();
        let body = b.new_block();
        let exit = b.new_block();
        b.push(entry, Cmd::assign(&i, Expr::int(0)));
        b.push(entry, Cmd::jump(head));
        b.push(head, Cmd::branch(Expr::var(&i).lt(Expr::int(10)), body, exit));
        b.push(body, Cmd::assign(&i, Expr::var(&i).add(Expr::int(1))));
        b.push(body, Cmd::Havoc { lhs: j.clone() });
        b.push(body, Cmd::jump(head));
        b.push(exit, Cmd::Return { payload: ExitPayload::Values(vec![Expr::var(&i)]) });
        b.build().expect("well formed")
    }

    #[test]
    fn increments_are_expressed_over_pre_values() {
        let p = counting();
        let l = natural_loops(&p).remove(0);
        let st = analyze_loop(&p, &l, l.head).expect("condition survives");
        let i = Var::int("i");
        assert_eq!(
            st.state.get(&i),
            Some(&Some(Expr::var(&pre_var(&i)).add(Expr::int(1))))
        );
        assert!(st.state.get(&Var::int("j")).is_none());
        assert!(st.pc.contains(&Expr::var(&pre_var(&i)).lt(Expr::int(10))));
    }

    #[test]
    fn merging_drops_disagreements() {
        let x = Var::int("x");
        let mut a = StateAndPc::default();
        a.state.insert(x.clone(), Some(Expr::int(1)));
        a.pc.insert(Expr::tt());
        let mut b = StateAndPc::default();
        b.state.insert(x.clone(), Some(Expr::int(2)));
        let merged = a.merge(&b);
        assert_eq!(merged.state.get(&x), Some(&None));
        assert!(merged.pc.is_empty());
    }
}
