//! Control-flow graph analyses over [`Program`]s.

use std::collections::{BTreeSet, HashMap, HashSet};

use indexmap::{IndexMap, IndexSet};

use crate::error::IrError;
use crate::location::Loop;
use crate::program::{BlockId, Cmd, Program};

/// Blocks reachable from the entry, in depth-first preorder.
pub fn reachable(program: &Program) -> IndexSet<BlockId> {
    let mut seen = IndexSet::new();
    let mut stack = vec![program.entry];
    while let Some(b) = stack.pop() {
        if !program.blocks.contains_key(&b) || !seen.insert(b) {
            continue;
        }
        for succ in program.successors(b).into_iter().rev() {
            if !seen.contains(&succ) {
                stack.push(succ);
            }
        }
    }
    seen
}

/// Reverse postorder of the reachable blocks.
pub fn reverse_postorder(program: &Program) -> Vec<BlockId> {
    let mut visited = HashSet::new();
    let mut post = Vec::new();
    // (block, next successor index)
    let mut stack: Vec<(BlockId, usize)> = vec![(program.entry, 0)];
    visited.insert(program.entry);
    while let Some((block, idx)) = stack.pop() {
        let succs = program.successors(block);
        if idx < succs.len() {
            stack.push((block, idx + 1));
            let next = succs[idx];
            if program.blocks.contains_key(&next) && visited.insert(next) {
                stack.push((next, 0));
            }
        } else {
            post.push(block);
        }
    }
    post.reverse();
    post
}

/// Topological order of the reachable blocks; fails on cycles.
pub fn topological_order(program: &Program) -> Result<Vec<BlockId>, IrError> {
    let live = reachable(program);
    let mut indegree: HashMap<BlockId, usize> = live.iter().map(|b| (*b, 0)).collect();
    for b in &live {
        for succ in program.successors(*b) {
            if let Some(d) = indegree.get_mut(&succ) {
                *d += 1;
            }
        }
    }
    let mut ready: Vec<BlockId> = live
        .iter()
        .filter(|b| indegree.get(b) == Some(&0))
        .copied()
        .collect();
    ready.reverse();
    let mut order = Vec::with_capacity(live.len());
    while let Some(b) = ready.pop() {
        order.push(b);
        for succ in program.successors(b).into_iter().rev() {
            if let Some(d) = indegree.get_mut(&succ) {
                *d -= 1;
                if *d == 0 {
                    ready.push(succ);
                }
            }
        }
    }
    if order.len() != live.len() {
        return Err(IrError::Cyclic(program.name.clone()));
    }
    Ok(order)
}

pub fn is_acyclic(program: &Program) -> bool {
    topological_order(program).is_ok()
}

/// Strongly connected components of the reachable graph, ordered so that a
/// component comes before every component it can reach.
pub fn strongly_connected_components(program: &Program) -> Vec<Vec<BlockId>> {
    struct Tarjan<'a> {
        program: &'a Program,
        index: HashMap<BlockId, usize>,
        low: HashMap<BlockId, usize>,
        on_stack: HashSet<BlockId>,
        stack: Vec<BlockId>,
        next: usize,
        out: Vec<Vec<BlockId>>,
    }

    impl Tarjan<'_> {
        fn visit(&mut self, v: BlockId) {
            self.index.insert(v, self.next);
            self.low.insert(v, self.next);
            self.next += 1;
            self.stack.push(v);
            self.on_stack.insert(v);
            for w in self.program.successors(v) {
                if !self.program.blocks.contains_key(&w) {
                    continue;
                }
                if !self.index.contains_key(&w) {
                    self.visit(w);
                    let lw = self.low[&w];
                    let lv = self.low[&v];
                    self.low.insert(v, lv.min(lw));
                } else if self.on_stack.contains(&w) {
                    let iw = self.index[&w];
                    let lv = self.low[&v];
                    self.low.insert(v, lv.min(iw));
                }
            }
            if self.low[&v] == self.index[&v] {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack.remove(&w);
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                component.reverse();
                self.out.push(component);
            }
        }
    }

    let mut t = Tarjan {
        program,
        index: HashMap::new(),
        low: HashMap::new(),
        on_stack: HashSet::new(),
        stack: Vec::new(),
        next: 0,
        out: Vec::new(),
    };
    if program.blocks.contains_key(&program.entry) {
        t.visit(program.entry);
    }
    // Tarjan emits sinks first.
    t.out.reverse();
    t.out
}

/// Dominator sets of the reachable blocks.
#[derive(Debug, Clone)]
pub struct Dominators {
    doms: HashMap<BlockId, HashSet<BlockId>>,
}

impl Dominators {
    pub fn compute(program: &Program) -> Self {
        let order = reverse_postorder(program);
        let all: HashSet<BlockId> = order.iter().copied().collect();
        let preds = program.predecessors();
        let mut doms: HashMap<BlockId, HashSet<BlockId>> = order
            .iter()
            .map(|b| {
                if *b == program.entry {
                    (*b, HashSet::from([*b]))
                } else {
                    (*b, all.clone())
                }
            })
            .collect();
        let mut changed = true;
        while changed {
            changed = false;
            for b in order.iter().filter(|b| **b != program.entry) {
                let mut new: Option<HashSet<BlockId>> = None;
                for p in preds.get(b).into_iter().flatten() {
                    let Some(pd) = doms.get(p) else {
                        continue;
                    };
                    new = Some(match new {
                        None => pd.clone(),
                        Some(acc) => acc.intersection(pd).copied().collect(),
                    });
                }
                let mut new = new.unwrap_or_default();
                new.insert(*b);
                if doms.get(b) != Some(&new) {
                    doms.insert(*b, new);
                    changed = true;
                }
            }
        }
        Self { doms }
    }

    /// Does `a` dominate `b`? Unreachable blocks are dominated by nothing.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.doms.get(&b).is_some_and(|d| d.contains(&a))
    }
}

/// Natural loops of the program, one per head (bodies of back edges sharing a
/// head are merged), in reverse postorder of their heads.
pub fn natural_loops(program: &Program) -> Vec<Loop> {
    let doms = Dominators::compute(program);
    let preds = program.predecessors();
    let order = reverse_postorder(program);
    let mut loops: IndexMap<BlockId, BTreeSet<BlockId>> = IndexMap::new();
    for tail in &order {
        for head in program.successors(*tail) {
            if !doms.dominates(head, *tail) {
                continue;
            }
            let body = loops.entry(head).or_default();
            body.insert(head);
            let mut work = vec![*tail];
            while let Some(b) = work.pop() {
                if !body.insert(b) {
                    continue;
                }
                for p in preds.get(&b).into_iter().flatten() {
                    if !body.contains(p) {
                        work.push(*p);
                    }
                }
            }
        }
    }
    let rank: HashMap<BlockId, usize> = order.iter().enumerate().map(|(i, b)| (*b, i)).collect();
    let mut out: Vec<Loop> = loops
        .into_iter()
        .map(|(head, body)| Loop { head, body })
        .collect();
    out.sort_by_key(|l| rank.get(&l.head).copied().unwrap_or(usize::MAX));
    out
}

/// Blocks from which every path ends in a `Revert`.
pub fn reverting_blocks(program: &Program) -> HashSet<BlockId> {
    let mut out: HashSet<BlockId> = program
        .blocks
        .values()
        .filter(|b| b.successors().is_empty() && matches!(b.cmds.last(), Some(Cmd::Revert)))
        .map(|b| b.id)
        .collect();
    let mut changed = true;
    while changed {
        changed = false;
        for block in program.blocks.values() {
            if out.contains(&block.id) {
                continue;
            }
            let succs = block.successors();
            if !succs.is_empty() && succs.iter().all(|s| out.contains(s)) {
                out.insert(block.id);
                changed = true;
            }
        }
    }
    out
}
