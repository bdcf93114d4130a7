//! Program rewriting: command replacement, block insertion, rerouting,
//! unreachable-block pruning and optimistic loop unrolling.

use std::collections::HashMap;

use crate::expr::Expr;
use crate::graph::{natural_loops, reachable};
use crate::program::{Block, BlockId, Cmd, CmdPointer, Program};

/// Batches edits against a program. Command replacements are addressed in
/// the coordinates of the original program and applied by [`Patcher::finish`].
#[derive(Debug, Clone)]
pub struct Patcher {
    program: Program,
    replacements: HashMap<CmdPointer, Vec<Cmd>>,
    next_block: u32,
}

impl Patcher {
    pub fn new(program: Program) -> Self {
        let next_block = program.fresh_block_id(0).id;
        Self {
            program,
            replacements: HashMap::new(),
            next_block,
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Replace the command at `ptr` by `cmds`. A later replacement of the
    /// same pointer wins.
    pub fn replace_command(&mut self, ptr: CmdPointer, cmds: Vec<Cmd>) {
        self.replacements.insert(ptr, cmds);
    }

    /// Replace the block's commands from `pos` (inclusive) to the end.
    pub fn truncate_from(&mut self, ptr: CmdPointer, cmds: Vec<Cmd>) {
        let len = self
            .program
            .blocks
            .get(&ptr.block)
            .map_or(0, |b| b.cmds.len());
        for pos in ptr.pos + 1..len {
            self.replacements
                .insert(CmdPointer::new(ptr.block, pos), Vec::new());
        }
        self.replacements.insert(ptr, cmds);
    }

    pub fn add_block(&mut self, cmds: Vec<Cmd>) -> BlockId {
        let id = BlockId::new(self.next_block);
        self.next_block += 1;
        self.program.blocks.insert(id, Block::new(id, cmds));
        id
    }

    pub fn set_block(&mut self, id: BlockId, cmds: Vec<Cmd>) {
        self.program.blocks.insert(id, Block::new(id, cmds));
    }

    /// Redirect every edge into `from` to `to`, except from predecessors for
    /// which `keep` holds.
    pub fn reroute_predecessors(&mut self, from: BlockId, to: BlockId, keep: impl Fn(BlockId) -> bool) {
        let ids: Vec<BlockId> = self.program.blocks.keys().copied().collect();
        for id in ids {
            if keep(id) || id == to {
                continue;
            }
            if let Some(block) = self.program.blocks.get_mut(&id) {
                if let Some(last) = block.cmds.last_mut() {
                    *last = last.map_targets(&|t| if t == from { to } else { t });
                }
            }
        }
        if self.program.entry == from {
            self.program.entry = to;
        }
    }

    /// Apply the pending replacements and drop unreachable blocks.
    pub fn finish(mut self) -> Program {
        let mut by_block: HashMap<BlockId, Vec<(usize, Vec<Cmd>)>> = HashMap::new();
        for (ptr, cmds) in self.replacements {
            by_block.entry(ptr.block).or_default().push((ptr.pos, cmds));
        }
        for (block, mut edits) in by_block {
            let Some(b) = self.program.blocks.get_mut(&block) else {
                continue;
            };
            edits.sort_by(|x, y| y.0.cmp(&x.0));
            for (pos, cmds) in edits {
                if pos < b.cmds.len() {
                    b.cmds.splice(pos..=pos, cmds);
                }
            }
        }
        prune_unreachable(self.program)
    }
}

/// Remove blocks not reachable from the entry.
pub fn prune_unreachable(mut program: Program) -> Program {
    let live = reachable(&program);
    program.blocks.retain(|id, _| live.contains(id));
    program
}

/// Optimistically unroll every natural loop `bound` times: the last copy's
/// back edges lead to `assume false`.
pub fn unroll_loops(program: &Program, bound: usize) -> Program {
    let mut current = program.clone();
    // Each pass removes one loop head's back edges; bound the passes by the
    // number of loops found up front to avoid chasing nested copies forever.
    let budget = natural_loops(program).len().saturating_mul(bound.max(1) + 1) + 1;
    for _ in 0..budget {
        let Some(l) = natural_loops(&current).into_iter().next() else {
            break;
        };
        let mut patcher = Patcher::new(current.clone());
        let dead = patcher.add_block(vec![
            Cmd::label("unrolling bound reached"),
            Cmd::assume(Expr::ff()),
        ]);
        // copies[k] maps original body blocks to the k-th copy
        let mut copies: Vec<HashMap<BlockId, BlockId>> = Vec::new();
        for _ in 0..bound {
            let map: HashMap<BlockId, BlockId> = l
                .body
                .iter()
                .map(|b| (*b, patcher.add_block(Vec::new())))
                .collect();
            copies.push(map);
        }
        let head_of = |k: usize| -> BlockId {
            copies
                .get(k)
                .and_then(|m| m.get(&l.head))
                .copied()
                .unwrap_or(dead)
        };
        // iteration 0 is the original body; its back edges go to copy 0
        for b in &l.body {
            let Some(block) = current.blocks.get(b) else {
                continue;
            };
            let cmds: Vec<Cmd> = block
                .cmds
                .iter()
                .map(|c| c.map_targets(&|t| if t == l.head { head_of(0) } else { t }))
                .collect();
            patcher.set_block(*b, cmds);
        }
        for (k, map) in copies.iter().enumerate() {
            for (orig, copy) in map {
                let Some(block) = current.blocks.get(orig) else {
                    continue;
                };
                let cmds: Vec<Cmd> = block
                    .cmds
                    .iter()
                    .map(|c| {
                        c.map_targets(&|t| {
                            if t == l.head {
                                head_of(k + 1)
                            } else if let Some(m) = map.get(&t) {
                                *m
                            } else {
                                t
                            }
                        })
                    })
                    .collect();
                patcher.set_block(*copy, cmds);
            }
        }
        current = patcher.finish();
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Var;
    use crate::graph::is_acyclic;
    use crate::program::{ExitPayload, ProgramBuilder};

    fn looping() -> Program {
        let i = Var::int("i");
        let mut b = ProgramBuilder::new("loop");
        let entry = b.new_block();
        let head = b.new_block();
        let body = b.new_block();
        let exit = b.new_block();
        b.push(entry, Cmd::assign(&i, Expr::int(0)));
        b.push(entry, Cmd::jump(head));
        b.push(head, Cmd::branch(Expr::var(&i).lt(Expr::int(3)), body, exit));
        b.push(body, Cmd::assign(&i, Expr::var(&i).add(Expr::int(1))));
        b.push(body, Cmd::jump(head));
        b.push(
            exit,
            Cmd::Return {
                payload: ExitPayload::Values(vec![Expr::var(&i)]),
            },
        );
        b.build().expect("well formed")
    }

    #[test]
    fn unrolling_removes_cycles() {
        let p = looping();
        let unrolled = unroll_loops(&p, 2);
        assert!(is_acyclic(&unrolled));
        assert!(unrolled.validate().is_ok());
        // original head/body plus two copies, plus the dead end
        assert_eq!(unrolled.blocks.len(), p.blocks.len() + 2 * 2 + 1);
    }

    #[test]
    fn replacement_and_pruning() {
        let p = looping();
        let mut patcher = Patcher::new(p.clone());
        let entry = p.entry;
        let replacement = patcher.add_block(vec![Cmd::Revert]);
        patcher.replace_command(CmdPointer::new(entry, 1), vec![Cmd::jump(replacement)]);
        let out = patcher.finish();
        assert_eq!(out.blocks.len(), 2);
        assert!(out.blocks.contains_key(&replacement));
    }
}
