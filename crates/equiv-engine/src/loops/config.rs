//! Static description of a loop: its inputs, its writes and an invariant
//! candidate, plus the rotation check for `while` loops whose condition
//! holds on entry.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use equiv_ir::analysis::{
    constant_value, copies_at, path_conditions, reaching_defs, Liveness, PathCondition,
};
use equiv_ir::graph::natural_loops;
use equiv_ir::graph::{reverting_blocks, strongly_connected_components};
use equiv_ir::{BlockId, Cmd, CmdPointer, Expr, Loop, Program, ProgramValueLocation, Value, Var};
use indexmap::IndexSet;
use num_bigint::BigInt;
use tracing::debug;

use super::condition::analyze_loop;

const CONSTANT_DEPTH: usize = 4;

/// Candidate inductive invariant, assumed at the start of an iteration as
/// `initial ∨ (pc ∧ state)`. The empty invariant is `true`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoopInvariant {
    pub inductive_pc: Vec<Expr>,
    pub initial: BTreeMap<Var, BigInt>,
    pub inductive_state: BTreeMap<Var, Expr>,
}

impl LoopInvariant {
    pub fn is_trivial(&self) -> bool {
        self.inductive_pc.is_empty() && self.initial.is_empty() && self.inductive_state.is_empty()
    }

    /// The invariant over variables renamed by `rename`.
    pub fn as_expr(&self, rename: &impl Fn(&Var) -> Var) -> Expr {
        if self.is_trivial() {
            return Expr::tt();
        }
        let initial = Expr::and(
            self.initial
                .iter()
                .map(|(v, c)| Expr::var(&rename(v)).eq(Expr::Int(c.clone())))
                .collect(),
        );
        let mut inductive: Vec<Expr> = self.inductive_pc.iter().map(|e| e.map_vars(rename)).collect();
        inductive.extend(
            self.inductive_state
                .iter()
                .map(|(v, e)| Expr::var(&rename(v)).eq(e.map_vars(rename))),
        );
        Expr::or(vec![initial, Expr::and(inductive)])
    }
}

/// One view of a loop, entered at `head`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// The effective head: the loop head, or its in-body successor for a
    /// rotated loop.
    pub head: BlockId,
    /// Locations read before being written in an iteration, in program order.
    pub inputs: IndexSet<ProgramValueLocation>,
    /// Locations possibly written when the loop exits, live ones only for
    /// variables.
    pub writes_at_exit: BTreeSet<ProgramValueLocation>,
    /// Variables written by the loop whose exit value is a copy of a
    /// variable at the loop entrance.
    pub alias_at_exit: BTreeMap<Var, Var>,
    pub invariant: LoopInvariant,
    pub all_writes: BTreeSet<ProgramValueLocation>,
}

/// The first loop of a program with its main and, when rotation gives a
/// different config, alternative views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfigOptions {
    pub source: Loop,
    pub distinguished_exit: BlockId,
    pub main: LoopConfig,
    pub alternative: Option<LoopConfig>,
}

/// A loop with the view chosen for the comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedLoop {
    pub source: Loop,
    pub distinguished_exit: BlockId,
    pub config: LoopConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ReadWriteState {
    must_cells: BTreeSet<BigInt>,
    must_vars: BTreeSet<Var>,
}

impl ReadWriteState {
    fn join(&self, other: &ReadWriteState) -> ReadWriteState {
        ReadWriteState {
            must_cells: self.must_cells.intersection(&other.must_cells).cloned().collect(),
            must_vars: self.must_vars.intersection(&other.must_vars).cloned().collect(),
        }
    }

    fn write_var(&mut self, v: &Var) {
        self.must_vars.insert(v.clone());
    }
}

/// Blocks of `the_loop` reachable from `head` without re-entering it, each
/// after all of its predecessors in that region.
fn iteration_order(program: &Program, the_loop: &Loop, head: BlockId) -> Vec<BlockId> {
    let mut post = Vec::new();
    let mut seen = BTreeSet::from([head]);
    let mut stack: Vec<(BlockId, usize)> = vec![(head, 0)];
    while let Some((block, idx)) = stack.pop() {
        let succs: Vec<BlockId> = program
            .successors(block)
            .into_iter()
            .filter(|s| *s != head && the_loop.contains(*s))
            .collect();
        if idx < succs.len() {
            stack.push((block, idx + 1));
            let next = succs[idx];
            if seen.insert(next) {
                stack.push((next, 0));
            }
        } else {
            post.push(block);
        }
    }
    post.reverse();
    post
}

fn first_ptr(block: BlockId) -> CmdPointer {
    CmdPointer::new(block, 0)
}

/// The constant `v` holds at `at` when its only definition outside the
/// loop assigns a constant and no path leaves it undefined.
pub fn constant_def_before_loop(program: &Program, v: &Var, at: CmdPointer, the_loop: &Loop) -> Option<BigInt> {
    let defs = reaching_defs(program, v, at);
    if defs.contains(&None) {
        return None;
    }
    let mut outside = defs.iter().flatten().filter(|d| !the_loop.contains(d.block));
    let (Some(def), None) = (outside.next(), outside.next()) else {
        return None;
    };
    match program.cmd(*def)? {
        Cmd::Assign { rhs, .. } => constant_value(program, rhs, *def, CONSTANT_DEPTH),
        _ => None,
    }
}

/// Gather inputs and writes of `the_loop` entered at `head`. `None` when the
/// body touches memory at a non-constant offset, copies memory, emits
/// events or accesses storage.
pub fn extract_loop_config(
    program: &Program,
    the_loop: &Loop,
    head: BlockId,
    distinguished_exit: BlockId,
) -> Option<LoopConfig> {
    let liveness = Liveness::compute(program);
    let mut inputs: IndexSet<ProgramValueLocation> = IndexSet::new();
    let mut all_writes: BTreeSet<ProgramValueLocation> = BTreeSet::new();
    let mut states: HashMap<BlockId, ReadWriteState> = HashMap::new();

    for block in iteration_order(program, the_loop, head) {
        let mut st = states.remove(&block).unwrap_or_default();
        let b = program.block(block).ok()?;
        for cmd in &b.cmds {
            match cmd {
                Cmd::MemStore { offset, value } => {
                    let cell = offset.as_int()?.clone();
                    for v in value.free_vars() {
                        if !st.must_vars.contains(&v) {
                            inputs.insert(ProgramValueLocation::StackVar(v));
                        }
                    }
                    st.must_cells.insert(cell.clone());
                    all_writes.insert(ProgramValueLocation::MemoryCell(cell));
                }
                Cmd::MemLoad { lhs, offset } => {
                    let cell = offset.as_int()?.clone();
                    if !st.must_cells.contains(&cell) {
                        inputs.insert(ProgramValueLocation::MemoryCell(cell));
                    }
                    st.write_var(lhs);
                    all_writes.insert(ProgramValueLocation::StackVar(lhs.clone()));
                }
                Cmd::MemCopy { .. }
                | Cmd::Event { .. }
                | Cmd::StorageLoad { .. }
                | Cmd::StorageStore { .. } => {
                    debug!(%cmd, "loop body command not supported for summarization");
                    return None;
                }
                other => {
                    for v in other.uses() {
                        if !st.must_vars.contains(&v) {
                            inputs.insert(ProgramValueLocation::StackVar(v));
                        }
                    }
                    if let Some(lhs) = other.lhs() {
                        st.write_var(lhs);
                        all_writes.insert(ProgramValueLocation::StackVar(lhs.clone()));
                    }
                }
            }
        }
        for succ in program.successors(block) {
            if !the_loop.contains(succ) {
                continue;
            }
            if succ == head {
                continue;
            }
            let merged = match states.get(&succ) {
                Some(existing) => existing.join(&st),
                None => st.clone(),
            };
            states.insert(succ, merged);
        }
    }

    // the exit may follow any number of iterations, so every write of the
    // body may be visible there
    let writes_at_exit: BTreeSet<ProgramValueLocation> = all_writes
        .iter()
        .filter(|loc| match loc {
            ProgramValueLocation::StackVar(v) => liveness.is_live_before(distinguished_exit, v),
            ProgramValueLocation::MemoryCell(_) => true,
        })
        .cloned()
        .collect();
    let invariant = infer_invariant(program, the_loop, head, &inputs);
    let alias_at_exit = writes_at_exit
        .iter()
        .filter_map(ProgramValueLocation::as_var)
        .filter_map(|k| {
            copies_at(program, first_ptr(the_loop.head), first_ptr(distinguished_exit), k)
                .into_iter()
                .find(|w| !all_writes.contains(&ProgramValueLocation::StackVar(w.clone())))
                .map(|w| (k.clone(), w))
        })
        .collect();
    Some(LoopConfig {
        head,
        inputs,
        writes_at_exit,
        alias_at_exit,
        invariant,
        all_writes,
    })
}

fn infer_invariant(
    program: &Program,
    the_loop: &Loop,
    head: BlockId,
    inputs: &IndexSet<ProgramValueLocation>,
) -> LoopInvariant {
    let Some(state) = analyze_loop(program, the_loop, head) else {
        return LoopInvariant::default();
    };
    let loop_start = first_ptr(head);
    let initial: BTreeMap<Var, BigInt> = state
        .state
        .keys()
        .filter(|k| inputs.contains(&ProgramValueLocation::StackVar((*k).clone())))
        .filter_map(|k| constant_def_before_loop(program, k, loop_start, the_loop).map(|c| (k.clone(), c)))
        .collect();
    let inductive_state: BTreeMap<Var, Expr> = state
        .state
        .into_iter()
        .filter(|(k, _)| initial.contains_key(k))
        .filter_map(|(k, e)| e.map(|e| (k, e)))
        .collect();
    let mut keys: BTreeSet<Var> = inductive_state.keys().cloned().collect();
    for e in inductive_state.values() {
        keys.extend(e.free_vars());
    }
    let inductive_pc: Vec<Expr> = state
        .pc
        .into_iter()
        .filter(|e| e.free_vars().iter().all(|v| keys.contains(v)))
        .collect();
    if inductive_pc.is_empty() || inductive_state.is_empty() || initial.is_empty() {
        return LoopInvariant::default();
    }
    LoopInvariant {
        inductive_pc,
        initial,
        inductive_state,
    }
}

/// The in-body successor of the head to use as the head of the rotated
/// loop, when the head only evaluates the loop condition and the condition
/// holds on entry.
pub fn can_rotate_loop(program: &Program, the_loop: &Loop) -> Option<BlockId> {
    let head = program.block(the_loop.head).ok()?;
    let conds = path_conditions(program, the_loop.head);
    let mut into_body = conds.iter().filter(|(b, _)| the_loop.contains(*b));
    let (Some((dest, cond)), None) = (into_body.next(), into_body.next()) else {
        return None;
    };
    let condition = match cond {
        PathCondition::True => return None,
        PathCondition::Holds(c) => c.clone(),
        PathCondition::Fails(c) => c.clone().not(),
    };
    if head
        .cmds
        .iter()
        .any(|c| !matches!(c, Cmd::Assign { .. } | Cmd::Branch { .. }))
    {
        return None;
    }
    let liveness = Liveness::compute(program);
    if head
        .cmds
        .iter()
        .filter_map(Cmd::lhs)
        .any(|v| liveness.is_live_before(*dest, v))
    {
        return None;
    }
    // the condition in terms of the values at the start of the head
    let mut defining = condition;
    for cmd in head.cmds.iter().rev() {
        if let Cmd::Assign { lhs, rhs } = cmd {
            defining = defining.substitute(&|v: &Var| (v == lhs).then(|| rhs.clone()));
        }
    }
    let start = first_ptr(the_loop.head);
    let folded = defining.substitute(&|v: &Var| {
        constant_def_before_loop(program, v, start, the_loop).map(Expr::Int)
    });
    match folded.eval_const() {
        Some(Value::Bool(true)) => Some(*dest),
        _ => None,
    }
}

/// The first loop of `program` in program order with its views. `None` for
/// loop-free programs, nested loops, loops without a unique non-reverting
/// exit, and loops no view can be extracted for.
pub fn extract_primary_loop(program: &Program) -> Option<LoopConfigOptions> {
    let loops = natural_loops(program);
    let nested = loops
        .iter()
        .any(|l| loops.iter().any(|o| o.head != l.head && o.contains(l.head)));
    if nested {
        debug!(program = %program.name, "nested loops are not summarized");
        return None;
    }
    let first = strongly_connected_components(program)
        .into_iter()
        .find(|scc| scc.len() > 1)?;
    let mut candidates = loops.into_iter().filter(|l| first.contains(&l.head));
    let (Some(the_loop), None) = (candidates.next(), candidates.next()) else {
        return None;
    };
    debug!(program = %program.name, head = %the_loop.head, "found first loop");

    let reverting = reverting_blocks(program);
    let exits: BTreeSet<BlockId> = the_loop
        .body
        .iter()
        .flat_map(|b| program.successors(*b))
        .filter(|s| !the_loop.contains(*s) && !reverting.contains(s))
        .collect();
    let mut exits = exits.into_iter();
    let (Some(distinguished_exit), None) = (exits.next(), exits.next()) else {
        debug!(head = %the_loop.head, "loop has no unique non-reverting exit");
        return None;
    };

    let alt_head = can_rotate_loop(program, &the_loop);
    let (main, alt) = std::thread::scope(|s| {
        let alt = s.spawn(|| {
            alt_head.and_then(|h| extract_loop_config(program, &the_loop, h, distinguished_exit))
        });
        let main = extract_loop_config(program, &the_loop, the_loop.head, distinguished_exit);
        (main, alt.join().ok().flatten())
    });
    let main_config = main.or_else(|| alt.clone())?;
    let alternative = alt.filter(|a| *a != main_config);
    Some(LoopConfigOptions {
        source: the_loop,
        distinguished_exit,
        main: main_config,
        alternative,
    })
}

/// Pick the views of both loops: the alternative of the side that has one
/// when only one side does, the main views otherwise.
pub fn choose_views(a: LoopConfigOptions, b: LoopConfigOptions) -> (AnnotatedLoop, AnnotatedLoop) {
    let (a_config, b_config) = match (a.alternative, b.alternative) {
        (Some(alt), None) => (alt, b.main),
        (None, Some(alt)) => (a.main, alt),
        _ => (a.main, b.main),
    };
    (
        AnnotatedLoop {
            source: a.source,
            distinguished_exit: a.distinguished_exit,
            config: a_config,
        },
        AnnotatedLoop {
            source: b.source,
            distinguished_exit: b.distinguished_exit,
            config: b_config,
        },
    )
}
