//! Control-flow-graph programs: blocks, commands and command pointers.

use std::fmt;

use indexmap::{IndexMap, IndexSet};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::error::IrError;
use crate::expr::{Expr, Var};

/// Identifier of a basic block. `call` separates the copies of a program
/// that are inlined into one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId {
    pub id: u32,
    pub call: u32,
}

impl BlockId {
    pub fn new(id: u32) -> Self {
        Self { id, call: 0 }
    }

    pub fn with_call(self, call: u32) -> Self {
        Self { id: self.id, call }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.call == 0 {
            write!(f, "B{}", self.id)
        } else {
            write!(f, "B{}@{}", self.id, self.call)
        }
    }
}

/// Position of a command inside a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CmdPointer {
    pub block: BlockId,
    pub pos: usize,
}

impl CmdPointer {
    pub fn new(block: BlockId, pos: usize) -> Self {
        Self { block, pos }
    }
}

impl fmt::Display for CmdPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.pos)
    }
}

/// Observable event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// External call.
    Call,
    /// Emitted log.
    Log,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Call => write!(f, "call"),
            EventKind::Log => write!(f, "log"),
        }
    }
}

/// What a returning program hands back to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitPayload {
    /// A memory buffer `[offset, offset + length)`.
    Buffer { offset: Expr, length: Expr },
    /// A list of scalar values.
    Values(Vec<Expr>),
}

/// Semantic tag of an assertion, used when classifying counterexamples.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssertTag {
    /// Trace values of both programs agree at the skolem index.
    TraceEquivalence,
    /// Storage of both programs agrees at the skolem key.
    StorageComparison { a_value: Var, b_value: Var, key: Var },
    /// Exit site marker placed by the exit matcher.
    ExitSite(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssertMeta {
    pub tag: Option<AssertTag>,
}

impl AssertMeta {
    pub fn tagged(tag: AssertTag) -> Self {
        Self { tag: Some(tag) }
    }
}

/// Non-semantic markers consumed by counterexample analysis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Annotation {
    /// Holds the skolem trace index the enclosing assertion talks about.
    IndexHolder(Var),
    /// Marks that the instrumentation site `site` recorded its event at
    /// the trace position held in `index`.
    TraceIndexMarker { site: u32, index: Var },
    /// Variables that must be retained in the model.
    KeepAlive(Vec<Var>),
}

/// IR command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cmd {
    Assign { lhs: Var, rhs: Expr },
    Havoc { lhs: Var },
    Assume { cond: Expr },
    Assert { cond: Expr, msg: String, meta: AssertMeta },
    /// Write one word at a byte offset.
    MemStore { offset: Expr, value: Expr },
    /// Read one word at a byte offset.
    MemLoad { lhs: Var, offset: Expr },
    /// Copy `len` bytes within memory.
    MemCopy { dst: Expr, src: Expr, len: Expr },
    StorageStore { key: Expr, value: Expr },
    StorageLoad { lhs: Var, key: Expr },
    /// Emit an observable event carrying the memory buffer `[offset, offset+length)`.
    Event {
        kind: EventKind,
        offset: Expr,
        length: Expr,
        context: Vec<Expr>,
    },
    Return { payload: ExitPayload },
    Revert,
    Label(String),
    Annotation(Annotation),
    Nop,
    Jump { target: BlockId },
    Branch {
        cond: Expr,
        then_block: BlockId,
        else_block: BlockId,
    },
}

impl Cmd {
    pub fn assign(lhs: &Var, rhs: Expr) -> Self {
        Cmd::Assign {
            lhs: lhs.clone(),
            rhs,
        }
    }

    pub fn assume(cond: Expr) -> Self {
        Cmd::Assume { cond }
    }

    pub fn assert(cond: Expr, msg: impl Into<String>) -> Self {
        Cmd::Assert {
            cond,
            msg: msg.into(),
            meta: AssertMeta::default(),
        }
    }

    pub fn label(text: impl Into<String>) -> Self {
        Cmd::Label(text.into())
    }

    pub fn jump(target: BlockId) -> Self {
        Cmd::Jump { target }
    }

    pub fn branch(cond: Expr, then_block: BlockId, else_block: BlockId) -> Self {
        Cmd::Branch {
            cond,
            then_block,
            else_block,
        }
    }

    pub fn mem_store(offset: impl Into<BigInt>, value: Expr) -> Self {
        Cmd::MemStore {
            offset: Expr::int(offset),
            value,
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self, Cmd::Jump { .. } | Cmd::Branch { .. })
    }

    /// Successor blocks named by this command, deduplicated.
    pub fn targets(&self) -> Vec<BlockId> {
        match self {
            Cmd::Jump { target } => vec![*target],
            Cmd::Branch {
                then_block,
                else_block,
                ..
            } => {
                if then_block == else_block {
                    vec![*then_block]
                } else {
                    vec![*then_block, *else_block]
                }
            }
            _ => Vec::new(),
        }
    }

    /// Variable assigned by this command, if any (memory and storage excluded).
    pub fn lhs(&self) -> Option<&Var> {
        match self {
            Cmd::Assign { lhs, .. }
            | Cmd::Havoc { lhs }
            | Cmd::MemLoad { lhs, .. }
            | Cmd::StorageLoad { lhs, .. } => Some(lhs),
            _ => None,
        }
    }

    /// Variables defined by this command, including implicit memory/storage.
    pub fn defs(&self) -> Vec<Var> {
        match self {
            Cmd::MemStore { .. } | Cmd::MemCopy { .. } => vec![Var::memory()],
            Cmd::StorageStore { .. } => vec![Var::storage()],
            other => other.lhs().cloned().into_iter().collect(),
        }
    }

    /// Expressions read by this command.
    pub fn rhs_exprs(&self) -> Vec<&Expr> {
        match self {
            Cmd::Assign { rhs, .. } => vec![rhs],
            Cmd::Assume { cond } | Cmd::Assert { cond, .. } => vec![cond],
            Cmd::MemStore { offset, value } => vec![offset, value],
            Cmd::MemLoad { offset, .. } => vec![offset],
            Cmd::MemCopy { dst, src, len } => vec![dst, src, len],
            Cmd::StorageStore { key, value } => vec![key, value],
            Cmd::StorageLoad { key, .. } => vec![key],
            Cmd::Event {
                offset,
                length,
                context,
                ..
            } => {
                let mut out = vec![offset, length];
                out.extend(context.iter());
                out
            }
            Cmd::Return { payload } => match payload {
                ExitPayload::Buffer { offset, length } => vec![offset, length],
                ExitPayload::Values(vals) => vals.iter().collect(),
            },
            Cmd::Branch { cond, .. } => vec![cond],
            Cmd::Havoc { .. }
            | Cmd::Revert
            | Cmd::Label(_)
            | Cmd::Annotation(_)
            | Cmd::Nop
            | Cmd::Jump { .. } => Vec::new(),
        }
    }

    /// Free variables read by this command, including implicit memory/storage.
    pub fn uses(&self) -> IndexSet<Var> {
        let mut out = IndexSet::new();
        for e in self.rhs_exprs() {
            e.collect_vars(&mut out);
        }
        match self {
            Cmd::MemLoad { .. }
            | Cmd::MemCopy { .. }
            | Cmd::MemStore { .. }
            | Cmd::Event { .. } => {
                out.insert(Var::memory());
            }
            Cmd::Return {
                payload: ExitPayload::Buffer { .. },
            } => {
                out.insert(Var::memory());
            }
            Cmd::StorageLoad { .. } | Cmd::StorageStore { .. } => {
                out.insert(Var::storage());
            }
            Cmd::Annotation(Annotation::KeepAlive(vars)) => {
                out.extend(vars.iter().cloned());
            }
            _ => {}
        }
        out
    }

    /// Rename every variable in the command.
    pub fn map_vars(&self, f: &impl Fn(&Var) -> Var) -> Cmd {
        let e = |x: &Expr| x.map_vars(f);
        match self {
            Cmd::Assign { lhs, rhs } => Cmd::Assign {
                lhs: f(lhs),
                rhs: e(rhs),
            },
            Cmd::Havoc { lhs } => Cmd::Havoc { lhs: f(lhs) },
            Cmd::Assume { cond } => Cmd::Assume { cond: e(cond) },
            Cmd::Assert { cond, msg, meta } => Cmd::Assert {
                cond: e(cond),
                msg: msg.clone(),
                meta: AssertMeta {
                    tag: meta.tag.as_ref().map(|t| match t {
                        AssertTag::StorageComparison {
                            a_value,
                            b_value,
                            key,
                        } => AssertTag::StorageComparison {
                            a_value: f(a_value),
                            b_value: f(b_value),
                            key: f(key),
                        },
                        other => other.clone(),
                    }),
                },
            },
            Cmd::MemStore { offset, value } => Cmd::MemStore {
                offset: e(offset),
                value: e(value),
            },
            Cmd::MemLoad { lhs, offset } => Cmd::MemLoad {
                lhs: f(lhs),
                offset: e(offset),
            },
            Cmd::MemCopy { dst, src, len } => Cmd::MemCopy {
                dst: e(dst),
                src: e(src),
                len: e(len),
            },
            Cmd::StorageStore { key, value } => Cmd::StorageStore {
                key: e(key),
                value: e(value),
            },
            Cmd::StorageLoad { lhs, key } => Cmd::StorageLoad {
                lhs: f(lhs),
                key: e(key),
            },
            Cmd::Event {
                kind,
                offset,
                length,
                context,
            } => Cmd::Event {
                kind: *kind,
                offset: e(offset),
                length: e(length),
                context: context.iter().map(e).collect(),
            },
            Cmd::Return { payload } => Cmd::Return {
                payload: match payload {
                    ExitPayload::Buffer { offset, length } => ExitPayload::Buffer {
                        offset: e(offset),
                        length: e(length),
                    },
                    ExitPayload::Values(vals) => ExitPayload::Values(vals.iter().map(e).collect()),
                },
            },
            Cmd::Annotation(ann) => Cmd::Annotation(match ann {
                Annotation::IndexHolder(v) => Annotation::IndexHolder(f(v)),
                Annotation::TraceIndexMarker { site, index } => Annotation::TraceIndexMarker {
                    site: *site,
                    index: f(index),
                },
                Annotation::KeepAlive(vars) => Annotation::KeepAlive(vars.iter().map(f).collect()),
            }),
            Cmd::Branch {
                cond,
                then_block,
                else_block,
            } => Cmd::Branch {
                cond: e(cond),
                then_block: *then_block,
                else_block: *else_block,
            },
            Cmd::Revert | Cmd::Label(_) | Cmd::Nop | Cmd::Jump { .. } => self.clone(),
        }
    }

    /// Rewrite successor targets through `f`.
    pub fn map_targets(&self, f: &impl Fn(BlockId) -> BlockId) -> Cmd {
        match self {
            Cmd::Jump { target } => Cmd::Jump { target: f(*target) },
            Cmd::Branch {
                cond,
                then_block,
                else_block,
            } => Cmd::Branch {
                cond: cond.clone(),
                then_block: f(*then_block),
                else_block: f(*else_block),
            },
            other => other.clone(),
        }
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cmd::Assign { lhs, rhs } => write!(f, "{lhs} := {rhs}"),
            Cmd::Havoc { lhs } => write!(f, "havoc {lhs}"),
            Cmd::Assume { cond } => write!(f, "assume {cond}"),
            Cmd::Assert { cond, msg, .. } => write!(f, "assert {cond} \"{msg}\""),
            Cmd::MemStore { offset, value } => write!(f, "mem[{offset}] := {value}"),
            Cmd::MemLoad { lhs, offset } => write!(f, "{lhs} := mem[{offset}]"),
            Cmd::MemCopy { dst, src, len } => write!(f, "mcopy({dst}, {src}, {len})"),
            Cmd::StorageStore { key, value } => write!(f, "storage[{key}] := {value}"),
            Cmd::StorageLoad { lhs, key } => write!(f, "{lhs} := storage[{key}]"),
            Cmd::Event {
                kind,
                offset,
                length,
                ..
            } => write!(f, "{kind}(mem[{offset}..+{length}])"),
            Cmd::Return { payload } => match payload {
                ExitPayload::Buffer { offset, length } => {
                    write!(f, "return mem[{offset}..+{length}]")
                }
                ExitPayload::Values(vals) => {
                    write!(f, "return (")?;
                    for (i, v) in vals.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{v}")?;
                    }
                    write!(f, ")")
                }
            },
            Cmd::Revert => write!(f, "revert"),
            Cmd::Label(l) => write!(f, "// {l}"),
            Cmd::Annotation(a) => write!(f, "@{a:?}"),
            Cmd::Nop => write!(f, "nop"),
            Cmd::Jump { target } => write!(f, "goto {target}"),
            Cmd::Branch {
                cond,
                then_block,
                else_block,
            } => write!(f, "if {cond} goto {then_block} else {else_block}"),
        }
    }
}

/// A basic block. Control leaves a block through its last command when that
/// command is a `Jump` or `Branch`; any other last command ends the program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub cmds: Vec<Cmd>,
}

impl Block {
    pub fn new(id: BlockId, cmds: Vec<Cmd>) -> Self {
        Self { id, cmds }
    }

    pub fn successors(&self) -> Vec<BlockId> {
        self.cmds.last().map(Cmd::targets).unwrap_or_default()
    }

    /// Pointer to the last command (or position 0 for an empty block).
    pub fn last_ptr(&self) -> CmdPointer {
        CmdPointer::new(self.id, self.cmds.len().saturating_sub(1))
    }
}

mod block_list {
    use indexmap::IndexMap;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{Block, BlockId};

    pub fn serialize<S: Serializer>(blocks: &IndexMap<BlockId, Block>, s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(blocks.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<IndexMap<BlockId, Block>, D::Error> {
        let blocks = Vec::<Block>::deserialize(d)?;
        Ok(blocks.into_iter().map(|b| (b.id, b)).collect())
    }
}

/// A function body in control-flow-graph form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    pub entry: BlockId,
    /// Serialized as a list; every block carries its own id.
    #[serde(with = "block_list")]
    pub blocks: IndexMap<BlockId, Block>,
    /// Positional inputs.
    pub params: Vec<Var>,
    /// Ambient inputs (caller, calldata size, ...) shared between compared programs.
    pub environment: Vec<Var>,
}

impl Program {
    pub fn block(&self, id: BlockId) -> Result<&Block, IrError> {
        self.blocks.get(&id).ok_or(IrError::UnknownBlock(id))
    }

    pub fn cmd(&self, ptr: CmdPointer) -> Option<&Cmd> {
        self.blocks.get(&ptr.block)?.cmds.get(ptr.pos)
    }

    pub fn successors(&self, id: BlockId) -> Vec<BlockId> {
        self.blocks
            .get(&id)
            .map(Block::successors)
            .unwrap_or_default()
    }

    pub fn predecessors(&self) -> IndexMap<BlockId, Vec<BlockId>> {
        let mut preds: IndexMap<BlockId, Vec<BlockId>> =
            self.blocks.keys().map(|b| (*b, Vec::new())).collect();
        for block in self.blocks.values() {
            for succ in block.successors() {
                preds.entry(succ).or_default().push(block.id);
            }
        }
        preds
    }

    /// Blocks without successors.
    pub fn ending_blocks(&self) -> Vec<BlockId> {
        self.blocks
            .values()
            .filter(|b| b.successors().is_empty())
            .map(|b| b.id)
            .collect()
    }

    /// Last command of every ending block.
    pub fn halting_sites(&self) -> Vec<CmdPointer> {
        self.ending_blocks()
            .into_iter()
            .filter_map(|b| self.blocks.get(&b).map(Block::last_ptr))
            .collect()
    }

    pub fn commands(&self) -> impl Iterator<Item = (CmdPointer, &Cmd)> {
        self.blocks.values().flat_map(|b| {
            b.cmds
                .iter()
                .enumerate()
                .map(move |(pos, c)| (CmdPointer::new(b.id, pos), c))
        })
    }

    /// A block id not used in this program for the given call index.
    pub fn fresh_block_id(&self, call: u32) -> BlockId {
        let next = self
            .blocks
            .keys()
            .filter(|b| b.call == call)
            .map(|b| b.id + 1)
            .max()
            .unwrap_or(0);
        BlockId { id: next, call }
    }

    /// Check that every jump target exists and that terminators are last.
    pub fn validate(&self) -> Result<(), IrError> {
        self.block(self.entry)?;
        for block in self.blocks.values() {
            for (pos, cmd) in block.cmds.iter().enumerate() {
                if cmd.is_terminator() && pos + 1 != block.cmds.len() {
                    return Err(IrError::MisplacedTerminator(CmdPointer::new(block.id, pos)));
                }
                for target in cmd.targets() {
                    self.block(target)?;
                }
            }
        }
        Ok(())
    }

    /// Every variable mentioned by the program.
    pub fn vars(&self) -> IndexSet<Var> {
        let mut out: IndexSet<Var> = self.params.iter().cloned().collect();
        out.extend(self.environment.iter().cloned());
        for (_, cmd) in self.commands() {
            out.extend(cmd.uses());
            out.extend(cmd.defs());
        }
        out
    }

    /// Copy of this program with every unindexed variable and every block
    /// tagged with `call`.
    pub fn call_indexed(&self, call: u32) -> Program {
        let rename = |v: &Var| v.indexed(call);
        let block_of = |b: BlockId| b.with_call(call);
        Program {
            name: self.name.clone(),
            entry: block_of(self.entry),
            blocks: self
                .blocks
                .values()
                .map(|b| {
                    let id = block_of(b.id);
                    let cmds = b
                        .cmds
                        .iter()
                        .map(|c| c.map_vars(&rename).map_targets(&block_of))
                        .collect();
                    (id, Block::new(id, cmds))
                })
                .collect(),
            params: self.params.iter().map(rename).collect(),
            environment: self.environment.iter().map(rename).collect(),
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "program {} (entry {})", self.name, self.entry)?;
        for block in self.blocks.values() {
            writeln!(f, "{}:", block.id)?;
            for cmd in &block.cmds {
                writeln!(f, "    {cmd}")?;
            }
        }
        Ok(())
    }
}

/// Incremental construction of a [`Program`]. The first allocated block is the entry.
#[derive(Debug, Clone)]
pub struct ProgramBuilder {
    name: String,
    blocks: IndexMap<BlockId, Block>,
    params: Vec<Var>,
    environment: Vec<Var>,
    next: u32,
}

impl ProgramBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blocks: IndexMap::new(),
            params: Vec::new(),
            environment: Vec::new(),
            next: 0,
        }
    }

    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId::new(self.next);
        self.next += 1;
        self.blocks.insert(id, Block::new(id, Vec::new()));
        id
    }

    pub fn push(&mut self, block: BlockId, cmd: Cmd) -> &mut Self {
        if let Some(b) = self.blocks.get_mut(&block) {
            b.cmds.push(cmd);
        }
        self
    }

    pub fn extend(&mut self, block: BlockId, cmds: impl IntoIterator<Item = Cmd>) -> &mut Self {
        if let Some(b) = self.blocks.get_mut(&block) {
            b.cmds.extend(cmds);
        }
        self
    }

    pub fn param(&mut self, var: Var) -> &mut Self {
        self.params.push(var);
        self
    }

    pub fn env(&mut self, var: Var) -> &mut Self {
        self.environment.push(var);
        self
    }

    pub fn build(self) -> Result<Program, IrError> {
        let entry = self
            .blocks
            .keys()
            .next()
            .copied()
            .ok_or(IrError::Empty)?;
        let program = Program {
            name: self.name,
            entry,
            blocks: self.blocks,
            params: self.params,
            environment: self.environment,
        };
        program.validate()?;
        Ok(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Program {
        let mut b = ProgramBuilder::new("diamond");
        let x = Var::int("x");
        let entry = b.new_block();
        let left = b.new_block();
        let right = b.new_block();
        let exit = b.new_block();
        b.param(x.clone());
        b.push(
            entry,
            Cmd::branch(Expr::var(&x).lt(Expr::int(10)), left, right),
        );
        b.push(left, Cmd::jump(exit));
        b.push(right, Cmd::Revert);
        b.push(
            exit,
            Cmd::Return {
                payload: ExitPayload::Values(vec![Expr::var(&x)]),
            },
        );
        b.build().expect("diamond is well formed")
    }

    #[test]
    fn ending_blocks_and_halting_sites() {
        let p = diamond();
        assert_eq!(p.ending_blocks(), vec![BlockId::new(2), BlockId::new(3)]);
        assert_eq!(
            p.halting_sites(),
            vec![
                CmdPointer::new(BlockId::new(2), 0),
                CmdPointer::new(BlockId::new(3), 0)
            ]
        );
    }

    #[test]
    fn call_indexing_renames_vars_and_blocks() {
        let p = diamond().call_indexed(2);
        assert_eq!(p.entry, BlockId::new(0).with_call(2));
        assert_eq!(p.params[0].smt_name(), "x@2");
        assert!(p.validate().is_ok());
        assert!(p.vars().iter().all(|v| v.call == 2));
    }

    #[test]
    fn builder_rejects_dangling_jump() {
        let mut b = ProgramBuilder::new("bad");
        let entry = b.new_block();
        b.push(entry, Cmd::jump(BlockId::new(7)));
        match b.build() {
            Err(IrError::UnknownBlock(id)) => assert_eq!(id, BlockId::new(7)),
            other => panic!("Expected UnknownBlock, got: {other:?}"),
        }
    }

    #[test]
    fn fresh_block_ids_do_not_collide() {
        let p = diamond();
        assert_eq!(p.fresh_block_id(0), BlockId::new(4));
        assert_eq!(p.fresh_block_id(3), BlockId { id: 0, call: 3 });
    }

    #[test]
    fn json_round_trip_keeps_blocks_in_order() {
        let p = diamond().call_indexed(1);
        let json = serde_json::to_string(&p).expect("serializes");
        let back: Program = serde_json::from_str(&json).expect("parses");
        assert_eq!(back, p);
        let ids: Vec<BlockId> = back.blocks.keys().copied().collect();
        assert_eq!(ids, p.blocks.keys().copied().collect::<Vec<_>>());
    }
}
