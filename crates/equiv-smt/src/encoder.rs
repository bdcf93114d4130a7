//! Encoding of acyclic programs into SMT assertions.
//!
//! Every block gets a reachability variable, variables are put in SSA form
//! and merged at joins, `assume` commands become path implications and every
//! `assert` gets a failure variable. The verification condition is the
//! disjunction of the failure variables.

use std::collections::{HashMap, HashSet};

use equiv_ir::analysis::path_conditions;
use equiv_ir::graph::topological_order;
use equiv_ir::{AssertMeta, BlockId, Cmd, CmdPointer, Expr, IrError, Program, Var};
use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};
use thiserror::Error;

use crate::backends::smtlib_printer::to_smtlib;
use crate::sorts::SmtSort;
use crate::terms::SmtTerm;

/// Memory word size in bytes.
pub const WORD_SIZE: u32 = 32;

/// Longest constant-length copy expanded into explicit word stores.
const MAX_UNROLLED_COPY_WORDS: u64 = 64;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error(transparent)]
    Ir(#[from] IrError),
    #[error("unsupported construct: {0}")]
    Unsupported(String),
    #[error("function `{name}` applied with {found} arguments, previously with {expected}")]
    FunctionArity {
        name: String,
        expected: usize,
        found: usize,
    },
}

/// An assertion of the program and the variable that holds when it fails.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedAssert {
    pub ptr: CmdPointer,
    pub fail: String,
    pub msg: String,
    pub meta: AssertMeta,
}

/// Declarations and assertions for one program.
#[derive(Debug, Clone, Default)]
pub struct ProgramEncoding {
    /// Variable declarations: (name, sort).
    pub declarations: Vec<(String, SmtSort)>,
    /// Uninterpreted functions from ints to int: (name, arity).
    pub functions: Vec<(String, usize)>,
    /// Path constraints.
    pub assertions: Vec<SmtTerm>,
    /// Reachable blocks in topological order.
    pub order: Vec<BlockId>,
    /// Reachability variable of every block.
    pub reach: IndexMap<BlockId, String>,
    /// Asserts in topological order.
    pub asserts: Vec<EncodedAssert>,
    exit_versions: HashMap<BlockId, HashMap<Var, String>>,
    declared: HashSet<String>,
    assertion_keys: HashSet<String>,
}

impl ProgramEncoding {
    fn declare(&mut self, name: String, sort: SmtSort) {
        if self.declared.insert(name.clone()) {
            self.declarations.push((name, sort));
        }
    }

    fn assert_term(&mut self, term: SmtTerm) {
        if self.assertion_keys.insert(to_smtlib(&term)) {
            self.assertions.push(term);
        }
    }

    /// Some assertion fails.
    pub fn vc(&self) -> SmtTerm {
        SmtTerm::or(
            self.asserts
                .iter()
                .map(|a| SmtTerm::var(a.fail.clone()))
                .collect(),
        )
    }

    /// Solver symbol holding `var` at the end of `block`, if the variable was
    /// ever mentioned.
    pub fn symbol_at_exit(&self, block: BlockId, var: &Var) -> Option<String> {
        if let Some(name) = self.exit_versions.get(&block).and_then(|m| m.get(var)) {
            return Some(name.clone());
        }
        let initial = initial_name(var);
        self.declared.contains(&initial).then_some(initial)
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.declared.contains(name)
    }
}

fn reach_name(block: BlockId) -> String {
    format!("reach!{block}")
}

fn initial_name(var: &Var) -> String {
    format!("{}!0", var.smt_name())
}

fn smt_sort(var: &Var) -> SmtSort {
    SmtSort::from(var.sort)
}

struct Encoder {
    out: ProgramEncoding,
    versions: HashMap<Var, usize>,
    functions: HashMap<String, usize>,
    fresh: usize,
    /// Call index of the block being encoded. Memory and storage are
    /// implicit in commands and belong to the call of their block.
    call: u32,
}

/// Encode an acyclic program.
pub fn encode_program(program: &Program) -> Result<ProgramEncoding, EncodeError> {
    let order = topological_order(program)?;
    let mut enc = Encoder {
        out: ProgramEncoding::default(),
        versions: HashMap::new(),
        functions: HashMap::new(),
        fresh: 0,
        call: 0,
    };
    enc.out.order = order.clone();
    for b in &order {
        enc.out.declare(reach_name(*b), SmtSort::Bool);
        enc.out.reach.insert(*b, reach_name(*b));
    }

    // incoming edges: (pred, edge variable)
    let mut incoming: HashMap<BlockId, Vec<(BlockId, String)>> = HashMap::new();
    for b in &order {
        enc.call = b.call;
        let reach = SmtTerm::var(reach_name(*b));
        let mut env = if *b == program.entry {
            enc.out.assert_term(reach.clone());
            HashMap::new()
        } else {
            let preds = incoming.remove(b).unwrap_or_default();
            enc.out.assert_term(reach.clone().eq(SmtTerm::or(
                preds
                    .iter()
                    .map(|(_, e)| SmtTerm::var(e.clone()))
                    .collect(),
            )));
            enc.merge(&preds)?
        };
        let mut guard = reach;
        let block = program.block(*b)?;
        for (pos, cmd) in block.cmds.iter().enumerate() {
            guard = enc.command(CmdPointer::new(*b, pos), cmd, guard, &mut env)?;
        }
        for (succ, cond) in path_conditions(program, *b) {
            let cond = enc.expr(&cond.as_expr(), &env)?;
            let edge = format!("edge!{b}!{succ}");
            enc.out.declare(edge.clone(), SmtSort::Bool);
            enc.out
                .assert_term(SmtTerm::var(edge.clone()).eq(SmtTerm::and(vec![guard.clone(), cond])));
            incoming.entry(succ).or_default().push((*b, edge));
        }
        enc.out.exit_versions.insert(*b, env);
    }
    let mut functions: Vec<(String, usize)> = enc.functions.into_iter().collect();
    functions.sort();
    enc.out.functions = functions;
    Ok(enc.out)
}

impl Encoder {
    fn lookup(&mut self, var: &Var, env: &HashMap<Var, String>) -> String {
        match env.get(var) {
            Some(name) => name.clone(),
            None => {
                let name = initial_name(var);
                self.out.declare(name.clone(), smt_sort(var));
                name
            }
        }
    }

    fn next_version(&mut self, var: &Var, env: &mut HashMap<Var, String>) -> String {
        let k = self.versions.entry(var.clone()).or_insert(0);
        *k += 1;
        let name = format!("{}!{}", var.smt_name(), k);
        self.out.declare(name.clone(), smt_sort(var));
        env.insert(var.clone(), name.clone());
        name
    }

    fn fresh_bool(&mut self, prefix: &str) -> String {
        self.fresh += 1;
        let name = format!("{prefix}!{}", self.fresh);
        self.out.declare(name.clone(), SmtSort::Bool);
        name
    }

    /// SSA environment at the start of a join block.
    fn merge(
        &mut self,
        preds: &[(BlockId, String)],
    ) -> Result<HashMap<Var, String>, EncodeError> {
        let envs: Vec<(String, HashMap<Var, String>)> = preds
            .iter()
            .map(|(p, edge)| {
                (
                    edge.clone(),
                    self.out.exit_versions.get(p).cloned().unwrap_or_default(),
                )
            })
            .collect();
        if envs.len() == 1 {
            return Ok(envs.into_iter().next().map(|(_, e)| e).unwrap_or_default());
        }
        let mut vars: Vec<Var> = envs
            .iter()
            .flat_map(|(_, env)| env.keys().cloned())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        vars.sort();
        let mut merged = HashMap::new();
        for var in vars {
            let names: Vec<(String, String)> = envs
                .iter()
                .map(|(edge, env)| (edge.clone(), self.lookup(&var, env)))
                .collect();
            let first = &names[0].1;
            if names.iter().all(|(_, n)| n == first) {
                merged.insert(var, first.clone());
                continue;
            }
            let joined = self.next_version(&var, &mut merged);
            for (edge, name) in names {
                self.out.assert_term(
                    SmtTerm::var(edge).implies(SmtTerm::var(joined.clone()).eq(SmtTerm::var(name))),
                );
            }
        }
        Ok(merged)
    }

    /// Encode one command under `guard`; returns the guard for the next command.
    fn command(
        &mut self,
        ptr: CmdPointer,
        cmd: &Cmd,
        guard: SmtTerm,
        env: &mut HashMap<Var, String>,
    ) -> Result<SmtTerm, EncodeError> {
        match cmd {
            Cmd::Assign { lhs, rhs } => {
                let value = self.expr(rhs, env)?;
                let name = self.next_version(lhs, env);
                self.out.assert_term(SmtTerm::var(name).eq(value));
            }
            Cmd::Havoc { lhs } => {
                self.next_version(lhs, env);
            }
            Cmd::Assume { cond } => {
                let cond = self.expr(cond, env)?;
                self.out.assert_term(guard.clone().implies(cond));
            }
            Cmd::Assert { cond, msg, meta } => {
                let cond = self.expr(cond, env)?;
                let fail = self.fresh_bool("fail");
                self.out.assert_term(
                    SmtTerm::var(fail.clone())
                        .eq(SmtTerm::and(vec![guard.clone(), cond.clone().not()])),
                );
                let next = self.fresh_bool("guard");
                self.out
                    .assert_term(SmtTerm::var(next.clone()).eq(SmtTerm::and(vec![guard, cond])));
                self.out.asserts.push(EncodedAssert {
                    ptr,
                    fail,
                    msg: msg.clone(),
                    meta: meta.clone(),
                });
                return Ok(SmtTerm::var(next));
            }
            Cmd::MemStore { offset, value } => {
                self.map_store(&Var::memory(), offset, value, env)?;
            }
            Cmd::StorageStore { key, value } => {
                self.map_store(&Var::storage(), key, value, env)?;
            }
            Cmd::MemLoad { lhs, offset } => {
                self.map_load(&Var::memory(), lhs, offset, env)?;
            }
            Cmd::StorageLoad { lhs, key } => {
                self.map_load(&Var::storage(), lhs, key, env)?;
            }
            Cmd::MemCopy { dst, src, len } => self.mem_copy(dst, src, len, env)?,
            Cmd::Event { .. }
            | Cmd::Return { .. }
            | Cmd::Revert
            | Cmd::Label(_)
            | Cmd::Annotation(_)
            | Cmd::Nop
            | Cmd::Jump { .. }
            | Cmd::Branch { .. } => {}
        }
        Ok(guard)
    }

    fn map_store(
        &mut self,
        map: &Var,
        index: &Expr,
        value: &Expr,
        env: &mut HashMap<Var, String>,
    ) -> Result<(), EncodeError> {
        let map = map.indexed(self.call);
        let before = SmtTerm::var(self.lookup(&map, env));
        let index = self.expr(index, env)?;
        let value = self.expr(value, env)?;
        let after = self.next_version(&map, env);
        self.out
            .assert_term(SmtTerm::var(after).eq(before.store(index, value)));
        Ok(())
    }

    fn map_load(
        &mut self,
        map: &Var,
        lhs: &Var,
        index: &Expr,
        env: &mut HashMap<Var, String>,
    ) -> Result<(), EncodeError> {
        let map = map.indexed(self.call);
        let current = SmtTerm::var(self.lookup(&map, env));
        let index = self.expr(index, env)?;
        let name = self.next_version(lhs, env);
        self.out
            .assert_term(SmtTerm::var(name).eq(current.select(index)));
        Ok(())
    }


    fn mem_copy(
        &mut self,
        dst: &Expr,
        src: &Expr,
        len: &Expr,
        env: &mut HashMap<Var, String>,
    ) -> Result<(), EncodeError> {
        let mem = Var::memory().indexed(self.call);
        let before = SmtTerm::var(self.lookup(&mem, env));
        let dst_t = self.expr(dst, env)?;
        let src_t = self.expr(src, env)?;
        let const_len = len.eval_const().and_then(|v| v.as_int().cloned());
        match const_len {
            Some(n) if n <= BigInt::zero() => Ok(()),
            Some(n)
                if n.to_u64()
                    .is_some_and(|l| l.div_ceil(WORD_SIZE as u64) <= MAX_UNROLLED_COPY_WORDS) =>
            {
                let words = n.to_u64().unwrap_or(0).div_ceil(WORD_SIZE as u64);
                let mut acc = before.clone();
                for k in 0..words {
                    let off = SmtTerm::int(k * WORD_SIZE as u64);
                    acc = acc.store(
                        dst_t.clone().add(off.clone()),
                        before.clone().select(src_t.clone().add(off)),
                    );
                }
                let after = self.next_version(&mem, env);
                self.out.assert_term(SmtTerm::var(after).eq(acc));
                Ok(())
            }
            _ => {
                let len_t = self.expr(len, env)?;
                let after = SmtTerm::var(self.next_version(&mem, env));
                let i = SmtTerm::var("i!copy");
                let inside = SmtTerm::and(vec![
                    dst_t.clone().le(i.clone()),
                    i.clone().lt(dst_t.clone().add(len_t)),
                ]);
                let copied = after
                    .clone()
                    .select(i.clone())
                    .eq(before.clone().select(i.clone().sub(dst_t).add(src_t)));
                let kept = after.select(i.clone()).eq(before.select(i));
                self.out.assert_term(SmtTerm::ForAll(
                    vec![("i!copy".to_string(), SmtSort::Int)],
                    Box::new(SmtTerm::ite(inside, copied, kept)),
                ));
                Ok(())
            }
        }
    }

    fn expr(&mut self, expr: &Expr, env: &HashMap<Var, String>) -> Result<SmtTerm, EncodeError> {
        Ok(match expr {
            Expr::Var(v) => SmtTerm::var(self.lookup(v, env)),
            Expr::Int(n) => SmtTerm::IntLit(n.clone()),
            Expr::Bool(b) => SmtTerm::bool(*b),
            Expr::Add(a, b) => self.expr(a, env)?.add(self.expr(b, env)?),
            Expr::Sub(a, b) => self.expr(a, env)?.sub(self.expr(b, env)?),
            Expr::Mul(a, b) => self.expr(a, env)?.mul(self.expr(b, env)?),
            Expr::Div(a, b) => self.expr(a, env)?.div(self.expr(b, env)?),
            Expr::Mod(a, b) => self.expr(a, env)?.modulo(self.expr(b, env)?),
            Expr::Lt(a, b) => self.expr(a, env)?.lt(self.expr(b, env)?),
            Expr::Le(a, b) => self.expr(a, env)?.le(self.expr(b, env)?),
            Expr::Eq(a, b) => self.expr(a, env)?.eq(self.expr(b, env)?),
            Expr::Not(a) => self.expr(a, env)?.not(),
            Expr::And(es) => SmtTerm::and(self.exprs(es, env)?),
            Expr::Or(es) => SmtTerm::or(self.exprs(es, env)?),
            Expr::Ite(c, t, e) => {
                SmtTerm::ite(self.expr(c, env)?, self.expr(t, env)?, self.expr(e, env)?)
            }
            Expr::Select(m, i) => self.expr(m, env)?.select(self.expr(i, env)?),
            Expr::Store(m, i, v) => {
                let m = self.expr(m, env)?;
                m.store(self.expr(i, env)?, self.expr(v, env)?)
            }
            Expr::ConstMap(v) => SmtTerm::const_array(self.expr(v, env)?),
            Expr::Apply(name, args) => {
                let args = self.exprs(args, env)?;
                self.function(name, args.len())?;
                SmtTerm::app(name.clone(), args)
            }
        })
    }

    fn exprs(&mut self, es: &[Expr], env: &HashMap<Var, String>) -> Result<Vec<SmtTerm>, EncodeError> {
        es.iter().map(|e| self.expr(e, env)).collect()
    }

    fn function(&mut self, name: &str, arity: usize) -> Result<(), EncodeError> {
        if arity == 0 {
            return Err(EncodeError::Unsupported(format!(
                "nullary application of `{name}`"
            )));
        }
        match self.functions.get(name) {
            Some(expected) if *expected != arity => Err(EncodeError::FunctionArity {
                name: name.to_string(),
                expected: *expected,
                found: arity,
            }),
            Some(_) => Ok(()),
            None => {
                self.functions.insert(name.to_string(), arity);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use equiv_ir::{ExitPayload, ProgramBuilder};

    fn branchy() -> Program {
        let x = Var::int("x");
        let y = Var::int("y");
        let mut b = ProgramBuilder::new("branchy");
        let entry = b.new_block();
        let left = b.new_block();
        let right = b.new_block();
        let join = b.new_block();
        b.param(x.clone());
        b.push(entry, Cmd::branch(Expr::var(&x).lt(Expr::int(0)), left, right));
        b.push(left, Cmd::assign(&y, Expr::int(0).sub(Expr::var(&x))));
        b.push(left, Cmd::jump(join));
        b.push(right, Cmd::assign(&y, Expr::var(&x)));
        b.push(right, Cmd::jump(join));
        b.push(join, Cmd::assert(Expr::int(0).le(Expr::var(&y)), "abs is non-negative"));
        b.push(
            join,
            Cmd::Return {
                payload: ExitPayload::Values(vec![Expr::var(&y)]),
            },
        );
        b.build().expect("well formed")
    }

    #[test]
    fn join_merges_versions() {
        let p = branchy();
        let enc = encode_program(&p).expect("encodes");
        assert_eq!(enc.order.len(), 4);
        assert_eq!(enc.asserts.len(), 1);
        let join = BlockId::new(3);
        let y = Var::int("y");
        assert_eq!(enc.symbol_at_exit(join, &y).as_deref(), Some("y!3"));
        let printed: Vec<String> = enc.assertions.iter().map(to_smtlib).collect();
        assert!(printed
            .iter()
            .any(|a| a == "(=> edge!B1!B3 (= y!3 y!1))"));
        assert!(printed.iter().any(|a| a == "reach!B0"));
        assert_eq!(to_smtlib(&enc.vc()), "fail!1");
    }

    #[test]
    fn cycles_are_rejected() {
        let i = Var::int("i");
        let mut b = ProgramBuilder::new("loop");
        let head = b.new_block();
        let body = b.new_block();
        b.push(head, Cmd::branch(Expr::var(&i).lt(Expr::int(3)), body, head));
        b.push(body, Cmd::jump(head));
        let p = b.build().expect("well formed");
        match encode_program(&p) {
            Err(EncodeError::Ir(IrError::Cyclic(name))) => assert_eq!(name, "loop"),
            other => panic!("Expected Cyclic, got: {other:?}"),
        }
    }

    #[test]
    fn function_arity_must_agree() {
        let mut b = ProgramBuilder::new("uf");
        let entry = b.new_block();
        let r = Var::int("r");
        b.push(entry, Cmd::assign(&r, Expr::apply("h", vec![Expr::int(1)])));
        b.push(
            entry,
            Cmd::assign(&r, Expr::apply("h", vec![Expr::int(1), Expr::int(2)])),
        );
        let p = b.build().expect("well formed");
        match encode_program(&p) {
            Err(EncodeError::FunctionArity { name, expected, found }) => {
                assert_eq!((name.as_str(), expected, found), ("h", 1, 2));
            }
            other => panic!("Expected FunctionArity, got: {other:?}"),
        }
    }

    #[test]
    fn constant_copies_unroll_into_stores() {
        let mut b = ProgramBuilder::new("copy");
        let entry = b.new_block();
        b.push(entry, Cmd::mem_store(0, Expr::int(7)));
        b.push(
            entry,
            Cmd::MemCopy {
                dst: Expr::int(64),
                src: Expr::int(0),
                len: Expr::int(40),
            },
        );
        let p = b.build().expect("well formed");
        let enc = encode_program(&p).expect("encodes");
        let printed: Vec<String> = enc.assertions.iter().map(to_smtlib).collect();
        assert!(printed.iter().any(|a| a.starts_with("(= mem!2 (store (store mem!1 (+ 64 0)")));
        assert!(!printed.iter().any(|a| a.contains("forall")));
    }
}
