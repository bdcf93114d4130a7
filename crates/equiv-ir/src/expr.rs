//! Expressions and variables of the equivalence IR.
//!
//! Arithmetic is over mathematical integers. Memory and storage are modelled
//! as integer-indexed maps (`Sort::Map`), manipulated with `Select`/`Store`.

use std::fmt;

use indexmap::IndexSet;
use num_bigint::BigInt;
use num_traits::{One, Signed, Zero};
use serde::{Deserialize, Serialize};

/// Sort of a variable or expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Sort {
    Int,
    Bool,
    /// Int-indexed map of ints (memory, storage, trace arrays).
    Map,
}

impl fmt::Display for Sort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sort::Int => write!(f, "int"),
            Sort::Bool => write!(f, "bool"),
            Sort::Map => write!(f, "map"),
        }
    }
}

/// A program variable.
///
/// `call` is zero for variables that have not been call-indexed into a rule.
/// Call-indexed variables keep their index when the program is indexed again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Var {
    pub name: String,
    pub sort: Sort,
    pub call: u32,
}

impl Var {
    pub fn new(name: impl Into<String>, sort: Sort) -> Self {
        Self {
            name: name.into(),
            sort,
            call: 0,
        }
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, Sort::Int)
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, Sort::Bool)
    }

    pub fn map(name: impl Into<String>) -> Self {
        Self::new(name, Sort::Map)
    }

    /// The word-addressed memory of a single program execution.
    pub fn memory() -> Self {
        Self::map("mem")
    }

    /// Persistent storage, shared in its initial state between compared programs.
    pub fn storage() -> Self {
        Self::map("storage")
    }

    pub fn with_call(&self, call: u32) -> Self {
        Self {
            call,
            ..self.clone()
        }
    }

    /// Index this variable with `call` unless it is already indexed.
    pub fn indexed(&self, call: u32) -> Self {
        if self.call == 0 {
            self.with_call(call)
        } else {
            self.clone()
        }
    }

    pub fn is_indexed(&self) -> bool {
        self.call != 0
    }

    /// Name used for this variable in solver queries.
    pub fn smt_name(&self) -> String {
        if self.call == 0 {
            self.name.clone()
        } else {
            format!("{}@{}", self.name, self.call)
        }
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.smt_name())
    }
}

/// Constant value of an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(BigInt),
    Bool(bool),
}

impl Value {
    pub fn as_int(&self) -> Option<&BigInt> {
        match self {
            Value::Int(n) => Some(n),
            Value::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(_) => None,
        }
    }
}

/// IR expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    Var(Var),
    Int(BigInt),
    Bool(bool),

    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    /// Euclidean division, as in SMT-LIB `div`.
    Div(Box<Expr>, Box<Expr>),
    /// Euclidean remainder, as in SMT-LIB `mod`.
    Mod(Box<Expr>, Box<Expr>),

    Lt(Box<Expr>, Box<Expr>),
    Le(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),

    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Ite(Box<Expr>, Box<Expr>, Box<Expr>),

    Select(Box<Expr>, Box<Expr>),
    Store(Box<Expr>, Box<Expr>, Box<Expr>),
    /// Map with every index holding the given int.
    ConstMap(Box<Expr>),

    /// Application of an uninterpreted int-valued function over int arguments.
    Apply(String, Vec<Expr>),
}

#[allow(clippy::should_implement_trait)]
impl Expr {
    pub fn var(v: &Var) -> Self {
        Expr::Var(v.clone())
    }

    pub fn int(n: impl Into<BigInt>) -> Self {
        Expr::Int(n.into())
    }

    pub fn tt() -> Self {
        Expr::Bool(true)
    }

    pub fn ff() -> Self {
        Expr::Bool(false)
    }

    pub fn add(self, other: Expr) -> Self {
        Expr::Add(Box::new(self), Box::new(other))
    }

    pub fn sub(self, other: Expr) -> Self {
        Expr::Sub(Box::new(self), Box::new(other))
    }

    pub fn mul(self, other: Expr) -> Self {
        Expr::Mul(Box::new(self), Box::new(other))
    }

    pub fn div(self, other: Expr) -> Self {
        Expr::Div(Box::new(self), Box::new(other))
    }

    pub fn modulo(self, other: Expr) -> Self {
        Expr::Mod(Box::new(self), Box::new(other))
    }

    pub fn lt(self, other: Expr) -> Self {
        Expr::Lt(Box::new(self), Box::new(other))
    }

    pub fn le(self, other: Expr) -> Self {
        Expr::Le(Box::new(self), Box::new(other))
    }

    pub fn eq(self, other: Expr) -> Self {
        Expr::Eq(Box::new(self), Box::new(other))
    }

    pub fn ne(self, other: Expr) -> Self {
        self.eq(other).not()
    }

    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    pub fn and(terms: Vec<Expr>) -> Self {
        Expr::And(terms)
    }

    pub fn or(terms: Vec<Expr>) -> Self {
        Expr::Or(terms)
    }

    pub fn ite(cond: Expr, then: Expr, els: Expr) -> Self {
        Expr::Ite(Box::new(cond), Box::new(then), Box::new(els))
    }

    pub fn select(self, index: Expr) -> Self {
        Expr::Select(Box::new(self), Box::new(index))
    }

    pub fn store(self, index: Expr, value: Expr) -> Self {
        Expr::Store(Box::new(self), Box::new(index), Box::new(value))
    }

    pub fn const_map(value: Expr) -> Self {
        Expr::ConstMap(Box::new(value))
    }

    pub fn apply(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Apply(name.into(), args)
    }

    /// Power of two as a constant.
    pub fn pow2(bits: usize) -> Self {
        Expr::Int(BigInt::one() << bits)
    }

    pub fn as_int(&self) -> Option<&BigInt> {
        match self {
            Expr::Int(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_var(&self) -> Option<&Var> {
        match self {
            Expr::Var(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_false(&self) -> bool {
        matches!(self, Expr::Bool(false))
    }

    fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Var(_) | Expr::Int(_) | Expr::Bool(_) => Vec::new(),
            Expr::Add(a, b)
            | Expr::Sub(a, b)
            | Expr::Mul(a, b)
            | Expr::Div(a, b)
            | Expr::Mod(a, b)
            | Expr::Lt(a, b)
            | Expr::Le(a, b)
            | Expr::Eq(a, b)
            | Expr::Select(a, b) => vec![a, b],
            Expr::Not(a) | Expr::ConstMap(a) => vec![a],
            Expr::Ite(a, b, c) | Expr::Store(a, b, c) => vec![a, b, c],
            Expr::And(es) | Expr::Or(es) | Expr::Apply(_, es) => es.iter().collect(),
        }
    }

    /// Collect the free variables of this expression into `out`.
    pub fn collect_vars(&self, out: &mut IndexSet<Var>) {
        if let Expr::Var(v) = self {
            out.insert(v.clone());
            return;
        }
        for child in self.children() {
            child.collect_vars(out);
        }
    }

    pub fn free_vars(&self) -> IndexSet<Var> {
        let mut out = IndexSet::new();
        self.collect_vars(&mut out);
        out
    }

    /// Names of uninterpreted functions applied in this expression, with arity.
    pub fn collect_functions(&self, out: &mut IndexSet<(String, usize)>) {
        if let Expr::Apply(name, args) = self {
            out.insert((name.clone(), args.len()));
        }
        for child in self.children() {
            child.collect_functions(out);
        }
    }

    /// Rebuild the expression, replacing variables for which `f` returns a value.
    pub fn substitute(&self, f: &impl Fn(&Var) -> Option<Expr>) -> Expr {
        let sub = |e: &Expr| Box::new(e.substitute(f));
        match self {
            Expr::Var(v) => f(v).unwrap_or_else(|| self.clone()),
            Expr::Int(_) | Expr::Bool(_) => self.clone(),
            Expr::Add(a, b) => Expr::Add(sub(a), sub(b)),
            Expr::Sub(a, b) => Expr::Sub(sub(a), sub(b)),
            Expr::Mul(a, b) => Expr::Mul(sub(a), sub(b)),
            Expr::Div(a, b) => Expr::Div(sub(a), sub(b)),
            Expr::Mod(a, b) => Expr::Mod(sub(a), sub(b)),
            Expr::Lt(a, b) => Expr::Lt(sub(a), sub(b)),
            Expr::Le(a, b) => Expr::Le(sub(a), sub(b)),
            Expr::Eq(a, b) => Expr::Eq(sub(a), sub(b)),
            Expr::Not(a) => Expr::Not(sub(a)),
            Expr::And(es) => Expr::And(es.iter().map(|e| e.substitute(f)).collect()),
            Expr::Or(es) => Expr::Or(es.iter().map(|e| e.substitute(f)).collect()),
            Expr::Ite(c, t, e) => Expr::Ite(sub(c), sub(t), sub(e)),
            Expr::Select(m, i) => Expr::Select(sub(m), sub(i)),
            Expr::Store(m, i, v) => Expr::Store(sub(m), sub(i), sub(v)),
            Expr::ConstMap(v) => Expr::ConstMap(sub(v)),
            Expr::Apply(name, args) => {
                Expr::Apply(name.clone(), args.iter().map(|e| e.substitute(f)).collect())
            }
        }
    }

    /// Rename every variable through `f`.
    pub fn map_vars(&self, f: &impl Fn(&Var) -> Var) -> Expr {
        self.substitute(&|v| Some(Expr::Var(f(v))))
    }

    /// Evaluate a closed scalar expression. Returns `None` when the expression
    /// mentions variables, maps or uninterpreted functions, or divides by zero.
    pub fn eval_const(&self) -> Option<Value> {
        let int = |e: &Expr| e.eval_const().and_then(|v| v.as_int().cloned());
        let boolean = |e: &Expr| e.eval_const().and_then(|v| v.as_bool());
        match self {
            Expr::Int(n) => Some(Value::Int(n.clone())),
            Expr::Bool(b) => Some(Value::Bool(*b)),
            Expr::Var(_)
            | Expr::Select(..)
            | Expr::Store(..)
            | Expr::ConstMap(_)
            | Expr::Apply(..) => None,
            Expr::Add(a, b) => Some(Value::Int(int(a)? + int(b)?)),
            Expr::Sub(a, b) => Some(Value::Int(int(a)? - int(b)?)),
            Expr::Mul(a, b) => Some(Value::Int(int(a)? * int(b)?)),
            Expr::Div(a, b) => euclid_div(&int(a)?, &int(b)?).map(Value::Int),
            Expr::Mod(a, b) => euclid_mod(&int(a)?, &int(b)?).map(Value::Int),
            Expr::Lt(a, b) => Some(Value::Bool(int(a)? < int(b)?)),
            Expr::Le(a, b) => Some(Value::Bool(int(a)? <= int(b)?)),
            Expr::Eq(a, b) => match (a.eval_const()?, b.eval_const()?) {
                (Value::Int(x), Value::Int(y)) => Some(Value::Bool(x == y)),
                (Value::Bool(x), Value::Bool(y)) => Some(Value::Bool(x == y)),
                _ => None,
            },
            Expr::Not(a) => Some(Value::Bool(!boolean(a)?)),
            Expr::And(es) => {
                let mut acc = true;
                for e in es {
                    acc &= boolean(e)?;
                }
                Some(Value::Bool(acc))
            }
            Expr::Or(es) => {
                let mut acc = false;
                for e in es {
                    acc |= boolean(e)?;
                }
                Some(Value::Bool(acc))
            }
            Expr::Ite(c, t, e) => {
                if boolean(c)? {
                    t.eval_const()
                } else {
                    e.eval_const()
                }
            }
        }
    }
}

/// SMT-LIB style division: the remainder is always non-negative.
pub fn euclid_div(a: &BigInt, b: &BigInt) -> Option<BigInt> {
    if b.is_zero() {
        return None;
    }
    let r = euclid_mod(a, b)?;
    Some((a - r) / b)
}

pub fn euclid_mod(a: &BigInt, b: &BigInt) -> Option<BigInt> {
    if b.is_zero() {
        return None;
    }
    let m = b.abs();
    let r = a % &m;
    Some(if r.is_negative() { r + m } else { r })
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Var(v) => write!(f, "{v}"),
            Expr::Int(n) => write!(f, "{n}"),
            Expr::Bool(b) => write!(f, "{b}"),
            Expr::Add(a, b) => write!(f, "({a} + {b})"),
            Expr::Sub(a, b) => write!(f, "({a} - {b})"),
            Expr::Mul(a, b) => write!(f, "({a} * {b})"),
            Expr::Div(a, b) => write!(f, "({a} / {b})"),
            Expr::Mod(a, b) => write!(f, "({a} % {b})"),
            Expr::Lt(a, b) => write!(f, "({a} < {b})"),
            Expr::Le(a, b) => write!(f, "({a} <= {b})"),
            Expr::Eq(a, b) => write!(f, "({a} == {b})"),
            Expr::Not(a) => write!(f, "!{a}"),
            Expr::And(es) => write_joined(f, es, " && ", "true"),
            Expr::Or(es) => write_joined(f, es, " || ", "false"),
            Expr::Ite(c, t, e) => write!(f, "({c} ? {t} : {e})"),
            Expr::Select(m, i) => write!(f, "{m}[{i}]"),
            Expr::Store(m, i, v) => write!(f, "{m}[{i} := {v}]"),
            Expr::ConstMap(v) => write!(f, "[_ := {v}]"),
            Expr::Apply(name, args) => {
                write!(f, "{name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, es: &[Expr], sep: &str, empty: &str) -> fmt::Result {
    if es.is_empty() {
        return write!(f, "{empty}");
    }
    write!(f, "(")?;
    for (i, e) in es.iter().enumerate() {
        if i > 0 {
            write!(f, "{sep}")?;
        }
        write!(f, "{e}")?;
    }
    write!(f, ")")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_indexing_is_sticky() {
        let v = Var::int("x");
        assert_eq!(v.smt_name(), "x");
        let a = v.indexed(1);
        assert_eq!(a.smt_name(), "x@1");
        assert_eq!(a.indexed(2).smt_name(), "x@1");
    }

    #[test]
    fn eval_const_folds_arithmetic_and_logic() {
        let e = Expr::int(7).add(Expr::int(5)).lt(Expr::int(13));
        assert_eq!(e.eval_const(), Some(Value::Bool(true)));
        let e = Expr::int(-7).modulo(Expr::int(3));
        assert_eq!(e.eval_const(), Some(Value::Int(BigInt::from(2))));
        let e = Expr::int(-7).div(Expr::int(3));
        assert_eq!(e.eval_const(), Some(Value::Int(BigInt::from(-3))));
        assert_eq!(Expr::int(1).div(Expr::int(0)).eval_const(), None);
        assert_eq!(Expr::var(&Var::int("x")).eval_const(), None);
    }

    #[test]
    fn substitute_replaces_only_matching_vars() {
        let x = Var::int("x");
        let y = Var::int("y");
        let e = Expr::var(&x).add(Expr::var(&y));
        let out = e.substitute(&|v| (v == &x).then(|| Expr::int(3)));
        assert_eq!(out, Expr::int(3).add(Expr::var(&y)));
        assert_eq!(out.free_vars().len(), 1);
    }

    #[test]
    fn display_is_readable() {
        let m = Var::memory();
        let e = Expr::var(&m).select(Expr::int(64));
        assert_eq!(e.to_string(), "mem[64]");
    }
}
