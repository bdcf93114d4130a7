#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use equiv_ir::{
    Annotation, AssertTag, Cmd, EventKind, ExitPayload, Expr, Program, ProgramBuilder, Value, Var,
};
use equiv_smt::{FailedAssert, ProgramModel, ProgramVerifier, Verdict, VerifyError};
use num_bigint::BigInt;

/// Gives the same verdict to every query and records the rule names.
pub struct Always {
    verdict: Verdict,
    rules: Mutex<Vec<String>>,
}

impl Always {
    pub fn new(verdict: Verdict) -> Self {
        Self {
            verdict,
            rules: Mutex::new(Vec::new()),
        }
    }

    pub fn unsat() -> Self {
        Self::new(Verdict::Unsat)
    }

    pub fn rules(&self) -> Vec<String> {
        self.rules.lock().expect("lock").clone()
    }
}

impl ProgramVerifier for Always {
    fn verify(&self, _rule: &Program, name: &str) -> Result<Verdict, VerifyError> {
        self.rules.lock().expect("lock").push(name.to_string());
        Ok(self.verdict.clone())
    }
}

/// Answers each query from the rule program and its name, recording the
/// names.
pub struct Modelled {
    answer: fn(&Program, &str) -> Verdict,
    rules: Mutex<Vec<String>>,
}

impl Modelled {
    pub fn new(answer: fn(&Program, &str) -> Verdict) -> Self {
        Self {
            answer,
            rules: Mutex::new(Vec::new()),
        }
    }

    pub fn rules(&self) -> Vec<String> {
        self.rules.lock().expect("lock").clone()
    }
}

impl ProgramVerifier for Modelled {
    fn verify(&self, rule: &Program, name: &str) -> Result<Verdict, VerifyError> {
        self.rules.lock().expect("lock").push(name.to_string());
        Ok((self.answer)(rule, name))
    }
}

/// A model of `rule` where every block is reached, every trace comparison
/// fails at position 0, and side A recorded its event there while side B
/// recorded nothing.
pub fn missing_in_b(rule: &Program) -> Verdict {
    let zero = || Value::Int(BigInt::from(0));
    let mut values: HashMap<Var, Value> = HashMap::new();
    let mut failed = Vec::new();
    for (ptr, cmd) in rule.commands() {
        match cmd {
            Cmd::Annotation(Annotation::IndexHolder(v)) => {
                values.insert(v.clone(), zero());
            }
            Cmd::Annotation(Annotation::TraceIndexMarker { index, .. }) => {
                let at = if ptr.block.call == 1 { 0 } else { -1 };
                values.insert(index.clone(), Value::Int(BigInt::from(at)));
            }
            Cmd::Assert { msg, meta, .. } if meta.tag == Some(AssertTag::TraceEquivalence) => {
                failed.push(FailedAssert {
                    ptr,
                    msg: msg.clone(),
                    meta: meta.clone(),
                });
            }
            _ => {}
        }
    }
    let reachable = rule.blocks.keys().copied().collect();
    Verdict::Sat(ProgramModel::new(values, reachable, failed))
}

/// For a loop input pairing query: `Some(true)` when every pair reads
/// variables of the same name.
pub fn pairs_same_names(rule: &Program) -> Option<bool> {
    let mut sources: HashMap<&Var, &str> = HashMap::new();
    let mut pairs = None;
    for (_, cmd) in rule.commands() {
        match cmd {
            Cmd::Assign {
                lhs,
                rhs: Expr::Var(src),
            } if lhs.name.starts_with("loop!in!") => {
                sources.insert(lhs, &src.name);
            }
            Cmd::Assert {
                cond: Expr::And(terms),
                msg,
                ..
            } if msg == "paired values agree" => pairs = Some(terms),
            _ => {}
        }
    }
    let same = pairs?.iter().all(|t| match t {
        Expr::Eq(x, y) => match (x.as_ref(), y.as_ref()) {
            (Expr::Var(x), Expr::Var(y)) => {
                sources.get(x).is_some() && sources.get(x) == sources.get(y)
            }
            _ => false,
        },
        _ => false,
    });
    Some(same)
}

/// Holders of a pairing query all set to 0, so any pairing fits the model.
pub fn zero_holders(rule: &Program) -> Verdict {
    let values = rule
        .commands()
        .filter_map(|(_, cmd)| match cmd {
            Cmd::Assign { lhs, .. } if lhs.name.starts_with("loop!in!") => {
                Some((lhs.clone(), Value::Int(BigInt::from(0))))
            }
            _ => None,
        })
        .collect();
    let reachable = rule.blocks.keys().copied().collect();
    Verdict::Sat(ProgramModel::new(values, reachable, Vec::new()))
}

/// `return x + k`
pub fn add_constant(name: &str, k: i64) -> Program {
    let x = Var::int("x");
    let mut b = ProgramBuilder::new(name);
    let entry = b.new_block();
    b.param(x.clone());
    b.push(
        entry,
        Cmd::Return {
            payload: ExitPayload::Values(vec![Expr::var(&x).add(Expr::int(k))]),
        },
    );
    b.build().expect("well formed")
}

/// Logs a word written from `x` and returns nothing.
pub fn logging(name: &str) -> Program {
    let x = Var::int("x");
    let mut b = ProgramBuilder::new(name);
    let entry = b.new_block();
    b.param(x.clone());
    b.push(entry, Cmd::mem_store(64, Expr::var(&x)));
    b.push(
        entry,
        Cmd::Event {
            kind: EventKind::Log,
            offset: Expr::int(64),
            length: Expr::int(32),
            context: vec![],
        },
    );
    b.push(
        entry,
        Cmd::Return {
            payload: ExitPayload::Values(vec![]),
        },
    );
    b.build().expect("well formed")
}

/// `x := 0; while (x < n) x := x + 1; return x`
pub fn count_to_n(name: &str) -> Program {
    let x = Var::int("x");
    let n = Var::int("n");
    let mut b = ProgramBuilder::new(name);
    let entry = b.new_block();
    let head = b.new_block();
    let body = b.new_block();
    let exit = b.new_block();
    b.param(n.clone());
    b.push(entry, Cmd::assign(&x, Expr::int(0)));
    b.push(entry, Cmd::jump(head));
    b.push(head, Cmd::branch(Expr::var(&x).lt(Expr::var(&n)), body, exit));
    b.push(body, Cmd::assign(&x, Expr::var(&x).add(Expr::int(1))));
    b.push(body, Cmd::jump(head));
    b.push(
        exit,
        Cmd::Return {
            payload: ExitPayload::Values(vec![Expr::var(&x)]),
        },
    );
    b.build().expect("well formed")
}

/// Route engine logs through the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `i := 0; j := 0; while (i < 10) { i += 1; j += 2 }; return j`
pub fn two_counters(name: &str) -> Program {
    let i = Var::int("i");
    let j = Var::int("j");
    let mut b = ProgramBuilder::new(name);
    let entry = b.new_block();
    let head = b.new_block();
    let body = b.new_block();
    let exit = b.new_block();
    b.push(entry, Cmd::assign(&i, Expr::int(0)));
    b.push(entry, Cmd::assign(&j, Expr::int(0)));
    b.push(entry, Cmd::jump(head));
    b.push(head, Cmd::branch(Expr::var(&i).lt(Expr::int(10)), body, exit));
    b.push(body, Cmd::assign(&i, Expr::var(&i).add(Expr::int(1))));
    b.push(body, Cmd::assign(&j, Expr::var(&j).add(Expr::int(2))));
    b.push(body, Cmd::jump(head));
    b.push(
        exit,
        Cmd::Return {
            payload: ExitPayload::Values(vec![Expr::var(&j)]),
        },
    );
    b.build().expect("well formed")
}

/// Like [`logging`] but without the event.
pub fn silent(name: &str) -> Program {
    let x = Var::int("x");
    let mut b = ProgramBuilder::new(name);
    let entry = b.new_block();
    b.param(x.clone());
    b.push(entry, Cmd::mem_store(64, Expr::var(&x)));
    b.push(
        entry,
        Cmd::Return {
            payload: ExitPayload::Values(vec![]),
        },
    );
    b.build().expect("well formed")
}

/// [`two_counters`] with the loop test on `j`, so `j` is read first:
/// `i := 0; j := 0; while (j < 20) { j += 2; i += 1 }; return j`
pub fn two_counters_by_j(name: &str) -> Program {
    let i = Var::int("i");
    let j = Var::int("j");
    let mut b = ProgramBuilder::new(name);
    let entry = b.new_block();
    let head = b.new_block();
    let body = b.new_block();
    let exit = b.new_block();
    b.push(entry, Cmd::assign(&i, Expr::int(0)));
    b.push(entry, Cmd::assign(&j, Expr::int(0)));
    b.push(entry, Cmd::jump(head));
    b.push(head, Cmd::branch(Expr::var(&j).lt(Expr::int(20)), body, exit));
    b.push(body, Cmd::assign(&j, Expr::var(&j).add(Expr::int(2))));
    b.push(body, Cmd::assign(&i, Expr::var(&i).add(Expr::int(1))));
    b.push(body, Cmd::jump(head));
    b.push(
        exit,
        Cmd::Return {
            payload: ExitPayload::Values(vec![Expr::var(&j)]),
        },
    );
    b.build().expect("well formed")
}
