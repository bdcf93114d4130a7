//! The basic unit of work: instrument both sides, generate a VC, build the
//! rule and ask the solver.

use std::sync::OnceLock;

use equiv_ir::{Annotation, AssertMeta, AssertTag, Cmd, Expr, Program, Var};
use equiv_smt::{ProgramModel, ProgramVerifier, Verdict};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::EngineResult;
use crate::instrumentation::{
    InstrumentationControl, InstrumentedProgram, Instrumenter, TraceTarget,
};
use crate::rule_generator::{vc_program, CallingConvention, RuleGenerator, Side};

/// What a VC generator knows about one inlined side.
#[derive(Debug, Clone, Copy)]
pub struct VcContext {
    pub side: Side,
    pub call: u32,
}

impl VcContext {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            call: side.call(),
        }
    }

    /// Storage of this side at the end of its execution.
    pub fn storage(&self) -> Var {
        Var::storage().indexed(self.call)
    }
}

/// Produces the assertion fragment checked after both sides ran. The
/// fragment refers to the sides through indexed variables and must not
/// index its own.
pub trait VcGenerator: Send + Sync {
    fn describe(&self) -> String;

    fn generate_vc(
        &self,
        a: &InstrumentedProgram,
        a_ctx: &VcContext,
        b: &InstrumentedProgram,
        b_ctx: &VcContext,
    ) -> EngineResult<Program>;
}

/// A program as compared: the original, its instrumentation and the call
/// index it was inlined with.
#[derive(Debug, Clone)]
pub struct Instrumentation {
    pub original: Program,
    pub result: InstrumentedProgram,
    pub call_id: u32,
}

/// Structured summary of a rule check, computed on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleOutput {
    pub rule: String,
    pub verdict: String,
    pub failed_asserts: Vec<String>,
    pub reached_blocks: usize,
}

#[derive(Debug)]
pub struct CheckResult {
    pub verdict: Verdict,
    /// The merged program submitted to the solver.
    pub rule: Program,
    pub a: Instrumentation,
    pub b: Instrumentation,
    rule_output: OnceLock<RuleOutput>,
}

impl CheckResult {
    pub fn new(verdict: Verdict, rule: Program, a: Instrumentation, b: Instrumentation) -> Self {
        Self {
            verdict,
            rule,
            a,
            b,
            rule_output: OnceLock::new(),
        }
    }

    pub fn model(&self) -> Option<&ProgramModel> {
        self.verdict.model()
    }

    pub fn side(&self, side: Side) -> &Instrumentation {
        match side {
            Side::A => &self.a,
            Side::B => &self.b,
        }
    }

    pub fn rule_output(&self) -> &RuleOutput {
        self.rule_output.get_or_init(|| {
            let (failed_asserts, reached_blocks) = match self.model() {
                Some(m) => (
                    m.failed_asserts().iter().map(|f| f.msg.clone()).collect(),
                    self.rule.blocks.keys().filter(|b| m.is_reachable(**b)).count(),
                ),
                None => (Vec::new(), 0),
            };
            RuleOutput {
                rule: self.rule.name.clone(),
                verdict: self.verdict.name().to_string(),
                failed_asserts,
                reached_blocks,
            }
        })
    }
}

/// Instruments, merges and checks program pairs.
pub struct TraceEquivalenceChecker<'a> {
    verifier: &'a dyn ProgramVerifier,
    instrumenter: &'a dyn Instrumenter,
    rules: RuleGenerator<&'a dyn CallingConvention>,
}

impl<'a> TraceEquivalenceChecker<'a> {
    pub fn new(
        verifier: &'a dyn ProgramVerifier,
        instrumenter: &'a dyn Instrumenter,
        convention: &'a dyn CallingConvention,
    ) -> Self {
        Self {
            verifier,
            instrumenter,
            rules: RuleGenerator::new(convention),
        }
    }

    pub fn verifier(&self) -> &'a dyn ProgramVerifier {
        self.verifier
    }

    pub fn instrumenter(&self) -> &'a dyn Instrumenter {
        self.instrumenter
    }

    pub fn rules(&self) -> &RuleGenerator<&'a dyn CallingConvention> {
        &self.rules
    }

    pub fn instrument_and_check(
        &self,
        rule_name: &str,
        a: (&Program, &InstrumentationControl),
        b: (&Program, &InstrumentationControl),
        vc: &dyn VcGenerator,
    ) -> EngineResult<CheckResult> {
        let instrumented_a = self.instrumenter.instrument(a.0, a.1)?;
        let instrumented_b = self.instrumenter.instrument(b.0, b.1)?;
        let a_ctx = VcContext::new(Side::A);
        let b_ctx = VcContext::new(Side::B);
        let fragment = vc.generate_vc(&instrumented_a, &a_ctx, &instrumented_b, &b_ctx)?;
        let rule = self.rules.generate_rule(
            &instrumented_a.program,
            &instrumented_b.program,
            &fragment,
            rule_name,
        )?;
        debug!(rule = rule_name, vc = %vc.describe(), "checking rule");
        let verdict = self.verifier.verify(&rule, rule_name)?;
        info!(rule = rule_name, vc = %vc.describe(), verdict = verdict.name(), "trace check finished");
        Ok(CheckResult::new(
            verdict,
            rule,
            Instrumentation {
                original: a.0.clone(),
                result: instrumented_a,
                call_id: a_ctx.call,
            },
            Instrumentation {
                original: b.0.clone(),
                result: instrumented_b,
                call_id: b_ctx.call,
            },
        ))
    }
}

/// Assert that the traces agree at `index`. With `tolerate_revert` a path
/// where either side reverts passes.
pub fn trace_equality_at(
    index: &Var,
    a: (&InstrumentedProgram, &VcContext),
    b: (&InstrumentedProgram, &VcContext),
    tolerate_revert: bool,
) -> Vec<Cmd> {
    let value_a = Var::int("vc!trace!a");
    let value_b = Var::int("vc!trace!b");
    let equal = Var::bool("vc!trace!eq");
    let same = Expr::var(&value_a).eq(Expr::var(&value_b));
    let cond = if tolerate_revert {
        Expr::or(vec![
            same,
            a.0.is_reverting(a.1.call),
            b.0.is_reverting(b.1.call),
        ])
    } else {
        same
    };
    vec![
        Cmd::Annotation(Annotation::IndexHolder(index.clone())),
        Cmd::assign(&value_a, a.0.trace_value_at(a.1.call, Expr::var(index))),
        Cmd::assign(&value_b, b.0.trace_value_at(b.1.call, Expr::var(index))),
        Cmd::assign(&equal, cond),
        Cmd::Assert {
            cond: Expr::var(&equal),
            msg: "traces equal".to_string(),
            meta: AssertMeta::tagged(AssertTag::TraceEquivalence),
        },
    ]
}

/// Compares call or log traces at a skolem index; reverting paths pass.
#[derive(Debug, Clone, Copy)]
pub struct LogOrCallTracer {
    pub target: TraceTarget,
}

impl LogOrCallTracer {
    pub fn new(target: TraceTarget) -> Self {
        Self { target }
    }
}

fn skolem_index() -> Var {
    Var::int("vc!skolem")
}

impl VcGenerator for LogOrCallTracer {
    fn describe(&self) -> String {
        format!("{} trace", self.target)
    }

    fn generate_vc(
        &self,
        a: &InstrumentedProgram,
        a_ctx: &VcContext,
        b: &InstrumentedProgram,
        b_ctx: &VcContext,
    ) -> EngineResult<Program> {
        let cmds = trace_equality_at(&skolem_index(), (a, a_ctx), (b, b_ctx), true);
        Ok(vc_program("assertion", cmds))
    }
}

/// [`LogOrCallTracer`] restricted to trace positions below `bound`.
#[derive(Debug, Clone, Copy)]
pub struct BoundedLogOrCallTracer {
    pub target: TraceTarget,
    pub bound: u32,
}

impl VcGenerator for BoundedLogOrCallTracer {
    fn describe(&self) -> String {
        format!("{} trace below {}", self.target, self.bound)
    }

    fn generate_vc(
        &self,
        a: &InstrumentedProgram,
        a_ctx: &VcContext,
        b: &InstrumentedProgram,
        b_ctx: &VcContext,
    ) -> EngineResult<Program> {
        let skolem = skolem_index();
        let mut cmds = vec![Cmd::assume(
            Expr::var(&skolem).lt(Expr::int(self.bound)),
        )];
        cmds.extend(trace_equality_at(&skolem, (a, a_ctx), (b, b_ctx), true));
        Ok(vc_program("final assertion", cmds))
    }
}

/// Compares exits, reverts included, and the final storage at a skolem key.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgramExitTracer;

impl ProgramExitTracer {
    pub fn storage_key() -> Var {
        Var::int("vc!storage!key")
    }
}

impl VcGenerator for ProgramExitTracer {
    fn describe(&self) -> String {
        "exit trace and storage".to_string()
    }

    fn generate_vc(
        &self,
        a: &InstrumentedProgram,
        a_ctx: &VcContext,
        b: &InstrumentedProgram,
        b_ctx: &VcContext,
    ) -> EngineResult<Program> {
        // every program has at most one exit, so the index is 0
        let index = Var::int("vc!exit!index");
        let mut cmds = vec![Cmd::assign(&index, Expr::int(0))];
        cmds.extend(trace_equality_at(&index, (a, a_ctx), (b, b_ctx), false));

        let key = Self::storage_key();
        let a_value = Var::int("vc!storage!a");
        let b_value = Var::int("vc!storage!b");
        cmds.extend([
            Cmd::assign(&a_value, Expr::var(&a_ctx.storage()).select(Expr::var(&key))),
            Cmd::assign(&b_value, Expr::var(&b_ctx.storage()).select(Expr::var(&key))),
            Cmd::Assert {
                cond: Expr::var(&a_value).eq(Expr::var(&b_value)),
                msg: "storage equal post execution".to_string(),
                meta: AssertMeta::tagged(AssertTag::StorageComparison {
                    a_value: a_value.clone(),
                    b_value: b_value.clone(),
                    key: key.clone(),
                }),
            },
        ]);
        Ok(vc_program("assertion check", cmds))
    }
}
