//! End-to-end verifier tests against a real solver; skipped when z3 is not
//! installed.

use equiv_ir::{AssertTag, BlockId, Cmd, Expr, ExitPayload, ProgramBuilder, Var};
use equiv_smt::{
    ProcessSolver, ProgramVerifier, SmtProgramVerifier, SmtVerifierOptions, SolverDialect,
    Verdict,
};
use num_bigint::BigInt;

fn verifier() -> Option<SmtProgramVerifier> {
    if !ProcessSolver::available(SolverDialect::Z3) {
        eprintln!("z3 not found, skipping");
        return None;
    }
    Some(SmtProgramVerifier::new(SmtVerifierOptions::default()))
}

#[test]
fn absolute_value_is_non_negative() {
    let Some(verifier) = verifier() else {
        return;
    };
    let x = Var::int("x");
    let y = Var::int("y");
    let mut b = ProgramBuilder::new("abs");
    let entry = b.new_block();
    let neg = b.new_block();
    let pos = b.new_block();
    let join = b.new_block();
    b.push(entry, Cmd::branch(Expr::var(&x).lt(Expr::int(0)), neg, pos));
    b.push(neg, Cmd::assign(&y, Expr::int(0).sub(Expr::var(&x))));
    b.push(neg, Cmd::jump(join));
    b.push(pos, Cmd::assign(&y, Expr::var(&x)));
    b.push(pos, Cmd::jump(join));
    b.push(join, Cmd::assert(Expr::int(0).le(Expr::var(&y)), "non-negative"));
    b.push(
        join,
        Cmd::Return {
            payload: ExitPayload::Values(vec![Expr::var(&y)]),
        },
    );
    let p = b.build().expect("well formed");
    let verdict = verifier.verify(&p, "abs").expect("verifies");
    assert_eq!(verdict, Verdict::Unsat);
}

#[test]
fn failing_assert_yields_model_at_end_of_path() {
    let Some(verifier) = verifier() else {
        return;
    };
    let x = Var::int("x");
    let y = Var::int("y");
    let mut b = ProgramBuilder::new("cex");
    let entry = b.new_block();
    let bad = b.new_block();
    let ok = b.new_block();
    b.push(entry, Cmd::mem_store(0, Expr::var(&x)));
    b.push(entry, Cmd::MemLoad { lhs: y.clone(), offset: Expr::int(0) });
    b.push(entry, Cmd::branch(Expr::var(&y).eq(Expr::int(5)), bad, ok));
    b.push(
        bad,
        Cmd::Assert {
            cond: Expr::ff(),
            msg: "x is five".into(),
            meta: equiv_ir::AssertMeta::tagged(AssertTag::TraceEquivalence),
        },
    );
    b.push(ok, Cmd::Revert);
    let p = b.build().expect("well formed");
    match verifier.verify(&p, "cex").expect("verifies") {
        Verdict::Sat(model) => {
            assert_eq!(model.int(&x), Some(&BigInt::from(5)));
            assert_eq!(model.int(&y), Some(&BigInt::from(5)));
            assert!(model.is_reachable(BlockId::new(1)));
            assert!(!model.is_reachable(BlockId::new(2)));
            let failed = model.failed_asserts();
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].meta.tag, Some(AssertTag::TraceEquivalence));
        }
        other => panic!("Expected SAT, got: {other:?}"),
    }
}

#[test]
fn contradictory_prelude_is_a_sanity_failure() {
    let Some(verifier) = verifier() else {
        return;
    };
    let mut b = ProgramBuilder::new("vacuous");
    let entry = b.new_block();
    b.push(entry, Cmd::assume(Expr::ff()));
    b.push(entry, Cmd::assert(Expr::ff(), "unreachable"));
    let p = b.build().expect("well formed");
    assert_eq!(
        verifier.verify(&p, "vacuous").expect("verifies"),
        Verdict::SanityFail
    );
}

#[test]
fn dumps_transcripts() {
    let Some(_) = verifier() else {
        return;
    };
    let dir = tempfile::tempdir().expect("tempdir");
    let verifier = SmtProgramVerifier::new(SmtVerifierOptions {
        dump_dir: Some(dir.path().to_path_buf()),
        ..SmtVerifierOptions::default()
    });
    let mut b = ProgramBuilder::new("dump");
    let entry = b.new_block();
    b.push(entry, Cmd::assert(Expr::tt(), "trivial"));
    let p = b.build().expect("well formed");
    assert_eq!(verifier.verify(&p, "dump me").expect("verifies"), Verdict::Unsat);
    let text = std::fs::read_to_string(dir.path().join("dump_me.smt2")).expect("dump written");
    assert!(text.contains("(check-sat)"));
}
