//! Backend parity tests: z3 and cvc5 must produce the same SAT/UNSAT verdicts
//! on a set of small formulas.
//!
//! A backend whose binary is not on `PATH` is skipped.

use equiv_smt::backends::{ProcessSolver, SolverDialect};
use equiv_smt::solver::{SatResult, SmtSolver};
use equiv_smt::sorts::SmtSort;
use equiv_smt::terms::SmtTerm;

fn available_dialects() -> Vec<SolverDialect> {
    [SolverDialect::Z3, SolverDialect::Cvc5]
        .into_iter()
        .filter(|d| ProcessSolver::available(*d))
        .collect()
}

fn check_all(setup: impl Fn(&mut ProcessSolver)) -> Vec<SatResult> {
    available_dialects()
        .into_iter()
        .map(|d| {
            let mut solver = ProcessSolver::new(d).expect("solver starts");
            setup(&mut solver);
            solver.check_sat().expect("check-sat")
        })
        .collect()
}

#[test]
fn simple_sat_and_unsat() {
    for result in check_all(|s| {
        s.declare_var("x", &SmtSort::Int).expect("declare");
        s.assert(&SmtTerm::and(vec![
            SmtTerm::var("x").gt(SmtTerm::int(0)),
            SmtTerm::var("x").lt(SmtTerm::int(10)),
        ]))
        .expect("assert");
    }) {
        assert_eq!(result, SatResult::Sat);
    }
    for result in check_all(|s| {
        s.declare_var("x", &SmtSort::Int).expect("declare");
        s.assert(&SmtTerm::and(vec![
            SmtTerm::var("x").gt(SmtTerm::int(0)),
            SmtTerm::var("x").lt(SmtTerm::int(0)),
        ]))
        .expect("assert");
    }) {
        assert_eq!(result, SatResult::Unsat);
    }
}

#[test]
fn arrays_and_functions() {
    // select(store(m, k, v), k) != v is unsat
    for result in check_all(|s| {
        s.declare_var("m", &SmtSort::IntArray).expect("declare");
        s.declare_var("k", &SmtSort::Int).expect("declare");
        s.declare_var("v", &SmtSort::Int).expect("declare");
        let m = SmtTerm::var("m").store(SmtTerm::var("k"), SmtTerm::var("v"));
        s.assert(&m.select(SmtTerm::var("k")).eq(SmtTerm::var("v")).not())
            .expect("assert");
    }) {
        assert_eq!(result, SatResult::Unsat);
    }
    // f(a) != f(b) with a == b is unsat
    for result in check_all(|s| {
        s.declare_fun("f", 1).expect("declare fun");
        s.declare_var("a b", &SmtSort::Int).expect("declare");
        s.declare_var("b", &SmtSort::Int).expect("declare");
        s.assert(&SmtTerm::var("a b").eq(SmtTerm::var("b"))).expect("assert");
        s.assert(
            &SmtTerm::app("f", vec![SmtTerm::var("a b")])
                .eq(SmtTerm::app("f", vec![SmtTerm::var("b")]))
                .not(),
        )
        .expect("assert");
    }) {
        assert_eq!(result, SatResult::Unsat);
    }
}

#[test]
fn models_carry_big_integers() {
    for dialect in available_dialects() {
        let mut s = ProcessSolver::new(dialect).expect("solver starts");
        s.declare_var("x", &SmtSort::Int).expect("declare");
        s.assert(
            &SmtTerm::var("x").eq(SmtTerm::int(1u8).mul(SmtTerm::IntLit(
                num_bigint::BigInt::from(1u8) << 200,
            ))),
        )
        .expect("assert");
        s.assert(&SmtTerm::var("x").gt(SmtTerm::int(-1))).expect("assert");
        let (result, model) = s
            .check_sat_with_model(&[("x", &SmtSort::Int)])
            .expect("check-sat");
        assert_eq!(result, SatResult::Sat);
        let model = model.expect("model on sat");
        assert_eq!(
            model.get_int("x"),
            Some(&(num_bigint::BigInt::from(1u8) << 200))
        );
    }
}
