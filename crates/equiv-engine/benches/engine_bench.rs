use criterion::{black_box, criterion_group, criterion_main, Criterion};
use equiv_engine::equivalence::EquivalenceLimits;
use equiv_engine::instrumentation::TraceInstrumenter;
use equiv_engine::loops::config::extract_primary_loop;
use equiv_engine::loops::LoopSummarizer;
use equiv_engine::{check_equivalence, EquivalenceOptions};
use equiv_ir::proptest_generators::BufferScript;
use equiv_ir::{Cmd, ExitPayload, Expr, Program, ProgramBuilder, Var};
use equiv_smt::{ProgramVerifier, Verdict, VerifyError};

/// Proves everything, so the benches measure the engine alone.
struct NoSolver;

impl ProgramVerifier for NoSolver {
    fn verify(&self, _rule: &Program, _name: &str) -> Result<Verdict, VerifyError> {
        Ok(Verdict::Unsat)
    }
}

fn count_to_n() -> Program {
    let x = Var::int("x");
    let n = Var::int("n");
    let mut b = ProgramBuilder::new("count");
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
    b.build().unwrap()
}

fn buffer_program() -> Program {
    BufferScript {
        length_words: 4,
        writes: vec![2, 0, 1, 2, 3],
    }
    .to_program("buffer")
}

fn bench_loop_config(c: &mut Criterion) {
    let p = count_to_n();
    c.bench_function("loop_config_extraction", |b| {
        b.iter(|| extract_primary_loop(black_box(&p)))
    });
}

fn bench_summarization(c: &mut Criterion) {
    let p = count_to_n();
    c.bench_function("loop_summarization", |b| {
        b.iter(|| {
            let mut summarizer = LoopSummarizer::new(&NoSolver, &TraceInstrumenter, EquivalenceLimits::default());
            summarizer
                .try_summarize_loops(black_box(p.clone()), black_box(p.clone()))
                .unwrap()
        })
    });
}

fn bench_check_equivalence(c: &mut Criterion) {
    let p = buffer_program();
    let options = EquivalenceOptions::default();
    c.bench_function("check_equivalence_buffers", |b| {
        b.iter(|| check_equivalence(black_box(&p), black_box(&p), &options, &NoSolver).unwrap())
    });
}

criterion_group!(
    benches,
    bench_loop_config,
    bench_summarization,
    bench_check_equivalence
);
criterion_main!(benches);
