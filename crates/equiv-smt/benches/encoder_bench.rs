use criterion::{black_box, criterion_group, criterion_main, Criterion};
use equiv_ir::{Cmd, Expr, ExitPayload, Program, ProgramBuilder, Var};

/// `n` diamonds in sequence, each conditionally writing memory.
fn diamond_chain(n: usize) -> Program {
    let x = Var::int("x");
    let acc = Var::int("acc");
    let mut b = ProgramBuilder::new("chain");
    let mut current = b.new_block();
    b.param(x.clone());
    b.push(current, Cmd::assign(&acc, Expr::int(0)));
    for i in 0..n {
        let left = b.new_block();
        let right = b.new_block();
        let join = b.new_block();
        b.push(
            current,
            Cmd::branch(Expr::var(&x).modulo(Expr::int(i as u64 + 2)).eq(Expr::int(0)), left, right),
        );
        b.push(left, Cmd::assign(&acc, Expr::var(&acc).add(Expr::int(i as u64))));
        b.push(left, Cmd::mem_store(32 * i as u64, Expr::var(&acc)));
        b.push(left, Cmd::jump(join));
        b.push(right, Cmd::assign(&acc, Expr::var(&acc).sub(Expr::int(1))));
        b.push(right, Cmd::jump(join));
        current = join;
    }
    b.push(current, Cmd::assert(Expr::var(&acc).le(Expr::int(1_000_000)), "bounded"));
    b.push(
        current,
        Cmd::Return {
            payload: ExitPayload::Values(vec![Expr::var(&acc)]),
        },
    );
    b.build().expect("chain is well formed")
}

fn bench_encode_chain_16(c: &mut Criterion) {
    let p = diamond_chain(16);
    c.bench_function("encode_chain_16", |b| {
        b.iter(|| equiv_smt::encode_program(black_box(&p)))
    });
}

fn bench_encode_chain_128(c: &mut Criterion) {
    let p = diamond_chain(128);
    c.bench_function("encode_chain_128", |b| {
        b.iter(|| equiv_smt::encode_program(black_box(&p)))
    });
}

criterion_group!(benches, bench_encode_chain_16, bench_encode_chain_128);
criterion_main!(benches);
