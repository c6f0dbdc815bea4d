//! Requantization throughput on the linear decay problem.

use core_config::{Method, Options};
use core_model::LinearModel;
use core_solver::Solver;
use criterion::{criterion_group, criterion_main, Criterion};

const DECAY: &str = r#"
    name = "decay"
    t_end = 5.0

    [[state]]
    name = "x"
    start = 1.0
    [state.der]
    x = -1.0
"#;

fn bench_decay(c: &mut Criterion) {
    for (label, method) in [("qss2", Method::Qss2), ("liqss2", Method::Liqss2)] {
        c.bench_function(&format!("decay_{label}"), |b| {
            b.iter(|| {
                let model = LinearModel::from_str_named(DECAY, "decay").unwrap();
                let mut cfg = Options {
                    method,
                    rtol: 1.0e-4,
                    atol: 1.0e-6,
                    ..Options::default()
                };
                cfg.output.sampled = false;
                let mut solver = Solver::new(Box::new(model), cfg).unwrap();
                solver.init().unwrap();
                solver.simulate().unwrap().requantizations
            })
        });
    }
}

criterion_group!(benches, bench_decay);
criterion_main!(benches);
