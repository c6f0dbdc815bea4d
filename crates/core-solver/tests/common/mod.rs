//! Shared helpers for the scenario tests.
#![allow(dead_code)] // each test binary uses a subset

use core_config::{Method, Options};
use core_model::Model;
use core_solver::Solver;

/// Options tuned for tests: no file output, explicit method and tolerances.
pub fn test_options(method: Method, rtol: f64, atol: f64, t_end: f64) -> Options {
    let mut cfg = Options {
        method,
        rtol,
        atol,
        t_end: Some(t_end),
        ..Options::default()
    };
    cfg.output.sampled = false;
    cfg
}

/// Build and initialize a solver over `model`.
pub fn solver(model: impl Model + 'static, cfg: Options) -> Solver {
    let mut s = Solver::new(Box::new(model), cfg).expect("setup");
    s.init().expect("init");
    s
}

/// Run to completion, checking trajectory invariants after every step.
pub fn run_checked(s: &mut Solver) {
    let t_end = s.t_end();
    while s.step_bounded(t_end).expect("step").is_some() {
        s.check_invariants();
    }
    s.finish().expect("finish");
}
