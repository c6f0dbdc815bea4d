//! Input sources: discontinuity scheduling and observer propagation.

mod common;

use common::{run_checked, solver, test_options};
use core_config::Method;
use core_model::LinearModel;

const INTEGRATOR: &str = r#"
    name = "integrator"

    [[state]]
    name = "x"
    start = 0.0
    [state.der]
    u = 1.0

    [[input]]
    name = "u"
    start = 0.0
"#;

#[test]
fn step_input_fires_exactly_at_the_discontinuity() {
    // x' = u with u stepping 0 -> 1 at t = 1: x(2) = 1 and the only input
    // event is the step itself (constant segments schedule nothing).
    let mut cfg = test_options(Method::Qss2, 1.0e-4, 1.0e-6, 2.0);
    cfg.fxn.insert("u".into(), "step[0,1,1]".into());
    let model = LinearModel::from_str_named(INTEGRATOR, "integrator").unwrap();
    let mut s = solver(model, cfg);
    run_checked(&mut s);

    assert_eq!(s.stats.input_events, 1);
    assert!((s.value("u", 2.0) - 1.0).abs() < 1.0e-12);
    assert!(
        (s.value("x", 2.0) - 1.0).abs() < 1.0e-9,
        "x(2) = {}",
        s.value("x", 2.0)
    );
    // Before the step nothing accumulated.
    assert!(s.value("x", 0.0).abs() < 1.0e-12);
}

#[test]
fn ramp_input_integrates_quadratically() {
    let mut cfg = test_options(Method::Qss2, 1.0e-5, 1.0e-7, 2.0);
    cfg.fxn.insert("u".into(), "ramp[0,1]".into());
    let model = LinearModel::from_str_named(INTEGRATOR, "integrator").unwrap();
    let mut s = solver(model, cfg);
    run_checked(&mut s);
    // x = t^2 / 2.
    assert!(
        (s.value("x", 2.0) - 2.0).abs() < 1.0e-4,
        "x(2) = {}",
        s.value("x", 2.0)
    );
}
