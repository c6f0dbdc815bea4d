//! Scenario: stiff self-coupled state driven by a slow forcing input. Plain
//! QSS would chatter at the stiffness scale; LIQSS must settle onto the slow
//! manifold with a bounded event count.

mod common;

use common::{run_checked, solver, test_options};
use core_config::Method;
use core_model::LinearModel;

const STIFF: &str = r#"
    name = "stiff"

    [[state]]
    name = "x"
    start = 0.0
    [state.der]
    x = -1000.0
    u = 999.0

    [[input]]
    name = "u"
    start = 0.0
"#;

/// Particular solution of x' = -1000 x + 999 sin t.
fn exact(t: f64) -> f64 {
    999.0 * (1000.0 * t.sin() - t.cos()) / (1000.0f64 * 1000.0 + 1.0)
}

#[test]
fn liqss2_settles_on_slow_manifold() {
    let t_end = 10.0;
    let model = LinearModel::from_str_named(STIFF, "stiff").unwrap();
    let mut cfg = test_options(Method::Liqss2, 1.0e-4, 1.0e-6, t_end);
    cfg.fxn.insert("u".into(), "sin[1,1,0]".into());
    let mut s = solver(model, cfg);
    run_checked(&mut s);

    let got = s.value("x", t_end);
    let want = exact(t_end);
    assert!(
        (got - want).abs() < 1.0e-3,
        "x({t_end}) = {got}, exact {want}"
    );

    // LIQSS must not degenerate to stiffness-scale steps: the bound from
    // the quantum alone is ~10 * tEnd / sqrt(qTol).
    let qtol: f64 = 1.0e-4 * 0.5; // rTol * typical |x|
    let bound = (10.0 * t_end / qtol.sqrt()) as u64;
    let n = s.requantization_count("x");
    assert!(n < bound, "{n} requantizations exceeds stiff bound {bound}");
    assert!(n > 10, "suspiciously few requantizations: {n}");
}

#[test]
fn mid_run_tracking_is_stable() {
    // Sample the trajectory against the exact solution while stepping; the
    // transient dies within milliseconds, after that the error must stay at
    // tolerance scale.
    let t_end = 10.0;
    let model = LinearModel::from_str_named(STIFF, "stiff").unwrap();
    let mut cfg = test_options(Method::Liqss2, 1.0e-4, 1.0e-6, t_end);
    cfg.fxn.insert("u".into(), "sin[1,1,0]".into());
    let mut s = solver(model, cfg);
    let mut worst: f64 = 0.0;
    while let Some(st) = s.step_bounded(t_end).unwrap() {
        if st.t > 0.1 {
            worst = worst.max((s.value("x", st.t) - exact(st.t)).abs());
        }
    }
    assert!(worst < 5.0e-3, "worst tracking error {worst}");
}
