//! Scenario: linear decay x' = -x, the canonical accuracy and step-count
//! check for the quantization engine.

mod common;

use common::{run_checked, solver, test_options};
use core_config::Method;
use core_model::LinearModel;

const DECAY: &str = r#"
    name = "decay"
    t_end = 5.0

    [[state]]
    name = "x"
    start = 1.0
    [state.der]
    x = -1.0
"#;

#[test]
fn decay_tracks_exponential() {
    let model = LinearModel::from_str_named(DECAY, "decay").unwrap();
    let cfg = test_options(Method::Qss2, 1.0e-4, 1.0e-6, 5.0);
    let mut s = solver(model, cfg);
    run_checked(&mut s);

    let exact = (-5.0f64).exp();
    let got = s.value("x", 5.0);
    assert!(
        (got - exact).abs() < 5.0e-4,
        "x(5) = {got}, expected {exact}"
    );
}

#[test]
fn decay_event_count_scales_with_quantum() {
    // Requantization count goes as 1/sqrt(qTol) per unit time for order 2:
    // a 100x tighter tolerance costs about 10x the events.
    let mut counts = Vec::new();
    for rtol in [1.0e-3, 1.0e-5] {
        let model = LinearModel::from_str_named(DECAY, "decay").unwrap();
        let cfg = test_options(Method::Qss2, rtol, rtol * 1.0e-2, 5.0);
        let mut s = solver(model, cfg);
        run_checked(&mut s);
        counts.push(s.requantization_count("x"));
    }
    let ratio = counts[1] as f64 / counts[0] as f64;
    assert!(
        counts[0] > 5 && counts[1] > counts[0],
        "counts not increasing: {counts:?}"
    );
    assert!(
        (3.0..35.0).contains(&ratio),
        "step scaling off: {counts:?} ratio {ratio}"
    );
}

#[test]
fn decay_is_deterministic() {
    // Two identical runs produce identical event sequences and trajectories.
    let run = || {
        let model = LinearModel::from_str_named(DECAY, "decay").unwrap();
        let cfg = test_options(Method::Qss2, 1.0e-4, 1.0e-6, 5.0);
        let mut s = solver(model, cfg);
        let mut trace = Vec::new();
        let t_end = s.t_end();
        while let Some(st) = s.step_bounded(t_end).unwrap() {
            trace.push((st.t, st.kind, s.value("x", st.t).to_bits()));
        }
        trace
    };
    assert_eq!(run(), run());
}

#[test]
fn decay_superdense_times_are_monotone() {
    let model = LinearModel::from_str_named(DECAY, "decay").unwrap();
    let cfg = test_options(Method::Qss2, 1.0e-4, 1.0e-6, 5.0);
    let mut s = solver(model, cfg);
    let t_end = s.t_end();
    let mut last = None;
    while let Some(st) = s.step_bounded(t_end).unwrap() {
        if let Some(prev) = last {
            assert!(prev <= st, "superdense time went backwards: {prev} > {st}");
        }
        last = Some(st);
    }
}

#[test]
fn liqss_and_relax_also_track_decay() {
    for method in [Method::Liqss2, Method::Rqss2, Method::Qss1, Method::Qss3] {
        let model = LinearModel::from_str_named(DECAY, "decay").unwrap();
        let cfg = test_options(method, 1.0e-4, 1.0e-6, 5.0);
        let mut s = solver(model, cfg);
        run_checked(&mut s);
        let exact = (-5.0f64).exp();
        let got = s.value("x", 5.0);
        let tol = if method == Method::Qss1 { 5.0e-3 } else { 1.0e-3 };
        assert!(
            (got - exact).abs() < tol,
            "{method}: x(5) = {got}, expected {exact}"
        );
    }
}
