//! Scenario: nonlinear separable ODE with a closed-form solution, exercising
//! the numerical-differentiation fallbacks on a closure-backed model.

mod common;

use common::{run_checked, solver, test_options};
use core_config::Method;
use core_model::FnModelBuilder;

/// y' = (1 + 2t) / (y + 2), y(0) = 2, exact y = sqrt(2t^2 + 2t + 16) - 2.
fn exact(t: f64) -> f64 {
    (2.0 * t * t + 2.0 * t + 16.0).sqrt() - 2.0
}

fn model() -> core_model::FnModel {
    let mut b = FnModelBuilder::new("separable");
    // "y" is declared first, so its value reference is 0.
    let (_y, _dy) = b.add_state("y", 2.0, |t, v| (1.0 + 2.0 * t) / (v[0] + 2.0));
    b.deps("der(y)", &["y"]).build()
}

#[test]
fn separable_meets_tolerance_at_end() {
    let rtol = 1.0e-4;
    let atol = 1.0e-6;
    let cfg = test_options(Method::Qss3, rtol, atol, 5.0);
    let mut s = solver(model(), cfg);
    run_checked(&mut s);

    let got = s.value("y", 5.0);
    let want = exact(5.0);
    let bound = rtol * want.abs() + atol;
    assert!(
        (got - want).abs() < bound,
        "y(5) = {got}, exact {want}, bound {bound}"
    );
}

#[test]
fn separable_tracks_along_the_run() {
    let cfg = test_options(Method::Qss2, 1.0e-5, 1.0e-7, 5.0);
    let mut s = solver(model(), cfg);
    let mut worst: f64 = 0.0;
    let t_end = s.t_end();
    while let Some(st) = s.step_bounded(t_end).unwrap() {
        worst = worst.max((s.value("y", st.t) - exact(st.t)).abs());
    }
    assert!(worst < 1.0e-3, "worst error {worst}");
}
