//! Anti-chatter: an indicator that never escapes the zTol band must not
//! fire crossings, while the same trajectory with chatter control disabled
//! fires on every zero transit.

mod common;

use common::{run_checked, solver, test_options};
use core_config::Method;
use core_model::FnModelBuilder;

const W: f64 = 2.0 * std::f64::consts::PI;
const AMP: f64 = 4.0e-7;

/// x = AMP * sin(w t); the indicator z = x + AMP/2 transits zero twice per
/// period with |z| <= 1.5 * AMP.
fn wiggle_model() -> core_model::FnModel {
    let mut b = FnModelBuilder::new("wiggle");
    let (x, _dx) = b.add_state("x", 0.0, |t, _| AMP * W * (W * t).cos());
    let (z, _dz) = b.add_indicator(
        "z",
        AMP / 2.0,
        move |_, v| v[x as usize] + AMP / 2.0,
        |t, _| AMP * W * (W * t).cos(),
    );
    let y = b.add_discrete("y", 0.0);
    b.on_crossing_toggle(z, y);
    b.deps("z", &["x"]).build()
}

#[test]
fn band_bound_trajectory_is_suppressed() {
    // zTol well above the indicator magnitude: the band swallows every
    // transit.
    let mut cfg = test_options(Method::Qss2, 1.0e-6, 1.0e-9, 3.0);
    cfg.ztol = 1.0e-6;
    let mut s = solver(wiggle_model(), cfg);
    run_checked(&mut s);
    assert_eq!(s.stats.zero_crossings, 0, "chatter suppression failed");
    assert_eq!(s.value("y", 3.0), 0.0);
}

#[test]
fn zero_ztol_disables_suppression() {
    // Same trajectory, chatter control off: two crossings per period, six
    // over three periods, caught either by prediction or sign-change
    // detection.
    let mut cfg = test_options(Method::Qss2, 1.0e-6, 1.0e-9, 3.0);
    cfg.ztol = 0.0;
    let mut s = solver(wiggle_model(), cfg);
    run_checked(&mut s);
    assert_eq!(s.stats.zero_crossings, 6, "expected every transit to fire");
    // Even toggle count returns y to the start value.
    assert_eq!(s.value("y", 3.0), 0.0);
}
