//! Event-indicator tracking policy for conditionals without computational
//! handlers: policy 0 keeps the indicator alive as its own handler, policy 1
//! passivates it entirely.

mod common;

use common::{run_checked, solver, test_options};
use core_config::Method;
use core_model::FnModelBuilder;

/// A ramp state crossing the indicator level once, with no reset rules.
fn handlerless_model() -> core_model::FnModel {
    let mut b = FnModelBuilder::new("ramp");
    let (x, _dx) = b.add_state("x", 0.0, |_, _| 1.0);
    let (_z, _dz) = b.add_indicator("z", -1.0, move |_, v| v[x as usize] - 1.0, |_, _| 1.0);
    b.deps("z", &["x"]).build()
}

#[test]
fn policy_zero_tracks_handlerless_indicators() {
    let mut cfg = test_options(Method::Qss2, 1.0e-5, 1.0e-8, 2.0);
    cfg.ei = 0;
    let mut s = solver(handlerless_model(), cfg);
    run_checked(&mut s);
    assert_eq!(s.stats.zero_crossings, 1, "crossing at t = 1 must fire");
    // No computational handlers: the crossing fires no handler events.
    assert_eq!(s.stats.handler_events, 0);
}

#[test]
fn policy_one_passivates_handlerless_indicators() {
    let mut cfg = test_options(Method::Qss2, 1.0e-5, 1.0e-8, 2.0);
    cfg.ei = 1;
    let mut s = solver(handlerless_model(), cfg);
    run_checked(&mut s);
    assert_eq!(s.stats.zero_crossings, 0, "passive indicator must not fire");
    assert_eq!(s.stats.zc_requantizations, 0);
}
