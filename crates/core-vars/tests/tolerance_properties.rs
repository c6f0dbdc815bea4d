//! Property tests for the requantization tolerance contract: immediately
//! after an aligned Stage Final, the continuous and quantized trajectories
//! separate by exactly the quantum at the predicted event time.

use core_time::{EventKind, SuperdenseTime};
use core_vars::{QssVar, Queue, SimOpts, VarCore, VarId};
use proptest::prelude::*;

fn var_with(order: u8, x0: f64) -> QssVar {
    let opts = SimOpts::default();
    let mut core = VarCore::new("x", VarId(0), order, 0, &opts);
    core.x_init = x0;
    QssVar::new(core)
}

proptest! {
    // Order 2: run stages 0..Final with a synthetic derivative pair and
    // check |x(tE) - q(tE)| = qTol at the scheduled event.
    #[test]
    fn aligned_separation_equals_quantum_order2(
        x0 in -10.0f64..10.0,
        x1 in -5.0f64..5.0,
        c2 in prop::sample::select(vec![-3.0f64, -0.4, 0.2, 1.5])
    ) {
        let opts = SimOpts::default();
        let mut v = var_with(2, x0);
        let mut queue = Queue::new();

        let st = SuperdenseTime::new(0.0, EventKind::Requantize, 0);
        v.advance_qss_0(0.0, st);
        v.advance_qss_1(x1);
        // Synthetic forward sample consistent with curvature coefficient c2.
        v.advance_qss_2(&opts, x1 + 2.0 * c2 * opts.nd.dt);
        v.advance_qss_f(&mut queue, &opts);

        let t_e = v.core.t_e;
        prop_assume!(t_e.is_finite());
        let sep = (v.x(t_e) - v.q(t_e)).abs();
        let qtol = v.core.qtol;
        prop_assert!(qtol > 0.0);
        prop_assert!(
            (sep - qtol).abs() <= 1.0e-9 * qtol.max(1.0),
            "separation {sep} vs quantum {qtol}"
        );
        // And the event really is in the future.
        prop_assert!(t_e > 0.0);
    }

    // Order 1: the quantized value holds still, so the slope alone sets the
    // event horizon.
    #[test]
    fn aligned_separation_equals_quantum_order1(
        x0 in -10.0f64..10.0,
        x1 in prop::sample::select(vec![-2.0f64, -1.0e-3, 5.0e-2, 4.0])
    ) {
        let opts = SimOpts::default();
        let mut v = var_with(1, x0);
        let mut queue = Queue::new();

        let st = SuperdenseTime::new(0.0, EventKind::Requantize, 0);
        v.advance_qss_0(0.0, st);
        v.advance_qss_1(x1);
        v.advance_qss_f(&mut queue, &opts);

        let t_e = v.core.t_e;
        prop_assume!(t_e.is_finite());
        let sep = (v.x(t_e) - v.q(t_e)).abs();
        let qtol = v.core.qtol;
        prop_assert!((sep - qtol).abs() <= 1.0e-9 * qtol.max(1.0));
    }
}
