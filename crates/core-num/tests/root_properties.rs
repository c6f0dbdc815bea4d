//! Property-based tests for the smallest-positive-root solvers.

use core_num::{min_root_cubic, min_root_quadratic};
use proptest::prelude::*;

fn eval_quadratic(a: f64, b: f64, c: f64, t: f64) -> f64 {
    (a * t + b) * t + c
}

fn eval_cubic(a: f64, b: f64, c: f64, d: f64, t: f64) -> f64 {
    ((a * t + b) * t + c) * t + d
}

proptest! {
    // Any reported quadratic root is strictly positive and a residual zero
    // at the problem's own scale.
    #[test]
    fn quadratic_root_is_positive_and_residual_small(
        a in -1e3f64..1e3, b in -1e3f64..1e3, c in -1e3f64..1e3
    ) {
        let r = min_root_quadratic(a, b, c);
        if r.is_finite() {
            prop_assert!(r > 0.0);
            let scale = a.abs() * r * r + b.abs() * r + c.abs() + 1.0;
            prop_assert!(eval_quadratic(a, b, c, r).abs() <= 1e-7 * scale);
        }
    }

    // Constructed roots are found: for 0 < r1 < r2 the solver must report r1
    // (up to conditioning of nearby roots).
    #[test]
    fn quadratic_finds_known_smallest_root(
        r1 in 1e-3f64..1e2, gap in 1e-2f64..1e2, scale in prop::sample::select(vec![-2.0f64, 0.5, 1.0, 3.0])
    ) {
        let r2 = r1 + gap;
        let (a, b, c) = (scale, -scale * (r1 + r2), scale * r1 * r2);
        let r = min_root_quadratic(a, b, c);
        prop_assert!(r.is_finite());
        prop_assert!((r - r1).abs() <= 1e-6 * r1.max(1.0));
    }

    // Cubic: report strictly positive roots with small residual, and never
    // miss a constructed smallest positive root.
    #[test]
    fn cubic_root_is_positive_and_residual_small(
        a in -1e2f64..1e2, b in -1e2f64..1e2, c in -1e2f64..1e2, d in -1e2f64..1e2
    ) {
        prop_assume!(a.abs() > 1e-6);
        let r = min_root_cubic(a, b, c, d);
        if r.is_finite() {
            prop_assert!(r > 0.0);
            let scale = a.abs() * r * r * r + b.abs() * r * r + c.abs() * r + d.abs() + 1.0;
            prop_assert!(eval_cubic(a, b, c, d, r).abs() <= 1e-6 * scale);
        }
    }

    #[test]
    fn cubic_finds_known_smallest_root(
        r1 in 1e-2f64..10.0, g1 in 0.5f64..10.0, g2 in 0.5f64..10.0
    ) {
        let (r2, r3) = (r1 + g1, r1 + g1 + g2);
        // (t - r1)(t - r2)(t - r3)
        let b = -(r1 + r2 + r3);
        let c = r1 * r2 + r1 * r3 + r2 * r3;
        let d = -r1 * r2 * r3;
        let r = min_root_cubic(1.0, b, c, d);
        prop_assert!(r.is_finite());
        prop_assert!((r - r1).abs() <= 1e-5 * r1.max(1.0));
    }
}
