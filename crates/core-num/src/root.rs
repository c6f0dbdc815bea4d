//! Smallest-positive-root solvers for quantization and zero-crossing
//! prediction.
//!
//! The quantization boundary solvers answer "when does the continuous
//! trajectory drift `qTol` away from the quantized one": the caller forms the
//! difference polynomial and asks for the first strictly positive root. The
//! zero-crossing solvers do the same for the event-indicator polynomial, with
//! an anti-chatter guard that suppresses prediction while the trajectory
//! magnitude has stayed inside the chatter band.

const INFINITY: f64 = f64::INFINITY;

/// Smallest strictly positive root of `a*t^2 + b*t + c`, or infinity.
///
/// Numerically stable form: the discriminant is clamped at zero so a grazing
/// tangency from roundoff reports the tangent point instead of no root.
pub fn min_root_quadratic(a: f64, b: f64, c: f64) -> f64 {
    if a == 0.0 {
        return zc_root_linear(b, c);
    }
    let disc = (b * b) - (4.0 * a * c);
    if disc < 0.0 {
        // A tiny negative discriminant is a tangency; a large one is no root.
        let scale = (b * b).max((4.0 * a * c).abs());
        if disc > -1.0e-12 * scale.max(1.0) {
            let t = -b / (2.0 * a);
            return if t > 0.0 { t } else { INFINITY };
        }
        return INFINITY;
    }
    let sq = disc.sqrt();
    // q-form avoids cancellation between -b and the radical.
    let q = -0.5 * (b + if b >= 0.0 { sq } else { -sq });
    let (r1, r2) = (q / a, if q != 0.0 { c / q } else { INFINITY });
    min_positive(r1, r2)
}

/// Smallest positive root crossing the upper quantization boundary:
/// roots of `a*t^2 + b*t + c` where the caller has already folded `-qTol`
/// into `c`. Preconditions per the quantization geometry: `b >= 0`, `a >= 0`,
/// `c <= 0` up to roundoff.
pub fn min_root_quadratic_upper(a: f64, b: f64, c: f64) -> f64 {
    min_root_quadratic(a, b, c)
}

/// Smallest positive root crossing the lower quantization boundary
/// (`+qTol` folded into `c`; `b <= 0`, `a <= 0`, `c >= 0`).
pub fn min_root_quadratic_lower(a: f64, b: f64, c: f64) -> f64 {
    min_root_quadratic(a, b, c)
}

/// Smallest positive root crossing either boundary: `cl` carries `+qTol`,
/// `cu` carries `-qTol`.
pub fn min_root_quadratic_both(a: f64, b: f64, cl: f64, cu: f64) -> f64 {
    min_root_quadratic(a, b, cl).min(min_root_quadratic(a, b, cu))
}

/// Smallest strictly positive root of `a*t^3 + b*t^2 + c*t + d`, or infinity.
///
/// Bracket scan with doubling steps out to the Cauchy bound, then bisection
/// tightened by Halley iterations. Degenerate leading coefficients fall back
/// to the quadratic/linear solvers.
pub fn min_root_cubic(a: f64, b: f64, c: f64, d: f64) -> f64 {
    if a == 0.0 {
        return min_root_quadratic(b, c, d);
    }
    let p = |t: f64| ((a * t + b) * t + c) * t + d;
    let p1 = |t: f64| (3.0 * a * t + 2.0 * b) * t + c;
    let p2 = |t: f64| 6.0 * a * t + 2.0 * b;

    // Root magnitude bound (Cauchy): all real roots lie within |t| <= bound.
    let bound = 1.0 + (b.abs().max(c.abs()).max(d.abs())) / a.abs();
    if !bound.is_finite() {
        return INFINITY;
    }

    let f0 = p(0.0);
    if f0 == 0.0 {
        // Already on the boundary: walk off zero before searching.
        let eps = f64::EPSILON * bound.max(1.0);
        return min_root_cubic_shifted(a, b, c, d, eps).map_or(INFINITY, |r| r);
    }

    // Doubling scan for the first sign change.
    let mut lo = 0.0_f64;
    let mut hi = 1.0e-12 * bound.max(1.0);
    let mut bracket = None;
    while hi <= bound * 2.0 {
        if p(hi) == 0.0 {
            return hi;
        }
        if (p(hi) > 0.0) != (f0 > 0.0) {
            bracket = Some((lo, hi));
            break;
        }
        lo = hi;
        hi *= 2.0;
    }
    let (mut lo, mut hi) = match bracket {
        Some(pair) => pair,
        None => return INFINITY,
    };

    // Bisection with Halley acceleration from the midpoint.
    let mut t = 0.5 * (lo + hi);
    for _ in 0..64 {
        let (f, f1, f2) = (p(t), p1(t), p2(t));
        if f == 0.0 {
            return t;
        }
        if (f > 0.0) == (f0 > 0.0) {
            lo = t;
        } else {
            hi = t;
        }
        let denom = 2.0 * f1 * f1 - f * f2;
        let step = if denom != 0.0 {
            2.0 * f * f1 / denom
        } else if f1 != 0.0 {
            f / f1
        } else {
            0.0
        };
        let cand = t - step;
        t = if cand > lo && cand < hi {
            cand
        } else {
            0.5 * (lo + hi)
        };
        if hi - lo <= f64::EPSILON * hi.abs().max(1.0) {
            break;
        }
    }
    t
}

fn min_root_cubic_shifted(a: f64, b: f64, c: f64, d: f64, eps: f64) -> Option<f64> {
    // Shift the frame by eps and search the shifted cubic; discard the origin
    // root that motivated the shift.
    let bs = b + 3.0 * a * eps;
    let cs = c + (2.0 * b + 3.0 * a * eps) * eps;
    let ds = d + ((a * eps + b) * eps + c) * eps;
    let r = min_root_cubic(a, bs, cs, ds);
    if r.is_finite() {
        Some(r + eps)
    } else {
        None
    }
}

/// Smallest positive root of the linear indicator `b*t + c`.
pub fn zc_root_linear(b: f64, c: f64) -> f64 {
    if b == 0.0 {
        return INFINITY;
    }
    let t = -c / b;
    if t > 0.0 { t } else { INFINITY }
}

/// Zero-crossing prediction for a quadratic indicator trajectory
/// `c2*t^2 + c1*t + c0`, suppressed while anti-chatter is active
/// (`z_tol > 0` and the running magnitude has not escaped the band).
pub fn zc_root_quadratic(c2: f64, c1: f64, c0: f64, z_tol: f64, x_mag: f64) -> f64 {
    if z_tol > 0.0 && x_mag < z_tol {
        return INFINITY;
    }
    min_root_quadratic(c2, c1, c0)
}

/// Zero-crossing prediction for a cubic indicator trajectory with the same
/// chatter guard as the quadratic form.
pub fn zc_root_cubic(c3: f64, c2: f64, c1: f64, c0: f64, z_tol: f64, x_mag: f64) -> f64 {
    if z_tol > 0.0 && x_mag < z_tol {
        return INFINITY;
    }
    min_root_cubic(c3, c2, c1, c0)
}

#[inline]
fn min_positive(r1: f64, r2: f64) -> f64 {
    let a = if r1 > 0.0 { r1 } else { INFINITY };
    let b = if r2 > 0.0 { r2 } else { INFINITY };
    a.min(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64, tol: f64) {
        assert!((a - b).abs() <= tol, "{a} vs {b}");
    }

    #[test]
    fn quadratic_picks_smallest_positive() {
        // (t - 2)(t - 5) = t^2 - 7t + 10
        assert_close(min_root_quadratic(1.0, -7.0, 10.0), 2.0, 1e-12);
        // (t + 1)(t - 3): negative root ignored
        assert_close(min_root_quadratic(1.0, -2.0, -3.0), 3.0, 1e-12);
        // No real roots
        assert_eq!(min_root_quadratic(1.0, 0.0, 1.0), f64::INFINITY);
        // Linear degenerate
        assert_close(min_root_quadratic(0.0, 2.0, -8.0), 4.0, 1e-12);
    }

    #[test]
    fn quadratic_tangency_clamps_discriminant() {
        // (t - 1)^2 scaled so roundoff makes disc slightly negative.
        let a = 3.0_f64;
        let r = 1.0 + 1e-9;
        let b = -2.0 * a * r;
        let c = a * r * r * (1.0 - 1e-16);
        let root = min_root_quadratic(a, b, c);
        assert!(root.is_finite());
        assert_close(root, r, 1e-6);
    }

    #[test]
    fn both_boundaries_take_minimum() {
        // Upward drift hits upper boundary first.
        let dt = min_root_quadratic_both(0.5, 1.0, 1e-4, -1e-4);
        assert_close(dt, min_root_quadratic(0.5, 1.0, -1e-4), 1e-15);
    }

    #[test]
    fn cubic_simple_roots() {
        // (t-1)(t-2)(t-4) = t^3 -7t^2 +14t -8
        assert_close(min_root_cubic(1.0, -7.0, 14.0, -8.0), 1.0, 1e-9);
        // Negative real root only: (t+1)(t^2+1)
        assert_eq!(min_root_cubic(1.0, 1.0, 1.0, 1.0), f64::INFINITY);
        // Degenerate to quadratic
        assert_close(min_root_cubic(0.0, 1.0, -7.0, 10.0), 2.0, 1e-12);
    }

    #[test]
    fn cubic_origin_root_excluded() {
        // t(t-3)^2: the origin root must not satisfy "strictly positive".
        let r = min_root_cubic(1.0, -6.0, 9.0, 0.0);
        assert!(r > 0.0);
        assert_close(r, 3.0, 1e-5);
    }

    #[test]
    fn chatter_band_suppresses_prediction() {
        assert_eq!(zc_root_quadratic(0.0, 1.0, -0.5, 1.0, 0.5), f64::INFINITY);
        let r = zc_root_quadratic(0.0, 1.0, -0.5, 1.0, 2.0);
        assert_close(r, 0.5, 1e-12);
        // z_tol = 0 disables the guard entirely.
        let r0 = zc_root_quadratic(0.0, 1.0, -0.5, 0.0, 0.0);
        assert_close(r0, 0.5, 1e-12);
    }

    #[test]
    fn linear_root_sign() {
        assert_close(zc_root_linear(2.0, -1.0), 0.5, 1e-15);
        assert_eq!(zc_root_linear(2.0, 1.0), f64::INFINITY);
        assert_eq!(zc_root_linear(0.0, 1.0), f64::INFINITY);
    }
}
