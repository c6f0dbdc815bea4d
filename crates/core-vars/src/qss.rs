//! Standard QSS state variables, orders 1–3.
//!
//! The quantized representation is one degree below the continuous one: the
//! quantized value holds still (order 1), drifts linearly (order 2), or
//! quadratically (order 3) while the continuous representation carries the
//! extra leading coefficient that decides when the two drift `qTol` apart.

use crate::{Ctx, Queue, SimOpts, Traj, VarCore};
use core_num::{
    min_root_cubic, min_root_quadratic_both, next_up, nonzero_and_signs_differ, zc_root_linear,
};
use core_time::{EventKind, SuperdenseTime, Time, INFINITY};

#[derive(Debug)]
pub struct QssVar {
    pub core: VarCore,
    pub x: Traj,
    pub q: Traj,
    /// ND scratch: first-derivative samples captured in stage 2 for stage 3.
    s_a: f64,
    s_b: f64,
}

impl QssVar {
    pub fn new(core: VarCore) -> Self {
        let x0 = core.x_init;
        Self {
            core,
            x: Traj::constant(x0),
            q: Traj::constant(x0),
            s_a: 0.0,
            s_b: 0.0,
        }
    }

    pub fn x(&self, t: Time) -> f64 {
        self.x.val(t - self.core.t_x)
    }

    pub fn x1(&self, t: Time) -> f64 {
        self.x.slope(t - self.core.t_x)
    }

    pub fn q(&self, t: Time) -> f64 {
        let d = t - self.core.t_q;
        match self.core.order {
            1 => self.q.c[0],
            2 => self.q.c[0] + self.q.c[1] * d,
            _ => self.q.c[0] + (self.q.c[1] + self.q.c[2] * d) * d,
        }
    }

    pub fn q1(&self, t: Time) -> f64 {
        match self.core.order {
            1 => panic!("{}: q1 undefined for order 1", self.core.name),
            2 => self.q.c[1],
            _ => self.q.c[1] + 2.0 * self.q.c[2] * (t - self.core.t_q),
        }
    }

    // -- Initialization ----------------------------------------------------

    pub fn init_0(&mut self, ctx: &mut Ctx<'_>) {
        let x0 = self.core.x_init;
        self.x = Traj::constant(x0);
        self.q = Traj::constant(x0);
        ctx.model.set_real(self.core.var_ref, x0);
    }

    // -- Requantization stages --------------------------------------------

    pub fn advance_qss_0(&mut self, t: Time, st: SuperdenseTime) {
        let d = t - self.core.t_x;
        let x0 = self.x.val(d);
        self.x.c[0] = x0;
        self.q.c[0] = x0;
        self.core.t_x = t;
        self.core.t_q = t;
        self.core.st = st;
    }

    pub fn advance_qss_1(&mut self, x1: f64) {
        self.x.c[1] = x1;
        self.q.c[1] = x1;
    }

    /// Stage 2, forward pair: derivative sample at `t + dtND`.
    pub fn advance_qss_2(&mut self, opts: &SimOpts, x1p: f64) {
        self.x.c[2] = opts.nd.x2_forward(self.x.c[1], x1p);
    }

    /// Stage 2, centered: derivative samples at `t - dtND` and `t + dtND`.
    pub fn advance_qss_2_c(&mut self, opts: &SimOpts, x1m: f64, x1p: f64) {
        self.x.c[2] = opts.nd.x2_centered(x1m, x1p);
        self.s_a = x1m;
        self.s_b = x1p;
    }

    /// Stage 2, forward 3-point: samples at `t + dtND` and `t + 2·dtND`.
    pub fn advance_qss_2_f(&mut self, opts: &SimOpts, x1p: f64, x1pp: f64) {
        self.x.c[2] = opts.nd.x2_forward3(self.x.c[1], x1p, x1pp);
        self.s_a = x1p;
        self.s_b = x1pp;
    }

    /// Stage 2 from a directional second derivative.
    pub fn advance_qss_2_dd(&mut self, d2: f64) {
        self.x.c[2] = 0.5 * d2;
    }

    /// Stage 3, centered (uses the samples captured by stage 2).
    pub fn advance_qss_3(&mut self, opts: &SimOpts) {
        debug_assert!(self.core.order >= 3);
        self.x.c[3] = opts.nd.x3_centered(self.s_a, self.x.c[1], self.s_b);
    }

    /// Stage 3, forward (uses the samples captured by stage 2).
    pub fn advance_qss_3_f(&mut self, opts: &SimOpts) {
        debug_assert!(self.core.order >= 3);
        self.x.c[3] = opts.nd.x3_forward(self.x.c[1], self.s_a, self.s_b);
    }

    /// Stage 3 from a directional second derivative at `t + dtND`.
    pub fn advance_qss_3_dd(&mut self, opts: &SimOpts, d2p: f64) {
        debug_assert!(self.core.order >= 3);
        self.x.c[3] = (d2p - 2.0 * self.x.c[2]) / (6.0 * opts.nd.dt);
    }

    pub fn advance_qss_f(&mut self, queue: &mut Queue, opts: &SimOpts) {
        if self.core.order >= 3 {
            self.q.c[2] = self.x.c[2];
        }
        self.core.set_qtol(self.q.c[0]);
        self.set_te_aligned(opts);
        let t_e = self.core.t_e;
        self.core.requeue(queue, t_e, EventKind::Requantize);
        tracing::debug!(
            target: "vars.qss",
            name = %self.core.name,
            t_q = self.core.t_q,
            q0 = self.q.c[0],
            x1 = self.x.c[1],
            t_e = self.core.t_e,
            "requantize"
        );
    }

    // -- Handler stages ----------------------------------------------------

    pub fn advance_handler_0(&mut self, ctx: &mut Ctx<'_>, t: Time, st: SuperdenseTime) {
        debug_assert!(self.core.t_x <= t && self.core.t_q <= t);
        self.core.t_x = t;
        self.core.t_q = t;
        self.core.st = st;
        let x0 = ctx.model.get_real(self.core.var_ref);
        self.x = Traj::constant(x0);
        self.q = Traj::constant(x0);
    }

    pub fn advance_handler_1(&mut self, x1: f64) {
        self.advance_qss_1(x1);
    }

    pub fn advance_handler_f(&mut self, queue: &mut Queue, opts: &SimOpts) {
        self.advance_qss_f(queue, opts);
    }

    // -- Observer stages ---------------------------------------------------

    pub fn advance_observer_1(&mut self, t: Time, x1: f64) {
        debug_assert!(self.core.t_x <= t);
        let d = t - self.core.t_x;
        self.x.c[0] = self.x.val(d);
        self.core.t_x = t;
        self.x.c[1] = x1;
    }

    pub fn advance_observer_f(&mut self, queue: &mut Queue, opts: &SimOpts) {
        self.set_te_unaligned(opts);
        let t_e = self.core.t_e;
        self.core.requeue(queue, t_e, EventKind::Requantize);
    }

    // -- End-time prediction ----------------------------------------------

    fn set_te_aligned(&mut self, opts: &SimOpts) {
        debug_assert!(self.core.t_x <= self.core.t_q);
        let n = self.core.order as usize;
        let cn = self.x.c[n];
        let dt_raw = if cn != 0.0 {
            (self.core.qtol / cn.abs()).powf(1.0 / n as f64)
        } else {
            INFINITY
        };
        let dt = self.core.dt_bounded(dt_raw, opts);
        self.core.t_e = if dt != INFINITY {
            self.core.t_q + dt
        } else {
            INFINITY
        };
        if opts.inflection && cn != 0.0 && nonzero_and_signs_differ(self.x.c[n - 1], cn) {
            let t_i = self.core.t_x - self.x.c[n - 1] / (n as f64 * cn);
            if self.core.t_q < t_i {
                self.core.t_e = self.core.t_e.min(t_i);
            }
        }
        if self.core.t_e == self.core.t_q {
            self.core.t_e = next_up(self.core.t_e);
        }
    }

    fn set_te_unaligned(&mut self, opts: &SimOpts) {
        debug_assert!(self.core.t_q <= self.core.t_x);
        let qtol = self.core.qtol;
        let diff = diff_coeffs(&self.x, &self.q, self.core.order, self.core.t_x - self.core.t_q);
        let dt_raw = min_boundary_root(self.core.order, &diff, qtol);
        let dt = self.core.dt_bounded(dt_raw, opts);
        self.core.t_e = if dt != INFINITY {
            self.core.t_x + dt
        } else {
            INFINITY
        };
        let n = self.core.order as usize;
        let cn = self.x.c[n];
        if opts.inflection
            && cn != 0.0
            && nonzero_and_signs_differ(self.x.c[n - 1], cn)
            && core_num::signum(self.x.c[n - 1]) == core_num::signum(self.q.c[1])
        {
            let t_i = self.core.t_x - self.x.c[n - 1] / (n as f64 * cn);
            if self.core.t_x < t_i {
                self.core.t_e = self.core.t_e.min(t_i);
            }
        }
        if self.core.t_e == self.core.t_x {
            self.core.t_e = next_up(self.core.t_e);
        }
    }
}

/// Coefficients of `x - q` in the frame of `tX`, where the quantized
/// polynomial (degree `order - 1`) is first re-centered by `dq = tX - tQ`.
pub(crate) fn diff_coeffs(x: &Traj, q: &Traj, order: u8, dq: f64) -> [f64; 4] {
    let mut qs = *q;
    // Quantized representation carries coefficients below `order` only.
    for k in order as usize..4 {
        qs.c[k] = 0.0;
    }
    let qs = qs.shifted(dq);
    let mut d = [0.0; 4];
    for k in 0..=order as usize {
        let qk = if k < order as usize { qs.c[k] } else { 0.0 };
        d[k] = x.c[k] - qk;
    }
    d
}

/// Smallest positive root where the difference polynomial hits either
/// quantization boundary.
pub(crate) fn min_boundary_root(order: u8, d: &[f64; 4], qtol: f64) -> f64 {
    match order {
        1 => zc_root_linear(d[1], d[0] - qtol).min(zc_root_linear(d[1], d[0] + qtol)),
        2 => min_root_quadratic_both(d[2], d[1], d[0] + qtol, d[0] - qtol),
        _ => min_root_cubic(d[3], d[2], d[1], d[0] - qtol)
            .min(min_root_cubic(d[3], d[2], d[1], d[0] + qtol)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SimOpts, VarId};

    fn mk(order: u8) -> QssVar {
        let opts = SimOpts::default();
        let mut core = VarCore::new("x", VarId(0), order, 0, &opts);
        core.x_init = 1.0;
        core.qtol = 1.0e-4;
        QssVar::new(core)
    }

    #[test]
    fn aligned_te_order2_is_sqrt_rule() {
        let opts = SimOpts::default();
        let mut v = mk(2);
        v.x.c = [1.0, -1.0, 0.5, 0.0];
        v.core.qtol = 1.0e-4;
        v.set_te_aligned(&opts);
        let expect = (1.0e-4f64 / 0.5).sqrt();
        assert!((v.core.t_e - expect).abs() < 1e-12);
    }

    #[test]
    fn aligned_te_infinite_when_leading_zero() {
        let opts = SimOpts::default();
        let mut v = mk(2);
        v.x.c = [1.0, -1.0, 0.0, 0.0];
        v.set_te_aligned(&opts);
        assert_eq!(v.core.t_e, INFINITY);
    }

    #[test]
    fn inflection_clips_te() {
        let opts = SimOpts {
            inflection: true,
            ..SimOpts::default()
        };
        let mut v = mk(2);
        // Slope and curvature oppose: inflection at tX + 1/(2*0.5) = 1.0.
        v.x.c = [1.0, -1.0, 0.5, 0.0];
        v.core.qtol = 1.0; // Tolerance root alone would be sqrt(2) > 1.
        v.set_te_aligned(&opts);
        assert!((v.core.t_e - 1.0).abs() < 1e-12);
    }

    #[test]
    fn unaligned_te_hits_band_edge() {
        let opts = SimOpts::default();
        let mut v = mk(2);
        // tQ = 0 with q = 1.0 constant-slope 0; x drifts quadratically.
        v.core.t_q = 0.0;
        v.core.t_x = 0.0;
        v.q.c = [1.0, 0.0, 0.0, 0.0];
        v.x.c = [1.0, 0.0, 0.25, 0.0];
        v.core.qtol = 1.0e-2;
        v.set_te_unaligned(&opts);
        // 0.25 dt^2 = 1e-2 -> dt = 0.2
        assert!((v.core.t_e - 0.2).abs() < 1e-9);
        // Trajectory separation at tE equals the quantum.
        let sep = (v.x.val(v.core.t_e) - v.q.c[0]).abs();
        assert!((sep - v.core.qtol).abs() < 1e-9);
    }

    #[test]
    fn stage_pipeline_updates_both_representations() {
        let opts = SimOpts::default();
        let mut v = mk(2);
        v.x.c = [1.0, -1.0, 0.5, 0.0];
        v.core.t_x = 0.0;
        v.core.t_q = 0.0;
        let st = SuperdenseTime::new(0.5, EventKind::Requantize, 0);
        v.advance_qss_0(0.5, st);
        assert!((v.x.c[0] - (1.0 - 0.5 + 0.5 * 0.25)).abs() < 1e-12);
        assert_eq!(v.core.t_q, 0.5);
        assert_eq!(v.core.t_x, 0.5);
        v.advance_qss_1(-0.7);
        assert_eq!(v.q.c[1], -0.7);
        v.advance_qss_2(&opts, -0.7 + 2.0e-6 * 0.3);
        assert!((v.x.c[2] - 0.3).abs() < 1e-6);
    }
}
