//! Full-order-broadcast (relaxation-family) QSS state variables.
//!
//! Identical staging to standard QSS, but the quantized representation
//! broadcasts every continuous coefficient at requantization instead of
//! dropping the leading one. Observers then see a locally exact trajectory,
//! which softens the error feedback between tightly coupled states.

use crate::{Ctx, Queue, SimOpts, Traj, VarCore};
use core_num::{next_up, nonzero_and_signs_differ, signum};
use core_time::{EventKind, SuperdenseTime, Time, INFINITY};

#[derive(Debug)]
pub struct RelaxVar {
    pub core: VarCore,
    pub x: Traj,
    pub q: Traj,
    s_a: f64,
    s_b: f64,
}

impl RelaxVar {
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
        self.q.val(t - self.core.t_q)
    }

    pub fn q1(&self, t: Time) -> f64 {
        self.q.slope(t - self.core.t_q)
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
        let x0 = self.x.val(t - self.core.t_x);
        self.x.c[0] = x0;
        self.core.t_x = t;
        self.core.t_q = t;
        self.core.st = st;
    }

    pub fn advance_qss_1(&mut self, x1: f64) {
        self.x.c[1] = x1;
    }

    pub fn advance_qss_2(&mut self, opts: &SimOpts, x1p: f64) {
        self.x.c[2] = opts.nd.x2_forward(self.x.c[1], x1p);
    }

    pub fn advance_qss_2_c(&mut self, opts: &SimOpts, x1m: f64, x1p: f64) {
        self.x.c[2] = opts.nd.x2_centered(x1m, x1p);
        self.s_a = x1m;
        self.s_b = x1p;
    }

    pub fn advance_qss_2_f(&mut self, opts: &SimOpts, x1p: f64, x1pp: f64) {
        self.x.c[2] = opts.nd.x2_forward3(self.x.c[1], x1p, x1pp);
        self.s_a = x1p;
        self.s_b = x1pp;
    }

    pub fn advance_qss_2_dd(&mut self, d2: f64) {
        self.x.c[2] = 0.5 * d2;
    }

    pub fn advance_qss_3(&mut self, opts: &SimOpts) {
        self.x.c[3] = opts.nd.x3_centered(self.s_a, self.x.c[1], self.s_b);
    }

    pub fn advance_qss_3_f(&mut self, opts: &SimOpts) {
        self.x.c[3] = opts.nd.x3_forward(self.x.c[1], self.s_a, self.s_b);
    }

    pub fn advance_qss_3_dd(&mut self, opts: &SimOpts, d2p: f64) {
        self.x.c[3] = (d2p - 2.0 * self.x.c[2]) / (6.0 * opts.nd.dt);
    }

    pub fn advance_qss_f(&mut self, queue: &mut Queue, opts: &SimOpts) {
        // Broadcast the full continuous representation.
        self.q = self.x;
        self.core.set_qtol(self.q.c[0]);
        self.set_te_aligned(opts);
        let t_e = self.core.t_e;
        self.core.requeue(queue, t_e, EventKind::Requantize);
        tracing::debug!(
            target: "vars.relax",
            name = %self.core.name,
            t_q = self.core.t_q,
            q0 = self.q.c[0],
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

    pub fn advance_handler_f(&mut self, queue: &mut Queue, opts: &SimOpts) {
        self.advance_qss_f(queue, opts);
    }

    // -- Observer stages ---------------------------------------------------

    pub fn advance_observer_1(&mut self, t: Time, x1: f64) {
        debug_assert!(self.core.t_x <= t);
        self.x.c[0] = self.x.val(t - self.core.t_x);
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
        // Both representations carry the full order: difference them
        // directly in the tX frame.
        let qs = self.q.shifted(self.core.t_x - self.core.t_q);
        let mut d = [0.0; 4];
        for k in 0..=self.core.order as usize {
            d[k] = self.x.c[k] - qs.c[k];
        }
        let dt_raw = crate::qss::min_boundary_root(self.core.order, &d, self.core.qtol);
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
            && signum(self.x.c[n - 1]) == signum(self.q.c[1])
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SimOpts, VarId};

    #[test]
    fn broadcast_copies_all_coefficients() {
        let opts = SimOpts::default();
        let mut core = VarCore::new("x", VarId(0), 3, 0, &opts);
        core.x_init = 2.0;
        let mut v = RelaxVar::new(core);
        let mut queue = crate::Queue::new();

        v.advance_qss_0(0.0, SuperdenseTime::new(0.0, EventKind::Requantize, 0));
        v.advance_qss_1(1.0);
        v.advance_qss_2_c(&opts, 1.0 - 2.0 * opts.nd.dt * 0.5, 1.0 + 2.0 * opts.nd.dt * 0.5);
        v.advance_qss_3(&opts);
        v.advance_qss_f(&mut queue, &opts);

        assert_eq!(v.q.c, v.x.c);
        // Immediately after requantization q(t) tracks x(t) exactly.
        assert!((v.q(0.37) - v.x(0.37)).abs() < 1e-15);
    }
}
