//! Linear-implicit QSS state variables, orders 1–3.
//!
//! For self-observing states the quantized value is displaced to one of the
//! band edges `q_c ± qTol` (or an interpolated point between them) chosen by
//! the sign of the next-higher derivative evaluated at both edges. This
//! biases the quantization against the self-feedback and suppresses the
//! oscillation plain QSS exhibits on stiff self-coupled states.
//!
//! All requantization work is deferred: stages accumulate into `d` and the
//! chosen edge into `l0`, and Stage Final commits both representations at
//! once so a simultaneous batch stays consistent.

use crate::{Ctx, Queue, SimOpts, Traj, VarCore};
use core_num::{next_up, nonzero_and_signs_differ, signum};
use core_time::{EventKind, SuperdenseTime, Time, INFINITY};

#[derive(Debug)]
pub struct LiqssVar {
    pub core: VarCore,
    pub x: Traj,
    pub q: Traj,
    /// Quantized center (undisplaced) value.
    q_c: f64,
    /// Deferred coefficients accumulated across stages.
    d: [f64; 4],
    /// Deferred displaced quantized value for self-observers.
    l0: f64,
    /// Time the pending stages commit at.
    pend_t: Time,
    pend_st: SuperdenseTime,
    s_a: f64,
    s_b: f64,
}

impl LiqssVar {
    pub fn new(core: VarCore) -> Self {
        let x0 = core.x_init;
        Self {
            core,
            x: Traj::constant(x0),
            q: Traj::constant(x0),
            q_c: x0,
            d: [x0, 0.0, 0.0, 0.0],
            l0: x0,
            pend_t: 0.0,
            pend_st: SuperdenseTime::new(core_time::NEG_INFINITY, EventKind::Requantize, 0),
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
        self.q_c = x0;
        self.d = [x0, 0.0, 0.0, 0.0];
        self.l0 = x0;
        self.pend_t = self.core.t_q;
        ctx.model.set_real(self.core.var_ref, x0);
    }

    // -- Requantization stages --------------------------------------------

    pub fn advance_qss_0(&mut self, t: Time, st: SuperdenseTime) {
        self.d[0] = self.x.val(t - self.core.t_x);
        self.pend_t = t;
        self.pend_st = st;
    }

    pub fn advance_qss_1(&mut self, x1: f64) {
        self.d[1] = x1;
    }

    /// Value of the pending (deferred, not yet committed) trajectory at a
    /// small offset past the pending event time.
    pub fn pending_val(&self, dt: f64) -> f64 {
        self.d[0] + (self.d[1] + (self.d[2] + self.d[3] * dt) * dt) * dt
    }

    pub fn advance_qss_2(&mut self, opts: &SimOpts, x1p: f64) {
        self.d[2] = opts.nd.x2_forward(self.d[1], x1p);
    }

    pub fn advance_qss_2_c(&mut self, opts: &SimOpts, x1m: f64, x1p: f64) {
        self.d[2] = opts.nd.x2_centered(x1m, x1p);
        self.s_a = x1m;
        self.s_b = x1p;
    }

    pub fn advance_qss_2_f(&mut self, opts: &SimOpts, x1p: f64, x1pp: f64) {
        self.d[2] = opts.nd.x2_forward3(self.d[1], x1p, x1pp);
        self.s_a = x1p;
        self.s_b = x1pp;
    }

    pub fn advance_qss_2_dd(&mut self, d2: f64) {
        self.d[2] = 0.5 * d2;
    }

    pub fn advance_qss_3(&mut self, opts: &SimOpts) {
        self.d[3] = opts.nd.x3_centered(self.s_a, self.d[1], self.s_b);
    }

    pub fn advance_qss_3_f(&mut self, opts: &SimOpts) {
        self.d[3] = opts.nd.x3_forward(self.d[1], self.s_a, self.s_b);
    }

    pub fn advance_qss_3_dd(&mut self, opts: &SimOpts, d2p: f64) {
        self.d[3] = (d2p - 2.0 * self.d[2]) / (6.0 * opts.nd.dt);
    }

    /// Self-observer probe, run in place of the numerical stages. Evaluates
    /// the model at both band edges and selects the quantized displacement
    /// from the next-higher derivative signs.
    pub fn advance_liqss_probe(&mut self, ctx: &mut Ctx<'_>, t: Time) {
        debug_assert!(self.core.self_observer);
        self.core.set_qtol(self.d[0]);
        match self.core.order {
            1 => self.probe_1(ctx, t),
            2 => self.probe_2(ctx, t),
            _ => self.probe_3(ctx, t),
        }
        // Leave the model's own value at the center for the rest of the
        // batch; observees are re-set by the pool at the next stage.
        ctx.model.set_real(self.core.var_ref, self.d[0]);
        ctx.model.set_time(t);
    }

    pub fn advance_qss_f(&mut self, queue: &mut Queue, opts: &SimOpts) {
        self.core.t_x = self.pend_t;
        self.core.t_q = self.pend_t;
        self.core.st = self.pend_st;
        self.x.c = self.d;
        for k in (self.core.order as usize + 1)..4 {
            self.x.c[k] = 0.0;
        }
        self.q_c = self.d[0];
        self.core.set_qtol(self.q_c);
        self.q.c = [self.d[0], self.d[1], 0.0, 0.0];
        if self.core.order >= 3 {
            self.q.c[2] = self.d[2];
        }
        if self.core.self_observer {
            self.q.c[0] = self.l0;
        } else {
            let n = self.core.order as usize;
            self.q.c[0] += signum(self.x.c[n]) as f64 * self.core.qtol;
        }
        self.set_te_aligned(opts);
        let t_e = self.core.t_e;
        self.core.requeue(queue, t_e, EventKind::Requantize);
        tracing::debug!(
            target: "vars.liqss",
            name = %self.core.name,
            t_q = self.core.t_q,
            q0 = self.q.c[0],
            q_c = self.q_c,
            t_e = self.core.t_e,
            "requantize"
        );
    }

    // -- Handler stages ----------------------------------------------------

    pub fn advance_handler_0(&mut self, t: Time, st: SuperdenseTime, x0: f64) {
        debug_assert!(self.core.t_x <= t && self.core.t_q <= t);
        self.d[0] = x0;
        self.pend_t = t;
        self.pend_st = st;
    }

    pub fn advance_handler_f(&mut self, queue: &mut Queue, opts: &SimOpts) {
        self.core.t_x = self.pend_t;
        self.core.t_q = self.pend_t;
        self.core.st = self.pend_st;
        self.x.c = self.d;
        self.q_c = self.d[0];
        // Handlers commit exactly; no band displacement.
        self.q.c = [self.d[0], self.d[1], 0.0, 0.0];
        if self.core.order >= 3 {
            self.q.c[2] = self.d[2];
        }
        self.core.set_qtol(self.q_c);
        self.set_te_aligned(opts);
        let t_e = self.core.t_e;
        self.core.requeue(queue, t_e, EventKind::Requantize);
    }

    // -- Observer stages ---------------------------------------------------

    pub fn advance_observer_1(&mut self, t: Time, x1: f64) {
        debug_assert!(self.core.t_x <= t);
        self.d[0] = self.x.val(t - self.core.t_x);
        self.d[1] = x1;
        self.pend_t = t;
    }

    pub fn advance_observer_f(&mut self, queue: &mut Queue, opts: &SimOpts) {
        self.core.t_x = self.pend_t;
        self.x.c = self.d;
        self.set_te_unaligned(opts);
        let t_e = self.core.t_e;
        self.core.requeue(queue, t_e, EventKind::Requantize);
    }

    // -- Probes ------------------------------------------------------------

    fn set_observees(&self, t: Time, ctx: &mut Ctx<'_>) {
        for &oid in &self.core.observees {
            if oid == self.core.id {
                ctx.model.set_real(self.core.var_ref, self.q(t));
            } else {
                let o = ctx.arena.get(oid);
                ctx.model.set_real(o.core().var_ref, o.q(t));
            }
        }
    }

    fn der(&self, ctx: &Ctx<'_>) -> f64 {
        let dref = self.core.der_ref.expect("state without derivative vref");
        ctx.model.get_real(dref)
    }

    fn probe_1(&mut self, ctx: &mut Ctx<'_>, t: Time) {
        let qtol = self.core.qtol;
        let (q_l, q_u) = (self.d[0] - qtol, self.d[0] + qtol);
        self.set_observees(t, ctx);
        ctx.model.set_real(self.core.var_ref, q_l);
        let x1_l = self.der(ctx);
        ctx.model.set_real(self.core.var_ref, q_u);
        let x1_u = self.der(ctx);
        match (signum(x1_l), signum(x1_u)) {
            (-1, -1) => {
                self.l0 = q_l;
                self.d[1] = x1_l;
            }
            (1, 1) => {
                self.l0 = q_u;
                self.d[1] = x1_u;
            }
            (l, u) if l == u => {
                self.l0 = self.d[0];
                self.d[1] = 0.0;
            }
            _ => {
                // Derivative changes sign across the band: interpolate to
                // its zero and flatten.
                self.l0 = ((q_l * x1_u) - (q_u * x1_l)) / (x1_u - x1_l);
                self.l0 = self.l0.clamp(q_l, q_u);
                self.d[1] = 0.0;
            }
        }
    }

    fn probe_2(&mut self, ctx: &mut Ctx<'_>, t: Time) {
        let qtol = self.core.qtol;
        let nd = ctx.opts.nd;
        let (q_l, q_u) = (self.d[0] - qtol, self.d[0] + qtol);

        self.set_observees(t, ctx);
        ctx.model.set_real(self.core.var_ref, q_l);
        let x1_l = self.der(ctx);
        ctx.model.set_real(self.core.var_ref, q_u);
        let x1_u = self.der(ctx);

        // Second derivatives at both edges by forward propagation.
        let tn = t + nd.dt;
        ctx.model.set_time(tn);
        self.set_observees(tn, ctx);
        ctx.model.set_real(self.core.var_ref, q_l + x1_l * nd.dt);
        let x2_l = nd.x2_forward(x1_l, self.der(ctx));
        ctx.model.set_real(self.core.var_ref, q_u + x1_u * nd.dt);
        let x2_u = nd.x2_forward(x1_u, self.der(ctx));

        match (signum(x2_l), signum(x2_u)) {
            (-1, -1) => {
                self.l0 = q_l;
                self.d[1] = x1_l;
                self.d[2] = x2_l;
            }
            (1, 1) => {
                self.l0 = q_u;
                self.d[1] = x1_u;
                self.d[2] = x2_u;
            }
            (l, u) if l == u => {
                self.l0 = self.d[0];
                self.d[1] = 0.5 * (x1_l + x1_u);
                self.d[2] = 0.0;
            }
            _ => {
                self.l0 = ((q_l * x2_u) - (q_u * x2_l)) / (x2_u - x2_l);
                self.l0 = self.l0.clamp(q_l, q_u);
                let w = 1.0 / (2.0 * qtol);
                self.d[1] = (((q_u - self.l0) * x1_l) + ((self.l0 - q_l) * x1_u)) * w;
                self.d[2] = 0.0;
            }
        }
    }

    fn probe_3(&mut self, ctx: &mut Ctx<'_>, t: Time) {
        let qtol = self.core.qtol;
        let nd = ctx.opts.nd;
        let (q_l, q_u) = (self.d[0] - qtol, self.d[0] + qtol);

        self.set_observees(t, ctx);
        ctx.model.set_real(self.core.var_ref, q_l);
        let x1_l = self.der(ctx);
        ctx.model.set_real(self.core.var_ref, q_u);
        let x1_u = self.der(ctx);

        // Second derivatives at both edges.
        let tp = t + nd.dt;
        ctx.model.set_time(tp);
        self.set_observees(tp, ctx);
        ctx.model.set_real(self.core.var_ref, q_l + x1_l * nd.dt);
        let x1p_l = self.der(ctx);
        let x2_l = nd.x2_forward(x1_l, x1p_l);
        ctx.model.set_real(self.core.var_ref, q_u + x1_u * nd.dt);
        let x1p_u = self.der(ctx);
        let x2_u = nd.x2_forward(x1_u, x1p_u);

        // Third derivatives at both edges, centered when time allows.
        let (x3_l, x3_u) = if !ctx.fwd_nd(t) {
            let tm = t - nd.dt;
            ctx.model.set_time(tm);
            self.set_observees(tm, ctx);
            ctx.model
                .set_real(self.core.var_ref, q_l - (x1_l - x2_l * nd.dt) * nd.dt);
            let x1m_l = self.der(ctx);
            ctx.model
                .set_real(self.core.var_ref, q_u - (x1_u - x2_u * nd.dt) * nd.dt);
            let x1m_u = self.der(ctx);
            (
                nd.x3_centered(x1m_l, x1_l, x1p_l),
                nd.x3_centered(x1m_u, x1_u, x1p_u),
            )
        } else {
            let t2 = t + nd.two_dt;
            ctx.model.set_time(t2);
            self.set_observees(t2, ctx);
            ctx.model.set_real(
                self.core.var_ref,
                q_l + (x1_l + x2_l * nd.two_dt) * nd.two_dt,
            );
            let x1pp_l = self.der(ctx);
            ctx.model.set_real(
                self.core.var_ref,
                q_u + (x1_u + x2_u * nd.two_dt) * nd.two_dt,
            );
            let x1pp_u = self.der(ctx);
            (
                nd.x3_forward(x1_l, x1p_l, x1pp_l),
                nd.x3_forward(x1_u, x1p_u, x1pp_u),
            )
        };

        match (signum(x3_l), signum(x3_u)) {
            (-1, -1) => {
                self.l0 = q_l;
                self.d[1] = x1_l;
                self.d[2] = x2_l;
                self.d[3] = x3_l;
            }
            (1, 1) => {
                self.l0 = q_u;
                self.d[1] = x1_u;
                self.d[2] = x2_u;
                self.d[3] = x3_u;
            }
            (l, u) if l == u => {
                self.l0 = self.d[0];
                self.d[1] = 0.5 * (x1_l + x1_u);
                self.d[2] = 0.5 * (x2_l + x2_u);
                self.d[3] = 0.0;
            }
            _ => {
                self.l0 = ((q_l * x3_u) - (q_u * x3_l)) / (x3_u - x3_l);
                self.l0 = self.l0.clamp(q_l, q_u);
                let w = 1.0 / (2.0 * qtol);
                self.d[1] = (((q_u - self.l0) * x1_l) + ((self.l0 - q_l) * x1_u)) * w;
                self.d[2] = (((q_u - self.l0) * x2_l) + ((self.l0 - q_l) * x2_u)) * w;
                self.d[3] = 0.0;
            }
        }
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
        // Drift is measured from the band center, not the displaced value.
        let mut q_center = self.q;
        q_center.c[0] = self.q_c;
        let diff = crate::qss::diff_coeffs(
            &self.x,
            &q_center,
            self.core.order,
            self.core.t_x - self.core.t_q,
        );
        let dt_raw = crate::qss::min_boundary_root(self.core.order, &diff, self.core.qtol);
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
    fn non_self_observer_displaces_by_curvature_sign() {
        let opts = SimOpts::default();
        let mut core = VarCore::new("x", VarId(0), 2, 0, &opts);
        core.x_init = 1.0;
        let mut v = LiqssVar::new(core);
        let mut queue = crate::Queue::new();

        v.advance_qss_0(0.0, SuperdenseTime::new(0.0, EventKind::Requantize, 0));
        v.advance_qss_1(-1.0);
        v.advance_qss_2(&opts, -1.0 + 2.0 * opts.nd.dt * 0.5); // x2 = +0.5
        v.advance_qss_f(&mut queue, &opts);

        let qtol = v.core.qtol;
        assert!((v.q.c[0] - (1.0 + qtol)).abs() < 1e-15, "upper displacement");
        assert_eq!(v.q_c, 1.0);
        assert!(v.core.t_e.is_finite());
    }

    #[test]
    fn handler_commit_has_no_displacement() {
        let opts = SimOpts::default();
        let mut core = VarCore::new("x", VarId(0), 2, 0, &opts);
        core.x_init = 1.0;
        let mut v = LiqssVar::new(core);
        let mut queue = crate::Queue::new();

        v.advance_handler_0(0.5, SuperdenseTime::new(0.5, EventKind::Handler, 0), 3.0);
        v.advance_qss_1(0.25);
        v.advance_qss_2(&opts, 0.25);
        v.advance_handler_f(&mut queue, &opts);
        assert_eq!(v.q.c[0], 3.0);
        assert_eq!(v.x.c[0], 3.0);
        assert_eq!(v.core.t_q, 0.5);
    }
}
