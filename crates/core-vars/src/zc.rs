//! Zero-crossing (event-indicator) variables, orders 1–3.
//!
//! A ZC variable fits a local polynomial to an event-indicator function and
//! predicts its next sign change. Crossings are classified by the signs on
//! each side; only classifications registered in the relevant set fire. An
//! anti-chatter band suppresses prediction while the indicator has not
//! escaped `zTol` since the last crossing, and a bump mechanism nudges the
//! model past zero after a crossing so its own detection does not re-fire.

use crate::{CondId, Ctx, Queue, SimOpts, Traj, VarCore};
use bitflags::bitflags;
use core_num::{
    min_root_cubic, min_root_quadratic_both, next_up, nonzero_and_signs_differ, signum,
    zc_root_cubic, zc_root_linear, zc_root_quadratic,
};
use core_time::{EventKind, SuperdenseTime, Time, INFINITY, NEG_INFINITY};

/// Sign-transition classification of a crossing. Naming reads
/// old-sign/new-sign: `DnPN` is downward positive-to-negative, `UpZP` upward
/// zero-to-positive, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crossing {
    DnPN,
    DnPZ,
    Dn,
    DnZN,
    Flat,
    UpZP,
    Up,
    UpNZ,
    UpNP,
}

bitflags! {
    /// Set of crossing types a ZC variable reacts to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CrossingSet: u16 {
        const DN_PN = 1 << 0;
        const DN_PZ = 1 << 1;
        const DN    = 1 << 2;
        const DN_ZN = 1 << 3;
        const FLAT  = 1 << 4;
        const UP_ZP = 1 << 5;
        const UP    = 1 << 6;
        const UP_NZ = 1 << 7;
        const UP_NP = 1 << 8;
    }
}

impl Crossing {
    pub fn flag(self) -> CrossingSet {
        match self {
            Crossing::DnPN => CrossingSet::DN_PN,
            Crossing::DnPZ => CrossingSet::DN_PZ,
            Crossing::Dn => CrossingSet::DN,
            Crossing::DnZN => CrossingSet::DN_ZN,
            Crossing::Flat => CrossingSet::FLAT,
            Crossing::UpZP => CrossingSet::UP_ZP,
            Crossing::Up => CrossingSet::UP,
            Crossing::UpNZ => CrossingSet::UP_NZ,
            Crossing::UpNP => CrossingSet::UP_NP,
        }
    }
}

impl CrossingSet {
    /// All downward and upward transitions; the default registration since
    /// the model interface does not expose crossing direction information.
    pub fn dn_up() -> Self {
        Self::DN_PN | Self::DN_PZ | Self::DN | Self::UP | Self::UP_NZ | Self::UP_NP
    }

    pub fn has(self, c: Crossing) -> bool {
        self.contains(c.flag())
    }
}

/// Classification from the values on each side of the transition.
pub fn crossing_type(val1: f64, val2: f64) -> Crossing {
    if val1 == 0.0 {
        if val2 > 0.0 {
            Crossing::UpZP
        } else if val2 == 0.0 {
            Crossing::Flat
        } else {
            Crossing::DnZN
        }
    } else if val2 == 0.0 {
        if val1 > 0.0 {
            Crossing::DnPZ
        } else {
            Crossing::UpNZ
        }
    } else if val1 > 0.0 {
        Crossing::DnPN
    } else {
        Crossing::UpNP
    }
}

/// Classification from sign pair.
pub fn crossing_type_signs(sign1: i32, sign2: i32) -> Crossing {
    crossing_type(sign1 as f64, sign2 as f64)
}

/// Classification from the slope at the crossing.
pub fn crossing_type_slope(slope: f64) -> Crossing {
    if slope == 0.0 {
        Crossing::Flat
    } else if slope > 0.0 {
        Crossing::UpNP
    } else {
        Crossing::DnPN
    }
}

#[derive(Debug)]
pub struct ZcVar {
    pub core: VarCore,
    pub x: Traj,
    /// Predicted next crossing time.
    pub t_z: Time,
    /// Time of the last processed crossing.
    pub t_z_last: Time,
    pub crossing: Crossing,
    pub crossing_last: Crossing,
    pub crossings: CrossingSet,
    pub conditional: Option<CondId>,
    /// Chatter control active (zTol > 0).
    z_chatter: bool,
    /// Peak |x| since the last crossing.
    x_mag: f64,
    check_crossing: bool,
    pub detected_crossing: bool,
    sign_old: i32,
    /// Did the last handler batch modify this indicator's value?
    pub handler_modified: bool,
    /// Indicator value captured at the bumped time, for the modification
    /// check after event iteration.
    pub x0_bump: f64,
    s_a: f64,
    s_b: f64,
}

impl ZcVar {
    pub fn new(core: VarCore) -> Self {
        let z_chatter = core.ztol > 0.0;
        Self {
            core,
            x: Traj::default(),
            t_z: INFINITY,
            t_z_last: NEG_INFINITY,
            crossing: Crossing::Flat,
            crossing_last: Crossing::Flat,
            crossings: CrossingSet::dn_up(),
            conditional: None,
            z_chatter,
            x_mag: 0.0,
            check_crossing: false,
            detected_crossing: false,
            sign_old: 0,
            handler_modified: false,
            x0_bump: 0.0,
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

    /// Quantized representation: one degree below the continuous fit.
    pub fn q(&self, t: Time) -> f64 {
        let d = t - self.core.t_q;
        match self.core.order {
            1 => self.x.c[0],
            2 => self.x.c[0] + self.x.c[1] * d,
            _ => self.x.c[0] + (self.x.c[1] + self.x.c[2] * d) * d,
        }
    }

    pub fn q1(&self, t: Time) -> f64 {
        match self.core.order {
            1 => panic!("{}: q1 undefined for order 1", self.core.name),
            2 => self.x.c[1],
            _ => self.x.c[1] + 2.0 * self.x.c[2] * (t - self.core.t_q),
        }
    }

    pub fn in_conditional(&self) -> bool {
        self.conditional.is_some()
    }

    pub fn is_tz_last(&self, t: Time) -> bool {
        t == self.t_z_last
    }

    /// Disable events entirely; used when the conditional ends up with no
    /// computational observers.
    pub fn flag_passive(&mut self, queue: &mut Queue) {
        self.core.passive = true;
        self.core.t_e = INFINITY;
        self.t_z = INFINITY;
        self.core.requeue(queue, INFINITY, EventKind::Requantize);
    }

    // -- Initialization ----------------------------------------------------

    pub fn init_0(&mut self, ctx: &mut Ctx<'_>) {
        self.detected_crossing = false;
        self.x.c[0] = ctx.model.get_real(self.core.var_ref);
        self.sign_old = signum(self.x.c[0]);
    }

    // -- Requantization stages (value + derivative fits) -------------------

    pub fn advance_qss_0(&mut self, t: Time, st: SuperdenseTime, x0: f64) {
        debug_assert!(!self.core.passive);
        self.advance_pre(t);
        self.core.t_q = t;
        self.core.t_x = t;
        self.core.st = st;
        self.x.c[0] = x0;
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

    pub fn advance_qss_3(&mut self, opts: &SimOpts) {
        self.x.c[3] = opts.nd.x3_centered(self.s_a, self.x.c[1], self.s_b);
    }

    pub fn advance_qss_3_f(&mut self, opts: &SimOpts) {
        self.x.c[3] = opts.nd.x3_forward(self.x.c[1], self.s_a, self.s_b);
    }

    pub fn advance_qss_f(&mut self, ctx: &mut Ctx<'_>) {
        debug_assert!(!self.core.passive);
        self.core.set_qtol(self.x.c[0]);
        self.set_te(ctx.opts);
        self.crossing_detect(ctx);
    }

    // -- Observer stages ---------------------------------------------------

    pub fn advance_observer_1(&mut self, t: Time, x0: f64, x1: f64) {
        if self.core.passive {
            return;
        }
        debug_assert!(self.core.t_x <= t);
        self.advance_pre(t);
        self.core.t_q = t;
        self.core.t_x = t;
        // Arriving exactly at the processed crossing with an unmodified
        // indicator: the value is exactly zero by construction.
        self.x.c[0] = if !self.handler_modified && t == self.t_z_last {
            0.0
        } else {
            x0
        };
        self.x.c[1] = x1;
    }

    pub fn advance_observer_f(&mut self, ctx: &mut Ctx<'_>) {
        if self.core.passive {
            return;
        }
        self.core.set_qtol(self.x.c[0]);
        self.set_te(ctx.opts);
        self.crossing_detect(ctx);
    }

    // -- Zero-crossing event ----------------------------------------------

    /// Process the crossing at `tZ`. The caller (driver) notifies the
    /// conditional separately.
    pub fn advance_zc(&mut self, ctx: &mut Ctx<'_>) {
        debug_assert!(self.in_conditional());
        let t = self.t_z;
        self.crossing_last = self.crossing;
        self.x_mag = 0.0;
        self.t_z_last = t;
        self.set_tz_from(t, ctx);
        self.requeue_zc(ctx.queue);
        self.fixup_te(ctx.queue, ctx.opts);
        tracing::debug!(
            target: "vars.zc",
            name = %self.core.name,
            t,
            crossing = ?self.crossing_last,
            t_e = self.core.t_e,
            t_z = self.t_z,
            "crossing"
        );
    }

    /// Nudge time for the model's own crossing detection: a point just past
    /// the crossing where the indicator has residual `zMul * zTol`.
    pub fn bump_time(&self, t: Time, opts: &SimOpts) -> Time {
        if !self.z_chatter {
            return t + opts.dt_zc;
        }
        let x1_t = self.x1(t);
        let b_tol = opts.zmul * self.core.ztol;
        let dt = match self.core.order {
            1 => {
                if x1_t != 0.0 {
                    b_tol / x1_t.abs()
                } else {
                    opts.dt_zc
                }
            }
            2 => min_root_quadratic_both(self.x.c[2], x1_t, b_tol, -b_tol),
            _ => {
                let d = t - self.core.t_x;
                let c2 = self.x.c[2] + 3.0 * self.x.c[3] * d;
                min_root_cubic(self.x.c[3], c2, x1_t, b_tol)
                    .min(min_root_cubic(self.x.c[3], c2, x1_t, -b_tol))
            }
        };
        if dt <= 0.0 || dt == INFINITY {
            // First-order fallback.
            let dt = if x1_t != 0.0 {
                b_tol / x1_t.abs()
            } else {
                opts.dt_zc
            };
            t + dt
        } else {
            t + dt
        }
    }

    // -- Internals ---------------------------------------------------------

    /// Bookkeeping before the trajectory is reset to time `t`: arm the
    /// unpredicted-crossing check and track the indicator magnitude over
    /// `[tX, t]`, including an interior extremum.
    fn advance_pre(&mut self, t: Time) {
        let past_tz = t > self.t_z_last;
        let x_t = self.x(t);
        self.check_crossing = past_tz;
        if past_tz || x_t != 0.0 {
            self.sign_old = signum(x_t);
        }
        if self.z_chatter && past_tz {
            self.mag_update(x_t);
            // Interior critical points of the current fit.
            let span = t - self.core.t_x;
            if self.core.order >= 3 && self.x.c[3] != 0.0 {
                let (a, b, c) = (3.0 * self.x.c[3], 2.0 * self.x.c[2], self.x.c[1]);
                let disc = b * b - 4.0 * a * c;
                if disc > 0.0 {
                    let sq = disc.sqrt();
                    for r in [(-b - sq) / (2.0 * a), (-b + sq) / (2.0 * a)] {
                        if r > 0.0 && r < span {
                            self.mag_update(self.x.val(r));
                        }
                    }
                }
            } else if nonzero_and_signs_differ(self.x.c[1], self.x.c[2]) {
                let r = -self.x.c[1] / (2.0 * self.x.c[2]);
                if r > 0.0 && r < span {
                    self.mag_update(self.x.val(r));
                }
            }
        }
    }

    fn mag_update(&mut self, val: f64) {
        self.x_mag = self.x_mag.max(val.abs());
    }

    fn set_te(&mut self, opts: &SimOpts) {
        debug_assert!(self.core.t_q == self.core.t_x);
        if opts.clipping {
            self.x = self.x.clipped(opts.clip);
        }
        let n = self.core.order as usize;
        let cn = self.x.c[n];
        let mut dt = if cn != 0.0 {
            let mut dt = (self.core.qtol / cn.abs()).powf(1.0 / n as f64);
            // The chatter band makes the tolerance root meaningless near
            // zero, so the inflection clip carries a fraction guard.
            if opts.inflection && nonzero_and_signs_differ(self.x.c[n - 1], cn) {
                let dt_i = -self.x.c[n - 1] / (n as f64 * cn);
                if dt_i > 0.0 && dt_i < dt && dt * opts.inflection_frac < dt_i {
                    dt = dt_i;
                }
            }
            dt
        } else {
            INFINITY
        };
        dt = self.core.dt_bounded(dt, opts);
        self.core.t_e = if dt != INFINITY {
            self.core.t_q + dt
        } else {
            INFINITY
        };
        if self.core.t_e == self.core.t_q {
            self.core.t_e = next_up(self.core.t_e);
        }
        let x0 = self.x.c[0];
        self.mag_update(x0);
    }

    /// Predict the next crossing on the active segment from `tX`.
    fn set_tz(&mut self, ctx: &mut Ctx<'_>) {
        let dt = self.poly_root(&self.x.c, self.core.ztol, self.x_mag);
        debug_assert!(dt > 0.0);
        if dt == INFINITY {
            self.t_z = INFINITY;
            return;
        }
        self.t_z = self.core.t_x + dt;
        if self.t_z <= self.t_z_last {
            self.t_z = INFINITY;
            return;
        }
        let check = self.classify(self.x.c[0], self.x.c[1], self.core.t_x);
        if self.crossings.has(check) {
            self.crossing = check;
            if ctx.opts.refine {
                self.refine_root(ctx, self.core.t_x);
            }
        } else {
            self.t_z = INFINITY;
        }
    }

    /// Predict the next crossing on `(tB, ...]`, where `tB` is usually the
    /// just-processed crossing time.
    fn set_tz_from(&mut self, t_b: Time, ctx: &mut Ctx<'_>) {
        let d_b = t_b - self.core.t_x;
        debug_assert!(d_b >= 0.0);
        let shifted = self.x.shifted(d_b);
        let x0 = if t_b == self.t_z_last {
            // Handler-modified check: compare the model value against the
            // bumped capture; an unmodified indicator is exactly zero at its
            // crossing, no matter how many handlers wrote this instant.
            self.handler_modified = ctx.model.get_real(self.core.var_ref) != self.x0_bump;
            if self.handler_modified {
                shifted.c[0]
            } else {
                0.0
            }
        } else {
            shifted.c[0]
        };
        let mut c = shifted.c;
        c[0] = x0;
        let dt = self.poly_root(&c, self.core.ztol, self.x_mag);
        debug_assert!(dt > 0.0);
        if dt == INFINITY {
            self.t_z = INFINITY;
            return;
        }
        self.t_z = t_b + dt;
        if self.t_z <= self.t_z_last {
            self.t_z = INFINITY;
            return;
        }
        let check = self.classify(x0, shifted.c[1], t_b);
        if self.crossings.has(check) {
            self.crossing = check;
            if ctx.opts.refine {
                self.refine_root(ctx, t_b);
            }
        } else {
            self.t_z = INFINITY;
        }
    }

    fn classify(&self, x0: f64, x1_at_b: f64, t_b: Time) -> Crossing {
        if x0 == 0.0 {
            if self.t_z == t_b {
                Crossing::Flat
            } else {
                crossing_type_slope(-x1_at_b)
            }
        } else {
            let s = self.x1(self.t_z);
            crossing_type_slope(if x0 > 0.0 { s.min(0.0) } else { s.max(0.0) })
        }
    }

    fn poly_root(&self, c: &[f64; 4], ztol: f64, x_mag: f64) -> f64 {
        let z_tol = if self.z_chatter { ztol } else { 0.0 };
        match self.core.order {
            1 => {
                if z_tol > 0.0 && x_mag < z_tol {
                    INFINITY
                } else {
                    zc_root_linear(c[1], c[0])
                }
            }
            2 => zc_root_quadratic(c[2], c[1], c[0], z_tol, x_mag),
            _ => zc_root_cubic(c[3], c[2], c[1], c[0], z_tol, x_mag),
        }
    }

    /// Crossing bookkeeping after a trajectory reset: either an unpredicted
    /// sign change fires immediately, or the polynomial prediction stands.
    fn crossing_detect(&mut self, ctx: &mut Ctx<'_>) {
        if self.z_chatter && self.x_mag < self.core.ztol {
            self.set_tz(ctx);
        } else {
            let sign_new = signum(self.x.c[0]);
            if self.check_crossing && sign_new != self.sign_old && self.core.t_x > self.t_z_last {
                let check = crossing_type_signs(self.sign_old, sign_new);
                if self.crossings.has(check) {
                    self.crossing = check;
                    self.detected_crossing = true;
                    self.t_z = self.core.t_x;
                    let t_z = self.t_z;
                    self.core.requeue(ctx.queue, t_z, EventKind::ZeroCrossing);
                    self.fixup_te(ctx.queue, ctx.opts);
                    return;
                }
            }
            self.set_tz(ctx);
        }
        self.requeue_zc(ctx.queue);
        self.fixup_te(ctx.queue, ctx.opts);
    }

    /// One event entry serves both the requantization and the crossing:
    /// whichever comes first.
    fn requeue_zc(&mut self, queue: &mut Queue) {
        if self.core.t_e < self.t_z {
            let t_e = self.core.t_e;
            self.core.requeue(queue, t_e, EventKind::Requantize);
        } else {
            let t_z = self.t_z;
            self.core.requeue(queue, t_z, EventKind::ZeroCrossing);
        }
    }

    /// Pull `tE` back so observers refresh before a predicted crossing that
    /// is far from the last trajectory reset.
    fn fixup_te(&mut self, queue: &mut Queue, opts: &SimOpts) {
        if opts.dt_zmax > 0.0 && self.t_z <= self.core.t_e && self.core.t_x < self.t_z - opts.dt_zmax
        {
            self.core.t_e = self.t_z - opts.dt_zmax;
            let t_e = self.core.t_e;
            self.core.requeue(queue, t_e, EventKind::Requantize);
        }
    }

    /// Bounded Newton refinement of `tZ` against the true model indicator,
    /// with step halving on non-improving residuals.
    fn refine_root(&mut self, ctx: &mut Ctx<'_>, t_beg: Time) {
        const MAX_ITER: usize = 10;
        let dref = match self.core.der_ref {
            Some(d) => d,
            None => return,
        };
        let mut t_r = self.t_z;
        let mut best_t = t_r;
        let mut best_mag = INFINITY;
        let mut converged = false;
        for _ in 0..MAX_ITER {
            self.eval_observees_x(t_r, ctx);
            let z = ctx.model.get_real(self.core.var_ref);
            let z1 = ctx.model.get_real(dref);
            let mag = z.abs();
            if mag < best_mag {
                best_mag = mag;
                best_t = t_r;
            }
            if mag <= f64::EPSILON * self.x_mag.max(1.0) {
                converged = true;
                break;
            }
            if z1 == 0.0 {
                break;
            }
            let mut step = z / z1;
            // Halve until the step stays in bounds.
            while t_r - step < t_beg && step.abs() > 0.0 {
                step *= 0.5;
                if step.abs() < f64::EPSILON * t_r.abs().max(1.0) {
                    break;
                }
            }
            let t_next = t_r - step;
            if t_next == t_r {
                converged = true;
                break;
            }
            t_r = t_next.max(t_beg);
        }
        if !converged {
            tracing::info!(
                target: "vars.zc",
                name = %self.core.name,
                t_z = self.t_z,
                residual = best_mag,
                "zero-crossing refinement did not converge"
            );
        }
        // Accept the best iterate only when it improves on the polynomial
        // prediction's own residual.
        self.eval_observees_x(self.t_z, ctx);
        let raw = ctx.model.get_real(self.core.var_ref).abs();
        if best_mag < raw && best_t >= t_beg {
            self.t_z = best_t;
        }
    }

    fn eval_observees_x(&self, t: Time, ctx: &mut Ctx<'_>) {
        for &oid in &self.core.observees {
            let o = ctx.arena.get(oid);
            ctx.model.set_real(o.core().var_ref, o.x(t));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        assert_eq!(crossing_type(1.0, -1.0), Crossing::DnPN);
        assert_eq!(crossing_type(1.0, 0.0), Crossing::DnPZ);
        assert_eq!(crossing_type(0.0, -1.0), Crossing::DnZN);
        assert_eq!(crossing_type(0.0, 0.0), Crossing::Flat);
        assert_eq!(crossing_type(0.0, 1.0), Crossing::UpZP);
        assert_eq!(crossing_type(-1.0, 0.0), Crossing::UpNZ);
        assert_eq!(crossing_type(-1.0, 1.0), Crossing::UpNP);
    }

    #[test]
    fn default_set_excludes_flat() {
        let set = CrossingSet::dn_up();
        assert!(set.has(Crossing::DnPN));
        assert!(set.has(Crossing::UpNP));
        assert!(!set.has(Crossing::Flat));
        assert!(!set.has(Crossing::UpZP));
        assert!(!set.has(Crossing::DnZN));
    }

    #[test]
    fn slope_classification() {
        assert_eq!(crossing_type_slope(-2.0), Crossing::DnPN);
        assert_eq!(crossing_type_slope(2.0), Crossing::UpNP);
        assert_eq!(crossing_type_slope(0.0), Crossing::Flat);
    }
}
