//! Pass-through real variables: algebraic model outputs carried as local
//! quadratic fits.
//!
//! These have no derivative value reference, so their coefficients come from
//! sampling the model value at the differentiation stencil times. They are
//! the "non-state" observers: when one changes, its own observers are
//! advanced in a cascading pass within the same instant.

use crate::{Ctx, Queue, SimOpts, Traj, VarCore};
use core_num::next_up;
use core_time::{EventKind, SuperdenseTime, Time, INFINITY};

#[derive(Debug)]
pub struct PassVar {
    pub core: VarCore,
    pub x: Traj,
}

impl PassVar {
    pub fn new(core: VarCore) -> Self {
        debug_assert_eq!(core.order, 2);
        let x0 = core.x_init;
        Self {
            core,
            x: Traj::constant(x0),
        }
    }

    pub fn x(&self, t: Time) -> f64 {
        self.x.val(t - self.core.t_x)
    }

    pub fn x1(&self, t: Time) -> f64 {
        self.x.slope(t - self.core.t_x)
    }

    /// Pass-through: the quantized view is the continuous fit itself.
    pub fn q(&self, t: Time) -> f64 {
        self.x.val(t - self.core.t_q)
    }

    pub fn q1(&self, t: Time) -> f64 {
        self.x.slope(t - self.core.t_q)
    }

    pub fn init_0(&mut self, ctx: &mut Ctx<'_>) {
        let x0 = ctx.model.get_real(self.core.var_ref);
        self.x = Traj::constant(x0);
        self.core.x_init = x0;
    }

    /// Refit from value samples. `centered` carries `(v at t-dt, v, v at
    /// t+dt)`; the forward form carries `(v, v at t+dt, v at t+2dt)`.
    pub fn advance_samples(
        &mut self,
        t: Time,
        st: SuperdenseTime,
        samples: (f64, f64, f64),
        centered: bool,
        opts: &SimOpts,
    ) {
        let dt = opts.nd.dt;
        self.core.t_x = t;
        self.core.t_q = t;
        self.core.st = st;
        let (a, b, c) = samples;
        if centered {
            // a = v(t-dt), b = v(t), c = v(t+dt)
            self.x.c = [b, (c - a) / (2.0 * dt), (a - 2.0 * b + c) / (2.0 * dt * dt), 0.0];
        } else {
            // a = v(t), b = v(t+dt), c = v(t+2dt)
            self.x.c = [
                a,
                (-3.0 * a + 4.0 * b - c) / (2.0 * dt),
                (a - 2.0 * b + c) / (2.0 * dt * dt),
                0.0,
            ];
        }
    }

    pub fn advance_f(&mut self, queue: &mut Queue, opts: &SimOpts) {
        self.core.set_qtol(self.x.c[0]);
        let dt_raw = if self.x.c[2] != 0.0 {
            (self.core.qtol / self.x.c[2].abs()).sqrt()
        } else {
            INFINITY
        };
        let dt = self.core.dt_bounded(dt_raw, opts);
        self.core.t_e = if dt != INFINITY {
            self.core.t_q + dt
        } else {
            INFINITY
        };
        if self.core.t_e == self.core.t_q {
            self.core.t_e = next_up(self.core.t_e);
        }
        let t_e = self.core.t_e;
        self.core.requeue(queue, t_e, EventKind::Requantize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SimOpts, VarId};

    #[test]
    fn centered_fit_recovers_quadratic() {
        let opts = SimOpts::default();
        let core = VarCore::new("z", VarId(0), 2, 0, &opts);
        let mut v = PassVar::new(core);
        let dt = opts.nd.dt;
        // f(u) = 2 + 3u + 4u^2 sampled around t = 1.
        let f = |u: f64| 2.0 + 3.0 * u + 4.0 * u * u;
        let st = SuperdenseTime::new(1.0, core_time::EventKind::Observe, 0);
        v.advance_samples(1.0, st, (f(-dt), f(0.0), f(dt)), true, &opts);
        assert!((v.x.c[0] - 2.0).abs() < 1e-12);
        assert!((v.x.c[1] - 3.0).abs() < 1e-6);
        assert!((v.x.c[2] - 4.0).abs() < 1e-2);
    }

    #[test]
    fn forward_fit_recovers_quadratic() {
        let opts = SimOpts::default();
        let core = VarCore::new("z", VarId(0), 2, 0, &opts);
        let mut v = PassVar::new(core);
        let dt = opts.nd.dt;
        let f = |u: f64| -1.0 + 0.5 * u - 2.0 * u * u;
        let st = SuperdenseTime::new(0.0, core_time::EventKind::Observe, 0);
        v.advance_samples(0.0, st, (f(0.0), f(dt), f(2.0 * dt)), false, &opts);
        assert!((v.x.c[0] + 1.0).abs() < 1e-12);
        assert!((v.x.c[1] - 0.5).abs() < 1e-6);
        assert!((v.x.c[2] + 2.0).abs() < 1e-2);
    }
}
