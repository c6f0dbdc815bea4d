//! Discrete variables: piecewise-constant values changed only by handlers.

use crate::{Ctx, VarCore};
use core_time::{EventKind, SuperdenseTime, Time, INFINITY};

#[derive(Debug)]
pub struct DisVar {
    pub core: VarCore,
    x0: f64,
}

impl DisVar {
    pub fn new(core: VarCore) -> Self {
        let x0 = core.x_init;
        Self { core, x0 }
    }

    pub fn value(&self) -> f64 {
        self.x0
    }

    pub fn x(&self, _t: Time) -> f64 {
        self.x0
    }

    /// Constant between events, so the slope is identically zero.
    pub fn x1(&self, _t: Time) -> f64 {
        0.0
    }

    pub fn q(&self, _t: Time) -> f64 {
        self.x0
    }

    pub fn q1(&self, _t: Time) -> f64 {
        0.0
    }

    pub fn init_0(&mut self, ctx: &mut Ctx<'_>) {
        self.x0 = self.core.x_init;
        ctx.model.set_real(self.core.var_ref, self.x0);
    }

    /// Handler advance: take the post-event value from the model.
    pub fn advance_handler(&mut self, ctx: &mut Ctx<'_>, t: Time, st: SuperdenseTime) {
        debug_assert!(self.core.t_x <= t && self.core.t_q <= t);
        self.core.t_x = t;
        self.core.t_q = t;
        self.core.st = st;
        let new = ctx.model.get_real(self.core.var_ref);
        if new != self.x0 {
            tracing::debug!(
                target: "vars.discrete",
                name = %self.core.name,
                t,
                from = self.x0,
                to = new,
                "discrete_change"
            );
        }
        self.x0 = new;
        // No future event of its own: park the entry the conditional (or a
        // time event) shifted here, so it cannot head the queue again.
        if self.core.handle.is_some() {
            self.core.requeue(ctx.queue, INFINITY, EventKind::Handler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SimOpts, VarId};

    #[test]
    fn constant_between_events() {
        let opts = SimOpts::default();
        let mut core = VarCore::new("y", VarId(0), 1, 0, &opts);
        core.x_init = 1.0;
        let v = DisVar::new(core);
        assert_eq!(v.x(0.0), 1.0);
        assert_eq!(v.x(100.0), 1.0);
        assert_eq!(v.x1(5.0), 0.0);
    }
}
