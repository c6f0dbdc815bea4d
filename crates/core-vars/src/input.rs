//! Input variables: time-dependent sources driving model inputs.
//!
//! An input's trajectory comes from an analytic source function rather than
//! the model, so requantization needs no model queries: the source supplies
//! the polynomial coefficients directly, and the only event scheduling
//! subtlety is stopping exactly at a source discontinuity. Connected inputs
//! (multi-model runs) have their coefficients pushed in by the connection
//! manager instead.

use crate::{Ctx, Queue, SimOpts, Traj, VarCore};
use core_time::{EventKind, SuperdenseTime, Time, INFINITY};

/// Analytic input source. `eval` returns polynomial coefficients
/// `[f, f', f''/2, f'''/6]` at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum InputFn {
    Constant(f64),
    /// `y0` before `t_step`, `y0 + dy` after.
    Step { y0: f64, dy: f64, t_step: Time },
    Ramp { y0: f64, slope: f64 },
    Sin { amp: f64, omega: f64, phase: f64 },
    Cos { amp: f64, omega: f64, phase: f64 },
    /// Fixed polynomial in absolute time: `c0 + c1 t + c2 t^2 + c3 t^3`.
    Poly([f64; 4]),
    /// Coefficients pushed by the connection manager; holds the latest
    /// received polynomial and its frame time.
    Connection,
}

impl InputFn {
    pub fn eval(&self, t: Time) -> [f64; 4] {
        match *self {
            InputFn::Constant(c) => [c, 0.0, 0.0, 0.0],
            InputFn::Step { y0, dy, t_step } => {
                let v = if t < t_step { y0 } else { y0 + dy };
                [v, 0.0, 0.0, 0.0]
            }
            InputFn::Ramp { y0, slope } => [y0 + slope * t, slope, 0.0, 0.0],
            InputFn::Sin { amp, omega, phase } => {
                let (s, c) = (omega * t + phase).sin_cos();
                [
                    amp * s,
                    amp * omega * c,
                    -amp * omega * omega * s / 2.0,
                    -amp * omega * omega * omega * c / 6.0,
                ]
            }
            InputFn::Cos { amp, omega, phase } => {
                let (s, c) = (omega * t + phase).sin_cos();
                [
                    amp * c,
                    -amp * omega * s,
                    -amp * omega * omega * c / 2.0,
                    amp * omega * omega * omega * s / 6.0,
                ]
            }
            InputFn::Poly(c) => {
                let v = c[0] + (c[1] + (c[2] + c[3] * t) * t) * t;
                let d1 = c[1] + (2.0 * c[2] + 3.0 * c[3] * t) * t;
                let d2 = c[2] + 3.0 * c[3] * t;
                [v, d1, d2, c[3]]
            }
            InputFn::Connection => [0.0; 4],
        }
    }

    /// Next time the source is discontinuous, if any, strictly after `t`.
    pub fn next_discontinuity(&self, t: Time) -> Time {
        match *self {
            InputFn::Step { t_step, .. } if t < t_step => t_step,
            _ => INFINITY,
        }
    }

    /// Parse a source spec: `constant[c]`, `step[y0,dy,t]`, `ramp[y0,r]`,
    /// `sin[a,w,p]`, `cos[a,w,p]`, `poly[c0,c1,c2,c3]`.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let spec = spec.trim();
        let (name, rest) = match spec.find('[') {
            Some(i) => (&spec[..i], &spec[i..]),
            None => (spec, "[]"),
        };
        let inner = rest
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(|| format!("malformed input function spec: {spec}"))?;
        let args: Vec<f64> = if inner.trim().is_empty() {
            Vec::new()
        } else {
            inner
                .split(',')
                .map(|a| {
                    a.trim()
                        .parse::<f64>()
                        .map_err(|_| format!("bad number in input function spec: {spec}"))
                })
                .collect::<Result<_, _>>()?
        };
        let arg = |i: usize, default: f64| args.get(i).copied().unwrap_or(default);
        match name {
            "constant" => Ok(InputFn::Constant(arg(0, 0.0))),
            "step" => Ok(InputFn::Step {
                y0: arg(0, 0.0),
                dy: arg(1, 1.0),
                t_step: arg(2, 1.0),
            }),
            "ramp" => Ok(InputFn::Ramp {
                y0: arg(0, 0.0),
                slope: arg(1, 1.0),
            }),
            "sin" => Ok(InputFn::Sin {
                amp: arg(0, 1.0),
                omega: arg(1, 1.0),
                phase: arg(2, 0.0),
            }),
            "cos" => Ok(InputFn::Cos {
                amp: arg(0, 1.0),
                omega: arg(1, 1.0),
                phase: arg(2, 0.0),
            }),
            "poly" => Ok(InputFn::Poly([
                arg(0, 0.0),
                arg(1, 0.0),
                arg(2, 0.0),
                arg(3, 0.0),
            ])),
            other => Err(format!("unknown input function: {other}")),
        }
    }
}

#[derive(Debug)]
pub struct InpVar {
    pub core: VarCore,
    pub x: Traj,
    pub f: InputFn,
}

impl InpVar {
    pub fn new(core: VarCore, f: InputFn) -> Self {
        Self {
            core,
            x: Traj::default(),
            f,
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

    pub fn init_0(&mut self, ctx: &mut Ctx<'_>) {
        self.load_coefficients(ctx.opts.t_beg);
        ctx.model.set_real(self.core.var_ref, self.x.c[0]);
    }

    pub fn init_f(&mut self, queue: &mut Queue, opts: &SimOpts) {
        self.schedule(queue, opts);
    }

    /// Input requantization: refresh coefficients from the source, publish
    /// the value to the model, and schedule the next event.
    pub fn advance_input(&mut self, ctx: &mut Ctx<'_>, t: Time, st: SuperdenseTime) {
        if matches!(self.f, InputFn::Connection) {
            // Connection-driven: coefficients arrive by push; the event only
            // re-centers the current extrapolation.
            self.x = self.x.shifted(t - self.core.t_x);
        }
        self.core.t_x = t;
        self.core.t_q = t;
        self.core.st = st;
        if !matches!(self.f, InputFn::Connection) {
            self.load_coefficients(t);
        }
        ctx.model.set_real(self.core.var_ref, self.x.c[0]);
        let (queue, opts) = (&mut *ctx.queue, ctx.opts);
        self.schedule(queue, opts);
        tracing::debug!(
            target: "vars.input",
            name = %self.core.name,
            t,
            x0 = self.x.c[0],
            t_e = self.core.t_e,
            "input_requantize"
        );
    }

    /// Connection push: replace the trajectory with source coefficients in
    /// the frame of `t`.
    pub fn set_connection(&mut self, t: Time, coeffs: [f64; 4], queue: &mut Queue, opts: &SimOpts) {
        debug_assert!(matches!(self.f, InputFn::Connection));
        self.core.t_x = t;
        self.core.t_q = t;
        self.x.c = coeffs;
        self.truncate_order();
        self.schedule(queue, opts);
    }

    fn load_coefficients(&mut self, t: Time) {
        self.x.c = self.f.eval(t);
        self.truncate_order();
    }

    fn truncate_order(&mut self) {
        for k in (self.core.order as usize + 1)..4 {
            self.x.c[k] = 0.0;
        }
    }

    fn schedule(&mut self, queue: &mut Queue, opts: &SimOpts) {
        self.core.set_qtol(self.x.c[0]);
        let n = self.core.order as usize;
        let cn = self.x.c[n];
        let dt_raw = if cn != 0.0 {
            (self.core.qtol / cn.abs()).powf(1.0 / n as f64)
        } else {
            INFINITY
        };
        let dt = self.core.dt_bounded(dt_raw, opts);
        let t_tol = if dt != INFINITY {
            self.core.t_q + dt
        } else {
            INFINITY
        };
        self.core.t_e = t_tol.min(self.f.next_discontinuity(self.core.t_q));
        let t_e = self.core.t_e;
        self.core.requeue(queue, t_e, EventKind::Input);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_specs() {
        assert_eq!(InputFn::parse("constant[2.5]").unwrap(), InputFn::Constant(2.5));
        assert_eq!(
            InputFn::parse("sin[2, 3, 0.5]").unwrap(),
            InputFn::Sin {
                amp: 2.0,
                omega: 3.0,
                phase: 0.5
            }
        );
        assert_eq!(
            InputFn::parse("step[0,1,2]").unwrap(),
            InputFn::Step {
                y0: 0.0,
                dy: 1.0,
                t_step: 2.0
            }
        );
        assert!(InputFn::parse("warble[1]").is_err());
        assert!(InputFn::parse("sin[a]").is_err());
    }

    #[test]
    fn sin_coefficients_match_derivatives() {
        let f = InputFn::Sin {
            amp: 2.0,
            omega: 3.0,
            phase: 0.0,
        };
        let t = 0.7;
        let c = f.eval(t);
        let h = 1e-6;
        let num_d1 = (f.eval(t + h)[0] - f.eval(t - h)[0]) / (2.0 * h);
        assert!((c[1] - num_d1).abs() < 1e-6);
        let num_d2 = (f.eval(t + h)[0] - 2.0 * c[0] + f.eval(t - h)[0]) / (h * h);
        assert!((2.0 * c[2] - num_d2).abs() < 1e-3);
    }

    #[test]
    fn step_discontinuity_is_scheduled() {
        let f = InputFn::Step {
            y0: 0.0,
            dy: 1.0,
            t_step: 2.0,
        };
        assert_eq!(f.next_discontinuity(0.0), 2.0);
        assert_eq!(f.next_discontinuity(2.0), INFINITY);
        assert_eq!(f.eval(1.9)[0], 0.0);
        assert_eq!(f.eval(2.0)[0], 1.0);
    }
}
