//! The variable family: quantized-state trajectories and their events.
//!
//! Each continuous state, event indicator, input, discrete, and pass-through
//! real in the model is represented by one [`Var`]. A variable owns two local
//! polynomials — the continuous representation `x` valid from `tX` and the
//! quantized representation `q` valid from `tQ` — plus the tolerance state
//! and the dependency edges that drive event propagation.
//!
//! Dispatch is a variant set over the *method* axis with the *order* carried
//! as data: `Qss`, `Liqss`, and `Relax` cover orders 1–3 of the standard,
//! linear-implicit, and full-order-broadcast flavors; `Zc` covers the
//! zero-crossing orders; `Inp`, `Dis`, and `Pass` are the non-state kinds.
//!
//! The dependency graph is cyclic by design, so variables live in an indexed
//! arena ([`VarArena`]) and reference each other by [`VarId`]. Stage hooks
//! that must read other variables while mutating one run through
//! [`VarArena::with_var`], which temporarily lifts the variable out of its
//! slot.

pub mod conditional;
pub mod discrete;
pub mod input;
pub mod liqss;
pub mod passthrough;
pub mod qss;
pub mod relax;
pub mod zc;

pub use conditional::Conditional;
pub use discrete::DisVar;
pub use input::{InpVar, InputFn};
pub use liqss::LiqssVar;
pub use passthrough::PassVar;
pub use qss::QssVar;
pub use relax::RelaxVar;
pub use zc::{Crossing, CrossingSet, ZcVar};

use core_model::Model;
use core_num::Nd;
use core_queue::{EventQueue, Handle};
use core_time::{EventKind, SuperdenseTime, Time, INFINITY, NEG_INFINITY};
use smallvec::SmallVec;

/// Index of a variable in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(pub u32);

/// Index of a conditional block in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CondId(pub u32);

/// What an event queue entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Var(VarId),
    Cond(CondId),
    /// Model-declared time event (`next_event_time` from event iteration).
    TimeEvent,
}

/// Queue specialization used throughout the solver.
pub type Queue = EventQueue<Target>;

/// Tuning knobs the variables read. The configuration layer maps the user
/// options onto this; defaults follow the solver's CLI defaults.
#[derive(Debug, Clone)]
pub struct SimOpts {
    pub rtol: f64,
    pub atol: f64,
    pub ztol: f64,
    /// Zero-crossing bump tolerance multiplier.
    pub zmul: f64,
    pub dt_min: Time,
    pub dt_max: Time,
    pub dt_inf: Time,
    /// Max step before a predicted crossing (0 disables the fixup).
    pub dt_zmax: Time,
    /// Fixed bump step when chatter control is off.
    pub dt_zc: Time,
    pub nd: Nd,
    pub inflection: bool,
    pub inflection_frac: f64,
    pub refine: bool,
    pub clipping: bool,
    pub clip: f64,
    /// Event-indicator tracking policy (0 both, 1 passive-handler only,
    /// 2 no-handler only).
    pub ei_mode: u8,
    /// Prefer directional second derivatives when the model supports them.
    pub d2d: bool,
    pub t_beg: Time,
    pub t_end: Time,
}

impl Default for SimOpts {
    fn default() -> Self {
        Self {
            rtol: 1.0e-4,
            atol: 1.0e-6,
            ztol: 1.0e-6,
            zmul: 1.01,
            dt_min: 0.0,
            dt_max: INFINITY,
            dt_inf: INFINITY,
            dt_zmax: 0.0,
            dt_zc: 1.0e-9,
            nd: Nd::new(1.0e-6),
            inflection: false,
            inflection_frac: 0.25,
            refine: false,
            clipping: false,
            clip: 1.0e-12,
            ei_mode: 0,
            d2d: false,
            t_beg: 0.0,
            t_end: 1.0,
        }
    }
}

/// Borrowed context handed to stage hooks. The arena view excludes the
/// variable currently lifted out by `with_var`.
pub struct Ctx<'a> {
    pub model: &'a mut dyn Model,
    pub arena: &'a VarArena,
    pub queue: &'a mut Queue,
    pub opts: &'a SimOpts,
    /// Model start time; decides forward vs centered differentiation.
    pub t0: Time,
}

impl Ctx<'_> {
    /// Forward time: `t - dtND` would fall before the model start, so the
    /// forward differentiation stencils must be used.
    pub fn fwd_nd(&self, t: Time) -> bool {
        t - self.opts.nd.dt < self.t0
    }
}

/// Local polynomial: coefficients in the frame of its validity start time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Traj {
    pub c: [f64; 4],
}

impl Traj {
    pub fn constant(c0: f64) -> Self {
        Self {
            c: [c0, 0.0, 0.0, 0.0],
        }
    }

    /// Value at offset `d`.
    pub fn val(&self, d: f64) -> f64 {
        self.c[0] + (self.c[1] + (self.c[2] + self.c[3] * d) * d) * d
    }

    /// First derivative at offset `d`.
    pub fn slope(&self, d: f64) -> f64 {
        self.c[1] + (2.0 * self.c[2] + 3.0 * self.c[3] * d) * d
    }

    /// Second derivative at offset `d`.
    pub fn curv(&self, d: f64) -> f64 {
        2.0 * self.c[2] + 6.0 * self.c[3] * d
    }

    /// Coefficients of the same polynomial re-centered at offset `d`.
    pub fn shifted(&self, d: f64) -> Traj {
        Traj {
            c: [
                self.val(d),
                self.slope(d),
                self.c[2] + 3.0 * self.c[3] * d,
                self.c[3],
            ],
        }
    }

    /// Zero coefficients at or below `clip` magnitude.
    pub fn clipped(mut self, clip: f64) -> Traj {
        for c in &mut self.c {
            if c.abs() <= clip {
                *c = 0.0;
            }
        }
        self
    }
}

/// State shared by every variable kind.
#[derive(Debug, Clone)]
pub struct VarCore {
    pub name: String,
    pub id: VarId,
    pub order: u8,
    pub rtol: f64,
    pub atol: f64,
    pub ztol: f64,
    pub qtol: f64,
    pub x_init: f64,
    /// Time of last requantization.
    pub t_q: Time,
    /// Time of last continuous-representation reset.
    pub t_x: Time,
    /// Predicted next requantization time.
    pub t_e: Time,
    /// Superdense time of the last event taken.
    pub st: SuperdenseTime,
    pub handle: Option<Handle>,
    /// Model value reference.
    pub var_ref: core_model::VRef,
    /// Model derivative value reference, when the model supplies one.
    pub der_ref: Option<core_model::VRef>,
    pub observees: SmallVec<[VarId; 4]>,
    pub observers: SmallVec<[VarId; 4]>,
    pub self_observer: bool,
    pub passive: bool,
    pub connected_output: bool,
    /// Relaxed dtInf cap; doubles on consecutive infinite predictions.
    dt_inf_rlx: Time,
}

impl VarCore {
    pub fn new(name: &str, id: VarId, order: u8, var_ref: core_model::VRef, opts: &SimOpts) -> Self {
        assert!((1..=3).contains(&order));
        Self {
            name: name.to_string(),
            id,
            order,
            rtol: opts.rtol,
            atol: opts.atol,
            ztol: opts.ztol,
            qtol: opts.atol,
            x_init: 0.0,
            t_q: opts.t_beg,
            t_x: opts.t_beg,
            t_e: INFINITY,
            st: SuperdenseTime::new(NEG_INFINITY, EventKind::Requantize, 0),
            handle: None,
            var_ref,
            der_ref: None,
            observees: SmallVec::new(),
            observers: SmallVec::new(),
            self_observer: false,
            passive: false,
            connected_output: false,
            dt_inf_rlx: INFINITY,
        }
    }

    pub fn observed(&self) -> bool {
        !self.observers.is_empty()
    }

    /// qTol from a quantized center value. Must stay positive.
    pub fn set_qtol(&mut self, q0: f64) {
        self.qtol = (self.rtol * q0.abs()).max(self.atol);
        assert!(self.qtol > 0.0, "{}: qTol must be positive", self.name);
    }

    /// dtInf guard: an infinite step prediction is clipped to a relaxed cap
    /// that doubles on each consecutive clip; any finite prediction under the
    /// cap resets the relaxation.
    pub fn dt_infinity(&mut self, dt: Time, opts: &SimOpts) -> Time {
        if opts.dt_inf == INFINITY {
            return dt;
        }
        if dt <= opts.dt_inf {
            self.dt_inf_rlx = opts.dt_inf;
            return dt;
        }
        let out = if self.dt_inf_rlx.is_finite() {
            self.dt_inf_rlx
        } else {
            opts.dt_inf
        };
        self.dt_inf_rlx = 2.0 * out;
        out
    }

    /// Clamp a step prediction through the dtInf guard and the min/max caps.
    /// A NaN prediction (derivative blow-up or NaN from the model) is a
    /// tolerated numerical exception: warn and clamp to dtMax.
    pub fn dt_bounded(&mut self, dt: Time, opts: &SimOpts) -> Time {
        debug_assert!(opts.dt_min <= opts.dt_max);
        if dt.is_nan() {
            tracing::warn!(
                target: "vars",
                name = %self.name,
                "non-finite step prediction; clamping to dtMax"
            );
            return opts.dt_max;
        }
        self.dt_infinity(dt, opts).max(opts.dt_min).min(opts.dt_max)
    }

    /// Move this variable's queue entry, adding it on first use.
    pub fn requeue(&mut self, queue: &mut Queue, t: Time, kind: EventKind) {
        let target = Target::Var(self.id);
        self.handle = Some(match self.handle.take() {
            Some(h) => queue.shift(h, t, kind, target),
            None => queue.add(t, kind, target),
        });
    }
}

/// One variable, dispatched by method kind.
#[derive(Debug)]
pub enum Var {
    Qss(QssVar),
    Liqss(LiqssVar),
    Relax(RelaxVar),
    Zc(ZcVar),
    Inp(InpVar),
    Dis(DisVar),
    Pass(PassVar),
}

macro_rules! for_each_var {
    ($self:expr, $v:ident => $body:expr) => {
        match $self {
            Var::Qss($v) => $body,
            Var::Liqss($v) => $body,
            Var::Relax($v) => $body,
            Var::Zc($v) => $body,
            Var::Inp($v) => $body,
            Var::Dis($v) => $body,
            Var::Pass($v) => $body,
        }
    };
}

impl Var {
    pub fn core(&self) -> &VarCore {
        for_each_var!(self, v => &v.core)
    }

    pub fn core_mut(&mut self) -> &mut VarCore {
        for_each_var!(self, v => &mut v.core)
    }

    pub fn id(&self) -> VarId {
        self.core().id
    }

    pub fn name(&self) -> &str {
        &self.core().name
    }

    pub fn order(&self) -> u8 {
        self.core().order
    }

    pub fn is_zc(&self) -> bool {
        matches!(self, Var::Zc(_))
    }

    pub fn is_input(&self) -> bool {
        matches!(self, Var::Inp(_))
    }

    pub fn is_discrete(&self) -> bool {
        matches!(self, Var::Dis(_))
    }

    /// State variable integrated by a QSS method.
    pub fn is_state(&self) -> bool {
        matches!(self, Var::Qss(_) | Var::Liqss(_) | Var::Relax(_))
    }

    /// Non-state variable whose change cascades to its own observers within
    /// the same instant (pass-through reals).
    pub fn is_ns(&self) -> bool {
        matches!(self, Var::Pass(_))
    }

    /// Active variables hold requantization events; passive ones are only
    /// evaluated on demand.
    pub fn is_active(&self) -> bool {
        !self.core().passive
    }

    /// Continuous value at time `t`.
    pub fn x(&self, t: Time) -> f64 {
        for_each_var!(self, v => v.x(t))
    }

    /// Continuous slope at time `t`. Fails loudly beyond the representation.
    pub fn x1(&self, t: Time) -> f64 {
        for_each_var!(self, v => v.x1(t))
    }

    /// Quantized value at time `t`.
    pub fn q(&self, t: Time) -> f64 {
        for_each_var!(self, v => v.q(t))
    }

    /// Quantized slope at time `t`. Fails loudly beyond the representation.
    pub fn q1(&self, t: Time) -> f64 {
        for_each_var!(self, v => v.q1(t))
    }

    /// Quantized slope used as a directional-derivative seed: zero for kinds
    /// whose quantized representation has no slope (order-1 states,
    /// discretes), the true slope otherwise.
    pub fn der_seed(&self, t: Time) -> f64 {
        match self {
            Var::Dis(_) => 0.0,
            Var::Qss(v) if v.core.order == 1 => 0.0,
            Var::Liqss(v) if v.core.order == 1 => 0.0,
            Var::Inp(v) if v.core.order == 1 => 0.0,
            _ => self.q1(t),
        }
    }

    /// Continuous-representation coefficients in the variable's own frame.
    pub fn coeffs(&self) -> [f64; 4] {
        match self {
            Var::Qss(v) => v.x.c,
            Var::Liqss(v) => v.x.c,
            Var::Relax(v) => v.x.c,
            Var::Zc(v) => v.x.c,
            Var::Inp(v) => v.x.c,
            Var::Pass(v) => v.x.c,
            Var::Dis(v) => [v.value(), 0.0, 0.0, 0.0],
        }
    }
}

/// Indexed arena of variables and conditionals.
#[derive(Default)]
pub struct VarArena {
    vars: Vec<Option<Var>>,
    conds: Vec<Option<Conditional>>,
}

impl VarArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn insert(&mut self, make: impl FnOnce(VarId) -> Var) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(Some(make(id)));
        id
    }

    pub fn insert_cond(&mut self, make: impl FnOnce(CondId) -> Conditional) -> CondId {
        let id = CondId(self.conds.len() as u32);
        self.conds.push(Some(make(id)));
        id
    }

    pub fn ids(&self) -> impl Iterator<Item = VarId> + '_ {
        (0..self.vars.len() as u32).map(VarId)
    }

    pub fn cond_ids(&self) -> impl Iterator<Item = CondId> + '_ {
        (0..self.conds.len() as u32).map(CondId)
    }

    pub fn get(&self, id: VarId) -> &Var {
        self.vars[id.0 as usize]
            .as_ref()
            .expect("variable lifted out of the arena")
    }

    pub fn get_mut(&mut self, id: VarId) -> &mut Var {
        self.vars[id.0 as usize]
            .as_mut()
            .expect("variable lifted out of the arena")
    }

    pub fn cond(&self, id: CondId) -> &Conditional {
        self.conds[id.0 as usize]
            .as_ref()
            .expect("conditional lifted out of the arena")
    }

    pub fn cond_mut(&mut self, id: CondId) -> &mut Conditional {
        self.conds[id.0 as usize]
            .as_mut()
            .expect("conditional lifted out of the arena")
    }

    /// Run `f` with the variable lifted out, so it can read the rest of the
    /// arena while being mutated.
    pub fn with_var<R>(&mut self, id: VarId, f: impl FnOnce(&mut Var, &VarArena) -> R) -> R {
        let mut v = self.vars[id.0 as usize]
            .take()
            .expect("variable already lifted out");
        let r = f(&mut v, self);
        self.vars[id.0 as usize] = Some(v);
        r
    }

    /// Same lift-out discipline for conditionals.
    pub fn with_cond<R>(
        &mut self,
        id: CondId,
        f: impl FnOnce(&mut Conditional, &mut VarArena) -> R,
    ) -> R {
        let mut c = self.conds[id.0 as usize]
            .take()
            .expect("conditional already lifted out");
        let r = f(&mut c, self);
        self.conds[id.0 as usize] = Some(c);
        r
    }

    pub fn find(&self, name: &str) -> Option<VarId> {
        self.ids().find(|&id| self.get(id).name() == name)
    }
}
