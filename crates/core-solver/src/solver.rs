//! The solver driver: owns the model, the variable arena, and the event
//! queue; builds the dependency graph; runs the init stages and the main
//! event loop.

use crate::pools::{set_observees_x, with_ctx, Handlers, Observers, TriggersQss, TriggersZc};
use core_config::Options;
use core_model::{Causality, EventInfo, Model, ModelError, ModelVar, VRef, Variability};
use core_num::Nd;
use core_output::TrajWriter;
use core_queue::Handle;
use core_time::{EventKind, SuperdenseTime, Time, INFINITY};
use core_vars::{
    Conditional, CondId, DisVar, InpVar, InputFn, LiqssVar, PassVar, QssVar, Queue, RelaxVar,
    SimOpts, Target, Var, VarArena, VarCore, VarId, ZcVar,
};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Config(#[from] core_config::ConfigError),
    #[error("zero-crossing variable has observers: {0}")]
    ZcHasObservers(String),
    #[error("input variable {input} is modified in conditional clause of {zc}")]
    InputModifiedInConditional { input: String, zc: String },
    #[error("connection output variable is a zero-crossing variable: {0}")]
    ConnectionToZc(String),
    #[error("connection variable not found: {0}")]
    ConnectionNotFound(String),
    #[error("connection variable spec is not unique: {0}")]
    AmbiguousConnection(String),
    #[error("input function for {name}: {message}")]
    BadInputFn { name: String, message: String },
    #[error("output: {0}")]
    Output(anyhow::Error),
}

/// Event-loop counters reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub requantizations: u64,
    pub zc_requantizations: u64,
    pub input_events: u64,
    pub observer_advances: u64,
    pub zero_crossings: u64,
    pub conditional_events: u64,
    pub handler_events: u64,
    pub time_events: u64,
    pub steps: u64,
}

pub struct Solver {
    pub name: String,
    model: Box<dyn Model>,
    arena: VarArena,
    queue: Queue,
    opts: SimOpts,
    cfg: Options,
    t: Time,
    t0: Time,
    vref_to_var: BTreeMap<VRef, VarId>,
    time_handle: Option<Handle>,
    writers: BTreeMap<VarId, TrajWriter>,
    next_out: Time,
    req_counts: Vec<u64>,
    crossings_log: Vec<(String, Time)>,
    pub stats: Stats,
    terminated: bool,
}

impl Solver {
    pub fn new(model: Box<dyn Model>, cfg: Options) -> Result<Self, SetupError> {
        cfg.validate()?;
        let t0 = cfg.t_beg.unwrap_or_else(|| model.t0());
        let t_end = cfg
            .t_end
            .or_else(|| model.t_end())
            .unwrap_or_else(|| t0 + 1.0);
        let opts = SimOpts {
            rtol: cfg.rtol,
            atol: cfg.atol,
            ztol: cfg.ztol,
            zmul: cfg.zmul,
            dt_min: cfg.dt_min,
            dt_max: cfg.dt_max,
            dt_inf: cfg.dt_inf,
            dt_zmax: cfg.dt_zmax,
            dt_zc: cfg.dt_zc,
            nd: Nd::new(cfg.dt_nd),
            inflection: cfg.inflection,
            inflection_frac: cfg.inflection_frac,
            refine: cfg.refine,
            clipping: cfg.clipping,
            clip: cfg.clip,
            ei_mode: cfg.ei,
            d2d: true,
            t_beg: t0,
            t_end,
        };
        let name = model.name().to_string();
        let mut solver = Self {
            name,
            model,
            arena: VarArena::new(),
            queue: Queue::new(),
            opts,
            cfg,
            t: t0,
            t0,
            vref_to_var: BTreeMap::new(),
            time_handle: None,
            writers: BTreeMap::new(),
            next_out: t0,
            req_counts: Vec::new(),
            crossings_log: Vec::new(),
            stats: Stats::default(),
            terminated: false,
        };
        solver.build_vars()?;
        solver.build_graph()?;
        solver.build_conditionals()?;
        solver.req_counts = vec![0; solver.arena.len()];
        Ok(solver)
    }

    /// Create one solver variable per eligible model variable.
    fn build_vars(&mut self) -> Result<(), SetupError> {
        let method = self.cfg.method;
        let order = method.order();
        let model_vars: Vec<ModelVar> = self.model.vars().to_vec();
        for mv in &model_vars {
            if mv.derivative_of.is_some() {
                continue; // derivative slots are queried, not owned
            }
            let make_core = |id: VarId, ord: u8, opts: &SimOpts| {
                let mut core = VarCore::new(&mv.name, id, ord, mv.vref, opts);
                core.x_init = mv.start;
                core.der_ref = mv.derivative;
                core
            };
            let opts = &self.opts;
            let var_id = if mv.is_event_indicator {
                self.arena
                    .insert(|id| Var::Zc(ZcVar::new(make_core(id, order, opts))))
            } else if mv.causality == Causality::Input {
                let f = match self.cfg.fxn.get(&mv.name) {
                    Some(spec) => {
                        InputFn::parse(spec).map_err(|message| SetupError::BadInputFn {
                            name: mv.name.clone(),
                            message,
                        })?
                    }
                    None => InputFn::Constant(mv.start),
                };
                self.arena
                    .insert(|id| Var::Inp(InpVar::new(make_core(id, order, opts), f)))
            } else if mv.variability == Variability::Discrete {
                self.arena
                    .insert(|id| Var::Dis(DisVar::new(make_core(id, 1, opts))))
            } else if mv.derivative.is_some() && mv.variability == Variability::Continuous {
                self.arena.insert(|id| match method {
                    m if m.is_liqss() => Var::Liqss(LiqssVar::new(make_core(id, order, opts))),
                    m if m.is_relax() => Var::Relax(RelaxVar::new(make_core(id, order, opts))),
                    _ => Var::Qss(QssVar::new(make_core(id, order, opts))),
                })
            } else if mv.causality == Causality::Output {
                self.arena
                    .insert(|id| Var::Pass(PassVar::new(make_core(id, 2, opts))))
            } else {
                continue; // parameters, constants, plain locals
            };
            self.vref_to_var.insert(mv.vref, var_id);
        }
        tracing::info!(
            target: "solver",
            model = %self.name,
            variables = self.arena.len(),
            method = %self.cfg.method,
            "variables built"
        );
        Ok(())
    }

    /// Observee edges from the model's dependency metadata, augmented by the
    /// configured dependency specs, then inverted into observer edges.
    fn build_graph(&mut self) -> Result<(), SetupError> {
        let model_vars: Vec<ModelVar> = self.model.vars().to_vec();
        let by_vref: BTreeMap<VRef, &ModelVar> = model_vars.iter().map(|v| (v.vref, v)).collect();

        for (&vref, &id) in &self.vref_to_var {
            let mv = by_vref[&vref];
            // Dependencies live on the computed slot: the derivative for a
            // state, the value itself for indicators and outputs.
            let deps: &[VRef] = if mv.is_event_indicator {
                &mv.deps
            } else if let Some(dref) = mv.derivative {
                by_vref.get(&dref).map(|d| d.deps.as_slice()).unwrap_or(&[])
            } else {
                &mv.deps
            };
            let mut observees: Vec<VarId> = deps
                .iter()
                .filter_map(|d| self.vref_to_var.get(d).copied())
                .collect();

            // Dependency augmentation by name specs.
            for spec in &self.cfg.dep {
                if spec.matches_var(&mv.name) {
                    for (&ovref, &oid) in &self.vref_to_var {
                        if oid != id && spec.matches_dep(&by_vref[&ovref].name) {
                            observees.push(oid);
                        }
                    }
                }
            }
            observees.sort_unstable();
            observees.dedup();
            let self_obs = observees.contains(&id);
            let core = self.arena.get_mut(id).core_mut();
            core.observees = observees.into_iter().collect();
            core.self_observer = self_obs;
        }

        // Invert into observer edges.
        let ids: Vec<VarId> = self.arena.ids().collect();
        for &id in &ids {
            let obs: Vec<VarId> = self.arena.get(id).core().observees.to_vec();
            for oid in obs {
                if oid != id {
                    self.arena.get_mut(oid).core_mut().observers.push(id);
                }
            }
        }
        for &id in &ids {
            let core = self.arena.get_mut(id).core_mut();
            core.observers.sort_unstable();
            core.observers.dedup();
        }

        // A zero-crossing variable is an event indicator, not a value other
        // variables may read.
        for &id in &ids {
            let v = self.arena.get(id);
            if v.is_zc() && v.core().observed() {
                return Err(SetupError::ZcHasObservers(v.name().to_string()));
            }
        }
        Ok(())
    }

    fn build_conditionals(&mut self) -> Result<(), SetupError> {
        let model_vars: Vec<ModelVar> = self.model.vars().to_vec();
        for mv in &model_vars {
            if !mv.is_event_indicator {
                continue;
            }
            let zc_id = self.vref_to_var[&mv.vref];
            let cond_name = format!("{} conditional", mv.name);
            let cid = self
                .arena
                .insert_cond(|id| Conditional::new(&cond_name, id, zc_id));
            for mref in &mv.mods {
                let target = self
                    .vref_to_var
                    .get(mref)
                    .copied()
                    .ok_or_else(|| ModelError::UnknownVariable(format!("vref {mref}")))?;
                if self.arena.get(target).is_input() {
                    return Err(SetupError::InputModifiedInConditional {
                        input: self.arena.get(target).name().to_string(),
                        zc: mv.name.clone(),
                    });
                }
                self.arena.cond_mut(cid).add_observer(target);
            }
            match self.arena.get_mut(zc_id) {
                Var::Zc(z) => z.conditional = Some(cid),
                _ => unreachable!(),
            }
        }
        Ok(())
    }

    /// Initialization: values, derivatives, tolerances, first events.
    pub fn init(&mut self) -> Result<(), SetupError> {
        let t0 = self.t0;
        self.model.set_time(t0);

        let ids: Vec<VarId> = self.arena.ids().collect();
        let states: Vec<VarId> = ids
            .iter()
            .copied()
            .filter(|&id| self.arena.get(id).is_state())
            .collect();
        let zcs: Vec<VarId> = ids
            .iter()
            .copied()
            .filter(|&id| self.arena.get(id).is_zc())
            .collect();
        let passes: Vec<VarId> = ids
            .iter()
            .copied()
            .filter(|&id| self.arena.get(id).is_ns())
            .collect();
        let inputs: Vec<VarId> = ids
            .iter()
            .copied()
            .filter(|&id| self.arena.get(id).is_input())
            .collect();
        let discretes: Vec<VarId> = ids
            .iter()
            .copied()
            .filter(|&id| self.arena.get(id).is_discrete())
            .collect();

        // Stage 0: start values into the model (states, inputs, discretes),
        // then value reads for the computed kinds.
        for &id in states.iter().chain(&inputs).chain(&discretes) {
            with_ctx(
                &mut self.arena,
                self.model.as_mut(),
                &mut self.queue,
                &self.opts,
                t0,
                id,
                |v, ctx| match v {
                    Var::Qss(v) => v.init_0(ctx),
                    Var::Liqss(v) => v.init_0(ctx),
                    Var::Relax(v) => v.init_0(ctx),
                    Var::Inp(v) => v.init_0(ctx),
                    Var::Dis(v) => v.init_0(ctx),
                    _ => unreachable!(),
                },
            );
        }
        for &id in passes.iter().chain(&zcs) {
            with_ctx(
                &mut self.arena,
                self.model.as_mut(),
                &mut self.queue,
                &self.opts,
                t0,
                id,
                |v, ctx| match v {
                    Var::Pass(v) => v.init_0(ctx),
                    Var::Zc(v) => v.init_0(ctx),
                    _ => unreachable!(),
                },
            );
        }

        // Conditionals: resolve computational observers, park events, and
        // passivate indicators nothing listens to.
        let cond_ids: Vec<CondId> = self.arena.cond_ids().collect();
        for cid in cond_ids {
            self.arena.with_cond(cid, |c, arena| {
                c.init_observers(arena, self.opts.ei_mode);
                c.enqueue(&mut self.queue);
            });
            let (empty, zc_id) = {
                let c = self.arena.cond(cid);
                (c.is_empty(), c.zc)
            };
            if empty {
                match self.arena.get_mut(zc_id) {
                    Var::Zc(z) => z.flag_passive(&mut self.queue),
                    _ => unreachable!(),
                }
            }
        }

        // Derivative stages via the trigger pools (at t0 the stage-0
        // advance is the identity, so init shares the requantization path).
        let st = SuperdenseTime::new(t0, EventKind::Requantize, 0);
        TriggersQss::advance(
            &mut self.arena,
            self.model.as_mut(),
            &mut self.queue,
            &self.opts,
            t0,
            &states,
            t0,
            st,
        );
        let active_zcs: Vec<VarId> = zcs
            .iter()
            .copied()
            .filter(|&id| self.arena.get(id).is_active())
            .collect();
        TriggersZc::advance(
            &mut self.arena,
            self.model.as_mut(),
            &mut self.queue,
            &self.opts,
            t0,
            &active_zcs,
            t0,
            st,
        );
        Observers::advance_r(
            &mut self.arena,
            self.model.as_mut(),
            &mut self.queue,
            &self.opts,
            t0,
            &passes,
            t0,
            st,
        );
        for &id in &inputs {
            match self.arena.get_mut(id) {
                Var::Inp(v) => v.init_f(&mut self.queue, &self.opts),
                _ => unreachable!(),
            }
        }

        // Model's own initial event iteration; schedule a time event if it
        // declares one.
        let mut info = EventInfo::default();
        self.model.new_discrete_states(&mut info);
        self.schedule_time_event(info.next_event_time);

        // Output writers.
        if self.cfg.output.sampled {
            for &id in &ids {
                let name = self.arena.get(id).name().to_string();
                let wanted = self.cfg.var_filter.is_empty()
                    || self.cfg.var_filter.iter().any(|re| re.is_match(&name));
                if wanted && !self.arena.get(id).is_zc() {
                    let w = TrajWriter::create(&self.cfg.out_dir, &name)
                        .map_err(SetupError::Output)?;
                    self.writers.insert(id, w);
                }
            }
        }
        self.next_out = t0;
        self.write_samples(t0)?;

        tracing::info!(target: "solver", model = %self.name, t0, "initialized");
        Ok(())
    }

    fn schedule_time_event(&mut self, t_next: Option<Time>) {
        let t = t_next.unwrap_or(INFINITY);
        self.time_handle = Some(match self.time_handle.take() {
            Some(h) => self
                .queue
                .shift(h, t, EventKind::Discrete, Target::TimeEvent),
            None => self.queue.add(t, EventKind::Discrete, Target::TimeEvent),
        });
    }

    /// Superdense time of the next pending event.
    pub fn next_time(&self) -> Option<SuperdenseTime> {
        self.queue.peek_time()
    }

    pub fn time(&self) -> Time {
        self.t
    }

    pub fn t_end(&self) -> Time {
        self.opts.t_end
    }

    pub fn terminated(&self) -> bool {
        self.terminated
    }

    /// Process the head event group if it is at or before `t_limit`.
    /// Returns the superdense time processed.
    pub fn step_bounded(&mut self, t_limit: Time) -> Result<Option<SuperdenseTime>, SetupError> {
        if self.terminated {
            return Ok(None);
        }
        let head = match self.queue.peek_time() {
            Some(h) => h,
            None => return Ok(None),
        };
        if !head.t.is_finite() || head.t > t_limit {
            return Ok(None);
        }
        self.write_samples_up_to(head.t)?;
        self.queue.mark(head);
        let (st, group) = self.queue.top_group().expect("head vanished");
        self.model.set_time(st.t);
        self.t = st.t;
        self.stats.steps += 1;
        tracing::trace!(
            target: "solver",
            model = %self.name,
            t = st.t,
            kind = %st.kind,
            n = group.len(),
            "dispatch"
        );

        match st.kind {
            EventKind::Requantize => self.dispatch_requantize(&group, st),
            EventKind::Input => self.dispatch_input(&group, st),
            EventKind::ZeroCrossing => self.dispatch_zc(&group, st),
            EventKind::Conditional => self.dispatch_conditional(&group),
            EventKind::Handler => self.dispatch_handler(&group, st),
            EventKind::Discrete => self.dispatch_time_event(&group, st),
            EventKind::Observe => unreachable!("observers are advanced inline"),
        }
        Ok(Some(st))
    }

    fn group_vars(group: &[Target]) -> Vec<VarId> {
        group
            .iter()
            .filter_map(|t| match t {
                Target::Var(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    fn dispatch_requantize(&mut self, group: &[Target], st: SuperdenseTime) {
        let vars = Self::group_vars(group);
        let t = st.t;
        let states: Vec<VarId> = vars
            .iter()
            .copied()
            .filter(|&id| self.arena.get(id).is_state())
            .collect();
        let zcs: Vec<VarId> = vars
            .iter()
            .copied()
            .filter(|&id| self.arena.get(id).is_zc())
            .collect();
        let passes: Vec<VarId> = vars
            .iter()
            .copied()
            .filter(|&id| self.arena.get(id).is_ns())
            .collect();
        self.stats.requantizations += states.len() as u64;
        self.stats.zc_requantizations += zcs.len() as u64;
        for &id in &states {
            self.req_counts[id.0 as usize] += 1;
        }
        TriggersQss::advance(
            &mut self.arena,
            self.model.as_mut(),
            &mut self.queue,
            &self.opts,
            self.t0,
            &states,
            t,
            st,
        );
        TriggersZc::advance(
            &mut self.arena,
            self.model.as_mut(),
            &mut self.queue,
            &self.opts,
            self.t0,
            &zcs,
            t,
            st,
        );
        Observers::advance_r(
            &mut self.arena,
            self.model.as_mut(),
            &mut self.queue,
            &self.opts,
            self.t0,
            &passes,
            t,
            st,
        );
        let advanced: Vec<VarId> = states.iter().chain(&passes).copied().collect();
        self.stats.observer_advances += Observers::advance(
            &mut self.arena,
            self.model.as_mut(),
            &mut self.queue,
            &self.opts,
            self.t0,
            &advanced,
            t,
            st,
        ) as u64;
        if self.cfg.dt_nd_optimizer {
            self.tune_dt_nd(&states);
        }
        self.write_events(&states, t, self.cfg.output.requantizations);
    }

    /// Adaptive differentiation step: when the third-difference coefficient
    /// is noise-dominated relative to the second, the stencil is too narrow
    /// for the roundoff floor and `dtND` shrinks; smooth coefficients let it
    /// recover toward the configured maximum.
    fn tune_dt_nd(&mut self, advanced: &[VarId]) {
        let mut worst: f64 = 0.0;
        let mut any = false;
        for &id in advanced {
            let v = self.arena.get(id);
            if v.order() < 3 {
                continue;
            }
            let c = v.coeffs();
            any = true;
            worst = worst.max(c[3].abs() * self.opts.nd.dt / (c[2].abs() + self.opts.atol));
        }
        if !any {
            return;
        }
        let dt = self.opts.nd.dt;
        let floor = 64.0 * f64::EPSILON * self.t.abs().max(1.0);
        let new_dt = if worst > 1.0e3 {
            (dt * 0.5).max(floor)
        } else if worst < 1.0 {
            (dt * 2.0).min(self.cfg.dt_nd_max)
        } else {
            dt
        };
        if new_dt != dt {
            tracing::debug!(target: "solver", from = dt, to = new_dt, "dtND retuned");
            self.opts.nd = Nd::new(new_dt);
        }
    }

    fn dispatch_input(&mut self, group: &[Target], st: SuperdenseTime) {
        let vars = Self::group_vars(group);
        let t = st.t;
        self.stats.input_events += vars.len() as u64;
        for &id in &vars {
            with_ctx(
                &mut self.arena,
                self.model.as_mut(),
                &mut self.queue,
                &self.opts,
                self.t0,
                id,
                |v, ctx| match v {
                    Var::Inp(v) => v.advance_input(ctx, t, st),
                    _ => unreachable!("non-input in input group"),
                },
            );
        }
        self.stats.observer_advances += Observers::advance(
            &mut self.arena,
            self.model.as_mut(),
            &mut self.queue,
            &self.opts,
            self.t0,
            &vars,
            t,
            st,
        ) as u64;
    }

    fn dispatch_zc(&mut self, group: &[Target], st: SuperdenseTime) {
        let vars = Self::group_vars(group);
        let t = st.t;
        self.stats.zero_crossings += vars.len() as u64;
        for &id in &vars {
            if self.cfg.output.zero_crossings {
                self.crossings_log
                    .push((self.arena.get(id).name().to_string(), t));
            }
            self.arena.get_mut(id).core_mut().st = st;
            // Bump the model just past the crossing before processing it:
            // the model's own detection must see the post-crossing sign, and
            // the captured indicator value is the baseline for the
            // handler-modified check.
            let (t_bump, observees) = match self.arena.get(id) {
                Var::Zc(z) => (z.bump_time(t, &self.opts), z.core.observees.to_vec()),
                _ => unreachable!("non-ZC in crossing group"),
            };
            self.model.set_time(t_bump);
            set_observees_x(&self.arena, self.model.as_mut(), &observees, t_bump);
            let vref = self.arena.get(id).core().var_ref;
            let x0_bump = self.model.get_real(vref);
            match self.arena.get_mut(id) {
                Var::Zc(z) => z.x0_bump = x0_bump,
                _ => unreachable!(),
            }
            self.model.set_time(t);
            with_ctx(
                &mut self.arena,
                self.model.as_mut(),
                &mut self.queue,
                &self.opts,
                self.t0,
                id,
                |v, ctx| match v {
                    Var::Zc(v) => v.advance_zc(ctx),
                    _ => unreachable!("non-ZC in crossing group"),
                },
            );
            if self.opts.refine {
                // Root refinement walked the observee values around; re-bump
                // so the event iteration still sees the post-crossing state.
                set_observees_x(&self.arena, self.model.as_mut(), &observees, t_bump);
            }
            let cid = match self.arena.get(id) {
                Var::Zc(z) => z.conditional.expect("crossing without conditional"),
                _ => unreachable!(),
            };
            self.arena.with_cond(cid, |c, _| c.activity(t, &mut self.queue));
        }
    }

    fn dispatch_conditional(&mut self, group: &[Target]) {
        let conds: Vec<CondId> = group
            .iter()
            .filter_map(|t| match t {
                Target::Cond(id) => Some(*id),
                _ => None,
            })
            .collect();
        self.stats.conditional_events += conds.len() as u64;
        for cid in conds {
            self.arena
                .with_cond(cid, |c, arena| c.advance(arena, &mut self.queue));
        }
    }

    fn dispatch_handler(&mut self, group: &[Target], st: SuperdenseTime) {
        let vars = Self::group_vars(group);
        let t = st.t;
        self.stats.handler_events += vars.len() as u64;

        // Indicators that crossed at this instant were bumped at their ZC
        // dispatch; their observee model values still sit just past the
        // crossing, which is what the event iteration must see.
        let firing: Vec<VarId> = self
            .arena
            .ids()
            .filter(|&id| match self.arena.get(id) {
                Var::Zc(z) => z.is_tz_last(t),
                _ => false,
            })
            .collect();

        // Model event iteration applies the discontinuities.
        let mut info = EventInfo::default();
        self.model.new_discrete_states(&mut info);
        if info.terminate_simulation {
            self.terminated = true;
        }

        // Un-bump: record which indicators the handlers themselves moved,
        // then restore observee values at t, keeping handler outputs.
        for &zid in &firing {
            let vref = self.arena.get(zid).core().var_ref;
            let x0_now = self.model.get_real(vref);
            match self.arena.get_mut(zid) {
                Var::Zc(z) => z.handler_modified = x0_now != z.x0_bump,
                _ => unreachable!(),
            }
        }
        self.model.set_time(t);
        for &zid in &firing {
            let observees: Vec<VarId> = self.arena.get(zid).core().observees.to_vec();
            let keep: Vec<VarId> = observees
                .into_iter()
                .filter(|id| !vars.contains(id))
                .collect();
            set_observees_x(&self.arena, self.model.as_mut(), &keep, t);
        }

        Handlers::advance(
            &mut self.arena,
            self.model.as_mut(),
            &mut self.queue,
            &self.opts,
            self.t0,
            &vars,
            t,
            st,
        );
        self.schedule_time_event(info.next_event_time.filter(|tn| *tn > t));
        self.stats.observer_advances += Observers::advance(
            &mut self.arena,
            self.model.as_mut(),
            &mut self.queue,
            &self.opts,
            self.t0,
            &vars,
            t,
            st,
        ) as u64;
        self.write_events(&vars, t, self.cfg.output.discrete);
    }

    fn dispatch_time_event(&mut self, group: &[Target], st: SuperdenseTime) {
        debug_assert!(group.iter().any(|t| matches!(t, Target::TimeEvent)));
        let t = st.t;
        self.stats.time_events += 1;
        let mut info = EventInfo::default();
        self.model.new_discrete_states(&mut info);
        if info.terminate_simulation {
            self.terminated = true;
        }
        // Refresh discrete variables the event may have changed.
        let discretes: Vec<VarId> = self
            .arena
            .ids()
            .filter(|&id| self.arena.get(id).is_discrete())
            .collect();
        let mut changed: Vec<VarId> = Vec::new();
        for &id in &discretes {
            let vref = self.arena.get(id).core().var_ref;
            let new = self.model.get_real(vref);
            let old = self.arena.get(id).x(t);
            if new != old {
                with_ctx(
                    &mut self.arena,
                    self.model.as_mut(),
                    &mut self.queue,
                    &self.opts,
                    self.t0,
                    id,
                    |v, ctx| match v {
                        Var::Dis(v) => v.advance_handler(ctx, t, st),
                        _ => unreachable!(),
                    },
                );
                changed.push(id);
            }
        }
        self.schedule_time_event(info.next_event_time.filter(|tn| *tn > t));
        if !changed.is_empty() {
            self.stats.observer_advances += Observers::advance(
                &mut self.arena,
                self.model.as_mut(),
                &mut self.queue,
                &self.opts,
                self.t0,
                &changed,
                t,
                st,
            ) as u64;
        }
    }

    /// Run to the configured end time.
    pub fn simulate(&mut self) -> Result<&Stats, SetupError> {
        let t_end = self.opts.t_end;
        while self.step_bounded(t_end)?.is_some() {}
        self.finish()?;
        Ok(&self.stats)
    }

    /// Flush final samples and output files.
    pub fn finish(&mut self) -> Result<(), SetupError> {
        let t_end = self.opts.t_end;
        self.write_samples_up_to(t_end)?;
        self.write_samples(t_end)?;
        for (_, w) in std::mem::take(&mut self.writers) {
            w.finish().map_err(SetupError::Output)?;
        }
        if self.cfg.output.steps {
            let counts: Vec<(String, u64)> = self
                .arena
                .ids()
                .map(|id| {
                    (
                        self.arena.get(id).name().to_string(),
                        self.req_counts[id.0 as usize],
                    )
                })
                .collect();
            core_output::write_steps(&self.cfg.out_dir, &counts).map_err(SetupError::Output)?;
        }
        if self.cfg.output.zero_crossings && !self.crossings_log.is_empty() {
            let path = self.cfg.out_dir.join("crossings.csv");
            let mut text = String::from("indicator,t\n");
            for (name, t) in &self.crossings_log {
                text.push_str(&format!("{name},{t}\n"));
            }
            std::fs::write(&path, text)
                .map_err(|e| SetupError::Output(anyhow::Error::new(e)))?;
        }
        if self.cfg.dot.dependency {
            let mut edges = Vec::new();
            for id in self.arena.ids() {
                let v = self.arena.get(id);
                for &oid in &v.core().observees {
                    edges.push((
                        self.arena.get(oid).name().to_string(),
                        v.name().to_string(),
                    ));
                }
            }
            core_output::write_dot(&self.cfg.out_dir, &format!("{}_deps", self.name), &edges)
                .map_err(SetupError::Output)?;
        }
        tracing::info!(
            target: "solver",
            model = %self.name,
            t = self.t,
            requantizations = self.stats.requantizations,
            zero_crossings = self.stats.zero_crossings,
            handlers = self.stats.handler_events,
            observers = self.stats.observer_advances,
            "simulation complete"
        );
        Ok(())
    }

    // -- Sampled output ----------------------------------------------------

    fn write_samples_up_to(&mut self, t: Time) -> Result<(), SetupError> {
        let Some(dt_out) = self.cfg.dt_out else {
            return Ok(());
        };
        while self.next_out + dt_out <= t {
            self.next_out += dt_out;
            let t_s = self.next_out;
            self.write_samples(t_s)?;
        }
        Ok(())
    }

    fn write_samples(&mut self, t: Time) -> Result<(), SetupError> {
        let ids: Vec<VarId> = self.writers.keys().copied().collect();
        for id in ids {
            let v = self.arena.get(id).x(t);
            if let Some(w) = self.writers.get_mut(&id) {
                w.write(t, v).map_err(SetupError::Output)?;
            }
        }
        Ok(())
    }

    fn write_events(&mut self, vars: &[VarId], t: Time, enabled: bool) {
        if !enabled {
            return;
        }
        for &id in vars {
            if let Some(w) = self.writers.get_mut(&id) {
                let v = self.arena.get(id).x(t);
                let _ = w.write(t, v);
            }
        }
    }

    /// Trajectory invariants that must hold after every Stage Final. Debug
    /// aid; panics on violation.
    pub fn check_invariants(&self) {
        for id in self.arena.ids() {
            let v = self.arena.get(id);
            let core = v.core();
            assert!(core.qtol > 0.0, "{}: qTol must stay positive", core.name);
            // After a requantization tX == tQ; an observer advance moves tX
            // ahead of tQ. Either way the next event cannot precede both.
            if v.is_state() || (v.is_zc() && v.is_active()) {
                assert!(
                    core.t_e >= core.t_x && core.t_e >= core.t_q,
                    "{}: tE {} precedes tX {} or tQ {}",
                    core.name,
                    core.t_e,
                    core.t_x,
                    core.t_q
                );
            }
        }
    }

    // -- Introspection for tests and connections ---------------------------

    pub fn var_id(&self, name: &str) -> Option<VarId> {
        self.arena.find(name)
    }

    /// Continuous value of a variable at `t` (valid for `t` at or after the
    /// variable's last reset and at or before the next pending event).
    pub fn value(&self, name: &str, t: Time) -> f64 {
        let id = self.arena.find(name).expect("unknown variable");
        self.arena.get(id).x(t)
    }

    pub fn requantization_count(&self, name: &str) -> u64 {
        let id = self.arena.find(name).expect("unknown variable");
        self.req_counts[id.0 as usize]
    }

    /// Trajectory coefficients of a variable re-centered at `t`, for
    /// connection pushes.
    pub fn output_coeffs(&self, id: VarId, t: Time) -> [f64; 4] {
        let v = self.arena.get(id);
        let x0 = v.x(t);
        let x1 = v.x1(t);
        [x0, x1, 0.0, 0.0]
    }

    /// Resolve a connection endpoint; the spec must name exactly one
    /// variable.
    pub fn resolve_connection(&self, spec: &str) -> Result<VarId, SetupError> {
        let re = core_config::spec_regex(spec)?;
        let mut matches = self
            .arena
            .ids()
            .filter(|&id| re.is_match(self.arena.get(id).name()));
        let first = matches
            .next()
            .ok_or_else(|| SetupError::ConnectionNotFound(spec.to_string()))?;
        if matches.next().is_some() {
            return Err(SetupError::AmbiguousConnection(spec.to_string()));
        }
        Ok(first)
    }

    /// Mark an input as connection-driven; its value is pushed by the
    /// connection manager instead of a source function.
    pub fn make_connected_input(&mut self, id: VarId) -> Result<(), SetupError> {
        match self.arena.get_mut(id) {
            Var::Inp(v) => {
                v.f = InputFn::Connection;
                Ok(())
            }
            other => Err(SetupError::ConnectionNotFound(other.name().to_string())),
        }
    }

    pub fn mark_connected_output(&mut self, id: VarId) -> Result<(), SetupError> {
        let v = self.arena.get_mut(id);
        if v.is_zc() {
            return Err(SetupError::ConnectionToZc(v.name().to_string()));
        }
        v.core_mut().connected_output = true;
        Ok(())
    }

    /// Push source coefficients into a connected input at time `t`.
    pub fn push_connection(&mut self, id: VarId, t: Time, coeffs: [f64; 4]) {
        let vref = self.arena.get(id).core().var_ref;
        self.model.set_real(vref, coeffs[0]);
        match self.arena.get_mut(id) {
            Var::Inp(v) => v.set_connection(t, coeffs, &mut self.queue, &self.opts),
            _ => unreachable!("connection push to a non-input"),
        }
        let st = self.queue.stamp(t, EventKind::Input);
        self.stats.observer_advances += Observers::advance(
            &mut self.arena,
            self.model.as_mut(),
            &mut self.queue,
            &self.opts,
            self.t0,
            &[id],
            t,
            st,
        ) as u64;
    }
}
