//! Pooled stage processors for simultaneous events.
//!
//! One model query for many value references is much cheaper than many
//! single queries, so simultaneous triggers are advanced stage by stage: all
//! Stage 0 advances complete before any Stage 1 query issues, observee
//! values are set once for the union of the batch's observees before each
//! query, and the numerical-differentiation time walk (set time, set
//! observees, query) is shared by the whole batch. Stage Final runs per
//! trigger in input order.
//!
//! Centered stencils need a sample at `t - dtND`; when that would precede
//! the model start time the forward stencils are used instead.

use core_model::Model;
use core_time::{SuperdenseTime, Time};
use core_vars::{Ctx, Queue, SimOpts, Var, VarArena, VarId};

/// Lift one variable out and hand it a full stage context.
pub(crate) fn with_ctx<R>(
    arena: &mut VarArena,
    model: &mut dyn Model,
    queue: &mut Queue,
    opts: &SimOpts,
    t0: Time,
    id: VarId,
    f: impl FnOnce(&mut Var, &mut Ctx<'_>) -> R,
) -> R {
    arena.with_var(id, |v, arena| {
        let mut ctx = Ctx {
            model: &mut *model,
            arena,
            queue: &mut *queue,
            opts,
            t0,
        };
        f(v, &mut ctx)
    })
}

/// Union of the batch members' observees, deduplicated and ordered for
/// deterministic model writes.
pub(crate) fn collect_observees(arena: &VarArena, members: &[VarId]) -> Vec<VarId> {
    let mut ids: Vec<VarId> = members
        .iter()
        .flat_map(|&id| arena.get(id).core().observees.iter().copied())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Set observee model values from the quantized representations at `t`.
pub(crate) fn set_observees_q(
    arena: &VarArena,
    model: &mut dyn Model,
    observees: &[VarId],
    t: Time,
) {
    for &oid in observees {
        let o = arena.get(oid);
        model.set_real(o.core().var_ref, o.q(t));
    }
}

/// Set observee model values from the continuous representations at `t`.
pub(crate) fn set_observees_x(
    arena: &VarArena,
    model: &mut dyn Model,
    observees: &[VarId],
    t: Time,
) {
    for &oid in observees {
        let o = arena.get(oid);
        model.set_real(o.core().var_ref, o.x(t));
    }
}

fn der_ref_of(arena: &VarArena, id: VarId) -> core_model::VRef {
    arena
        .get(id)
        .core()
        .der_ref
        .expect("trigger without a derivative value reference")
}

fn fetch_ders(arena: &VarArena, model: &dyn Model, members: &[VarId], out: &mut [f64]) {
    let refs: Vec<core_model::VRef> = members.iter().map(|&id| der_ref_of(arena, id)).collect();
    model.get_reals(&refs, out);
}

/// Requantization of a batch of QSS-family state variables sharing one
/// superdense time (and, by construction, one order).
pub struct TriggersQss;

impl TriggersQss {
    #[allow(clippy::too_many_arguments)]
    pub fn advance(
        arena: &mut VarArena,
        model: &mut dyn Model,
        queue: &mut Queue,
        opts: &SimOpts,
        t0: Time,
        triggers: &[VarId],
        t: Time,
        st: SuperdenseTime,
    ) {
        if triggers.is_empty() {
            return;
        }
        debug_assert_eq!(model.get_time(), t);
        let order = arena.get(triggers[0]).order();
        debug_assert!(triggers.iter().all(|&id| arena.get(id).order() == order));

        // Stage 0: advance values; all commits before any query.
        for &id in triggers {
            match arena.get_mut(id) {
                Var::Qss(v) => v.advance_qss_0(t, st),
                Var::Liqss(v) => v.advance_qss_0(t, st),
                Var::Relax(v) => v.advance_qss_0(t, st),
                other => unreachable!("non-state QSS trigger {}", other.name()),
            }
        }

        // Stage 1: pooled first derivatives at t.
        let observees = collect_observees(arena, triggers);
        set_observees_q(arena, model, &observees, t);
        let mut ders = vec![0.0; triggers.len()];
        fetch_ders(arena, model, triggers, &mut ders);
        for (&id, &d) in triggers.iter().zip(&ders) {
            match arena.get_mut(id) {
                Var::Qss(v) => v.advance_qss_1(d),
                Var::Liqss(v) => v.advance_qss_1(d),
                Var::Relax(v) => v.advance_qss_1(d),
                _ => unreachable!(),
            }
        }
        // Order-1 LIQSS self-observers probe on the first derivative.
        if order == 1 {
            Self::probe_self_observers(arena, model, queue, opts, t0, triggers, t);
        }

        if order >= 2 {
            let d2d = opts.d2d && model.supports_directional_derivatives();
            if d2d {
                Self::stages_d2d(arena, model, opts, triggers, &observees, t, order);
            } else {
                Self::stages_n2d(arena, model, opts, t0, triggers, &observees, t, order);
            }
            Self::probe_self_observers(arena, model, queue, opts, t0, triggers, t);
        }

        // Stage Final, serial in input order.
        for &id in triggers {
            match arena.get_mut(id) {
                Var::Qss(v) => v.advance_qss_f(queue, opts),
                Var::Liqss(v) => v.advance_qss_f(queue, opts),
                Var::Relax(v) => v.advance_qss_f(queue, opts),
                _ => unreachable!(),
            }
        }
    }

    /// LIQSS self-observers replace their sampled stages with the band-edge
    /// probe. Runs after the pooled samples are distributed so the probes'
    /// model writes cannot corrupt the batch queries.
    fn probe_self_observers(
        arena: &mut VarArena,
        model: &mut dyn Model,
        queue: &mut Queue,
        opts: &SimOpts,
        t0: Time,
        triggers: &[VarId],
        t: Time,
    ) {
        for &id in triggers {
            let is_so = matches!(arena.get(id), Var::Liqss(v) if v.core.self_observer);
            if is_so {
                with_ctx(arena, model, queue, opts, t0, id, |v, ctx| match v {
                    Var::Liqss(v) => v.advance_liqss_probe(ctx, t),
                    _ => unreachable!(),
                });
            }
        }
    }

    /// Directional second derivatives: one pooled call per stage.
    fn stages_d2d(
        arena: &mut VarArena,
        model: &mut dyn Model,
        opts: &SimOpts,
        triggers: &[VarId],
        observees: &[VarId],
        t: Time,
        order: u8,
    ) {
        let obs_refs: Vec<core_model::VRef> = observees
            .iter()
            .map(|&id| arena.get(id).core().var_ref)
            .collect();
        let der_refs: Vec<core_model::VRef> =
            triggers.iter().map(|&id| der_ref_of(arena, id)).collect();
        let seeds: Vec<f64> = observees
            .iter()
            .map(|&id| arena.get(id).der_seed(t))
            .collect();
        let mut d2 = vec![0.0; triggers.len()];
        model.directional_derivative(&obs_refs, &der_refs, &seeds, &mut d2);
        for (&id, &v2) in triggers.iter().zip(&d2) {
            match arena.get_mut(id) {
                Var::Qss(v) => v.advance_qss_2_dd(v2),
                Var::Liqss(v) if !v.core.self_observer => v.advance_qss_2_dd(v2),
                Var::Liqss(_) => {} // probe handles it
                Var::Relax(v) => v.advance_qss_2_dd(v2),
                _ => unreachable!(),
            }
        }
        if order >= 3 {
            let tn = t + opts.nd.dt;
            model.set_time(tn);
            set_observees_q(arena, model, observees, tn);
            let seeds: Vec<f64> = observees
                .iter()
                .map(|&id| arena.get(id).der_seed(tn))
                .collect();
            let mut d2p = vec![0.0; triggers.len()];
            model.directional_derivative(&obs_refs, &der_refs, &seeds, &mut d2p);
            for (&id, &v2p) in triggers.iter().zip(&d2p) {
                match arena.get_mut(id) {
                    Var::Qss(v) => v.advance_qss_3_dd(opts, v2p),
                    Var::Liqss(v) if !v.core.self_observer => v.advance_qss_3_dd(opts, v2p),
                    Var::Liqss(_) => {}
                    Var::Relax(v) => v.advance_qss_3_dd(opts, v2p),
                    _ => unreachable!(),
                }
            }
            model.set_time(t);
            set_observees_q(arena, model, observees, t);
        }
    }

    /// Numerical second (and third) derivatives by the shared time walk.
    #[allow(clippy::too_many_arguments)]
    fn stages_n2d(
        arena: &mut VarArena,
        model: &mut dyn Model,
        opts: &SimOpts,
        t0: Time,
        triggers: &[VarId],
        observees: &[VarId],
        t: Time,
        order: u8,
    ) {
        let nd = opts.nd;
        let n = triggers.len();
        if order >= 3 {
            let fwd = t - nd.dt < t0;
            if !fwd {
                let tm = t - nd.dt;
                model.set_time(tm);
                set_observees_q(arena, model, observees, tm);
                let mut ders_m = vec![0.0; n];
                fetch_ders(arena, model, triggers, &mut ders_m);
                let tp = t + nd.dt;
                model.set_time(tp);
                set_observees_q(arena, model, observees, tp);
                let mut ders_p = vec![0.0; n];
                fetch_ders(arena, model, triggers, &mut ders_p);
                for (i, &id) in triggers.iter().enumerate() {
                    match arena.get_mut(id) {
                        Var::Qss(v) => {
                            v.advance_qss_2_c(opts, ders_m[i], ders_p[i]);
                            v.advance_qss_3(opts);
                        }
                        Var::Liqss(v) if !v.core.self_observer => {
                            v.advance_qss_2_c(opts, ders_m[i], ders_p[i]);
                            v.advance_qss_3(opts);
                        }
                        Var::Liqss(_) => {}
                        Var::Relax(v) => {
                            v.advance_qss_2_c(opts, ders_m[i], ders_p[i]);
                            v.advance_qss_3(opts);
                        }
                        _ => unreachable!(),
                    }
                }
            } else {
                let tp = t + nd.dt;
                model.set_time(tp);
                set_observees_q(arena, model, observees, tp);
                let mut ders_p = vec![0.0; n];
                fetch_ders(arena, model, triggers, &mut ders_p);
                let tpp = t + nd.two_dt;
                model.set_time(tpp);
                set_observees_q(arena, model, observees, tpp);
                let mut ders_pp = vec![0.0; n];
                fetch_ders(arena, model, triggers, &mut ders_pp);
                for (i, &id) in triggers.iter().enumerate() {
                    match arena.get_mut(id) {
                        Var::Qss(v) => {
                            v.advance_qss_2_f(opts, ders_p[i], ders_pp[i]);
                            v.advance_qss_3_f(opts);
                        }
                        Var::Liqss(v) if !v.core.self_observer => {
                            v.advance_qss_2_f(opts, ders_p[i], ders_pp[i]);
                            v.advance_qss_3_f(opts);
                        }
                        Var::Liqss(_) => {}
                        Var::Relax(v) => {
                            v.advance_qss_2_f(opts, ders_p[i], ders_pp[i]);
                            v.advance_qss_3_f(opts);
                        }
                        _ => unreachable!(),
                    }
                }
            }
        } else {
            let tp = t + nd.dt;
            model.set_time(tp);
            set_observees_q(arena, model, observees, tp);
            let mut ders_p = vec![0.0; n];
            fetch_ders(arena, model, triggers, &mut ders_p);
            for (i, &id) in triggers.iter().enumerate() {
                match arena.get_mut(id) {
                    Var::Qss(v) => v.advance_qss_2(opts, ders_p[i]),
                    Var::Liqss(v) if !v.core.self_observer => v.advance_qss_2(opts, ders_p[i]),
                    Var::Liqss(_) => {}
                    Var::Relax(v) => v.advance_qss_2(opts, ders_p[i]),
                    _ => unreachable!(),
                }
            }
        }
        model.set_time(t);
        set_observees_q(arena, model, observees, t);
    }
}

/// Requantization of a batch of zero-crossing variables.
pub struct TriggersZc;

impl TriggersZc {
    #[allow(clippy::too_many_arguments)]
    pub fn advance(
        arena: &mut VarArena,
        model: &mut dyn Model,
        queue: &mut Queue,
        opts: &SimOpts,
        t0: Time,
        triggers: &[VarId],
        t: Time,
        st: SuperdenseTime,
    ) {
        if triggers.is_empty() {
            return;
        }
        let order = arena.get(triggers[0]).order();
        let n = triggers.len();

        // Indicator values need observees before stage 0.
        let observees = collect_observees(arena, triggers);
        set_observees_q(arena, model, &observees, t);
        let val_refs: Vec<core_model::VRef> = triggers
            .iter()
            .map(|&id| arena.get(id).core().var_ref)
            .collect();
        let mut vals = vec![0.0; n];
        model.get_reals(&val_refs, &mut vals);
        for (i, &id) in triggers.iter().enumerate() {
            match arena.get_mut(id) {
                Var::Zc(v) => v.advance_qss_0(t, st, vals[i]),
                other => unreachable!("non-ZC trigger {}", other.name()),
            }
        }

        let mut ders = vec![0.0; n];
        fetch_ders(arena, model, triggers, &mut ders);
        for (i, &id) in triggers.iter().enumerate() {
            match arena.get_mut(id) {
                Var::Zc(v) => v.advance_qss_1(ders[i]),
                _ => unreachable!(),
            }
        }

        if order >= 2 {
            Self::nd_stages(arena, model, opts, t0, triggers, &observees, t, order);
        }

        for &id in triggers {
            with_ctx(arena, model, queue, opts, t0, id, |v, ctx| match v {
                Var::Zc(v) => v.advance_qss_f(ctx),
                _ => unreachable!(),
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn nd_stages(
        arena: &mut VarArena,
        model: &mut dyn Model,
        opts: &SimOpts,
        t0: Time,
        triggers: &[VarId],
        observees: &[VarId],
        t: Time,
        order: u8,
    ) {
        let nd = opts.nd;
        let n = triggers.len();
        if order >= 3 && t - nd.dt >= t0 {
            let tm = t - nd.dt;
            model.set_time(tm);
            set_observees_q(arena, model, observees, tm);
            let mut ders_m = vec![0.0; n];
            fetch_ders(arena, model, triggers, &mut ders_m);
            let tp = t + nd.dt;
            model.set_time(tp);
            set_observees_q(arena, model, observees, tp);
            let mut ders_p = vec![0.0; n];
            fetch_ders(arena, model, triggers, &mut ders_p);
            for (i, &id) in triggers.iter().enumerate() {
                match arena.get_mut(id) {
                    Var::Zc(v) => {
                        v.advance_qss_2_c(opts, ders_m[i], ders_p[i]);
                        v.advance_qss_3(opts);
                    }
                    _ => unreachable!(),
                }
            }
        } else if order >= 3 {
            let tp = t + nd.dt;
            model.set_time(tp);
            set_observees_q(arena, model, observees, tp);
            let mut ders_p = vec![0.0; n];
            fetch_ders(arena, model, triggers, &mut ders_p);
            let tpp = t + nd.two_dt;
            model.set_time(tpp);
            set_observees_q(arena, model, observees, tpp);
            let mut ders_pp = vec![0.0; n];
            fetch_ders(arena, model, triggers, &mut ders_pp);
            for (i, &id) in triggers.iter().enumerate() {
                match arena.get_mut(id) {
                    Var::Zc(v) => {
                        v.advance_qss_2_f(opts, ders_p[i], ders_pp[i]);
                        v.advance_qss_3_f(opts);
                    }
                    _ => unreachable!(),
                }
            }
        } else {
            let tp = t + nd.dt;
            model.set_time(tp);
            set_observees_q(arena, model, observees, tp);
            let mut ders_p = vec![0.0; n];
            fetch_ders(arena, model, triggers, &mut ders_p);
            for (i, &id) in triggers.iter().enumerate() {
                match arena.get_mut(id) {
                    Var::Zc(v) => v.advance_qss_2(opts, ders_p[i]),
                    _ => unreachable!(),
                }
            }
        }
        model.set_time(t);
        set_observees_q(arena, model, observees, t);
    }
}

/// Handler batch: variables modified discontinuously at a crossing instant.
/// Input and ZC kinds never appear here; the conditional only schedules
/// computational observers.
pub struct Handlers;

impl Handlers {
    #[allow(clippy::too_many_arguments)]
    pub fn advance(
        arena: &mut VarArena,
        model: &mut dyn Model,
        queue: &mut Queue,
        opts: &SimOpts,
        t0: Time,
        handlers: &[VarId],
        t: Time,
        st: SuperdenseTime,
    ) {
        if handlers.is_empty() {
            return;
        }
        debug_assert!(handlers
            .iter()
            .all(|&id| !arena.get(id).is_zc() && !arena.get(id).is_input()));

        let states: Vec<VarId> = handlers
            .iter()
            .copied()
            .filter(|&id| arena.get(id).is_state())
            .collect();
        let passes: Vec<VarId> = handlers
            .iter()
            .copied()
            .filter(|&id| arena.get(id).is_ns())
            .collect();

        // Stage 0: take post-event values from the model.
        for &id in handlers {
            match arena.get(id) {
                Var::Qss(_) | Var::Relax(_) | Var::Dis(_) => {
                    with_ctx(arena, model, queue, opts, t0, id, |v, ctx| match v {
                        Var::Qss(v) => v.advance_handler_0(ctx, t, st),
                        Var::Relax(v) => v.advance_handler_0(ctx, t, st),
                        Var::Dis(v) => v.advance_handler(ctx, t, st),
                        _ => unreachable!(),
                    });
                }
                Var::Liqss(_) => {
                    let x0 = model.get_real(arena.get(id).core().var_ref);
                    match arena.get_mut(id) {
                        Var::Liqss(v) => v.advance_handler_0(t, st, x0),
                        _ => unreachable!(),
                    }
                }
                Var::Pass(_) => {} // sampled below
                _ => unreachable!(),
            }
        }

        if !states.is_empty() {
            Self::state_stages(arena, model, opts, t0, &states, handlers, t);
            for &id in &states {
                match arena.get_mut(id) {
                    Var::Qss(v) => v.advance_handler_f(queue, opts),
                    Var::Liqss(v) => v.advance_handler_f(queue, opts),
                    Var::Relax(v) => v.advance_handler_f(queue, opts),
                    _ => unreachable!(),
                }
            }
        }

        // Pass-through handlers refit from value samples.
        if !passes.is_empty() {
            Observers::advance_r(arena, model, queue, opts, t0, &passes, t, st);
        }
    }

    /// Derivative stages for state handlers. Handler variables and discrete
    /// observees keep their post-event model values at `t`; at the stencil
    /// times the handlers' pending trajectories supply their values.
    fn state_stages(
        arena: &mut VarArena,
        model: &mut dyn Model,
        opts: &SimOpts,
        t0: Time,
        states: &[VarId],
        handlers: &[VarId],
        t: Time,
    ) {
        let order = arena.get(states[0]).order();
        let all_observees = collect_observees(arena, states);
        let plain: Vec<VarId> = all_observees
            .iter()
            .copied()
            .filter(|&id| !handlers.contains(&id) && !arena.get(id).is_discrete())
            .collect();

        set_observees_q(arena, model, &plain, t);
        let mut ders = vec![0.0; states.len()];
        fetch_ders(arena, model, states, &mut ders);
        for (&id, &d) in states.iter().zip(&ders) {
            match arena.get_mut(id) {
                Var::Qss(v) => v.advance_handler_1(d),
                Var::Liqss(v) => v.advance_qss_1(d),
                Var::Relax(v) => v.advance_qss_1(d),
                _ => unreachable!(),
            }
        }

        if order >= 2 {
            let nd = opts.nd;
            let set_at = |arena: &VarArena, model: &mut dyn Model, tn: Time| {
                set_observees_q(arena, model, &plain, tn);
                for &hid in handlers {
                    if all_observees.contains(&hid) {
                        let hv = arena.get(hid);
                        model.set_real(hv.core().var_ref, handler_pending_val(hv, tn - t));
                    }
                }
            };
            if order >= 3 && t - nd.dt >= t0 {
                let tm = t - nd.dt;
                model.set_time(tm);
                set_at(arena, model, tm);
                let mut ders_m = vec![0.0; states.len()];
                fetch_ders(arena, model, states, &mut ders_m);
                let tp = t + nd.dt;
                model.set_time(tp);
                set_at(arena, model, tp);
                let mut ders_p = vec![0.0; states.len()];
                fetch_ders(arena, model, states, &mut ders_p);
                for (i, &id) in states.iter().enumerate() {
                    match arena.get_mut(id) {
                        Var::Qss(v) => {
                            v.advance_qss_2_c(opts, ders_m[i], ders_p[i]);
                            v.advance_qss_3(opts);
                        }
                        Var::Liqss(v) => {
                            v.advance_qss_2_c(opts, ders_m[i], ders_p[i]);
                            v.advance_qss_3(opts);
                        }
                        Var::Relax(v) => {
                            v.advance_qss_2_c(opts, ders_m[i], ders_p[i]);
                            v.advance_qss_3(opts);
                        }
                        _ => unreachable!(),
                    }
                }
            } else if order >= 3 {
                let tp = t + nd.dt;
                model.set_time(tp);
                set_at(arena, model, tp);
                let mut ders_p = vec![0.0; states.len()];
                fetch_ders(arena, model, states, &mut ders_p);
                let tpp = t + nd.two_dt;
                model.set_time(tpp);
                set_at(arena, model, tpp);
                let mut ders_pp = vec![0.0; states.len()];
                fetch_ders(arena, model, states, &mut ders_pp);
                for (i, &id) in states.iter().enumerate() {
                    match arena.get_mut(id) {
                        Var::Qss(v) => {
                            v.advance_qss_2_f(opts, ders_p[i], ders_pp[i]);
                            v.advance_qss_3_f(opts);
                        }
                        Var::Liqss(v) => {
                            v.advance_qss_2_f(opts, ders_p[i], ders_pp[i]);
                            v.advance_qss_3_f(opts);
                        }
                        Var::Relax(v) => {
                            v.advance_qss_2_f(opts, ders_p[i], ders_pp[i]);
                            v.advance_qss_3_f(opts);
                        }
                        _ => unreachable!(),
                    }
                }
            } else {
                let tp = t + nd.dt;
                model.set_time(tp);
                set_at(arena, model, tp);
                let mut ders_p = vec![0.0; states.len()];
                fetch_ders(arena, model, states, &mut ders_p);
                for (i, &id) in states.iter().enumerate() {
                    match arena.get_mut(id) {
                        Var::Qss(v) => v.advance_qss_2(opts, ders_p[i]),
                        Var::Liqss(v) => v.advance_qss_2(opts, ders_p[i]),
                        Var::Relax(v) => v.advance_qss_2(opts, ders_p[i]),
                        _ => unreachable!(),
                    }
                }
            }
            model.set_time(t);
            set_observees_q(arena, model, &plain, t);
        }
    }
}

/// A handler's value a small offset after the event, from its pending
/// (not yet finalized) representation.
fn handler_pending_val(v: &Var, dt: f64) -> f64 {
    match v {
        Var::Qss(q) => q.x.val(dt),
        Var::Relax(r) => r.x.val(dt),
        Var::Liqss(l) => l.pending_val(dt),
        Var::Dis(d) => d.value(),
        Var::Pass(p) => p.x.val(dt),
        _ => unreachable!(),
    }
}

/// Observer advances: refresh the continuous representations of everything
/// that depends on just-advanced variables, within the same superdense time.
pub struct Observers;

impl Observers {
    /// Advance all observers of `advanced`; non-state observers cascade to
    /// their own observers until fixpoint.
    #[allow(clippy::too_many_arguments)]
    pub fn advance(
        arena: &mut VarArena,
        model: &mut dyn Model,
        queue: &mut Queue,
        opts: &SimOpts,
        t0: Time,
        advanced: &[VarId],
        t: Time,
        st: SuperdenseTime,
    ) -> usize {
        let mut total = 0;
        let mut frontier: Vec<VarId> = advanced.to_vec();
        let mut rounds = 0;
        while !frontier.is_empty() {
            rounds += 1;
            assert!(
                rounds <= arena.len() + 1,
                "observer cascade failed to reach a fixpoint"
            );
            let mut observers: Vec<VarId> = frontier
                .iter()
                .flat_map(|&id| arena.get(id).core().observers.iter().copied())
                .filter(|id| !frontier.contains(id) && !advanced.contains(id))
                .collect();
            observers.sort_unstable();
            observers.dedup();
            if observers.is_empty() {
                break;
            }
            total += observers.len();

            let states: Vec<VarId> = observers
                .iter()
                .copied()
                .filter(|&id| arena.get(id).is_state())
                .collect();
            let zcs: Vec<VarId> = observers
                .iter()
                .copied()
                .filter(|&id| arena.get(id).is_zc() && arena.get(id).is_active())
                .collect();
            let rs: Vec<VarId> = observers
                .iter()
                .copied()
                .filter(|&id| arena.get(id).is_ns())
                .collect();

            Self::advance_states(arena, model, queue, opts, t0, &states, t);
            Self::advance_zcs(arena, model, queue, opts, t0, &zcs, t);
            Self::advance_r(arena, model, queue, opts, t0, &rs, t, st);

            // Only non-state observers propagate: their value changed at t,
            // while a state observer's quantized representation is intact.
            frontier = rs;
        }
        total
    }

    fn advance_states(
        arena: &mut VarArena,
        model: &mut dyn Model,
        queue: &mut Queue,
        opts: &SimOpts,
        t0: Time,
        states: &[VarId],
        t: Time,
    ) {
        if states.is_empty() {
            return;
        }
        let order = arena.get(states[0]).order();
        let observees = collect_observees(arena, states);
        set_observees_q(arena, model, &observees, t);
        let mut ders = vec![0.0; states.len()];
        fetch_ders(arena, model, states, &mut ders);
        for (&id, &d) in states.iter().zip(&ders) {
            match arena.get_mut(id) {
                Var::Qss(v) => v.advance_observer_1(t, d),
                Var::Liqss(v) => v.advance_observer_1(t, d),
                Var::Relax(v) => v.advance_observer_1(t, d),
                _ => unreachable!(),
            }
        }
        if order >= 2 {
            Self::observer_nd(arena, model, opts, t0, states, &observees, t, order, false);
        }
        for &id in states {
            match arena.get_mut(id) {
                Var::Qss(v) => v.advance_observer_f(queue, opts),
                Var::Liqss(v) => v.advance_observer_f(queue, opts),
                Var::Relax(v) => v.advance_observer_f(queue, opts),
                _ => unreachable!(),
            }
        }
    }

    fn advance_zcs(
        arena: &mut VarArena,
        model: &mut dyn Model,
        queue: &mut Queue,
        opts: &SimOpts,
        t0: Time,
        zcs: &[VarId],
        t: Time,
    ) {
        if zcs.is_empty() {
            return;
        }
        let order = arena.get(zcs[0]).order();
        let observees = collect_observees(arena, zcs);
        set_observees_q(arena, model, &observees, t);
        let val_refs: Vec<core_model::VRef> =
            zcs.iter().map(|&id| arena.get(id).core().var_ref).collect();
        let mut vals = vec![0.0; zcs.len()];
        model.get_reals(&val_refs, &mut vals);
        let mut ders = vec![0.0; zcs.len()];
        fetch_ders(arena, model, zcs, &mut ders);
        for (i, &id) in zcs.iter().enumerate() {
            match arena.get_mut(id) {
                Var::Zc(v) => v.advance_observer_1(t, vals[i], ders[i]),
                _ => unreachable!(),
            }
        }
        if order >= 2 {
            Self::observer_nd(arena, model, opts, t0, zcs, &observees, t, order, true);
        }
        for &id in zcs {
            with_ctx(arena, model, queue, opts, t0, id, |v, ctx| match v {
                Var::Zc(v) => v.advance_observer_f(ctx),
                _ => unreachable!(),
            });
        }
    }

    /// Pass-through refits from value samples; also used for pass-through
    /// handlers and requantizations.
    #[allow(clippy::too_many_arguments)]
    pub fn advance_r(
        arena: &mut VarArena,
        model: &mut dyn Model,
        queue: &mut Queue,
        opts: &SimOpts,
        t0: Time,
        rs: &[VarId],
        t: Time,
        st: SuperdenseTime,
    ) {
        if rs.is_empty() {
            return;
        }
        let nd = opts.nd;
        let observees = collect_observees(arena, rs);
        let val_refs: Vec<core_model::VRef> =
            rs.iter().map(|&id| arena.get(id).core().var_ref).collect();
        let centered = t - nd.dt >= t0;
        let mut s0 = vec![0.0; rs.len()];
        let mut s1 = vec![0.0; rs.len()];
        let mut s2 = vec![0.0; rs.len()];
        if centered {
            let tm = t - nd.dt;
            model.set_time(tm);
            set_observees_q(arena, model, &observees, tm);
            model.get_reals(&val_refs, &mut s0);
            model.set_time(t);
            set_observees_q(arena, model, &observees, t);
            model.get_reals(&val_refs, &mut s1);
            let tp = t + nd.dt;
            model.set_time(tp);
            set_observees_q(arena, model, &observees, tp);
            model.get_reals(&val_refs, &mut s2);
        } else {
            model.set_time(t);
            set_observees_q(arena, model, &observees, t);
            model.get_reals(&val_refs, &mut s0);
            let tp = t + nd.dt;
            model.set_time(tp);
            set_observees_q(arena, model, &observees, tp);
            model.get_reals(&val_refs, &mut s1);
            let tpp = t + nd.two_dt;
            model.set_time(tpp);
            set_observees_q(arena, model, &observees, tpp);
            model.get_reals(&val_refs, &mut s2);
        }
        model.set_time(t);
        set_observees_q(arena, model, &observees, t);
        for (i, &id) in rs.iter().enumerate() {
            match arena.get_mut(id) {
                Var::Pass(v) => {
                    v.advance_samples(t, st, (s0[i], s1[i], s2[i]), centered, opts);
                    v.advance_f(queue, opts);
                }
                _ => unreachable!(),
            }
        }
    }

    /// Shared ND walk for state and ZC observers.
    #[allow(clippy::too_many_arguments)]
    fn observer_nd(
        arena: &mut VarArena,
        model: &mut dyn Model,
        opts: &SimOpts,
        t0: Time,
        members: &[VarId],
        observees: &[VarId],
        t: Time,
        order: u8,
        is_zc: bool,
    ) {
        let nd = opts.nd;
        let n = members.len();
        let stage2 = |arena: &mut VarArena, i: usize, id: VarId, a: f64, b: f64, centered: bool| {
            match arena.get_mut(id) {
                Var::Qss(v) => {
                    if centered {
                        v.advance_qss_2_c(opts, a, b);
                    } else {
                        v.advance_qss_2_f(opts, a, b);
                    }
                    if order >= 3 {
                        if centered {
                            v.advance_qss_3(opts);
                        } else {
                            v.advance_qss_3_f(opts);
                        }
                    }
                }
                Var::Liqss(v) => {
                    if centered {
                        v.advance_qss_2_c(opts, a, b);
                    } else {
                        v.advance_qss_2_f(opts, a, b);
                    }
                    if order >= 3 {
                        if centered {
                            v.advance_qss_3(opts);
                        } else {
                            v.advance_qss_3_f(opts);
                        }
                    }
                }
                Var::Relax(v) => {
                    if centered {
                        v.advance_qss_2_c(opts, a, b);
                    } else {
                        v.advance_qss_2_f(opts, a, b);
                    }
                    if order >= 3 {
                        if centered {
                            v.advance_qss_3(opts);
                        } else {
                            v.advance_qss_3_f(opts);
                        }
                    }
                }
                Var::Zc(v) => {
                    if centered {
                        v.advance_qss_2_c(opts, a, b);
                    } else {
                        v.advance_qss_2_f(opts, a, b);
                    }
                    if order >= 3 {
                        if centered {
                            v.advance_qss_3(opts);
                        } else {
                            v.advance_qss_3_f(opts);
                        }
                    }
                }
                _ => unreachable!(),
            }
            let _ = (i, is_zc);
        };

        if order >= 3 && t - nd.dt >= t0 {
            let tm = t - nd.dt;
            model.set_time(tm);
            set_observees_q(arena, model, observees, tm);
            let mut ders_m = vec![0.0; n];
            fetch_ders(arena, model, members, &mut ders_m);
            let tp = t + nd.dt;
            model.set_time(tp);
            set_observees_q(arena, model, observees, tp);
            let mut ders_p = vec![0.0; n];
            fetch_ders(arena, model, members, &mut ders_p);
            for (i, &id) in members.iter().enumerate() {
                stage2(arena, i, id, ders_m[i], ders_p[i], true);
            }
        } else if order >= 3 {
            let tp = t + nd.dt;
            model.set_time(tp);
            set_observees_q(arena, model, observees, tp);
            let mut ders_p = vec![0.0; n];
            fetch_ders(arena, model, members, &mut ders_p);
            let tpp = t + nd.two_dt;
            model.set_time(tpp);
            set_observees_q(arena, model, observees, tpp);
            let mut ders_pp = vec![0.0; n];
            fetch_ders(arena, model, members, &mut ders_pp);
            for (i, &id) in members.iter().enumerate() {
                stage2(arena, i, id, ders_p[i], ders_pp[i], false);
            }
        } else {
            // Order 2: forward pair.
            let tp = t + nd.dt;
            model.set_time(tp);
            set_observees_q(arena, model, observees, tp);
            let mut ders_p = vec![0.0; n];
            fetch_ders(arena, model, members, &mut ders_p);
            for (i, &id) in members.iter().enumerate() {
                match arena.get_mut(id) {
                    Var::Qss(v) => v.advance_qss_2(opts, ders_p[i]),
                    Var::Liqss(v) => v.advance_qss_2(opts, ders_p[i]),
                    Var::Relax(v) => v.advance_qss_2(opts, ders_p[i]),
                    Var::Zc(v) => v.advance_qss_2(opts, ders_p[i]),
                    _ => unreachable!(),
                }
            }
        }
        model.set_time(t);
        set_observees_q(arena, model, observees, t);
    }
}
