//! Conditional blocks: the gate between a zero-crossing variable and the
//! handlers its crossings fire.
//!
//! A conditional owns the ordered set of handler-modified variables. At
//! setup, passive observers are short-circuited: the traversal walks each
//! passive observer's own observer set until it reaches computational
//! (active, non-ZC) variables, with a checked set breaking dependency
//! cycles. When the set comes up empty, the event-indicator policy decides
//! whether the ZC variable stays alive as its own handler so crossings are
//! still tracked.

use crate::{CondId, Queue, Target, Var, VarArena, VarId};
use core_queue::Handle;
use core_time::{EventKind, SuperdenseTime, Time, INFINITY, NEG_INFINITY};
use std::collections::BTreeSet;

#[derive(Debug)]
pub struct Conditional {
    pub name: String,
    pub id: CondId,
    /// The event-indicator variable this conditional watches.
    pub zc: VarId,
    /// Handler-modified variables; computational only after `init_observers`.
    pub observers: Vec<VarId>,
    pub handle: Option<Handle>,
    pub st: SuperdenseTime,
    /// When-clause semantics: fire only if the condition became true in the
    /// same pass as this dispatch (if-clauses fire on any crossing).
    pub when: bool,
    self_handler: bool,
}

impl Conditional {
    pub fn new(name: &str, id: CondId, zc: VarId) -> Self {
        Self {
            name: name.to_string(),
            id,
            zc,
            observers: Vec::new(),
            handle: None,
            st: SuperdenseTime::new(NEG_INFINITY, EventKind::Conditional, 0),
            when: false,
            self_handler: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn self_handler(&self) -> bool {
        self.self_handler
    }

    pub fn add_observer(&mut self, observer: VarId) {
        self.observers.push(observer);
    }

    /// Park the conditional's event at infinity (idle state).
    pub fn enqueue(&mut self, queue: &mut Queue) {
        debug_assert!(self.handle.is_none());
        self.handle = Some(queue.add(INFINITY, EventKind::Conditional, Target::Cond(self.id)));
    }

    /// Crossing notification: move the event to the crossing instant.
    pub fn activity(&mut self, t: Time, queue: &mut Queue) {
        let h = self.handle.take().expect("conditional not enqueued");
        let h = queue.shift(h, t, EventKind::Conditional, Target::Cond(self.id));
        self.st = h.st();
        self.handle = Some(h);
    }

    /// Resolve the computational observer set: dedupe, short-circuit passive
    /// observers to their active downstream, and apply the EI policy for
    /// handler-less indicators. `ei_mode`: 0 tracks both handler-less and
    /// passive-handler indicators, 1 only passive-handler, 2 only
    /// handler-less.
    pub fn init_observers(&mut self, arena: &VarArena, ei_mode: u8) {
        let mut seen = BTreeSet::new();
        self.observers.retain(|o| seen.insert(*o));

        if self.observers.is_empty() {
            if ei_mode == 0 || ei_mode == 2 {
                self.observers.push(self.zc);
                self.self_handler = true;
            }
            tracing::debug!(
                target: "vars.conditional",
                name = %self.name,
                self_handler = self.self_handler,
                "conditional has no handlers"
            );
            return;
        }

        let mut checked: BTreeSet<VarId> = BTreeSet::new();
        let mut computational: BTreeSet<VarId> = BTreeSet::new();
        for &obs in &self.observers {
            let v = arena.get(obs);
            if v.is_zc() {
                checked.insert(obs);
            } else if v.is_active() {
                computational.insert(obs);
                checked.insert(obs);
            } else {
                find_computational(arena, obs, &mut checked, &mut computational);
            }
        }
        self.observers = computational.into_iter().collect();
        if self.observers.is_empty() && ei_mode < 2 {
            // Only passive handlers: keep the indicator alive so the passive
            // handlers still refresh through crossings.
            self.observers.push(self.zc);
            self.self_handler = true;
        }
        tracing::debug!(
            target: "vars.conditional",
            name = %self.name,
            observers = self.observers.len(),
            self_handler = self.self_handler,
            "conditional observers resolved"
        );
    }

    /// Dispatch at the conditional's event: if the watched indicator crossed
    /// at this instant, push a handler event for every computational
    /// observer, then park again.
    pub fn advance(&mut self, arena: &mut VarArena, queue: &mut Queue) {
        let t = self.st.t;
        let fired = match arena.get(self.zc) {
            // A when-clause additionally requires the condition to have
            // become true in this very pass; a re-dispatch at the same
            // instant from a later pass must not re-fire it.
            Var::Zc(z) => {
                z.is_tz_last(t) && (!self.when || z.core.st.same_pass(&self.st))
            }
            _ => unreachable!("conditional watching a non-ZC variable"),
        };
        if fired {
            for &obs in &self.observers {
                if obs == self.zc {
                    // Self-handler marker: the crossing itself already
                    // requantizes the indicator; no handler event needed.
                    continue;
                }
                arena.get_mut(obs).core_mut().requeue(queue, t, EventKind::Handler);
            }
        }
        let h = self.handle.take().expect("conditional not enqueued");
        self.handle = Some(queue.shift(h, INFINITY, EventKind::Conditional, Target::Cond(self.id)));
    }
}

/// Walk a passive observer's observer sub-graph collecting the active,
/// non-ZC variables. Cycles are broken by the checked set.
fn find_computational(
    arena: &VarArena,
    observer: VarId,
    checked: &mut BTreeSet<VarId>,
    computational: &mut BTreeSet<VarId>,
) {
    if !checked.insert(observer) {
        return;
    }
    let v = arena.get(observer);
    if v.is_zc() {
        return;
    }
    if v.is_active() {
        computational.insert(observer);
        return;
    }
    for &oo in &v.core().observers {
        find_computational(arena, oo, checked, computational);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SimOpts, VarCore, ZcVar};

    fn arena_with_chain() -> (VarArena, VarId, VarId, VarId, VarId) {
        // zc watches; passive p feeds active a and active b.
        let opts = SimOpts::default();
        let mut arena = VarArena::new();
        let zc = arena.insert(|id| {
            let core = VarCore::new("zc", id, 2, 0, &opts);
            Var::Zc(ZcVar::new(core))
        });
        let p = arena.insert(|id| {
            let mut core = VarCore::new("p", id, 2, 1, &opts);
            core.passive = true;
            Var::Pass(crate::PassVar::new(core))
        });
        let a = arena.insert(|id| {
            let core = VarCore::new("a", id, 2, 2, &opts);
            Var::Qss(crate::QssVar::new(core))
        });
        let b = arena.insert(|id| {
            let core = VarCore::new("b", id, 2, 3, &opts);
            Var::Qss(crate::QssVar::new(core))
        });
        // p's observers are a and b.
        arena.get_mut(p).core_mut().observers.push(a);
        arena.get_mut(p).core_mut().observers.push(b);
        (arena, zc, p, a, b)
    }

    #[test]
    fn passive_observer_short_circuits_to_active() {
        let (arena, zc, p, a, b) = arena_with_chain();
        let mut cond = Conditional::new("zc cond", CondId(0), zc);
        cond.add_observer(p);
        cond.init_observers(&arena, 0);
        let mut obs = cond.observers.clone();
        obs.sort();
        assert_eq!(obs, vec![a, b]);
        assert!(!cond.self_handler());
    }

    #[test]
    fn empty_conditional_becomes_self_handler_by_policy() {
        let (arena, zc, _p, _a, _b) = arena_with_chain();
        let mut cond = Conditional::new("zc cond", CondId(0), zc);
        cond.init_observers(&arena, 0);
        assert!(cond.self_handler());
        assert_eq!(cond.observers, vec![zc]);

        let mut cond1 = Conditional::new("zc cond", CondId(1), zc);
        cond1.init_observers(&arena, 1);
        assert!(!cond1.self_handler());
        assert!(cond1.is_empty());
    }

    #[test]
    fn cycles_do_not_hang_the_traversal() {
        let opts = SimOpts::default();
        let mut arena = VarArena::new();
        let zc = arena.insert(|id| Var::Zc(ZcVar::new(VarCore::new("zc", id, 2, 0, &opts))));
        let p1 = arena.insert(|id| {
            let mut core = VarCore::new("p1", id, 2, 1, &opts);
            core.passive = true;
            Var::Pass(crate::PassVar::new(core))
        });
        let p2 = arena.insert(|id| {
            let mut core = VarCore::new("p2", id, 2, 2, &opts);
            core.passive = true;
            Var::Pass(crate::PassVar::new(core))
        });
        arena.get_mut(p1).core_mut().observers.push(p2);
        arena.get_mut(p2).core_mut().observers.push(p1);
        let mut cond = Conditional::new("zc cond", CondId(0), zc);
        cond.add_observer(p1);
        cond.init_observers(&arena, 2);
        // Nothing computational downstream and policy 2 forbids the
        // passive-handler fallback.
        assert!(cond.is_empty());
    }
}
