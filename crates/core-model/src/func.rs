//! Closure-backed model adapter.
//!
//! Each derivative and event-indicator value reference is computed on demand
//! by a closure over the current time and the value table, so the solver's
//! set-observees-then-query choreography behaves exactly as it would against
//! an external model binary. Event handling is a per-indicator reset list
//! applied by `new_discrete_states` when the indicator's sign has moved since
//! the previous event iteration.

use crate::{Causality, EventInfo, Model, ModelVar, VRef, ValueKind, Variability};
use core_time::Time;

type ValueFn = Box<dyn Fn(Time, &[f64]) -> f64>;

/// A discontinuous update applied when an indicator fires.
enum Reset {
    /// target := closure(t, values)
    Assign(VRef, ValueFn),
    /// target := 1 - target (discrete toggle)
    Toggle(VRef),
}

pub struct FnModel {
    name: String,
    t0: Time,
    t_end: Option<Time>,
    t: Time,
    vars: Vec<ModelVar>,
    vals: Vec<f64>,
    /// Computed vrefs: derivative and indicator outputs.
    fns: Vec<Option<ValueFn>>,
    /// Reset lists per indicator vref, with the sign snapshot from the last
    /// event iteration.
    resets: Vec<(VRef, Vec<Reset>)>,
    prev_signs: Vec<i8>,
}

impl FnModel {
    pub fn builder(name: &str) -> FnModelBuilder {
        FnModelBuilder::new(name)
    }

    fn compute(&self, vref: VRef) -> f64 {
        match &self.fns[vref as usize] {
            Some(f) => f(self.t, &self.vals),
            None => self.vals[vref as usize],
        }
    }

    fn indicator_sign(&self, vref: VRef) -> i8 {
        let z = self.compute(vref);
        if z > 0.0 {
            1
        } else if z < 0.0 {
            -1
        } else {
            0
        }
    }
}

impl Model for FnModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn t0(&self) -> Time {
        self.t0
    }

    fn t_end(&self) -> Option<Time> {
        self.t_end
    }

    fn vars(&self) -> &[ModelVar] {
        &self.vars
    }

    fn set_time(&mut self, t: Time) {
        self.t = t;
    }

    fn get_time(&self) -> Time {
        self.t
    }

    fn set_real(&mut self, vref: VRef, value: f64) {
        assert!((vref as usize) < self.vals.len(), "bad value reference");
        self.vals[vref as usize] = value;
    }

    fn get_real(&self, vref: VRef) -> f64 {
        assert!((vref as usize) < self.vals.len(), "bad value reference");
        self.compute(vref)
    }

    fn new_discrete_states(&mut self, info: &mut EventInfo) {
        info.new_discrete_states_needed = false;
        info.values_of_continuous_states_changed = false;
        for i in 0..self.resets.len() {
            let zref = self.resets[i].0;
            let sign = self.indicator_sign(zref);
            if sign == self.prev_signs[i] {
                continue;
            }
            self.prev_signs[i] = sign;
            // Apply this indicator's resets against a snapshot so multiple
            // writes in one instant see consistent inputs.
            let snapshot = self.vals.clone();
            let t = self.t;
            let mut changed = false;
            let rules = &self.resets[i].1;
            let vals = &mut self.vals;
            for reset in rules {
                match reset {
                    Reset::Assign(target, f) => {
                        let v = f(t, &snapshot);
                        if vals[*target as usize] != v {
                            vals[*target as usize] = v;
                            changed = true;
                        }
                    }
                    Reset::Toggle(target) => {
                        let idx = *target as usize;
                        vals[idx] = 1.0 - vals[idx];
                        changed = true;
                    }
                }
            }
            if changed {
                tracing::debug!(
                    target: "model.event",
                    model = %self.name,
                    indicator = zref,
                    t,
                    "event_iteration_applied"
                );
                info.values_of_continuous_states_changed = true;
            }
        }
    }
}

/// Builder assigning value references in declaration order.
pub struct FnModelBuilder {
    name: String,
    t0: Time,
    t_end: Option<Time>,
    vars: Vec<ModelVar>,
    vals: Vec<f64>,
    fns: Vec<Option<ValueFn>>,
    resets: Vec<(VRef, Vec<Reset>)>,
}

impl FnModelBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            t0: 0.0,
            t_end: None,
            vars: Vec::new(),
            vals: Vec::new(),
            fns: Vec::new(),
            resets: Vec::new(),
        }
    }

    pub fn t0(mut self, t0: Time) -> Self {
        self.t0 = t0;
        self
    }

    pub fn t_end(mut self, t_end: Time) -> Self {
        self.t_end = Some(t_end);
        self
    }

    fn push(&mut self, var: ModelVar, start: f64, f: Option<ValueFn>) -> VRef {
        let vref = var.vref;
        self.vars.push(var);
        self.vals.push(start);
        self.fns.push(f);
        vref
    }

    fn next_vref(&self) -> VRef {
        self.vals.len() as VRef
    }

    /// Continuous state with its derivative closure. Returns `self`; use
    /// `state_ref` when the value reference is needed.
    pub fn state(
        mut self,
        name: &str,
        start: f64,
        der: impl Fn(Time, &[f64]) -> f64 + 'static,
    ) -> Self {
        let _ = self.add_state(name, start, der);
        self
    }

    /// Continuous state, returning `(state_vref, der_vref)`.
    pub fn add_state(
        &mut self,
        name: &str,
        start: f64,
        der: impl Fn(Time, &[f64]) -> f64 + 'static,
    ) -> (VRef, VRef) {
        let sref = self.next_vref();
        let dref = sref + 1;
        self.push(
            ModelVar {
                name: name.to_string(),
                vref: sref,
                kind: ValueKind::Real,
                causality: Causality::Local,
                variability: Variability::Continuous,
                start,
                derivative_of: None,
                derivative: Some(dref),
                is_event_indicator: false,
                deps: Vec::new(),
                mods: Vec::new(),
            },
            start,
            None,
        );
        self.push(
            ModelVar {
                name: format!("der({name})"),
                vref: dref,
                kind: ValueKind::Real,
                causality: Causality::Local,
                variability: Variability::Continuous,
                start: 0.0,
                derivative_of: Some(sref),
                derivative: None,
                is_event_indicator: false,
                deps: Vec::new(),
                mods: Vec::new(),
            },
            0.0,
            Some(Box::new(der)),
        );
        (sref, dref)
    }

    /// Declare which value references a derivative (or indicator) reads.
    /// Dependencies drive the observer/observee graph on the solver side.
    pub fn deps(mut self, name: &str, dep_names: &[&str]) -> Self {
        let refs: Vec<VRef> = dep_names
            .iter()
            .map(|n| {
                self.vars
                    .iter()
                    .find(|v| v.name == *n)
                    .unwrap_or_else(|| panic!("unknown dependency {n}"))
                    .vref
            })
            .collect();
        let var = self
            .vars
            .iter_mut()
            .find(|v| v.name == name)
            .unwrap_or_else(|| panic!("unknown variable {name}"));
        var.deps = refs;
        self
    }

    /// Event indicator with value and first-derivative closures, returning
    /// `(value_vref, der_vref)`.
    pub fn add_indicator(
        &mut self,
        name: &str,
        start: f64,
        value: impl Fn(Time, &[f64]) -> f64 + 'static,
        der: impl Fn(Time, &[f64]) -> f64 + 'static,
    ) -> (VRef, VRef) {
        let zref = self.next_vref();
        let dref = zref + 1;
        self.push(
            ModelVar {
                name: name.to_string(),
                vref: zref,
                kind: ValueKind::Real,
                causality: Causality::Local,
                variability: Variability::Continuous,
                start,
                derivative_of: None,
                derivative: Some(dref),
                is_event_indicator: true,
                deps: Vec::new(),
                mods: Vec::new(),
            },
            start,
            Some(Box::new(value)),
        );
        self.push(
            ModelVar {
                name: format!("der({name})"),
                vref: dref,
                kind: ValueKind::Real,
                causality: Causality::Local,
                variability: Variability::Continuous,
                start: 0.0,
                derivative_of: Some(zref),
                derivative: None,
                is_event_indicator: false,
                deps: Vec::new(),
                mods: Vec::new(),
            },
            0.0,
            Some(Box::new(der)),
        );
        self.resets.push((zref, Vec::new()));
        (zref, dref)
    }

    /// Discrete variable, returning its value reference.
    pub fn add_discrete(&mut self, name: &str, start: f64) -> VRef {
        let vref = self.next_vref();
        self.push(
            ModelVar {
                name: name.to_string(),
                vref,
                kind: ValueKind::Real,
                causality: Causality::Local,
                variability: Variability::Discrete,
                start,
                derivative_of: None,
                derivative: None,
                is_event_indicator: false,
                deps: Vec::new(),
                mods: Vec::new(),
            },
            start,
            None,
        );
        vref
    }

    /// Input variable, returning its value reference.
    pub fn add_input(&mut self, name: &str, start: f64) -> VRef {
        let vref = self.next_vref();
        self.push(
            ModelVar {
                name: name.to_string(),
                vref,
                kind: ValueKind::Real,
                causality: Causality::Input,
                variability: Variability::Continuous,
                start,
                derivative_of: None,
                derivative: None,
                is_event_indicator: false,
                deps: Vec::new(),
                mods: Vec::new(),
            },
            start,
            None,
        );
        vref
    }

    /// Output variable computed by a closure, returning its value reference.
    pub fn add_output(
        &mut self,
        name: &str,
        start: f64,
        value: impl Fn(Time, &[f64]) -> f64 + 'static,
    ) -> VRef {
        let vref = self.next_vref();
        self.push(
            ModelVar {
                name: name.to_string(),
                vref,
                kind: ValueKind::Real,
                causality: Causality::Output,
                variability: Variability::Continuous,
                start,
                derivative_of: None,
                derivative: None,
                is_event_indicator: false,
                deps: Vec::new(),
                mods: Vec::new(),
            },
            start,
            Some(Box::new(value)),
        );
        vref
    }

    /// Toggle `target` between 0 and 1 when `indicator` fires, and record the
    /// modification for conditional setup.
    pub fn on_crossing_toggle(&mut self, indicator: VRef, target: VRef) {
        self.vars[indicator as usize].mods.push(target);
        self.reset_list(indicator).push(Reset::Toggle(target));
    }

    /// Assign `target := f(t, values)` when `indicator` fires.
    pub fn on_crossing_assign(
        &mut self,
        indicator: VRef,
        target: VRef,
        f: impl Fn(Time, &[f64]) -> f64 + 'static,
    ) {
        self.vars[indicator as usize].mods.push(target);
        self.reset_list(indicator).push(Reset::Assign(target, Box::new(f)));
    }

    fn reset_list(&mut self, indicator: VRef) -> &mut Vec<Reset> {
        &mut self
            .resets
            .iter_mut()
            .find(|(z, _)| *z == indicator)
            .expect("not an event indicator")
            .1
    }

    pub fn build(self) -> FnModel {
        let prev_signs = vec![0i8; self.resets.len()];
        let mut model = FnModel {
            name: self.name,
            t0: self.t0,
            t_end: self.t_end,
            t: self.t0,
            vars: self.vars,
            vals: self.vals,
            fns: self.fns,
            resets: self.resets,
            prev_signs,
        };
        // Indicator start values in the table may be stale relative to their
        // closures; recompute so the first event iteration sees true signs.
        model.prev_signs = model
            .resets
            .iter()
            .map(|(zref, _)| {
                let z = model.compute(*zref);
                if z > 0.0 {
                    1
                } else if z < 0.0 {
                    -1
                } else {
                    0
                }
            })
            .collect();
        model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivative_reads_current_values() {
        let mut m = FnModelBuilder::new("decay")
            .state("x", 1.0, |_, v| -v[0])
            .build();
        let x = m.resolve("x").unwrap();
        let dx = m.resolve("der(x)").unwrap();
        assert_eq!(m.get_real(dx), -1.0);
        m.set_real(x, 4.0);
        assert_eq!(m.get_real(dx), -4.0);
    }

    #[test]
    fn event_iteration_toggles_on_sign_change() {
        let mut b = FnModelBuilder::new("ladder");
        let (x, _dx) = b.add_state("x", 0.0, |_, _| 1.0);
        let (z, _dz) = b.add_indicator("z", -1.0, move |_, v| v[x as usize] - 1.0, |_, _| 1.0);
        let y = b.add_discrete("y", 0.0);
        b.on_crossing_toggle(z, y);
        let mut m = b.build();

        let mut info = EventInfo::default();
        m.new_discrete_states(&mut info);
        assert!(!info.values_of_continuous_states_changed);
        assert_eq!(m.get_real(y), 0.0);

        // Push x past the indicator zero and iterate again.
        m.set_real(x, 1.5);
        m.new_discrete_states(&mut info);
        assert_eq!(m.get_real(y), 1.0);

        // No further sign change: idempotent.
        m.new_discrete_states(&mut info);
        assert_eq!(m.get_real(y), 1.0);
    }
}
