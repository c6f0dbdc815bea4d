//! The model adapter seam.
//!
//! The solver integrates an opaque model reached through the [`Model`] trait:
//! values and derivatives are read and written by value reference, the
//! model's notion of "current time" is set before every query batch, and
//! discontinuities are applied by the model's own event iteration
//! (`new_discrete_states`). The trait mirrors a model-exchange binary
//! interface; the two in-tree implementations stand in for the out-of-scope
//! model loader: [`LinearModel`] (state-space systems described in TOML) and
//! [`FnModel`] (closure-backed, used by tests and nonlinear scenarios).

mod func;
mod linear;

pub use func::{FnModel, FnModelBuilder};
pub use linear::{LinearModel, LinearModelFile};

use core_time::Time;
use thiserror::Error;

/// Value reference: the model-side handle for one scalar variable.
pub type VRef = u32;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model file {path}: {source}")]
    File {
        path: String,
        source: std::io::Error,
    },
    #[error("model file {path}: {message}")]
    Parse { path: String, message: String },
    #[error("unknown variable: {0}")]
    UnknownVariable(String),
    #[error("variable spec matches multiple variables: {0}")]
    AmbiguousVariable(String),
}

/// Scalar type of a model variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Real,
    Integer,
    Boolean,
    Enumeration,
}

/// Who sets the variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    Input,
    Output,
    Parameter,
    Local,
    Independent,
}

/// How the variable may change over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variability {
    Constant,
    Fixed,
    Tunable,
    Discrete,
    Continuous,
}

/// Introspection record for one model variable.
#[derive(Debug, Clone)]
pub struct ModelVar {
    pub name: String,
    pub vref: VRef,
    pub kind: ValueKind,
    pub causality: Causality,
    pub variability: Variability,
    pub start: f64,
    /// For a derivative variable: the state it is the derivative of.
    pub derivative_of: Option<VRef>,
    /// For a state variable: its derivative's value reference.
    pub derivative: Option<VRef>,
    pub is_event_indicator: bool,
    /// Value references this variable's computation reads (derivatives and
    /// event indicators; empty otherwise).
    pub deps: Vec<VRef>,
    /// For an event indicator: value references its handler modifies.
    pub mods: Vec<VRef>,
}

/// Outcome of one model event iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventInfo {
    pub new_discrete_states_needed: bool,
    pub terminate_simulation: bool,
    pub values_of_continuous_states_changed: bool,
    pub next_event_time: Option<Time>,
}

/// Model-exchange adapter contract.
///
/// The adapter is a shared mutable resource: its current time and its input
/// values are global state that every query batch must re-set before reading.
/// Value-reference arguments are validated with assertions; an out-of-range
/// reference is a programmer error, not a data error.
pub trait Model {
    fn name(&self) -> &str;

    /// Model start time.
    fn t0(&self) -> Time;

    /// Model-declared end time, if any.
    fn t_end(&self) -> Option<Time>;

    fn vars(&self) -> &[ModelVar];

    fn set_time(&mut self, t: Time);
    fn get_time(&self) -> Time;

    fn set_real(&mut self, vref: VRef, value: f64);
    fn get_real(&self, vref: VRef) -> f64;

    fn set_reals(&mut self, refs: &[VRef], values: &[f64]) {
        assert_eq!(refs.len(), values.len());
        for (&r, &v) in refs.iter().zip(values) {
            self.set_real(r, v);
        }
    }

    fn get_reals(&self, refs: &[VRef], out: &mut [f64]) {
        assert_eq!(refs.len(), out.len());
        for (&r, o) in refs.iter().zip(out.iter_mut()) {
            *o = self.get_real(r);
        }
    }

    fn set_integer(&mut self, vref: VRef, value: i64) {
        self.set_real(vref, value as f64);
    }
    fn get_integer(&self, vref: VRef) -> i64 {
        self.get_real(vref) as i64
    }
    fn set_boolean(&mut self, vref: VRef, value: bool) {
        self.set_real(vref, if value { 1.0 } else { 0.0 });
    }
    fn get_boolean(&self, vref: VRef) -> bool {
        self.get_real(vref) != 0.0
    }

    /// Whether `directional_derivative` is implemented.
    fn supports_directional_derivatives(&self) -> bool {
        false
    }

    /// Directional derivative of the `der_refs` outputs with respect to the
    /// `val_refs` inputs along `seed`. Used for second-derivative queries.
    fn directional_derivative(
        &self,
        val_refs: &[VRef],
        der_refs: &[VRef],
        seed: &[f64],
        out: &mut [f64],
    ) {
        let _ = (val_refs, der_refs, seed);
        let _ = out;
        unimplemented!("model does not supply directional derivatives");
    }

    /// Run the model's own event iteration, applying any pending
    /// discontinuous updates to its variables.
    fn new_discrete_states(&mut self, info: &mut EventInfo);

    /// Look up a variable by name.
    fn vref_of(&self, name: &str) -> Option<VRef> {
        self.vars()
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.vref)
    }

    /// Look up a variable by name, as a setup-time error on failure.
    fn resolve(&self, name: &str) -> Result<VRef, ModelError> {
        self.vref_of(name)
            .ok_or_else(|| ModelError::UnknownVariable(name.to_string()))
    }
}
