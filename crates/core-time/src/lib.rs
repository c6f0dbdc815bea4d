//! Superdense time and event-kind ordering for the qsolve event queue.
//!
//! Physical time alone cannot order the work done at a discontinuity: a zero
//! crossing, the handlers it fires, and the requantizations those handlers
//! force all share one instant. `SuperdenseTime` extends the time axis with a
//! kind index (which phase of the instant) and a pass serial (which sweep
//! within the phase) so the queue stays totally ordered.

use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

/// Simulation time in seconds.
pub type Time = f64;

/// Positive infinity used for "no event scheduled".
pub const INFINITY: Time = f64::INFINITY;

/// Negative infinity used for "no previous event".
pub const NEG_INFINITY: Time = f64::NEG_INFINITY;

/// Within-instant dispatch order. Lower discriminants run first when events
/// share a physical time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(u8)]
pub enum EventKind {
    /// QSS requantization of a state variable.
    Requantize = 0,
    /// Observer refresh following a requantization or handler batch.
    Observe = 1,
    /// Predicted zero crossing of an event indicator.
    ZeroCrossing = 2,
    /// Conditional block evaluation at a crossing.
    Conditional = 3,
    /// Handler (discontinuous update) application.
    Handler = 4,
    /// Discrete variable event.
    Discrete = 5,
    /// Input variable requantization.
    Input = 6,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Requantize => "QSS",
            EventKind::Observe => "OBS",
            EventKind::ZeroCrossing => "ZC",
            EventKind::Conditional => "CND",
            EventKind::Handler => "HND",
            EventKind::Discrete => "DSC",
            EventKind::Input => "INP",
        };
        f.write_str(s)
    }
}

/// Totally ordered event key `(t, kind, pass)`.
///
/// `t` is physical time; `kind` imposes the within-instant phase order; `o`
/// is the pass serial assigned by the queue. Ordering is lexicographic, with
/// the usual caveat that `t` must never be NaN (the queue rejects NaN keys at
/// insertion).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuperdenseTime {
    pub t: Time,
    pub kind: EventKind,
    pub o: u64,
}

impl SuperdenseTime {
    pub const fn new(t: Time, kind: EventKind, o: u64) -> Self {
        Self { t, kind, o }
    }

    /// Key at positive infinity, used to park inactive targets.
    pub const fn infinity(kind: EventKind) -> Self {
        Self {
            t: INFINITY,
            kind,
            o: 0,
        }
    }

    /// Same physical time and pass serial: the When-clause "became true in
    /// this pass" test. The kind field is deliberately ignored so a crossing
    /// and the handler it spawned compare as the same pass.
    pub fn same_pass(&self, other: &SuperdenseTime) -> bool {
        self.t == other.t && self.o == other.o
    }

    /// Same physical time and kind: the batching group for pooled advances.
    pub fn same_group(&self, other: &SuperdenseTime) -> bool {
        self.t == other.t && self.kind == other.kind
    }
}

impl Eq for SuperdenseTime {}

impl Ord for SuperdenseTime {
    fn cmp(&self, other: &Self) -> Ordering {
        debug_assert!(!self.t.is_nan() && !other.t.is_nan());
        self.t
            .partial_cmp(&other.t)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.kind.cmp(&other.kind))
            .then_with(|| self.o.cmp(&other.o))
    }
}

impl PartialOrd for SuperdenseTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SuperdenseTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.t, self.kind, self.o)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_order_matches_dispatch_order() {
        assert!(EventKind::Requantize < EventKind::Observe);
        assert!(EventKind::Observe < EventKind::ZeroCrossing);
        assert!(EventKind::ZeroCrossing < EventKind::Conditional);
        assert!(EventKind::Conditional < EventKind::Handler);
        assert!(EventKind::Handler < EventKind::Discrete);
        assert!(EventKind::Discrete < EventKind::Input);
    }

    #[test]
    fn lexicographic_ordering() {
        let a = SuperdenseTime::new(1.0, EventKind::Handler, 5);
        let b = SuperdenseTime::new(2.0, EventKind::Requantize, 0);
        assert!(a < b);

        let c = SuperdenseTime::new(1.0, EventKind::Requantize, 9);
        assert!(c < a);

        let d = SuperdenseTime::new(1.0, EventKind::Handler, 6);
        assert!(a < d);
    }

    #[test]
    fn infinity_sorts_last() {
        let inf = SuperdenseTime::infinity(EventKind::Requantize);
        let late = SuperdenseTime::new(1.0e300, EventKind::Input, u64::MAX);
        assert!(late < inf);
    }

    #[test]
    fn same_pass_ignores_kind() {
        let zc = SuperdenseTime::new(3.0, EventKind::ZeroCrossing, 2);
        let hnd = SuperdenseTime::new(3.0, EventKind::Handler, 2);
        assert!(zc.same_pass(&hnd));
        let later = SuperdenseTime::new(3.0, EventKind::Handler, 3);
        assert!(!zc.same_pass(&later));
    }
}
