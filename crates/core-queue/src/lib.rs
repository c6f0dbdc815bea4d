//! The event queue driving a qsolve simulation.
//!
//! A multimap from superdense time to event targets. Targets hold a `Handle`
//! to their single live entry and reposition it with `shift`; the driver
//! reads the head group and relies on the processors' shifts to clear it.
//! This mirrors the requantization discipline: every advance ends by
//! re-predicting its own next event time, so no separate pop is needed.
//!
//! Pass bookkeeping: the driver calls `mark` once per dispatched group. A new
//! physical instant resets the pass counter; each zero-crossing sweep within
//! the instant starts a new pass. Entries added while an instant is active
//! are stamped with the current pass, which is what When-clause "became true
//! in the same pass" detection reads back.

use core_time::{EventKind, SuperdenseTime, Time};
use std::collections::BTreeMap;
use std::fmt;

/// Queue key: superdense time plus an insertion serial making keys unique
/// (the serial plays the role of the C++ multimap's per-node identity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    st: SuperdenseTime,
    seq: u64,
}

/// Opaque token for one live queue entry. Stale handles (after a shift that
/// returned a replacement) must not be reused; shifting a stale handle is a
/// programmer error and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(Key);

impl Handle {
    /// Superdense time this handle was queued at.
    pub fn st(&self) -> SuperdenseTime {
        self.0.st
    }
}

pub struct EventQueue<T> {
    map: BTreeMap<Key, T>,
    seq: u64,
    /// Physical time of the instant currently being processed.
    t_active: Time,
    /// Pass counter within the active instant.
    pass: u64,
}

impl<T: Copy + Eq + fmt::Debug> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
            seq: 0,
            t_active: core_time::NEG_INFINITY,
            pass: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Current pass counter (the `o` stamped on newly added entries at the
    /// active instant).
    pub fn pass(&self) -> u64 {
        self.pass
    }

    /// Record that the driver is dispatching the group at `head`. Must be
    /// called exactly once per dispatched group.
    pub fn mark(&mut self, head: SuperdenseTime) {
        if head.t != self.t_active {
            self.t_active = head.t;
            self.pass = 0;
        } else if head.kind == EventKind::ZeroCrossing {
            self.pass += 1;
        }
    }

    /// Superdense time stamped on an event added now at `(t, kind)`.
    pub fn stamp(&self, t: Time, kind: EventKind) -> SuperdenseTime {
        let o = if t == self.t_active { self.pass } else { 0 };
        SuperdenseTime::new(t, kind, o)
    }

    /// Add an event for `target` at `(t, kind)`. The pass serial is the
    /// current pass when `t` is the active instant, zero otherwise.
    pub fn add(&mut self, t: Time, kind: EventKind, target: T) -> Handle {
        assert!(!t.is_nan(), "event time must not be NaN");
        let key = Key {
            st: self.stamp(t, kind),
            seq: self.next_seq(),
        };
        tracing::trace!(target: "solver.queue", t, %kind, o = key.st.o, ?target, "queue_add");
        let prev = self.map.insert(key, target);
        debug_assert!(prev.is_none());
        Handle(key)
    }

    /// Reposition the entry behind `handle` to `(t, kind)`, returning the
    /// replacement handle. Panics on a stale handle.
    pub fn shift(&mut self, handle: Handle, t: Time, kind: EventKind, target: T) -> Handle {
        let removed = self.map.remove(&handle.0);
        assert!(
            removed == Some(target),
            "shift on stale queue handle for {target:?}"
        );
        self.add(t, kind, target)
    }

    /// Park the entry at positive infinity (inactive).
    pub fn shift_inf(&mut self, handle: Handle, kind: EventKind, target: T) -> Handle {
        self.shift(handle, core_time::INFINITY, kind, target)
    }

    /// Superdense time of the head entry, if any.
    pub fn peek_time(&self) -> Option<SuperdenseTime> {
        self.map.keys().next().map(|k| k.st)
    }

    /// Head group: every target sharing the minimal `(t, kind)`, in insertion
    /// order, without removing them.
    pub fn top_group(&self) -> Option<(SuperdenseTime, Vec<T>)> {
        let head = self.peek_time()?;
        let group = self
            .group_keys(head)
            .map(|k| self.map[&k])
            .collect::<Vec<_>>();
        Some((head, group))
    }

    /// Head group with removal. Used by flows that do not re-shift (e.g. the
    /// multi-model sync loop).
    pub fn extract_min_group(&mut self) -> Option<(SuperdenseTime, Vec<T>)> {
        let (head, group) = self.top_group()?;
        let keys: Vec<Key> = self.group_keys(head).collect();
        for k in keys {
            self.map.remove(&k);
        }
        Some((head, group))
    }

    fn group_keys(&self, head: SuperdenseTime) -> impl Iterator<Item = Key> + '_ {
        self.map
            .range(
                Key {
                    st: SuperdenseTime::new(head.t, head.kind, 0),
                    seq: 0,
                }..,
            )
            .take_while(move |(k, _)| k.st.same_group(&head))
            .map(|(k, _)| *k)
    }

    fn next_seq(&mut self) -> u64 {
        let s = self.seq;
        self.seq += 1;
        s
    }
}

impl<T: Copy + Eq + fmt::Debug> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_peek() {
        let mut q = EventQueue::new();
        q.add(2.0, EventKind::Requantize, 1u32);
        q.add(1.0, EventKind::Handler, 2u32);
        assert_eq!(q.peek_time().unwrap().t, 1.0);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn top_group_batches_same_time_and_kind() {
        let mut q = EventQueue::new();
        q.add(1.0, EventKind::Requantize, 1u32);
        q.add(1.0, EventKind::Requantize, 2u32);
        q.add(1.0, EventKind::Observe, 3u32);
        let (st, group) = q.top_group().unwrap();
        assert_eq!(st.kind, EventKind::Requantize);
        assert_eq!(group, vec![1, 2]);
    }

    #[test]
    fn shift_repositions_single_entry() {
        let mut q = EventQueue::new();
        let h = q.add(1.0, EventKind::Requantize, 7u32);
        let h2 = q.shift(h, 3.0, EventKind::Requantize, 7u32);
        assert_eq!(q.len(), 1);
        assert_eq!(q.peek_time().unwrap().t, 3.0);
        let _h3 = q.shift_inf(h2, EventKind::Requantize, 7u32);
        assert_eq!(q.peek_time().unwrap().t, core_time::INFINITY);
    }

    #[test]
    #[should_panic(expected = "stale queue handle")]
    fn stale_shift_panics() {
        let mut q = EventQueue::new();
        let h = q.add(1.0, EventKind::Requantize, 7u32);
        let _h2 = q.shift(h, 2.0, EventKind::Requantize, 7u32);
        let _ = q.shift(h, 4.0, EventKind::Requantize, 7u32); // stale
    }

    #[test]
    fn pass_counter_tracks_zc_sweeps() {
        let mut q = EventQueue::new();
        q.add(1.0, EventKind::ZeroCrossing, 1u32);

        // First sweep at a fresh instant is pass 0.
        let (st, _) = q.extract_min_group().unwrap();
        q.mark(st);
        assert_eq!(q.pass(), 0);
        let h = q.add(1.0, EventKind::Handler, 2u32);
        assert_eq!(h.st().o, 0);

        // Handler dispatch at the same instant does not advance the pass.
        let (st, _) = q.extract_min_group().unwrap();
        q.mark(st);
        assert_eq!(q.pass(), 0);

        // A second crossing sweep at the same instant starts pass 1.
        q.add(1.0, EventKind::ZeroCrossing, 3u32);
        let (st, _) = q.extract_min_group().unwrap();
        q.mark(st);
        assert_eq!(q.pass(), 1);
        let h2 = q.add(1.0, EventKind::Handler, 4u32);
        assert_eq!(h2.st().o, 1);

        // A later instant resets to pass 0.
        let (st, _) = q.extract_min_group().unwrap();
        q.mark(st);
        q.add(2.0, EventKind::ZeroCrossing, 5u32);
        let (st, _) = q.extract_min_group().unwrap();
        q.mark(st);
        assert_eq!(q.pass(), 0);
    }

    #[test]
    fn future_adds_get_pass_zero() {
        let mut q = EventQueue::new();
        q.add(1.0, EventKind::ZeroCrossing, 1u32);
        let (st, _) = q.top_group().unwrap();
        q.mark(st);
        let h = q.add(5.0, EventKind::Requantize, 2u32);
        assert_eq!(h.st().o, 0);
    }
}
