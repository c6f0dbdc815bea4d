//! Event-driven quantized-state solver: pooled stage processors, the driver
//! event loop, and the multi-model connection manager.
//!
//! Control flow: the driver peeks the queue head, extracts the group of
//! events sharing the leading superdense time, dispatches by event kind
//! (requantization, input, zero crossing, conditional, handler, time event),
//! and lets each processor schedule follow-on events by re-shifting its own
//! queue entries. Observers of advanced variables are refreshed in a second
//! pass within the same superdense time.

mod connect;
mod pools;
mod solver;

pub use connect::Connections;
pub use pools::{Handlers, Observers, TriggersQss, TriggersZc};
pub use solver::{SetupError, Solver, Stats};
