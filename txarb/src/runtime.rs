//! Arbiter-side runtime.
//!
//! - `arbiter`: round-robin drain, rate limit, forward, reclaim.
//! - `dispatcher`: batch transmitter fed by the arbiter.
//! - `queue`: per-CPU mailboxes of mailbox references.
//! - `stats`: counters for an external reporting layer.
//! - `clock`: time source, injectable for tests.
//! - `topology`: CPU detection and worker pinning.

pub mod arbiter;
pub mod clock;
pub mod dispatcher;
pub(crate) mod queue;
pub mod stats;
pub mod topology;
