//! Job dispatch between the scheduler and the other nodes.
//!
//! The scheduler creates a [`Tracker`] and either dispatches a pool of
//! numbered workload parts to the worker group ([`Tracker::start_dispatch`])
//! or sends one job to a node group and waits for every member's numeric
//! returns ([`Tracker::issue_and_wait`]). Workers and servers run an
//! executor loop that turns received [`Job`]s into serialized results.
//!
//! Dispatch keeps one job in flight per worker. The [`WorkloadPool`] tracks
//! part states, optionally picks parts at random, and reassigns jobs held
//! by stragglers; a monitor thread watches for dead nodes, returning their
//! parts to the pool on the scheduler and terminating non-scheduler nodes
//! when the scheduler itself dies.

pub mod executor;
pub mod job;
pub mod pool;
pub mod tracker;

pub use executor::run_worker_executor;
pub use job::{Job, JobType};
pub use pool::WorkloadPool;
pub use tracker::Tracker;
