//! rwq is a Redis-backed distributed job processor. Independent worker
//! pools cooperate through a shared namespace to claim jobs from per-name
//! queues with priority-weighted sampling and bounded concurrency, retry
//! failures with backoff, run cron-scheduled jobs exactly once across the
//! fleet, and reclaim work orphaned by crashed pools.
//!
//! Delivery is at-least-once: the in-progress commit happens after the
//! handler returns, so handlers must be idempotent.

pub mod client;
pub mod constants;
pub mod handler;
pub mod job;
pub mod keys;
pub mod pool;
pub mod settings;
pub mod store;

mod heartbeat;
mod observer;
mod periodic;
mod reaper;
mod requeuer;
mod sampler;
mod watchdog;
mod worker;

#[cfg(test)]
mod test_support;

pub use client::{
    Client, DeadJob, Enqueuer, PoolHeartbeat, QueueInfo, RetryJob, ScheduledJob, WorkerObservation,
};
pub use handler::{JobHandler, Middleware, Next, handler_fn};
pub use job::{BackoffCalculator, Job, JobOptions};
pub use keys::Namespace;
pub use pool::WorkerPool;
pub use reaper::ReaperHook;
pub use settings::Settings;
pub use store::Store;
pub use watchdog::WatchdogStat;
