use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::constants::{DEFAULT_MAX_FAILS, DEFAULT_PRIORITY, MAX_PRIORITY};

pub(crate) fn now_epoch_seconds() -> i64 {
    Utc::now().timestamp()
}

/// A single unit of work as it travels through the store. The serialized
/// JSON object is the only wire form; field names are fixed for
/// compatibility with queues written by earlier deployments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub id: String,
    /// Enqueue time, epoch seconds.
    #[serde(rename = "t")]
    pub enqueued_at: i64,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub args: serde_json::Map<String, Value>,
    /// Accumulated failure count.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub fails: i64,
    /// Last handler error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,
    /// Periodic-firing deadline, epoch seconds. Promotion past this point
    /// drops the job instead of running it stale.
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<i64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,

    /// Bytes exactly as fetched; the release commit matches on these.
    #[serde(skip)]
    pub(crate) raw: Vec<u8>,
    #[serde(skip)]
    pub(crate) dequeued_from: String,
    #[serde(skip)]
    pub(crate) in_progress_queue: String,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Job {
    pub fn new(name: &str, args: serde_json::Map<String, Value>) -> Self {
        Self {
            name: name.to_string(),
            id: Uuid::new_v4().to_string(),
            enqueued_at: now_epoch_seconds(),
            args,
            ..Default::default()
        }
    }

    pub(crate) fn from_raw(raw: Vec<u8>, dequeued_from: String, in_progress_queue: String) -> Result<Self> {
        let mut job: Job = serde_json::from_slice(&raw)?;
        job.raw = raw;
        job.dequeued_from = dequeued_from;
        job.in_progress_queue = in_progress_queue;
        Ok(job)
    }

    pub(crate) fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub(crate) fn record_failure(&mut self, err: &str) {
        self.fails += 1;
        self.err = Some(err.to_string());
        self.failed_at = Some(now_epoch_seconds());
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }

    pub fn arg_i64(&self, key: &str) -> Option<i64> {
        self.args.get(key).and_then(Value::as_i64)
    }

    pub fn arg_bool(&self, key: &str) -> Option<bool> {
        self.args.get(key).and_then(Value::as_bool)
    }
}

/// Seconds to wait before the next attempt of a failed job.
pub type BackoffCalculator = Arc<dyn Fn(&Job) -> i64 + Send + Sync>;

/// Per-job-type tuning. Zero-valued fields fall back to their defaults when
/// the type is registered.
#[derive(Clone, Default)]
pub struct JobOptions {
    /// Sampling weight, 1..=100_000. Higher is drawn earlier more often.
    pub priority: u32,
    /// Failures allowed before the job is dead (default 4).
    pub max_fails: u32,
    /// Discard exhausted jobs instead of forwarding them to the dead set.
    pub skip_dead: bool,
    /// Global cap on simultaneously running instances; 0 disables.
    pub max_concurrency: u32,
    pub backoff: Option<BackoffCalculator>,
}

impl JobOptions {
    pub(crate) fn normalized(mut self) -> Result<Self> {
        if self.priority == 0 {
            self.priority = DEFAULT_PRIORITY;
        }
        if self.priority > MAX_PRIORITY {
            anyhow::bail!("job priority must be between 1 and {MAX_PRIORITY}");
        }
        if self.max_fails == 0 {
            self.max_fails = DEFAULT_MAX_FAILS;
        }
        Ok(self)
    }
}

/// Default backoff: grows fast with the failure count, with enough spread
/// that simultaneous failures do not retry in lockstep.
pub(crate) fn default_backoff(job: &Job) -> i64 {
    let fails = job.fails;
    let mut rng = rand::rng();
    (fails * fails * fails * fails) + 15 + rng.random_range(0..30) * (fails + 1)
}
