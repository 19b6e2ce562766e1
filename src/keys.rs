//! Key schema. Every piece of shared state lives under a caller-chosen
//! namespace prefix; this module is the single place that knows how keys
//! are spelled.

use anyhow::Result;
use serde_json::Value;

/// Namespace-aware key builder. The prefix always ends in `:`.
#[derive(Debug, Clone)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    pub fn new(namespace: &str) -> Self {
        let prefix = if namespace.is_empty() || namespace.ends_with(':') {
            namespace.to_string()
        } else {
            format!("{namespace}:")
        };
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Set of job names any pool has ever declared.
    pub fn known_jobs(&self) -> String {
        format!("{}known_jobs", self.prefix)
    }

    /// Prefix shared by every ready list; appending a job name yields its
    /// ready list key. The requeue scripts route on this.
    pub fn jobs_prefix(&self) -> String {
        format!("{}jobs:", self.prefix)
    }

    pub fn jobs(&self, job_name: &str) -> String {
        format!("{}{job_name}", self.jobs_prefix())
    }

    pub fn job_name_from_queue<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(&self.jobs_prefix()).unwrap_or(key)
    }

    pub fn in_progress(&self, pool_id: &str, job_name: &str) -> String {
        format!("{}:{pool_id}:inprogress", self.jobs(job_name))
    }

    pub fn paused(&self, job_name: &str) -> String {
        format!("{}:paused", self.jobs(job_name))
    }

    pub fn lock(&self, job_name: &str) -> String {
        format!("{}:lock", self.jobs(job_name))
    }

    pub fn lock_info(&self, job_name: &str) -> String {
        format!("{}:lock_info", self.jobs(job_name))
    }

    pub fn max_concurrency(&self, job_name: &str) -> String {
        format!("{}:max_concurrency", self.jobs(job_name))
    }

    pub fn retry(&self) -> String {
        format!("{}retry", self.prefix)
    }

    pub fn scheduled(&self) -> String {
        format!("{}scheduled", self.prefix)
    }

    pub fn dead(&self) -> String {
        format!("{}dead", self.prefix)
    }

    pub fn worker_pools(&self) -> String {
        format!("{}worker_pools", self.prefix)
    }

    pub fn heartbeat(&self, pool_id: &str) -> String {
        format!("{}worker_pools:{pool_id}", self.prefix)
    }

    pub fn worker_observation(&self, worker_id: &str) -> String {
        format!("{}worker:{worker_id}", self.prefix)
    }

    /// Uniqueness latch for a (name, args) submission.
    pub fn unique_job(&self, job_name: &str, args: &serde_json::Map<String, Value>) -> Result<String> {
        let encoded = serde_json::to_string(args)?;
        Ok(format!("{}unique:{job_name}:{encoded}", self.prefix))
    }

    /// Uniqueness latch for one periodic firing; the id already encodes the
    /// job name and fire time.
    pub fn unique_periodic(&self, job_name: &str, job_id: &str) -> String {
        format!("{}unique:{job_name}:{job_id}", self.prefix)
    }

    pub fn last_periodic_enqueue(&self) -> String {
        format!("{}last_periodic_enqueue", self.prefix)
    }

    pub fn reaper_lock(&self) -> String {
        format!("{}reaper_lock", self.prefix)
    }
}
