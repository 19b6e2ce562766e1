//! The producer and operator surface: enqueue jobs (plain, future-dated,
//! unique) and inspect or repair what the fleet is doing.

use std::collections::HashSet;

use anyhow::Result;
use serde_json::Value;

use crate::constants::{DEAD_REQUEUE_BATCH, JOBS_PAGE_SIZE};
use crate::job::{Job, now_epoch_seconds};
use crate::store::Store;

/// Enqueues jobs. Job names are added to the shared known-jobs set the
/// first time this enqueuer sees them, so requeuers can route entries back.
pub struct Enqueuer {
    store: Store,
    known: HashSet<String>,
}

impl Enqueuer {
    pub async fn new(redis_dsn: &str, namespace: &str) -> Result<Self> {
        Ok(Self::with_store(Store::new(redis_dsn, namespace).await?))
    }

    pub fn with_store(store: Store) -> Self {
        Self {
            store,
            known: HashSet::new(),
        }
    }

    pub async fn enqueue(
        &mut self,
        name: &str,
        args: serde_json::Map<String, Value>,
    ) -> Result<Job> {
        let job = Job::new(name, args);
        self.store.enqueue(&job).await?;
        self.mark_known(name).await?;
        tracing::debug!(job_name = %name, job_id = %job.id, "enqueued job");
        Ok(job)
    }

    /// Schedules the job to run `seconds_from_now` in the future.
    pub async fn enqueue_in(
        &mut self,
        name: &str,
        seconds_from_now: i64,
        args: serde_json::Map<String, Value>,
    ) -> Result<Job> {
        let job = Job::new(name, args);
        let run_at = job.enqueued_at + seconds_from_now;
        self.store.schedule(&job, run_at).await?;
        self.mark_known(name).await?;
        tracing::debug!(job_name = %name, job_id = %job.id, run_at, "scheduled job");
        Ok(job)
    }

    /// Enqueues unless an identical (name, args) submission is already
    /// enqueued or running. Returns `None` on a duplicate.
    pub async fn enqueue_unique(
        &mut self,
        name: &str,
        args: serde_json::Map<String, Value>,
    ) -> Result<Option<Job>> {
        let mut job = Job::new(name, args);
        job.unique = true;
        let latch = self.store.keys().unique_job(name, &job.args)?;
        let enqueued = self.store.enqueue_unique(&job, &latch).await?;
        self.mark_known(name).await?;
        Ok(enqueued.then_some(job))
    }

    /// The future-dated form of [`Enqueuer::enqueue_unique`].
    pub async fn enqueue_unique_in(
        &mut self,
        name: &str,
        seconds_from_now: i64,
        args: serde_json::Map<String, Value>,
    ) -> Result<Option<Job>> {
        let mut job = Job::new(name, args);
        job.unique = true;
        let latch = self.store.keys().unique_job(name, &job.args)?;
        let run_at = job.enqueued_at + seconds_from_now;
        let enqueued = self.store.enqueue_unique_in(&job, &latch, run_at).await?;
        self.mark_known(name).await?;
        Ok(enqueued.then_some(job))
    }

    async fn mark_known(&mut self, name: &str) -> Result<()> {
        if self.known.insert(name.to_string()) {
            self.store.add_known_jobs(&[name.to_string()]).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoolHeartbeat {
    pub pool_id: String,
    pub started_at: i64,
    pub heartbeat_at: i64,
    pub job_names: Vec<String>,
    pub concurrency: usize,
    pub worker_ids: Vec<String>,
    pub host: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerObservation {
    pub worker_id: String,
    pub is_busy: bool,
    pub job_name: String,
    pub job_id: String,
    pub started_at: i64,
    pub args_json: String,
}

#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub job_name: String,
    pub count: i64,
    /// Seconds the oldest ready job has been waiting.
    pub latency: i64,
}

#[derive(Debug, Clone)]
pub struct RetryJob {
    pub retry_at: i64,
    pub job: Job,
}

#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub run_at: i64,
    pub job: Job,
}

#[derive(Debug, Clone)]
pub struct DeadJob {
    pub died_at: i64,
    pub job: Job,
}

/// Read-side and repair API over a namespace. Listings are paged, 1-based.
pub struct Client {
    store: Store,
}

impl Client {
    pub async fn new(redis_dsn: &str, namespace: &str) -> Result<Self> {
        Ok(Self::with_store(Store::new(redis_dsn, namespace).await?))
    }

    pub fn with_store(store: Store) -> Self {
        Self { store }
    }

    pub async fn worker_pool_heartbeats(&mut self) -> Result<Vec<PoolHeartbeat>> {
        let mut pool_ids = self.store.worker_pool_ids().await?;
        pool_ids.sort();
        let mut heartbeats = Vec::with_capacity(pool_ids.len());
        for pool_id in pool_ids {
            let Some(hash) = self.store.read_heartbeat(&pool_id).await? else {
                continue;
            };
            let field_i64 =
                |name: &str| hash.get(name).and_then(|raw| raw.parse::<i64>().ok()).unwrap_or(0);
            let field_list = |name: &str| -> Vec<String> {
                hash.get(name)
                    .map(|raw| {
                        raw.split(',')
                            .filter(|part| !part.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default()
            };
            heartbeats.push(PoolHeartbeat {
                pool_id,
                started_at: field_i64("started_at"),
                heartbeat_at: field_i64("heartbeat_at"),
                job_names: field_list("job_names"),
                concurrency: field_i64("concurrency") as usize,
                worker_ids: field_list("worker_ids"),
                host: hash.get("host").cloned().unwrap_or_default(),
                pid: field_i64("pid") as u32,
            });
        }
        Ok(heartbeats)
    }

    /// What each known worker is doing right now, per its observation key.
    pub async fn worker_observations(&mut self) -> Result<Vec<WorkerObservation>> {
        let heartbeats = self.worker_pool_heartbeats().await?;
        let mut observations = Vec::new();
        for heartbeat in &heartbeats {
            for worker_id in &heartbeat.worker_ids {
                let mut observation = WorkerObservation {
                    worker_id: worker_id.clone(),
                    ..Default::default()
                };
                if let Some(hash) = self.store.read_worker_observation(worker_id).await? {
                    if let Some(job_id) = hash.get("job_id") {
                        observation.is_busy = true;
                        observation.job_id = job_id.clone();
                        observation.job_name = hash.get("job_name").cloned().unwrap_or_default();
                        observation.started_at = hash
                            .get("started_at")
                            .and_then(|raw| raw.parse().ok())
                            .unwrap_or(0);
                        observation.args_json = hash.get("args").cloned().unwrap_or_default();
                    }
                }
                observations.push(observation);
            }
        }
        Ok(observations)
    }

    /// Depth and age of every known ready queue.
    pub async fn queues(&mut self) -> Result<Vec<QueueInfo>> {
        let mut names = self.store.known_job_names().await?;
        names.sort();
        let now = now_epoch_seconds();
        let mut queues = Vec::with_capacity(names.len());
        for name in names {
            let count = self.store.queue_len(&name).await?;
            let latency = match self.store.next_ready_job(&name).await? {
                Some(job) if count > 0 => (now - job.enqueued_at).max(0),
                _ => 0,
            };
            queues.push(QueueInfo {
                job_name: name,
                count,
                latency,
            });
        }
        Ok(queues)
    }

    pub async fn retry_count(&mut self) -> Result<i64> {
        let key = self.store.keys().retry();
        self.store.zset_len(&key).await
    }

    pub async fn scheduled_count(&mut self) -> Result<i64> {
        let key = self.store.keys().scheduled();
        self.store.zset_len(&key).await
    }

    pub async fn dead_count(&mut self) -> Result<i64> {
        let key = self.store.keys().dead();
        self.store.zset_len(&key).await
    }

    pub async fn retry_jobs(&mut self, page: usize) -> Result<Vec<RetryJob>> {
        let key = self.store.keys().retry();
        let entries = self.zset_jobs(&key, page).await?;
        Ok(entries
            .into_iter()
            .map(|(job, score)| RetryJob {
                retry_at: score,
                job,
            })
            .collect())
    }

    pub async fn scheduled_jobs(&mut self, page: usize) -> Result<Vec<ScheduledJob>> {
        let key = self.store.keys().scheduled();
        let entries = self.zset_jobs(&key, page).await?;
        Ok(entries
            .into_iter()
            .map(|(job, score)| ScheduledJob { run_at: score, job })
            .collect())
    }

    pub async fn dead_jobs(&mut self, page: usize) -> Result<Vec<DeadJob>> {
        let key = self.store.keys().dead();
        let entries = self.zset_jobs(&key, page).await?;
        Ok(entries
            .into_iter()
            .map(|(job, score)| DeadJob { died_at: score, job })
            .collect())
    }

    async fn zset_jobs(&mut self, key: &str, page: usize) -> Result<Vec<(Job, i64)>> {
        let page = page.max(1) as isize;
        let start = (page - 1) * JOBS_PAGE_SIZE;
        let stop = start + JOBS_PAGE_SIZE - 1;
        let entries = self.store.zset_page(key, start, stop).await?;
        let mut jobs = Vec::with_capacity(entries.len());
        for (raw, score) in entries {
            match serde_json::from_slice::<Job>(&raw) {
                Ok(job) => jobs.push((job, score as i64)),
                Err(err) => tracing::warn!("skipping undecodable entry in {key}: {err:#}"),
            }
        }
        Ok(jobs)
    }

    pub async fn delete_retry_job(&mut self, retry_at: i64, job_id: &str) -> Result<bool> {
        let key = self.store.keys().retry();
        let (deleted, _) = self.store.delete_single(&key, retry_at, job_id).await?;
        Ok(deleted > 0)
    }

    pub async fn delete_scheduled_job(&mut self, run_at: i64, job_id: &str) -> Result<bool> {
        let key = self.store.keys().scheduled();
        let (deleted, _) = self.store.delete_single(&key, run_at, job_id).await?;
        Ok(deleted > 0)
    }

    pub async fn delete_dead_job(&mut self, died_at: i64, job_id: &str) -> Result<bool> {
        let key = self.store.keys().dead();
        let (deleted, _) = self.store.delete_single(&key, died_at, job_id).await?;
        Ok(deleted > 0)
    }

    /// Returns one dead job to its ready list with its failure bookkeeping
    /// cleared.
    pub async fn requeue_dead_job(&mut self, died_at: i64, job_id: &str) -> Result<bool> {
        let known = self.known_queues().await?;
        let requeued = self
            .store
            .requeue_single_dead(&known, now_epoch_seconds(), died_at, job_id)
            .await?;
        Ok(requeued > 0)
    }

    /// Drains the dead set back onto ready lists in batches. Returns the
    /// total requeued.
    pub async fn requeue_all_dead_jobs(&mut self) -> Result<i64> {
        let known = self.known_queues().await?;
        let mut total = 0;
        loop {
            let requeued = self
                .store
                .requeue_all_dead(&known, now_epoch_seconds(), DEAD_REQUEUE_BATCH)
                .await?;
            total += requeued;
            if requeued == 0 {
                return Ok(total);
            }
        }
    }

    /// Sets the pause flag: workers stop claiming this job type until it is
    /// unpaused. Jobs already running finish normally.
    pub async fn pause_jobs(&mut self, job_name: &str) -> Result<()> {
        self.store.pause_jobs(job_name).await
    }

    pub async fn unpause_jobs(&mut self, job_name: &str) -> Result<()> {
        self.store.unpause_jobs(job_name).await
    }

    async fn known_queues(&mut self) -> Result<Vec<String>> {
        let names = self.store.known_job_names().await?;
        Ok(names
            .iter()
            .map(|name| self.store.keys().jobs(name))
            .collect())
    }
}
