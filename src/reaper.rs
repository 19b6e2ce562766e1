//! Recovery from crashed pools. A pool whose heartbeat hash has expired
//! still owns in-progress jobs and lock slots; one reaper per tick across
//! the fleet returns the jobs to their ready lists and repairs the lock
//! accounting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::constants::REAP_JITTER_RATIO;
use crate::job::Job;
use crate::store::{ReenqueueKeys, Store};
use crate::worker::sleep_with_wake;

/// Observes the reaper's repairs. All methods default to no-ops.
pub trait ReaperHook: Send + Sync {
    /// An orphaned job was returned to its ready list.
    fn requeued(&self, _pool_id: &str, _job_name: &str, _job: &Job) {}
    /// A lock counter went negative during repair and was clamped to zero.
    fn lock_clamped(&self, _lock_key: &str) {}
}

pub(crate) struct DeadPoolReaper {
    store: Store,
    job_names: Vec<String>,
    period: Duration,
    hook: Option<Arc<dyn ReaperHook>>,
    shutdown: Arc<AtomicBool>,
    stop_wake: Arc<Notify>,
}

impl DeadPoolReaper {
    pub(crate) fn new(
        store: Store,
        job_names: Vec<String>,
        period: Duration,
        hook: Option<Arc<dyn ReaperHook>>,
        shutdown: Arc<AtomicBool>,
        stop_wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            job_names,
            period,
            hook,
            shutdown,
            stop_wake,
        }
    }

    pub(crate) async fn run(mut self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            sleep_with_wake(&self.shutdown, &self.stop_wake, self.jittered_period()).await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = self.reap().await {
                tracing::error!("reap failed: {err:#}");
            }
        }
        tracing::debug!("reaper stopped");
    }

    fn jittered_period(&self) -> Duration {
        let ratio = rand::rng().random_range(-REAP_JITTER_RATIO..=REAP_JITTER_RATIO);
        self.period.mul_f64(1.0 + ratio)
    }

    pub(crate) async fn reap(&mut self) -> Result<()> {
        let token = Uuid::new_v4().to_string();
        let ttl = self.period.as_secs().max(1);
        if !self.store.acquire_reaper_lock(&token, ttl).await? {
            tracing::debug!("another pool holds the reaper lock");
            return Ok(());
        }

        let outcome = self.reap_locked().await;
        if let Err(err) = self.store.release_reaper_lock(&token).await {
            tracing::warn!("failed to release reaper lock: {err:#}");
        }
        outcome
    }

    async fn reap_locked(&mut self) -> Result<()> {
        let keys = self.store.keys().clone();

        let mut dead_pools = Vec::new();
        for pool_id in self.store.worker_pool_ids().await? {
            if !self.store.heartbeat_exists(&pool_id).await? {
                dead_pools.push(pool_id);
            }
        }

        // Pools that left lock-info fingerprints without being members at
        // all, e.g. killed before their first heartbeat landed.
        let lock_info_keys: Vec<String> = self
            .job_names
            .iter()
            .map(|name| keys.lock_info(name))
            .collect();
        for pool_id in self.store.unknown_pools(&lock_info_keys).await?.into_keys() {
            if !dead_pools.contains(&pool_id) {
                dead_pools.push(pool_id);
            }
        }

        for pool_id in &dead_pools {
            tracing::info!(pool_id = %pool_id, "reaping dead worker pool");
            let names = self.dead_pool_job_names(pool_id).await?;
            self.requeue_in_progress(pool_id, &names).await?;

            let pairs: Vec<(String, String)> = names
                .iter()
                .map(|name| (keys.lock(name), keys.lock_info(name)))
                .collect();
            let clamped = self.store.reap_stale_locks(&pairs, pool_id).await?;
            for lock_key in &clamped {
                tracing::warn!(pool_id = %pool_id, lock_key = %lock_key, "clamped negative lock counter");
                if let Some(hook) = &self.hook {
                    hook.lock_clamped(lock_key);
                }
            }

            self.store.remove_worker_pool(pool_id).await?;
        }

        // Catch any remaining drift between counters and their breakdowns.
        let pairs: Vec<(String, String)> = self
            .job_names
            .iter()
            .map(|name| (keys.lock(name), keys.lock_info(name)))
            .collect();
        let fixed = self.store.remove_dangling_locks(&pairs).await?;
        for lock_key in fixed {
            tracing::warn!(lock_key = %lock_key, "corrected drifted lock counter");
        }

        Ok(())
    }

    /// The names the dead pool declared in its last heartbeat. The hash has
    /// usually expired by the time a pool is declared dead, in which case
    /// this pool's own registry is the best available guess.
    async fn dead_pool_job_names(&mut self, pool_id: &str) -> Result<Vec<String>> {
        if let Some(hash) = self.store.read_heartbeat(pool_id).await?
            && let Some(joined) = hash.get("job_names")
        {
            return Ok(joined
                .split(',')
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect());
        }
        Ok(self.job_names.clone())
    }

    async fn requeue_in_progress(&mut self, pool_id: &str, names: &[String]) -> Result<()> {
        let keys = self.store.keys().clone();
        let tuples: Vec<ReenqueueKeys> = names
            .iter()
            .map(|name| ReenqueueKeys {
                in_progress: keys.in_progress(pool_id, name),
                jobs: keys.jobs(name),
                lock: keys.lock(name),
                lock_info: keys.lock_info(name),
            })
            .collect();
        if tuples.is_empty() {
            return Ok(());
        }

        while let Some((raw, _in_progress_key, jobs_key)) =
            self.store.reenqueue_orphan(&tuples, pool_id).await?
        {
            let job_name = keys.job_name_from_queue(&jobs_key).to_string();
            tracing::info!(pool_id = %pool_id, job_name = %job_name, "requeued orphaned job");
            if let Some(hook) = &self.hook {
                match serde_json::from_slice::<Job>(&raw) {
                    Ok(job) => hook.requeued(pool_id, &job_name, &job),
                    Err(err) => tracing::debug!("could not decode requeued job: {err:#}"),
                }
            }
        }
        Ok(())
    }
}
