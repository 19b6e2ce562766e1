use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{Notify, mpsc};
use tokio::time::sleep;
use uuid::Uuid;

use crate::constants::SLEEP_BACKOFFS_MS;
use crate::handler::{JobType, Middleware, Registry, invoke};
use crate::job::{Job, now_epoch_seconds};
use crate::observer::Observer;
use crate::sampler::{JobTypeKeys, PrioritySampler};
use crate::store::{ForwardTarget, Store};

/// Notification sent to the watchdog for every job a worker picks up.
pub(crate) struct ProcessedJob {
    pub name: String,
    pub id: String,
}

/// Control surface the pool keeps for each spawned worker.
pub(crate) struct WorkerHandle {
    pub worker_id: String,
    pub draining: Arc<AtomicBool>,
    pub drain_wake: Arc<Notify>,
    pub drained_ack: Arc<Notify>,
}

/// One fetch→execute→release loop. Workers never share in-memory work; the
/// store itself is the only queue between them.
pub(crate) struct Worker {
    worker_id: String,
    pool_id: String,
    store: Store,
    registry: Arc<Registry>,
    middleware: Arc<Vec<Arc<dyn Middleware>>>,
    sampler: PrioritySampler,
    observer: Observer,
    processed_tx: Option<mpsc::UnboundedSender<ProcessedJob>>,
    shutdown: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    drain_wake: Arc<Notify>,
    drained_ack: Arc<Notify>,
}

impl Worker {
    pub(crate) fn new(
        store: Store,
        pool_id: String,
        registry: Arc<Registry>,
        middleware: Arc<Vec<Arc<dyn Middleware>>>,
        processed_tx: Option<mpsc::UnboundedSender<ProcessedJob>>,
        shutdown: Arc<AtomicBool>,
    ) -> (Self, WorkerHandle) {
        let worker_id = Uuid::new_v4().to_string();
        let keys = store.keys().clone();
        let mut sampler = PrioritySampler::default();
        for (name, job_type) in registry.iter() {
            sampler.add(
                job_type.options.priority,
                JobTypeKeys {
                    jobs: keys.jobs(name),
                    in_progress: keys.in_progress(&pool_id, name),
                    paused: keys.paused(name),
                    lock: keys.lock(name),
                    lock_info: keys.lock_info(name),
                    max_concurrency: keys.max_concurrency(name),
                },
            );
        }

        let draining = Arc::new(AtomicBool::new(false));
        let drain_wake = Arc::new(Notify::new());
        let drained_ack = Arc::new(Notify::new());
        let handle = WorkerHandle {
            worker_id: worker_id.clone(),
            draining: draining.clone(),
            drain_wake: drain_wake.clone(),
            drained_ack: drained_ack.clone(),
        };

        let observer = Observer::new(store.clone(), worker_id.clone());
        let worker = Self {
            worker_id,
            pool_id,
            store,
            registry,
            middleware,
            sampler,
            observer,
            processed_tx,
            shutdown,
            draining,
            drain_wake,
            drained_ack,
        };
        (worker, handle)
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!(worker_id = %self.worker_id, "worker started");
        let mut idle_count = 0usize;

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.fetch_job().await {
                Err(err) => {
                    tracing::error!(worker_id = %self.worker_id, "fetch failed: {err:#}");
                    self.idle_sleep(Duration::from_millis(SLEEP_BACKOFFS_MS[1])).await;
                }
                Ok(Some(mut job)) => {
                    if let Some(tx) = &self.processed_tx {
                        let _ = tx.send(ProcessedJob {
                            name: job.name.clone(),
                            id: job.id.clone(),
                        });
                    }
                    self.process_job(&mut job).await;
                    idle_count = 0;
                }
                Ok(None) => {
                    if self.draining.swap(false, Ordering::SeqCst) {
                        self.drained_ack.notify_one();
                    }
                    idle_count += 1;
                    let idx = idle_count.min(SLEEP_BACKOFFS_MS.len() - 1);
                    self.idle_sleep(Duration::from_millis(SLEEP_BACKOFFS_MS[idx])).await;
                }
            }
        }

        if let Err(err) = self.observer.clear().await {
            tracing::debug!(worker_id = %self.worker_id, "failed to clear observation: {err:#}");
        }
        tracing::debug!(worker_id = %self.worker_id, "worker stopped");
    }

    async fn idle_sleep(&self, duration: Duration) {
        sleep_with_wake(&self.shutdown, &self.drain_wake, duration).await;
    }

    async fn fetch_job(&mut self) -> Result<Option<Job>> {
        if self.sampler.is_empty() {
            return Ok(None);
        }
        self.sampler.sample();
        let claimed = self.store.fetch_job(self.sampler.keys(), &self.pool_id).await?;
        match claimed {
            None => Ok(None),
            Some((raw, dequeued_from, in_progress)) => {
                Ok(Some(Job::from_raw(raw, dequeued_from, in_progress)?))
            }
        }
    }

    async fn process_job(&mut self, job: &mut Job) {
        if job.unique {
            // Drop the latch up front so a fresh duplicate may enter while
            // this instance runs.
            match self.store.keys().unique_job(&job.name, &job.args) {
                Ok(latch) => {
                    if let Err(err) = self.store.delete_unique_latch(&latch).await {
                        tracing::error!(job_id = %job.id, "failed to delete uniqueness latch: {err:#}");
                    }
                }
                Err(err) => {
                    tracing::error!(job_id = %job.id, "failed to build uniqueness latch key: {err:#}");
                }
            }
        }

        let job_type = self.registry.get(&job.name).cloned();
        let run_err = match &job_type {
            None => {
                tracing::error!(job_name = %job.name, job_id = %job.id, "stray job: no handler");
                Some("stray job: no handler".to_string())
            }
            Some(job_type) => {
                if let Err(err) = self.observer.started(job).await {
                    tracing::debug!(worker_id = %self.worker_id, "observation write failed: {err:#}");
                }
                let started = Instant::now();
                let run_err =
                    run_handler(self.middleware.clone(), job_type.clone(), job.clone()).await;
                if let Err(err) = self
                    .observer
                    .done(job, started.elapsed(), run_err.as_deref())
                    .await
                {
                    tracing::debug!(worker_id = %self.worker_id, "observation write failed: {err:#}");
                }
                run_err
            }
        };

        if let Some(err) = &run_err {
            job.record_failure(err);
        }
        self.release_job(job, job_type.as_ref(), run_err.is_some()).await;
    }

    /// Commits the job's outcome. An uncommitted in-progress entry pins a
    /// lock slot forever, so this retries until the store accepts it.
    async fn release_job(&mut self, job: &Job, job_type: Option<&Arc<JobType>>, failed: bool) {
        let destination = if !failed {
            None
        } else {
            match job_type {
                // stray jobs are never retried
                None => None,
                Some(job_type) if job_type.options.skip_dead => None,
                Some(job_type) if i64::from(job_type.options.max_fails) - job.fails > 0 => Some((
                    self.store.keys().retry(),
                    now_epoch_seconds() + job_type.calc_backoff(job),
                )),
                Some(_) => Some((self.store.keys().dead(), now_epoch_seconds())),
            }
        };
        let forward = destination.and_then(|(queue, score)| match job.serialize() {
            Ok(payload) => Some(ForwardTarget { queue, score, payload }),
            Err(err) => {
                tracing::error!(job_id = %job.id, "failed to serialize failed job: {err:#}");
                None
            }
        });

        let mut attempt = 0usize;
        loop {
            match self
                .store
                .remove_job_from_in_progress(job, &self.pool_id, forward.as_ref())
                .await
            {
                Ok(()) => break,
                Err(err) => {
                    tracing::warn!(job_id = %job.id, "release commit failed: {err:#}");
                    let idx = attempt.min(SLEEP_BACKOFFS_MS.len() - 1);
                    sleep(Duration::from_millis(SLEEP_BACKOFFS_MS[idx])).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Runs the middleware chain and handler on its own task so a panicking
/// handler surfaces as an error instead of tearing the worker down.
async fn run_handler(
    middleware: Arc<Vec<Arc<dyn Middleware>>>,
    job_type: Arc<JobType>,
    job: Job,
) -> Option<String> {
    let joined = tokio::spawn(async move { invoke(&middleware, &job_type, &job).await }).await;
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(format!("{err:#}")),
        Err(join_err) => {
            if join_err.is_panic() {
                let payload = join_err.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|text| text.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Some(format!("job handler panicked: {message}"))
            } else {
                Some(format!("job handler task failed: {join_err}"))
            }
        }
    }
}

/// Sleeps up to `duration`, returning early when `wake` fires and polling
/// the shutdown flag every 100ms.
pub(crate) async fn sleep_with_wake(shutdown: &AtomicBool, wake: &Notify, duration: Duration) {
    let mut remaining = duration;
    let step = Duration::from_millis(100);
    while remaining > Duration::ZERO && !shutdown.load(Ordering::SeqCst) {
        let next = remaining.min(step);
        tokio::select! {
            _ = sleep(next) => {}
            _ = wake.notified() => return,
        }
        remaining = remaining.saturating_sub(next);
    }
}
