//! The supervisor that wires everything together: workers, heartbeater,
//! requeuers, periodic enqueuer, reaper, and watchdog.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::handler::{JobHandler, JobType, Middleware, Registry};
use crate::heartbeat::Heartbeater;
use crate::job::JobOptions;
use crate::periodic::{PeriodicEnqueuer, PeriodicJob};
use crate::reaper::{DeadPoolReaper, ReaperHook};
use crate::requeuer::Requeuer;
use crate::settings::Settings;
use crate::store::Store;
use crate::watchdog::{Watchdog, WatchdogStat};
use crate::worker::{Worker, WorkerHandle};

/// A pool of workers sharing one namespace and store. Register job types
/// and middleware, then `start`. Pools on different machines cooperate
/// through the store alone.
pub struct WorkerPool {
    settings: Settings,
    pool_id: String,
    store: Store,
    registry: Registry,
    middleware: Vec<Arc<dyn Middleware>>,
    periodic_jobs: Vec<PeriodicJob>,
    reaper_hook: Option<Arc<dyn ReaperHook>>,
    watchdog: Watchdog,
    started: bool,
    shutdown: Arc<AtomicBool>,
    stop_wake: Arc<Notify>,
    workers: Vec<WorkerHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("pool_id", &self.pool_id)
            .field("started", &self.started)
            .finish()
    }
}

impl WorkerPool {
    pub async fn new(settings: Settings) -> Result<Self> {
        let store = Store::new(&settings.redis_dsn, &settings.namespace).await?;
        Ok(Self::with_store(settings, store))
    }

    pub fn with_store(settings: Settings, store: Store) -> Self {
        let watchdog = Watchdog::new(Duration::from_secs(settings.watchdog_fail_timeout_seconds));
        Self {
            settings,
            pool_id: Uuid::new_v4().to_string(),
            store,
            registry: Registry::new(),
            middleware: Vec::new(),
            periodic_jobs: Vec::new(),
            reaper_hook: None,
            watchdog,
            started: false,
            shutdown: Arc::new(AtomicBool::new(false)),
            stop_wake: Arc::new(Notify::new()),
            workers: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn register(&mut self, name: &str, handler: Arc<dyn JobHandler>) -> Result<&mut Self> {
        self.register_with_options(name, JobOptions::default(), handler)
    }

    pub fn register_with_options(
        &mut self,
        name: &str,
        options: JobOptions,
        handler: Arc<dyn JobHandler>,
    ) -> Result<&mut Self> {
        anyhow::ensure!(!self.started, "job types must be registered before start");
        let options = options.normalized()?;
        self.registry.insert(
            name.to_string(),
            Arc::new(JobType {
                name: name.to_string(),
                options,
                handler,
            }),
        );
        Ok(self)
    }

    /// Appends to the middleware chain; middleware runs in registration
    /// order around every handler.
    pub fn middleware(&mut self, middleware: Arc<dyn Middleware>) -> Result<&mut Self> {
        anyhow::ensure!(!self.started, "middleware must be registered before start");
        self.middleware.push(middleware);
        Ok(self)
    }

    /// Enqueues `job_name` on the cron spec. Pools sharing a namespace
    /// coordinate so each firing is enqueued once across the fleet.
    pub fn periodically_enqueue(&mut self, spec: &str, job_name: &str) -> Result<&mut Self> {
        anyhow::ensure!(!self.started, "periodic jobs must be registered before start");
        let periodic = PeriodicJob::new(spec, job_name)?;
        tracing::debug!(job_name = %job_name, spec = %periodic.spec, "registered periodic job");
        self.watchdog.add_periodic(job_name, periodic.schedule().clone());
        self.periodic_jobs.push(periodic);
        Ok(self)
    }

    pub fn set_reaper_hook(&mut self, hook: Arc<dyn ReaperHook>) -> &mut Self {
        self.reaper_hook = Some(hook);
        self
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;

        let mut names: Vec<String> = self.registry.keys().cloned().collect();
        names.sort();
        let caps: Vec<(String, u32)> = self
            .registry
            .iter()
            .map(|(name, job_type)| (name.clone(), job_type.options.max_concurrency))
            .collect();
        for (name, cap) in caps {
            self.store.set_max_concurrency(&name, cap).await?;
        }
        self.store.add_known_jobs(&names).await?;

        let registry = Arc::new(self.registry.clone());
        let middleware = Arc::new(self.middleware.clone());
        let (processed_tx, processed_rx) = mpsc::unbounded_channel();
        self.tasks.push(self.watchdog.spawn(processed_rx));

        let mut worker_ids = Vec::new();
        for _ in 0..self.settings.concurrency.max(1) {
            let (worker, handle) = Worker::new(
                self.store.clone(),
                self.pool_id.clone(),
                registry.clone(),
                middleware.clone(),
                Some(processed_tx.clone()),
                self.shutdown.clone(),
            );
            worker_ids.push(handle.worker_id.clone());
            self.tasks.push(tokio::spawn(worker.run()));
            self.workers.push(handle);
        }
        drop(processed_tx);

        let heartbeater = Heartbeater::new(
            self.store.clone(),
            self.pool_id.clone(),
            names.clone(),
            self.settings.concurrency,
            worker_ids,
            Duration::from_secs(self.settings.heartbeat_period_seconds),
            self.shutdown.clone(),
            self.stop_wake.clone(),
        );
        self.tasks.push(tokio::spawn(heartbeater.run()));

        let known_queues: Vec<String> = names
            .iter()
            .map(|name| self.store.keys().jobs(name))
            .collect();
        let requeue_period = Duration::from_millis(self.settings.requeue_period_ms);
        for source in [self.store.keys().retry(), self.store.keys().scheduled()] {
            let requeuer = Requeuer::new(
                self.store.clone(),
                source,
                known_queues.clone(),
                requeue_period,
                self.shutdown.clone(),
                self.stop_wake.clone(),
            );
            self.tasks.push(tokio::spawn(requeuer.run()));
        }

        let periodic_enqueuer = PeriodicEnqueuer::new(
            self.store.clone(),
            self.periodic_jobs.clone(),
            Duration::from_secs(self.settings.periodic_enqueue_period_seconds),
            self.shutdown.clone(),
            self.stop_wake.clone(),
        );
        self.tasks.push(tokio::spawn(periodic_enqueuer.run()));

        let reaper = DeadPoolReaper::new(
            self.store.clone(),
            names.clone(),
            Duration::from_secs(self.settings.reap_period_seconds),
            self.reaper_hook.clone(),
            self.shutdown.clone(),
            self.stop_wake.clone(),
        );
        self.tasks.push(tokio::spawn(reaper.run()));

        tracing::info!(
            pool_id = %self.pool_id,
            concurrency = self.settings.concurrency,
            job_names = ?names,
            "worker pool started"
        );
        Ok(())
    }

    /// Stops every component and waits for them to finish. Running handlers
    /// are not cancelled; their results are committed before the workers
    /// exit.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        self.shutdown.store(true, Ordering::SeqCst);
        self.stop_wake.notify_waiters();
        for handle in &self.workers {
            handle.drain_wake.notify_one();
        }
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                tracing::error!(pool_id = %self.pool_id, "component task failed: {err}");
            }
        }
        self.workers.clear();
        tracing::info!(pool_id = %self.pool_id, "worker pool stopped");
    }

    /// Waits until every worker has seen an empty fetch. Unbounded if
    /// producers keep the queues full.
    pub async fn drain(&self) {
        for handle in &self.workers {
            handle.draining.store(true, Ordering::SeqCst);
            handle.drain_wake.notify_one();
        }
        for handle in &self.workers {
            handle.drained_ack.notified().await;
        }
    }

    pub fn watchdog_stats(&self) -> Vec<WatchdogStat> {
        self.watchdog.stats()
    }
}
