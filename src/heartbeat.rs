//! Pool liveness. Each pool periodically rewrites its heartbeat hash with a
//! short TTL; a pool whose hash has expired is considered dead and becomes
//! the reaper's business.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;

use crate::constants::HEARTBEAT_TTL_SECONDS;
use crate::job::now_epoch_seconds;
use crate::store::Store;
use crate::worker::sleep_with_wake;

pub(crate) struct Heartbeater {
    store: Store,
    pool_id: String,
    started_at: i64,
    job_names: String,
    concurrency: usize,
    worker_ids: String,
    host: String,
    pid: u32,
    period: Duration,
    shutdown: Arc<AtomicBool>,
    stop_wake: Arc<Notify>,
}

impl Heartbeater {
    pub(crate) fn new(
        store: Store,
        pool_id: String,
        mut job_names: Vec<String>,
        concurrency: usize,
        mut worker_ids: Vec<String>,
        period: Duration,
        shutdown: Arc<AtomicBool>,
        stop_wake: Arc<Notify>,
    ) -> Self {
        job_names.sort();
        worker_ids.sort();
        let host = hostname::get()
            .ok()
            .and_then(|host| host.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            store,
            pool_id,
            started_at: now_epoch_seconds(),
            job_names: job_names.join(","),
            concurrency,
            worker_ids: worker_ids.join(","),
            host,
            pid: std::process::id(),
            period,
            shutdown,
            stop_wake,
        }
    }

    pub(crate) async fn run(mut self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(err) = self.beat().await {
                tracing::error!(pool_id = %self.pool_id, "heartbeat write failed: {err:#}");
            }
            sleep_with_wake(&self.shutdown, &self.stop_wake, self.period).await;
        }

        if let Err(err) = self.store.remove_worker_pool(&self.pool_id).await {
            tracing::error!(pool_id = %self.pool_id, "failed to remove heartbeat: {err:#}");
        }
        tracing::debug!(pool_id = %self.pool_id, "heartbeater stopped");
    }

    pub(crate) async fn beat(&mut self) -> Result<()> {
        let fields = [
            ("heartbeat_at", now_epoch_seconds().to_string()),
            ("started_at", self.started_at.to_string()),
            ("job_names", self.job_names.clone()),
            ("concurrency", self.concurrency.to_string()),
            ("worker_ids", self.worker_ids.clone()),
            ("host", self.host.clone()),
            ("pid", self.pid.to_string()),
        ];
        self.store
            .write_heartbeat(&self.pool_id, &fields, HEARTBEAT_TTL_SECONDS)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RedisTestContext;

    fn build_heartbeater(ctx: &RedisTestContext, shutdown: Arc<AtomicBool>) -> Heartbeater {
        Heartbeater::new(
            ctx.store.clone(),
            "pool-1".to_string(),
            vec!["email".to_string(), "billing".to_string()],
            4,
            vec!["w2".to_string(), "w1".to_string()],
            Duration::from_millis(50),
            shutdown,
            Arc::new(Notify::new()),
        )
    }

    #[tokio::test]
    async fn beat_publishes_membership_with_ttl() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut heartbeater = build_heartbeater(&ctx, Arc::new(AtomicBool::new(false)));

        heartbeater.beat().await.unwrap();

        assert!(ctx.store.heartbeat_exists("pool-1").await.unwrap());
        assert_eq!(ctx.store.worker_pool_ids().await.unwrap(), vec!["pool-1"]);
        let hash = ctx.store.read_heartbeat("pool-1").await.unwrap().unwrap();
        assert_eq!(hash.get("job_names").map(String::as_str), Some("billing,email"));
        assert_eq!(hash.get("worker_ids").map(String::as_str), Some("w1,w2"));
        assert_eq!(hash.get("concurrency").map(String::as_str), Some("4"));
        assert!(hash.contains_key("heartbeat_at"));
        assert!(hash.contains_key("started_at"));
        assert!(hash.contains_key("host"));
        assert!(hash.contains_key("pid"));

        let key = ctx.store.keys().heartbeat("pool-1");
        let ttl: i64 = redis::cmd("TTL")
            .arg(&key)
            .query_async(&mut ctx.store.conn)
            .await
            .unwrap();
        assert!(ttl > 0 && ttl <= HEARTBEAT_TTL_SECONDS);
    }

    #[tokio::test]
    async fn stop_removes_membership_and_hash() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let heartbeater = build_heartbeater(&ctx, shutdown.clone());
        let join = tokio::spawn(heartbeater.run());

        // give the first beat a moment to land
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(ctx.store.heartbeat_exists("pool-1").await.unwrap());

        shutdown.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(5), join)
            .await
            .expect("heartbeater did not stop")
            .unwrap();

        assert!(!ctx.store.heartbeat_exists("pool-1").await.unwrap());
        assert!(ctx.store.worker_pool_ids().await.unwrap().is_empty());
    }
}
