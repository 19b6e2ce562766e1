//! Promotes due entries from a time-scored sorted set back onto their ready
//! lists. One instance runs against `retry`, another against `scheduled`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;

use crate::constants::REQUEUE_JITTER_MS;
use crate::job::now_epoch_seconds;
use crate::store::Store;
use crate::worker::sleep_with_wake;

pub(crate) struct Requeuer {
    store: Store,
    source_key: String,
    known_queues: Vec<String>,
    period: Duration,
    shutdown: Arc<AtomicBool>,
    stop_wake: Arc<Notify>,
}

impl Requeuer {
    pub(crate) fn new(
        store: Store,
        source_key: String,
        known_queues: Vec<String>,
        period: Duration,
        shutdown: Arc<AtomicBool>,
        stop_wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            source_key,
            known_queues,
            period,
            shutdown,
            stop_wake,
        }
    }

    pub(crate) async fn run(mut self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            self.drain_due().await;
            sleep_with_wake(&self.shutdown, &self.stop_wake, self.jittered_period()).await;
        }
        tracing::debug!(source = %self.source_key, "requeuer stopped");
    }

    fn jittered_period(&self) -> Duration {
        let jitter = REQUEUE_JITTER_MS as i64;
        let offset = rand::rng().random_range(-jitter..=jitter);
        let millis = (self.period.as_millis() as i64 + offset).max(0);
        Duration::from_millis(millis as u64)
    }

    /// Keeps promoting until nothing is due.
    pub(crate) async fn drain_due(&mut self) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            match self
                .store
                .requeue_due(&self.source_key, &self.known_queues, now_epoch_seconds())
                .await
            {
                Ok(Some(outcome)) => {
                    if outcome == "dead" {
                        tracing::warn!(source = %self.source_key, "diverted unknown job to dead set");
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    tracing::error!(source = %self.source_key, "requeue failed: {err:#}");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::test_support::RedisTestContext;

    #[tokio::test]
    async fn drain_promotes_everything_due_and_leaves_the_future() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let keys = ctx.store.keys().clone();
        let now = now_epoch_seconds();

        let due_one = Job::new("email", serde_json::Map::new());
        let due_two = Job::new("email", serde_json::Map::new());
        let future = Job::new("email", serde_json::Map::new());
        for (job, score) in [(&due_one, now - 10), (&due_two, now - 5), (&future, now + 3_600)] {
            let payload = job.serialize().unwrap();
            redis::cmd("ZADD")
                .arg(keys.retry())
                .arg(score)
                .arg(payload)
                .query_async::<()>(&mut ctx.store.conn)
                .await
                .unwrap();
        }

        let mut requeuer = Requeuer::new(
            ctx.store.clone(),
            keys.retry(),
            vec![keys.jobs("email")],
            Duration::from_millis(10),
            Arc::new(AtomicBool::new(false)),
            Arc::new(Notify::new()),
        );
        requeuer.drain_due().await;

        assert_eq!(ctx.store.queue_len("email").await.unwrap(), 2);
        assert_eq!(ctx.store.zset_len(&keys.retry()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn jittered_period_stays_near_base() {
        let ctx = RedisTestContext::new().await.unwrap();
        let keys = ctx.store.keys().clone();
        let requeuer = Requeuer::new(
            ctx.store.clone(),
            keys.retry(),
            Vec::new(),
            Duration::from_millis(1_000),
            Arc::new(AtomicBool::new(false)),
            Arc::new(Notify::new()),
        );
        for _ in 0..100 {
            let period = requeuer.jittered_period().as_millis() as i64;
            assert!((750..=1_250).contains(&period), "period {period}");
        }
    }
}
