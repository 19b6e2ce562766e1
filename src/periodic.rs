//! Cron-scheduled enqueueing, coordinated so each firing is scheduled once
//! across the fleet: a shared watermark keeps most pools from doing the
//! work at all, and a deterministic job id plus uniqueness latch settles
//! the races the watermark lets through.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use sha1::{Digest, Sha1};
use tokio::sync::Notify;

use crate::constants::PERIODIC_DEADLINE_SLACK_SECONDS;
use crate::job::{Job, now_epoch_seconds};
use crate::store::Store;
use crate::worker::sleep_with_wake;

/// A cron spec bound to a job name. Specs may omit the seconds field and
/// may use descriptors such as `@hourly`.
#[derive(Debug, Clone)]
pub(crate) struct PeriodicJob {
    pub job_name: String,
    pub spec: String,
    schedule: Schedule,
}

impl PeriodicJob {
    pub(crate) fn new(spec: &str, job_name: &str) -> Result<Self> {
        let schedule = Schedule::from_str(&normalize_spec(spec))
            .with_context(|| format!("invalid cron spec for job '{job_name}': {spec}"))?;
        Ok(Self {
            job_name: job_name.to_string(),
            spec: spec.to_string(),
            schedule,
        })
    }

    pub(crate) fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    fn upcoming(&self, from: DateTime<Utc>, until: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&from)
            .take_while(|fire| *fire <= until)
            .collect()
    }
}

/// Five-field specs gain an explicit zero seconds field; six-field specs and
/// descriptors pass through untouched.
fn normalize_spec(spec: &str) -> String {
    let spec = spec.trim();
    if !spec.starts_with('@') && spec.split_whitespace().count() == 5 {
        format!("0 {spec}")
    } else {
        spec.to_string()
    }
}

/// The id for one (job name, fire time) pair. Deterministic across the
/// fleet so concurrent enqueuers collide on the same uniqueness latch.
pub(crate) fn periodic_job_id(job_name: &str, fire_at: i64) -> String {
    let digest = Sha1::digest(format!("{job_name}|{fire_at}").as_bytes());
    hex::encode(digest)
}

pub(crate) struct PeriodicEnqueuer {
    store: Store,
    jobs: Vec<PeriodicJob>,
    period: Duration,
    shutdown: Arc<AtomicBool>,
    stop_wake: Arc<Notify>,
}

impl PeriodicEnqueuer {
    pub(crate) fn new(
        store: Store,
        jobs: Vec<PeriodicJob>,
        period: Duration,
        shutdown: Arc<AtomicBool>,
        stop_wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            jobs,
            period,
            shutdown,
            stop_wake,
        }
    }

    pub(crate) async fn run(mut self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            if !self.jobs.is_empty() {
                if let Err(err) = self.tick().await {
                    tracing::error!("periodic enqueue failed: {err:#}");
                }
            }
            sleep_with_wake(&self.shutdown, &self.stop_wake, self.period).await;
        }
        tracing::debug!("periodic enqueuer stopped");
    }

    pub(crate) async fn tick(&mut self) -> Result<()> {
        if !self.should_enqueue().await? {
            return Ok(());
        }
        self.store.set_last_periodic_enqueue(now_epoch_seconds()).await?;
        self.enqueue_upcoming().await
    }

    /// Another pool that enqueued within the last period already covered
    /// this window.
    async fn should_enqueue(&mut self) -> Result<bool> {
        let cutoff = now_epoch_seconds() - self.period.as_secs() as i64;
        Ok(match self.store.last_periodic_enqueue().await? {
            Some(watermark) => watermark < cutoff,
            None => true,
        })
    }

    async fn enqueue_upcoming(&mut self) -> Result<()> {
        let from = Utc::now();
        let until = from + chrono::Duration::seconds(2 * self.period.as_secs() as i64);
        for periodic in &self.jobs {
            for fire in periodic.upcoming(from, until) {
                let fire_at = fire.timestamp();
                let id = periodic_job_id(&periodic.job_name, fire_at);
                let job = Job {
                    name: periodic.job_name.clone(),
                    id: id.clone(),
                    enqueued_at: fire_at,
                    deadline: Some(fire_at + PERIODIC_DEADLINE_SLACK_SECONDS),
                    unique: true,
                    ..Default::default()
                };
                let latch = self.store.keys().unique_periodic(&periodic.job_name, &id);
                if !self.store.enqueue_unique_in(&job, &latch, fire_at).await? {
                    tracing::debug!(
                        job_name = %periodic.job_name,
                        fire_at,
                        "periodic firing already scheduled"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RedisTestContext;

    #[test]
    fn five_field_specs_gain_a_seconds_field() {
        assert_eq!(normalize_spec("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_spec("0 * * * * *"), "0 * * * * *");
        assert_eq!(normalize_spec("@hourly"), "@hourly");
    }

    #[test]
    fn periodic_job_accepts_common_spec_forms() {
        assert!(PeriodicJob::new("*/5 * * * *", "sync").is_ok());
        assert!(PeriodicJob::new("0 30 * * * *", "sync").is_ok());
        assert!(PeriodicJob::new("@hourly", "sync").is_ok());
        assert!(PeriodicJob::new("not a spec", "sync").is_err());
    }

    #[test]
    fn upcoming_respects_the_window() {
        let periodic = PeriodicJob::new("* * * * * *", "sync").unwrap();
        let from = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let firings = periodic.upcoming(from, from + chrono::Duration::seconds(5));
        assert_eq!(firings.len(), 5);
        assert!(firings.iter().all(|fire| *fire > from));
    }

    #[test]
    fn id_is_deterministic_per_name_and_fire_time() {
        let id = periodic_job_id("sync", 1_700_000_000);
        assert_eq!(id, periodic_job_id("sync", 1_700_000_000));
        assert_eq!(id.len(), 40);
        assert_ne!(id, periodic_job_id("sync", 1_700_000_001));
        assert_ne!(id, periodic_job_id("other", 1_700_000_000));
    }

    #[tokio::test]
    async fn tick_schedules_each_firing_once() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let keys = ctx.store.keys().clone();
        let jobs = vec![PeriodicJob::new("* * * * * *", "sync").unwrap()];
        let mut enqueuer = PeriodicEnqueuer::new(
            ctx.store.clone(),
            jobs.clone(),
            Duration::from_secs(4),
            Arc::new(AtomicBool::new(false)),
            Arc::new(Notify::new()),
        );

        enqueuer.tick().await.unwrap();
        let scheduled = ctx.store.zset_len(&keys.scheduled()).await.unwrap();
        // one firing per second over a 2x-period horizon, give or take the
        // second boundary we start on
        assert!((7..=9).contains(&scheduled), "scheduled {scheduled}");

        let entries = ctx.store.zset_page(&keys.scheduled(), 0, 0).await.unwrap();
        let first: Job = serde_json::from_slice(&entries[0].0).unwrap();
        assert_eq!(first.name, "sync");
        assert!(first.unique);
        let fire_at = entries[0].1 as i64;
        assert_eq!(first.deadline, Some(fire_at + PERIODIC_DEADLINE_SLACK_SECONDS));
        assert_eq!(first.id, periodic_job_id("sync", fire_at));

        // a second pool ticking immediately afterwards skips on the watermark
        let mut other = PeriodicEnqueuer::new(
            ctx.store.clone(),
            jobs,
            Duration::from_secs(4),
            Arc::new(AtomicBool::new(false)),
            Arc::new(Notify::new()),
        );
        other.tick().await.unwrap();
        assert_eq!(ctx.store.zset_len(&keys.scheduled()).await.unwrap(), scheduled);
    }

    #[tokio::test]
    async fn latch_settles_races_past_the_watermark() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let keys = ctx.store.keys().clone();
        let jobs = vec![PeriodicJob::new("* * * * * *", "sync").unwrap()];
        let mut enqueuer = PeriodicEnqueuer::new(
            ctx.store.clone(),
            jobs,
            Duration::from_secs(4),
            Arc::new(AtomicBool::new(false)),
            Arc::new(Notify::new()),
        );

        // both pools believe they should enqueue; the second one's inserts
        // land on held latches, so at most one firing (a fresh second
        // crossing the horizon between the calls) can be added
        enqueuer.enqueue_upcoming().await.unwrap();
        let scheduled = ctx.store.zset_len(&keys.scheduled()).await.unwrap();
        enqueuer.enqueue_upcoming().await.unwrap();
        let after = ctx.store.zset_len(&keys.scheduled()).await.unwrap();
        assert!(after <= scheduled + 1, "scheduled {scheduled} then {after}");
    }
}
