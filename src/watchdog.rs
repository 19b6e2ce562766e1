//! In-memory tracking of what this pool has processed, with a missed-firing
//! check for periodic jobs. Diagnostic only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use cron::Schedule;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::job::now_epoch_seconds;
use crate::worker::ProcessedJob;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogStat {
    pub job_name: String,
    pub processed: u64,
    pub last_processed_at: Option<i64>,
    /// Set for periodic jobs with a firing that has gone unprocessed past
    /// the checking timeout.
    pub missed: bool,
}

#[derive(Default)]
struct Entry {
    processed: u64,
    last_processed_at: Option<i64>,
}

pub(crate) struct Watchdog {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    periodic: Vec<(String, Schedule)>,
    fail_timeout: Duration,
    started_at: i64,
}

impl Watchdog {
    pub(crate) fn new(fail_timeout: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            periodic: Vec::new(),
            fail_timeout,
            started_at: now_epoch_seconds(),
        }
    }

    pub(crate) fn add_periodic(&mut self, job_name: &str, schedule: Schedule) {
        self.periodic.push((job_name.to_string(), schedule));
    }

    /// Consumes worker notifications until every sender is gone.
    pub(crate) fn spawn(&self, mut rx: mpsc::UnboundedReceiver<ProcessedJob>) -> JoinHandle<()> {
        let entries = self.entries.clone();
        tokio::spawn(async move {
            while let Some(processed) = rx.recv().await {
                let mut entries = entries.lock().unwrap();
                let entry = entries.entry(processed.name).or_default();
                entry.processed += 1;
                entry.last_processed_at = Some(now_epoch_seconds());
            }
        })
    }

    pub(crate) fn stats(&self) -> Vec<WatchdogStat> {
        let entries = self.entries.lock().unwrap();
        let mut stats: HashMap<String, WatchdogStat> = entries
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    WatchdogStat {
                        job_name: name.clone(),
                        processed: entry.processed,
                        last_processed_at: entry.last_processed_at,
                        missed: false,
                    },
                )
            })
            .collect();

        for (name, schedule) in &self.periodic {
            let last_processed_at = entries.get(name).and_then(|entry| entry.last_processed_at);
            let missed = self.has_missed_firing(schedule, last_processed_at);
            stats
                .entry(name.clone())
                .or_insert_with(|| WatchdogStat {
                    job_name: name.clone(),
                    processed: 0,
                    last_processed_at: None,
                    missed: false,
                })
                .missed = missed;
        }

        let mut stats: Vec<WatchdogStat> = stats.into_values().collect();
        stats.sort_by(|a, b| a.job_name.cmp(&b.job_name));
        stats
    }

    /// A firing was missed if one is due later than the last processing
    /// anchor and the checking timeout has already elapsed past it.
    fn has_missed_firing(&self, schedule: &Schedule, last_processed_at: Option<i64>) -> bool {
        let anchor = last_processed_at.unwrap_or(self.started_at);
        let Some(anchor) = Utc.timestamp_opt(anchor, 0).single() else {
            return false;
        };
        let timeout = chrono::Duration::from_std(self.fail_timeout).unwrap_or_default();
        let now = Utc::now();
        schedule
            .after(&anchor)
            .take_while(|fire| *fire + timeout < now)
            .next()
            .is_some()
    }
}
