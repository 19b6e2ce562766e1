//! Per-worker observation keys. Diagnostic only: operators can see what
//! each worker is doing and what it last ran.

use std::time::Duration;

use anyhow::Result;

use crate::constants::WORKER_OBSERVATION_TTL_SECONDS;
use crate::job::{Job, now_epoch_seconds};
use crate::store::Store;

const CURRENT_FIELDS: [&str; 4] = ["job_name", "job_id", "started_at", "args"];

pub(crate) struct Observer {
    store: Store,
    worker_id: String,
}

impl Observer {
    pub(crate) fn new(store: Store, worker_id: String) -> Self {
        Self { store, worker_id }
    }

    pub(crate) async fn started(&mut self, job: &Job) -> Result<()> {
        let set = [
            ("job_name", job.name.clone()),
            ("job_id", job.id.clone()),
            ("started_at", now_epoch_seconds().to_string()),
            ("args", serde_json::to_string(&job.args)?),
        ];
        self.store
            .write_worker_observation(&self.worker_id, &set, &[], WORKER_OBSERVATION_TTL_SECONDS)
            .await
    }

    pub(crate) async fn done(&mut self, job: &Job, elapsed: Duration, err: Option<&str>) -> Result<()> {
        let set = [
            ("last_job_name", job.name.clone()),
            ("last_job_id", job.id.clone()),
            ("last_finished_at", now_epoch_seconds().to_string()),
            ("last_duration_ms", elapsed.as_millis().to_string()),
            (
                "last_status",
                if err.is_some() { "error" } else { "ok" }.to_string(),
            ),
        ];
        self.store
            .write_worker_observation(
                &self.worker_id,
                &set,
                &CURRENT_FIELDS,
                WORKER_OBSERVATION_TTL_SECONDS,
            )
            .await
    }

    pub(crate) async fn clear(&mut self) -> Result<()> {
        self.store.delete_worker_observation(&self.worker_id).await
    }
}
