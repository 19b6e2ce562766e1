use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CONCURRENCY, DEFAULT_NAMESPACE, DEFAULT_REAP_PERIOD_SECONDS,
    DEFAULT_WATCHDOG_FAIL_TIMEOUT_SECONDS, HEARTBEAT_PERIOD_SECONDS,
    PERIODIC_ENQUEUE_PERIOD_SECONDS, REQUEUE_PERIOD_MS,
};

/// Pool-level configuration. Every field has a default so a settings file
/// only needs to name what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct Settings {
    pub redis_dsn: String,
    /// Namespace prefix shared by every pool cooperating on the same jobs.
    pub namespace: String,
    /// Number of workers this pool runs.
    pub concurrency: usize,
    pub heartbeat_period_seconds: u64,
    pub requeue_period_ms: u64,
    pub periodic_enqueue_period_seconds: u64,
    pub reap_period_seconds: u64,
    pub watchdog_fail_timeout_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_dsn: "redis://localhost:6379/0".to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            heartbeat_period_seconds: HEARTBEAT_PERIOD_SECONDS,
            requeue_period_ms: REQUEUE_PERIOD_MS,
            periodic_enqueue_period_seconds: PERIODIC_ENQUEUE_PERIOD_SECONDS,
            reap_period_seconds: DEFAULT_REAP_PERIOD_SECONDS,
            watchdog_fail_timeout_seconds: DEFAULT_WATCHDOG_FAIL_TIMEOUT_SECONDS,
        }
    }
}
