pub const DEFAULT_NAMESPACE: &str = "rwq";
pub const DEFAULT_CONCURRENCY: usize = 10;

pub const DEFAULT_PRIORITY: u32 = 1;
pub const MAX_PRIORITY: u32 = 100_000;
pub const DEFAULT_MAX_FAILS: u32 = 4;

/// Idle/retry sleep ladder shared by the worker fetch loop and the release
/// commit loop. Indexed by consecutive misses, saturating at the last entry.
pub const SLEEP_BACKOFFS_MS: [u64; 5] = [0, 10, 100, 1_000, 5_000];

pub const HEARTBEAT_PERIOD_SECONDS: u64 = 5;
pub const HEARTBEAT_TTL_SECONDS: i64 = 30;

pub const REQUEUE_PERIOD_MS: u64 = 1_000;
pub const REQUEUE_JITTER_MS: u64 = 250;

pub const PERIODIC_ENQUEUE_PERIOD_SECONDS: u64 = 38;
/// A periodic firing promoted later than this many seconds past its fire
/// time is dropped instead of run stale.
pub const PERIODIC_DEADLINE_SLACK_SECONDS: i64 = 59;

pub const DEFAULT_REAP_PERIOD_SECONDS: u64 = 600;
pub const REAP_JITTER_RATIO: f64 = 0.1;

pub const UNIQUE_LATCH_TTL_SECONDS: i64 = 86_400;

pub const WORKER_OBSERVATION_TTL_SECONDS: i64 = 60 * 60 * 24;
pub const DEFAULT_WATCHDOG_FAIL_TIMEOUT_SECONDS: u64 = 60;

pub const DEAD_REQUEUE_BATCH: usize = 1_000;
pub const JOBS_PAGE_SIZE: isize = 20;
