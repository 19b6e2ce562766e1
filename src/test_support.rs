use std::sync::OnceLock;

use anyhow::Result;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::settings::Settings;
use crate::store::Store;

static REDIS_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn redis_lock() -> &'static Mutex<()> {
    REDIS_LOCK.get_or_init(|| Mutex::new(()))
}

/// Serializes Redis-backed tests onto a flushed test database with a unique
/// namespace per test.
pub struct RedisTestContext {
    _guard: MutexGuard<'static, ()>,
    pub settings: Settings,
    pub store: Store,
}

impl RedisTestContext {
    pub async fn new() -> Result<Self> {
        let guard = redis_lock().lock().await;
        let mut settings = Settings::default();
        settings.redis_dsn = std::env::var("RWQ_TEST_REDIS_DSN")
            .unwrap_or_else(|_| "redis://localhost:6379/15".to_string());
        settings.namespace = format!("test-{}", Uuid::new_v4());
        let mut store = Store::new(&settings.redis_dsn, &settings.namespace).await?;
        store.flushdb().await?;
        Ok(Self {
            _guard: guard,
            settings,
            store,
        })
    }
}
