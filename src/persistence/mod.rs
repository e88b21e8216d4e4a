use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::future::Future;
use tokio::time::{timeout, Duration};

use crate::error::Result;

/// Key-value store for selection-set membership lists
pub trait SelectionStore: Send + Sync {
    fn load(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    fn save(&self, key: &str, value: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Process-local store, used when no Redis is configured
#[derive(Debug, Default)]
pub struct MemorySelectionStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySelectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStore for MemorySelectionStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Redis-backed selection store
///
/// Each set lives under a plain string key holding the space-joined
/// tickers.
#[derive(Clone)]
pub struct RedisSelectionStore {
    conn: ConnectionManager,
}

impl RedisSelectionStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| {
                redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "Redis connection timeout after 5 seconds",
                ))
            })??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }
}

impl SelectionStore for RedisSelectionStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn save(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;

        tracing::debug!("Saved selection {} to Redis", key);
        Ok(())
    }
}
