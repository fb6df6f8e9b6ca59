use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::error::PipelineError;

/// How long an "in flight" marker survives a worker that never reports back.
pub const CHUNK_BATCH_IN_FLIGHT_TTL: Duration = Duration::from_secs(2 * 60 * 60);
/// How long the outcome of a finished chunk batch stays visible to the fallback.
pub const CHUNK_BATCH_COMPLETED_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub owner: Uuid,
}

/// Shared key/value state with expiry plus expiring mutual-exclusion locks.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, PipelineError>;
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), PipelineError>;
    async fn forget(&self, key: &str) -> Result<(), PipelineError>;
    /// `None` when another owner holds an unexpired lock on `key`.
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, PipelineError>;
    async fn unlock(&self, token: &LockToken) -> Result<(), PipelineError>;
}

/// State of the most recent chunked download for one working-directory prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkBatchState {
    InFlight,
    /// The batch ended without producing a dataset (failed, cancelled or rejected).
    Completed,
    /// The batch ended and its chunks were merged and extracted.
    Merged,
}

impl ChunkBatchState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkBatchState::InFlight => "in_flight",
            ChunkBatchState::Completed => "completed",
            ChunkBatchState::Merged => "merged",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_flight" => Some(ChunkBatchState::InFlight),
            "completed" => Some(ChunkBatchState::Completed),
            "merged" => Some(ChunkBatchState::Merged),
            _ => None,
        }
    }
}

pub fn chunk_batch_flag_key(work_prefix: &str) -> String {
    format!("chunk-batch:{work_prefix}")
}

pub async fn read_chunk_batch_state(
    store: &dyn CoordinationStore,
    work_prefix: &str,
) -> Result<Option<ChunkBatchState>, PipelineError> {
    Ok(store
        .get(&chunk_batch_flag_key(work_prefix))
        .await?
        .as_deref()
        .and_then(ChunkBatchState::parse))
}

pub async fn write_chunk_batch_state(
    store: &dyn CoordinationStore,
    work_prefix: &str,
    state: ChunkBatchState,
) -> Result<(), PipelineError> {
    let ttl = match state {
        ChunkBatchState::InFlight => CHUNK_BATCH_IN_FLIGHT_TTL,
        ChunkBatchState::Completed | ChunkBatchState::Merged => CHUNK_BATCH_COMPLETED_TTL,
    };
    store
        .put(&chunk_batch_flag_key(work_prefix), state.as_str(), ttl)
        .await
}

pub async fn clear_chunk_batch_state(
    store: &dyn CoordinationStore,
    work_prefix: &str,
) -> Result<(), PipelineError> {
    store.forget(&chunk_batch_flag_key(work_prefix)).await
}

fn lock_key(key: &str) -> String {
    format!("lock:{key}")
}

/// A held lock. Dropping it without `release` (a cancelled or timed-out job) unlocks
/// from a background task.
pub struct LockGuard {
    store: Arc<dyn CoordinationStore>,
    token: Option<LockToken>,
}

impl LockGuard {
    pub async fn acquire(
        store: &Arc<dyn CoordinationStore>,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, PipelineError> {
        Ok(store.try_lock(key, ttl).await?.map(|token| LockGuard {
            store: store.clone(),
            token: Some(token),
        }))
    }

    /// Failures are only logged; an unreleased lock still expires with its TTL.
    pub async fn release(mut self) {
        if let Some(token) = &self.token {
            if let Err(err) = self.store.unlock(token).await {
                warn!(lock = %token.key, error = %err, "failed to release lock");
            }
        }
        self.token = None;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lock = %token.key, "no runtime left to release abandoned lock");
            return;
        };
        let store = self.store.clone();
        runtime.spawn(async move {
            if let Err(err) = store.unlock(&token).await {
                warn!(lock = %token.key, error = %err, "failed to release abandoned lock");
            }
        });
    }
}

/// Single-process store used by tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryCoordinationStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, (String, Instant)>) -> T) -> T {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        f(&mut entries)
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<String>, PipelineError> {
        Ok(self.with_entries(|entries| entries.get(key).map(|(value, _)| value.clone())))
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), PipelineError> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        });
        Ok(())
    }

    async fn forget(&self, key: &str) -> Result<(), PipelineError> {
        self.with_entries(|entries| entries.remove(key));
        Ok(())
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, PipelineError> {
        let key = lock_key(key);
        Ok(self.with_entries(|entries| {
            if entries.contains_key(&key) {
                return None;
            }
            let owner = Uuid::new_v4();
            entries.insert(key.clone(), (owner.to_string(), Instant::now() + ttl));
            Some(LockToken { key, owner })
        }))
    }

    async fn unlock(&self, token: &LockToken) -> Result<(), PipelineError> {
        let owner = token.owner.to_string();
        self.with_entries(|entries| {
            if entries.get(&token.key).is_some_and(|(value, _)| *value == owner) {
                entries.remove(&token.key);
            }
        });
        Ok(())
    }
}

/// Store backed by the `coordination_entries` table, shared by every worker process.
#[derive(Debug, Clone)]
pub struct PgCoordinationStore {
    pool: PgPool,
}

impl PgCoordinationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CoordinationStore for PgCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<String>, PipelineError> {
        let row = sqlx::query(
            r#"
            SELECT value
              FROM coordination_entries
             WHERE key = $1
               AND expires_at > NOW()
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| row.try_get("value")).transpose()?)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), PipelineError> {
        sqlx::query(
            r#"
            INSERT INTO coordination_entries (key, value, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
               SET value = EXCLUDED.value,
                   expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn forget(&self, key: &str) -> Result<(), PipelineError> {
        sqlx::query("DELETE FROM coordination_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, PipelineError> {
        let key = lock_key(key);
        let owner = Uuid::new_v4();
        let acquired = sqlx::query(
            r#"
            INSERT INTO coordination_entries (key, value, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
               SET value = EXCLUDED.value,
                   expires_at = EXCLUDED.expires_at
             WHERE coordination_entries.expires_at <= NOW()
            RETURNING key
            "#,
        )
        .bind(&key)
        .bind(owner.to_string())
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(acquired.map(|_| LockToken { key, owner }))
    }

    async fn unlock(&self, token: &LockToken) -> Result<(), PipelineError> {
        sqlx::query("DELETE FROM coordination_entries WHERE key = $1 AND value = $2")
            .bind(&token.key)
            .bind(token.owner.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_expire_after_ttl() {
        let store = MemoryCoordinationStore::new();
        store
            .put("k", "v", Duration::from_millis(20))
            .await
            .expect("put");
        assert_eq!(store.get("k").await.expect("get").as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released_or_expired() {
        let store = MemoryCoordinationStore::new();
        let token = store
            .try_lock("staging:a", Duration::from_secs(60))
            .await
            .expect("lock")
            .expect("acquired");
        assert!(store
            .try_lock("staging:a", Duration::from_secs(60))
            .await
            .expect("lock")
            .is_none());

        store.unlock(&token).await.expect("unlock");
        let short = store
            .try_lock("staging:a", Duration::from_millis(10))
            .await
            .expect("lock");
        assert!(short.is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store
            .try_lock("staging:a", Duration::from_secs(60))
            .await
            .expect("lock")
            .is_some());
    }

    #[tokio::test]
    async fn stale_token_cannot_release_a_newer_lock() {
        let store = MemoryCoordinationStore::new();
        let stale = store
            .try_lock("zip", Duration::from_millis(10))
            .await
            .expect("lock")
            .expect("acquired");
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _current = store
            .try_lock("zip", Duration::from_secs(60))
            .await
            .expect("lock")
            .expect("acquired");

        store.unlock(&stale).await.expect("unlock");
        assert!(store
            .try_lock("zip", Duration::from_secs(60))
            .await
            .expect("lock")
            .is_none());
    }

    #[tokio::test]
    async fn abandoned_lock_guard_releases_its_lock() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordinationStore::new());
        let held = tokio::time::timeout(Duration::from_millis(20), async {
            let _guard = LockGuard::acquire(&store, "staging:slow", Duration::from_secs(600))
                .await
                .expect("lock")
                .expect("acquired");
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;
        assert!(held.is_err());

        let mut reacquired = None;
        for _ in 0..100 {
            reacquired = LockGuard::acquire(&store, "staging:slow", Duration::from_secs(600))
                .await
                .expect("lock");
            if reacquired.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let guard = reacquired.expect("lock released after the job was dropped");
        guard.release().await;
        assert!(store
            .try_lock("staging:slow", Duration::from_secs(1))
            .await
            .expect("lock")
            .is_some());
    }

    #[tokio::test]
    async fn chunk_batch_state_round_trips_through_store() {
        let store = MemoryCoordinationStore::new();
        assert_eq!(read_chunk_batch_state(&store, "registry").await.expect("read"), None);

        write_chunk_batch_state(&store, "registry", ChunkBatchState::InFlight)
            .await
            .expect("write");
        assert_eq!(
            read_chunk_batch_state(&store, "registry").await.expect("read"),
            Some(ChunkBatchState::InFlight)
        );
        assert_eq!(read_chunk_batch_state(&store, "other").await.expect("read"), None);

        clear_chunk_batch_state(&store, "registry").await.expect("clear");
        assert_eq!(read_chunk_batch_state(&store, "registry").await.expect("read"), None);
    }
}
