//! Cross-process rate limiter
//!
//! Per-service sliding-window throttle whose state lives in a shared
//! key-value store, so the ceiling holds across every worker process, not
//! just inside one. The store is injected (`SharedKvStore`), never a module
//! singleton. The read-modify-write is deliberately lock-free across
//! processes: concurrent callers may under-throttle slightly, which is
//! acceptable; they can never deadlock, because no lock outlives a single
//! store call and all sleeping happens outside the store.

use crate::config::{PipelineConfig, ServiceLimit};
use crate::types::DataSourceKind;
use crate::BoxError;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared key-value store backing the limiter. Any networked cache with TTL
/// semantics satisfies this; the default deployment points it at the same
/// SQLite file the lineage store uses.
#[async_trait]
pub trait SharedKvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, BoxError>;
    async fn put(&self, key: &str, value: &str, ttl_secs: i64) -> Result<(), BoxError>;
}

/// SQLite-backed KV store (cross-process via WAL).
pub struct SqliteKvStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKvStore {
    pub fn open(db_path: &str) -> Result<Self, BoxError> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rate_limiter_state (
                key         TEXT PRIMARY KEY,
                value       TEXT NOT NULL,
                expires_at  INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl SharedKvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, BoxError> {
        let conn = self.lock();
        let now = chrono::Utc::now().timestamp();
        let mut stmt =
            conn.prepare("SELECT value FROM rate_limiter_state WHERE key = ?1 AND expires_at > ?2")?;
        let mut rows = stmt.query_map(params![key, now], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(value) => Ok(Some(value?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl_secs: i64) -> Result<(), BoxError> {
        let conn = self.lock();
        let expires_at = chrono::Utc::now().timestamp() + ttl_secs;
        conn.execute(
            "INSERT INTO rate_limiter_state (key, value, expires_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at",
            params![key, value, expires_at],
        )?;
        Ok(())
    }
}

/// In-memory KV store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryKvStore {
    inner: Mutex<HashMap<String, (String, i64)>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedKvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, BoxError> {
        let now = chrono::Utc::now().timestamp();
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        Ok(inner
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl_secs: i64) -> Result<(), BoxError> {
        let expires_at = chrono::Utc::now().timestamp() + ttl_secs;
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }
}

/// Per-service window state, serialized into the KV store.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WindowState {
    last_call_ms: i64,
    calls_in_window: u32,
    window_reset_ms: i64,
}

/// Sliding-window rate limiter shared by all pipeline workers.
pub struct RateLimiter {
    kv: Arc<dyn SharedKvStore>,
    limits: HashMap<DataSourceKind, ServiceLimit>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn SharedKvStore>, config: &PipelineConfig) -> Self {
        let mut limits = HashMap::new();
        limits.insert(DataSourceKind::Warehouse, config.warehouse_limit);
        limits.insert(DataSourceKind::Ledger, config.ledger_limit);
        limits.insert(DataSourceKind::Index, config.index_limit);
        Self { kv, limits }
    }

    pub fn with_limits(
        kv: Arc<dyn SharedKvStore>,
        limits: HashMap<DataSourceKind, ServiceLimit>,
    ) -> Self {
        Self { kv, limits }
    }

    fn key(service: DataSourceKind) -> String {
        format!("ratelimit:{}", service.as_str())
    }

    async fn load_state(&self, key: &str) -> Result<Option<WindowState>, BoxError> {
        match self.kv.get(key).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    /// Block until a call to `service` is allowed, then record the call.
    /// Returns how long the caller was made to wait.
    pub async fn wait_if_needed(&self, service: DataSourceKind) -> Result<Duration, BoxError> {
        let limit = match self.limits.get(&service) {
            Some(limit) => *limit,
            None => return Ok(Duration::ZERO),
        };
        let key = Self::key(service);
        let window_ms = (limit.window_secs * 1_000) as i64;
        // Keyed state outlives the window slightly so a freshly reset window
        // still sees the previous last_call_time.
        let ttl_secs = limit.window_secs as i64 + 60;

        let mut waited = Duration::ZERO;
        let now_ms = chrono::Utc::now().timestamp_millis();

        let mut state = match self.load_state(&key).await? {
            Some(state) => state,
            None => WindowState {
                last_call_ms: 0,
                calls_in_window: 0,
                window_reset_ms: now_ms + window_ms,
            },
        };

        let mut now_ms = now_ms;
        if now_ms >= state.window_reset_ms {
            state.calls_in_window = 0;
            state.window_reset_ms = now_ms + window_ms;
        }

        if state.calls_in_window >= limit.burst_limit {
            let sleep_ms = (state.window_reset_ms - now_ms).max(0) as u64;
            log::debug!(
                "🛑 {} window exhausted ({} calls), sleeping {}ms",
                service.as_str(),
                state.calls_in_window,
                sleep_ms
            );
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            waited += Duration::from_millis(sleep_ms);

            now_ms = chrono::Utc::now().timestamp_millis();
            state.calls_in_window = 0;
            state.window_reset_ms = now_ms + window_ms;
        } else if state.last_call_ms > 0 {
            let since_last = now_ms - state.last_call_ms;
            let min_interval = limit.min_interval_ms as i64;
            if since_last < min_interval {
                let sleep_ms = (min_interval - since_last) as u64;
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                waited += Duration::from_millis(sleep_ms);
                now_ms = chrono::Utc::now().timestamp_millis();
            }
        }

        state.last_call_ms = now_ms;
        state.calls_in_window += 1;
        self.kv
            .put(&key, &serde_json::to_string(&state)?, ttl_secs)
            .await?;

        Ok(waited)
    }
}
