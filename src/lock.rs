//! Distributed per-message locks that keep a queue message on a single worker.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Value stored under a message id while a worker owns it.
const PROCESSING_MARKER: &str = "processed";

/// A shared key-value cache with atomic set-if-absent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Sets `key` only if it is absent, expiring after `ttl`.
    ///
    /// Returns true when this call created the key.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Deletes `key` whether or not it exists.
    async fn release(&self, key: &str) -> Result<()>;
}

/// Redis [`LockStore`] using `SET key value NX EX ttl`.
///
/// The connection manager is created on first use and shared by all callers.
pub struct RedisLockStore {
    client: Client,
    conn: OnceCell<ConnectionManager>,
}

impl RedisLockStore {
    /// Creates a lock store for `redis_url` without connecting.
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("Failed to create Redis client")?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let conn = ConnectionManager::new(self.client.clone())
                    .await
                    .context("Failed to connect to Redis")?;
                info!("Connected to Redis");
                Ok::<_, anyhow::Error>(conn)
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(PROCESSING_MARKER)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Failed to acquire lock {}", key))?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key)
            .await
            .with_context(|| format!("Failed to release lock {}", key))?;
        Ok(())
    }
}

/// In-process [`LockStore`] with the same expiry semantics as Redis.
///
/// Locks are not shared across processes.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    locks: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `key` is currently held.
    pub fn is_held(&self, key: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.get(key).is_some_and(|expires_at| *expires_at > Utc::now())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        if locks.get(key).is_some_and(|expires_at| *expires_at > now) {
            return Ok(false);
        }
        let ttl = chrono::Duration::from_std(ttl).context("Lock TTL out of range")?;
        locks.insert(key.to_string(), now + ttl);
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// Admits each queue message to at most one concurrent worker.
///
/// A successful run leaves its lock to expire, which suppresses duplicate deliveries
/// arriving before the queue has applied the delete. A failed run releases the lock
/// so the redelivery after the visibility timeout is admitted straight away.
#[derive(Clone)]
pub struct DedupGate {
    store: std::sync::Arc<dyn LockStore>,
    ttl: Duration,
}

impl DedupGate {
    pub fn new(store: std::sync::Arc<dyn LockStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Claims `message_id`. False means another worker (or an earlier attempt) owns it.
    pub async fn admit(&self, message_id: &str) -> Result<bool> {
        let admitted = self.store.try_acquire(message_id, self.ttl).await?;
        debug!(message_id = %message_id, admitted, "Dedup admission");
        Ok(admitted)
    }

    /// Drops the claim on `message_id` after a failed run.
    pub async fn reject(&self, message_id: &str) -> Result<()> {
        self.store.release(message_id).await
    }
}
