//! Source store adapter.
//!
//! The drain engine only needs a handful of list operations from the queueing
//! store. They are expressed as the [`SourceStore`] trait so the engine can be
//! driven against Redis in production and against fakes in tests.

use crate::config::RedisConfig;
use crate::error::StoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, instrument};

/// Store-side type of a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyType {
    List,
    /// Any other type, carrying the store's type name
    Other(String),
    Absent,
}

impl KeyType {
    /// Map a Redis `TYPE` reply onto a key type
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "list" => KeyType::List,
            "none" => KeyType::Absent,
            other => KeyType::Other(other.to_string()),
        }
    }
}

/// List operations the drain engine consumes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Enumerate keys matching `pattern`. May contain duplicates.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Store-side type of `key`
    async fn key_type(&self, key: &str) -> Result<KeyType, StoreError>;

    /// Elements `start..=stop` counted from the head, without removing them
    async fn range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Keep only elements `start..=stop`; negative indexes count from the tail
    async fn trim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError>;

    /// List length, `None` when the key does not exist
    async fn size(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Remove the key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Connectivity check used by readiness probes
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Redis-backed source store.
///
/// Holds `pool_size` multiplexed connections, each of which reconnects on
/// its own, and hands them out round-robin.
pub struct RedisSourceStore {
    connections: Vec<ConnectionManager>,
    next: AtomicUsize,
    scan_count: usize,
}

impl RedisSourceStore {
    /// Connect to Redis and open the connection set
    pub async fn new(config: &RedisConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str())?;

        let mut connections = Vec::with_capacity(config.pool_size.max(1));
        for _ in 0..config.pool_size.max(1) {
            connections.push(ConnectionManager::new(client.clone()).await?);
        }

        info!(
            connections = connections.len(),
            scan_count = config.scan_count,
            "Connected to Redis"
        );

        Ok(Self {
            connections,
            next: AtomicUsize::new(0),
            scan_count: config.scan_count.max(1),
        })
    }

    fn connection(&self) -> ConnectionManager {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        self.connections[index].clone()
    }
}

#[async_trait]
impl SourceStore for RedisSourceStore {
    #[instrument(skip(self))]
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut con = self.connection();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next_cursor, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(self.scan_count)
                .query_async(&mut con)
                .await?;

            keys.extend(page);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }

        debug!(count = keys.len(), "Enumerated keys");
        Ok(keys)
    }

    async fn key_type(&self, key: &str) -> Result<KeyType, StoreError> {
        let mut con = self.connection();
        let name: String = redis::cmd("TYPE").arg(key).query_async(&mut con).await?;
        Ok(KeyType::from_type_name(&name))
    }

    async fn range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut con = self.connection();
        let items: Vec<Vec<u8>> = redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut con)
            .await?;
        Ok(items)
    }

    async fn trim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        let mut con = self.connection();
        let _: () = redis::cmd("LTRIM")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn size(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut con = self.connection();
        let (exists, len): (bool, u64) = redis::pipe()
            .atomic()
            .cmd("EXISTS")
            .arg(key)
            .cmd("LLEN")
            .arg(key)
            .query_async(&mut con)
            .await?;
        Ok(exists.then_some(len))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut con = self.connection();
        let removed: u64 = redis::cmd("DEL").arg(key).query_async(&mut con).await?;
        debug!(key = %key, removed, "Deleted key");
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut con = self.connection();
        let reply: String = redis::cmd("PING").query_async(&mut con).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("unexpected PING reply: {}", reply)))
        }
    }
}
