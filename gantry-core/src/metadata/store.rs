use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::errors::Result;
use super::watch::WatchStream;

/// A key-value-version tuple returned by bulk queries.
#[derive(Debug, Clone)]
pub struct KeyValueVersion {
    pub key: String,
    pub value: Value,
    pub version: i64,
}

#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Full paths of the direct and nested children of `path`.
    async fn get_childrens(&self, path: &str) -> Result<Vec<String>>;

    async fn put(&self, key: &str, value: Value) -> Result<()>;

    /// Put a key with a time-to-live. The key is deleted after `ttl` unless it is
    /// written again first.
    async fn put_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;

    /// Atomically create `key`. Fails with `MetadataError::KeyExists` when a live
    /// value is already stored there. An optional `ttl` bounds how long the key lives.
    async fn put_if_absent(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Retrieve all key-value pairs under a given prefix.
    async fn get_bulk(&self, prefix: &str) -> Result<Vec<KeyValueVersion>>;

    /// Stream of put and delete events for every key starting with `prefix`.
    async fn watch(&self, prefix: &str) -> Result<WatchStream>;
}
