use async_trait::async_trait;
use dashmap::{mapref::one::RefMut, DashMap};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{
    errors::Result,
    store::{KeyValueVersion, MetadataStore},
    watch::{WatchEvent, WatchStream},
    MetadataError,
};

const WATCH_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    version: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// In-memory `MetadataStore`, enough for a single control-plane process and for tests.
///
/// Keys are grouped by their first three path segments (`/cluster/register`), one
/// ordered map per group. TTL keys are removed by a timer task, and reads ignore
/// entries whose deadline has passed even if the timer has not fired yet.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<DashMap<String, BTreeMap<String, Entry>>>,
    watchers: Arc<DashMap<String, broadcast::Sender<WatchEvent>>>,
    next_version: Arc<AtomicI64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Arc::new(DashMap::new()),
            watchers: Arc::new(DashMap::new()),
            next_version: Arc::new(AtomicI64::new(1)),
        }
    }

    fn split_path(path: &str) -> Result<(String, String)> {
        let parts: Vec<&str> = path.split('/').collect();
        // empty, namespace, category
        if parts.len() < 3 {
            return Err(MetadataError::InvalidArguments(format!(
                "Path must have at least 3 segments: {}",
                path
            )));
        }
        Ok((parts[..3].join("/"), parts[3..].join("/")))
    }

    fn split_key(path: &str) -> Result<(String, String)> {
        let (group, key) = Self::split_path(path)?;
        if key.is_empty() {
            return Err(MetadataError::InvalidArguments(format!(
                "Path must have a key component: {}",
                path
            )));
        }
        Ok((group, key))
    }

    fn group(&self, group: String) -> RefMut<'_, String, BTreeMap<String, Entry>> {
        self.inner.entry(group).or_insert_with(BTreeMap::new)
    }

    fn notify_watchers(&self, event: WatchEvent) {
        for watcher in self.watchers.iter() {
            if event.key().starts_with(watcher.key()) {
                // no receivers left is fine, the next watch() call resubscribes
                let _ = watcher.value().send(event.clone());
            }
        }
    }

    fn insert(&self, path: &str, value: Value, ttl: Option<Duration>, only_if_absent: bool) -> Result<()> {
        let (group, key) = Self::split_key(path)?;
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        {
            let mut map = self.group(group);
            if only_if_absent && map.get(&key).map_or(false, Entry::is_live) {
                return Err(MetadataError::KeyExists(path.to_string()));
            }
            map.insert(
                key,
                Entry {
                    value: value.clone(),
                    version,
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                },
            );
        }

        if let Some(ttl) = ttl {
            self.schedule_expiry(path.to_string(), version, ttl);
        }

        self.notify_watchers(WatchEvent::Put {
            key: path.to_string(),
            value,
            version,
        });
        Ok(())
    }

    fn schedule_expiry(&self, path: String, version: i64, ttl: Duration) {
        let store = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            store.expire(&path, version);
        });
    }

    /// Removes `path` only if it still holds the write identified by `version`.
    fn expire(&self, path: &str, version: i64) {
        let Ok((group, key)) = Self::split_key(path) else {
            return;
        };
        let removed = {
            let mut map = self.group(group);
            match map.get(&key) {
                Some(entry) if entry.version == version => map.remove(&key).is_some(),
                _ => false,
            }
        };
        if removed {
            self.notify_watchers(WatchEvent::Delete {
                key: path.to_string(),
            });
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let (group, key) = Self::split_path(path)?;
        Ok(self
            .inner
            .get(&group)
            .and_then(|map| map.get(&key).filter(|e| e.is_live()).map(|e| e.value.clone())))
    }

    async fn get_childrens(&self, path: &str) -> Result<Vec<String>> {
        let (group, parent) = Self::split_path(path.trim_end_matches('/'))?;
        let Some(map) = self.inner.get(&group) else {
            return Ok(Vec::new());
        };
        let prefix = if parent.is_empty() {
            String::new()
        } else {
            format!("{}/", parent)
        };
        Ok(map
            .iter()
            .filter(|(key, entry)| key.starts_with(&prefix) && entry.is_live())
            .map(|(key, _)| format!("{}/{}", group, key))
            .collect())
    }

    async fn put(&self, path: &str, value: Value) -> Result<()> {
        self.insert(path, value, None, false)
    }

    async fn put_with_ttl(&self, path: &str, value: Value, ttl: Duration) -> Result<()> {
        self.insert(path, value, Some(ttl), false)
    }

    async fn put_if_absent(&self, path: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.insert(path, value, ttl, true)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let (group, key) = Self::split_key(path)?;
        let removed = self.group(group).remove(&key).is_some();
        if removed {
            self.notify_watchers(WatchEvent::Delete {
                key: path.to_string(),
            });
        }
        Ok(())
    }

    async fn get_bulk(&self, prefix: &str) -> Result<Vec<KeyValueVersion>> {
        let (group, suffix) = Self::split_path(prefix)?;
        let Some(map) = self.inner.get(&group) else {
            return Ok(Vec::new());
        };
        Ok(map
            .iter()
            .filter(|(key, entry)| key.starts_with(&suffix) && entry.is_live())
            .map(|(key, entry)| KeyValueVersion {
                key: format!("{}/{}", group, key),
                value: entry.value.clone(),
                version: entry.version,
            })
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        let rx = self
            .watchers
            .entry(prefix.to_string())
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0)
            .subscribe();
        Ok(WatchStream::from_broadcast(rx))
    }
}

#[cfg(test)]
#[path = "memory_store_test.rs"]
mod memory_store_test;
