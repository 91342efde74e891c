//! In-process cache client with expiring keys

use super::CacheClient;
use crate::core::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    bytes: Vec<u8>,
    expires: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct Shared {
    entries: DashMap<String, Entry>,
    connected: AtomicBool,
}

/// Cache kept in a concurrent map; clones share the same entries
#[derive(Debug, Clone)]
pub struct MemoryCache {
    name: String,
    inner: Arc<Shared>,
}

impl MemoryCache {
    /// Create an empty cache
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Shared::default()),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if !self.inner.connected.load(Ordering::Acquire) {
            return Err(Error::NotConnected(self.identity()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheClient for MemoryCache {
    fn identity(&self) -> String {
        format!("memory:{}", self.name)
    }

    async fn connect(&self) -> Result<()> {
        self.inner.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.connected.store(false, Ordering::Release);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_connected()?;
        let now = Instant::now();
        Ok(self
            .inner
            .entries
            .get(key)
            .filter(|entry| entry.live(now))
            .map(|entry| entry.bytes.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.ensure_connected()?;
        self.inner.entries.insert(
            key.to_string(),
            Entry {
                bytes: value,
                expires: None,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.ensure_connected()?;
        self.inner.entries.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.ensure_connected()?;
        let now = Instant::now();
        Ok(self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().live(now))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        self.ensure_connected()?;
        let now = Instant::now();
        let mut slot = self.inner.entries.entry(key.to_string()).or_insert_with(|| Entry {
            bytes: Vec::new(),
            expires: Some(now),
        });
        if slot.live(now) {
            return Ok(false);
        }
        *slot = Entry {
            bytes: value,
            expires: Some(now + ttl),
        };
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_respects_expiry() {
        let cache = MemoryCache::new("c");
        cache.connect().await.unwrap();
        assert!(cache.set_nx("l", b"a".to_vec(), Duration::from_millis(20)).await.unwrap());
        assert!(!cache.set_nx("l", b"b".to_vec(), Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("l").await.unwrap(), None);
        assert!(cache.set_nx("l", b"c".to_vec(), Duration::from_millis(20)).await.unwrap());
    }

    #[tokio::test]
    async fn test_prefix_listing() {
        let cache = MemoryCache::new("c");
        assert!(cache.keys("").await.is_err());
        cache.connect().await.unwrap();
        cache.set("ns:d:a", vec![1]).await.unwrap();
        cache.set("ns:d:b", vec![2]).await.unwrap();
        cache.set("other", vec![3]).await.unwrap();
        let mut keys = cache.keys("ns:d:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["ns:d:a", "ns:d:b"]);
    }
}
