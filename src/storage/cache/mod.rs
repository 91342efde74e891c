//! Whole-value cache adapter
//!
//! Each top-level segment is one cache entry `{namespace}:d:{segment}` holding
//! the encoded value. Nested operations read, decode, mutate, encode and
//! write back the whole entry. Every queued mutation, including the read half
//! of `inc`, `upd`, `add` and `pop`, runs while holding the short-lived
//! `{namespace}:lock` advisory key, so processes sharing the cache serialize
//! their read-modify-write cycles.

pub mod memory;

pub use memory::MemoryCache;

use super::codec::{JsonCodec, ValueCodec};
use super::ids::IdGenerator;
use super::registry::AdapterRegistry;
use super::{root_map, Adapter};
use crate::core::error::{Error, Result};
use crate::path::tree::{delete_in, get_in, set_in};
use crate::path::Path;
use crate::queue::{LockOptions, OpQueue};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Minimal contract of a key/value cache
#[async_trait]
pub trait CacheClient: Send + Sync + fmt::Debug {
    /// Identity of the physical cache, e.g. `redis://host:6379/0`
    fn identity(&self) -> String;

    /// Open the connection
    async fn connect(&self) -> Result<()>;

    /// Close the connection
    async fn disconnect(&self) -> Result<()>;

    /// Bytes stored under `key`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store bytes under `key`
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Delete `key`
    async fn del(&self, key: &str) -> Result<()>;

    /// Every key starting with `prefix`
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Store only if `key` is absent, expiring after `ttl`; true when stored
    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool>;
}

/// Options for [`CacheAdapter`]
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Key namespace shared by every entry of this tree
    pub namespace: String,
    /// Encoding of the stored entries
    pub codec: Arc<dyn ValueCodec>,
    /// Identifier generator for `add`
    pub ids: IdGenerator,
    /// Advisory key retries; `stale` is the key's expiry
    pub lock: LockOptions,
    /// Registry the shared queue is looked up in
    pub registry: Arc<AdapterRegistry>,
}

impl CacheOptions {
    /// Defaults for `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            codec: Arc::new(JsonCodec::default()),
            ids: IdGenerator::default(),
            lock: LockOptions::default(),
            registry: AdapterRegistry::global(),
        }
    }
}

/// Adapter storing one encoded blob per top-level segment
#[derive(Debug)]
pub struct CacheAdapter {
    name: String,
    namespace: String,
    client: Arc<dyn CacheClient>,
    codec: Arc<dyn ValueCodec>,
    ids: IdGenerator,
    lock: LockOptions,
    queue: Arc<OpQueue>,
    held: Mutex<Option<Vec<u8>>>,
}

impl CacheAdapter {
    /// Wrap a cache client
    pub fn new(client: Arc<dyn CacheClient>, options: CacheOptions) -> Result<Self> {
        let name = format!("cache:{}/{}", client.identity(), options.namespace);
        let queue = options.registry.shared(&name, OpQueue::new)?;
        Ok(Self {
            name,
            namespace: options.namespace,
            client,
            codec: options.codec,
            ids: options.ids,
            lock: options.lock,
            queue,
            held: Mutex::new(None),
        })
    }

    fn data_prefix(&self) -> String {
        format!("{}:d:", self.namespace)
    }

    fn data_key(&self, segment: &str) -> String {
        format!("{}{}", self.data_prefix(), segment)
    }

    fn lock_key(&self) -> String {
        format!("{}:lock", self.namespace)
    }

    async fn load(&self, segment: &str) -> Result<Option<Value>> {
        match self.client.get(&self.data_key(segment)).await? {
            Some(bytes) => self.codec.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn store(&self, segment: &str, value: &Value) -> Result<()> {
        let bytes = self.codec.encode(value)?;
        self.client.set(&self.data_key(segment), bytes).await
    }

    async fn segments(&self) -> Result<Vec<String>> {
        let prefix = self.data_prefix();
        Ok(self
            .client
            .keys(&prefix)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }
}

#[async_trait]
impl Adapter for CacheAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue(&self) -> &OpQueue {
        &self.queue
    }

    fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    async fn connect(&self) -> Result<()> {
        self.client.connect().await?;
        info!("Connected {} ({} codec)", self.name, self.codec.name());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await
    }

    async fn read(&self, path: &Path) -> Result<Option<Value>> {
        let Some((top, rest)) = path.split_first() else {
            let mut root = Map::new();
            for segment in self.segments().await? {
                if let Some(value) = self.load(&segment).await? {
                    root.insert(segment, value);
                }
            }
            return Ok(Some(Value::Object(root)));
        };
        Ok(self
            .load(top)
            .await?
            .and_then(|value| get_in(&value, rest.segments()).cloned()))
    }

    async fn write(&self, path: &Path, value: Value) -> Result<()> {
        let Some((top, rest)) = path.split_first() else {
            let map = root_map(&self.name, value)?;
            for segment in self.segments().await? {
                self.client.del(&self.data_key(&segment)).await?;
            }
            for (segment, value) in map {
                self.store(&segment, &value).await?;
            }
            return Ok(());
        };
        if rest.is_root() {
            return self.store(top, &value).await;
        }
        let mut current = self.load(top).await?.unwrap_or_else(|| Value::Object(Map::new()));
        set_in(&mut current, rest.segments(), value)?;
        self.store(top, &current).await
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let Some((top, rest)) = path.split_first() else {
            for segment in self.segments().await? {
                self.client.del(&self.data_key(&segment)).await?;
            }
            return Ok(());
        };
        if rest.is_root() {
            return self.client.del(&self.data_key(top)).await;
        }
        let Some(mut current) = self.load(top).await? else {
            return Ok(());
        };
        if delete_in(&mut current, rest.segments()).is_some() {
            debug!("Rewriting {} after nested delete of {}", top, path);
            self.store(top, &current).await?;
        }
        Ok(())
    }

    async fn begin_exclusive(&self) -> Result<()> {
        let key = self.lock_key();
        let token = rand::rng().random::<u64>().to_string().into_bytes();
        let mut attempt = 0;
        while !self.client.set_nx(&key, token.clone(), self.lock.stale).await? {
            if attempt >= self.lock.retries {
                return Err(Error::Lock(format!("{} is held elsewhere", key)));
            }
            let delay = self
                .lock
                .min_backoff
                .saturating_mul(1u32 << attempt.min(16))
                .min(self.lock.max_backoff);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
        *self.held.lock() = Some(token);
        Ok(())
    }

    async fn end_exclusive(&self) -> Result<()> {
        let key = self.lock_key();
        let Some(token) = self.held.lock().take() else {
            return Ok(());
        };
        // An expired key may have been taken over; leave it to its new owner
        if self.client.get(&key).await? != Some(token) {
            warn!("Advisory key {} expired before release", key);
            return Ok(());
        }
        self.client.del(&key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;
    use crate::storage::codec::MessagePackCodec;
    use crate::storage::contract;
    use serde_json::{json, Number};

    fn options() -> CacheOptions {
        let mut options = CacheOptions::new("mt");
        options.registry = Arc::new(AdapterRegistry::new());
        options
    }

    #[tokio::test]
    async fn test_adapter_contract() {
        contract::run_all(|| {
            Arc::new(CacheAdapter::new(Arc::new(MemoryCache::new("c")), options()).unwrap()) as Arc<dyn Adapter>
        })
        .await;
    }

    #[tokio::test]
    async fn test_500_concurrent_increments() {
        let db = CacheAdapter::new(Arc::new(MemoryCache::new("c")), options()).unwrap();
        contract::concurrent_increments(Arc::new(db), 500).await;
    }

    #[tokio::test]
    async fn test_one_entry_per_top_level_segment() {
        let cache = Arc::new(MemoryCache::new("c"));
        let mut opts = options();
        opts.codec = Arc::new(MessagePackCodec);
        let db = CacheAdapter::new(cache.clone(), opts).unwrap();
        db.connect().await.unwrap();
        db.set(&path!["users", "alice", "age"], Some(json!(30))).await.unwrap();
        db.set(&path!["users", "bob"], Some(json!({"age": 41}))).await.unwrap();
        db.set(&path!["config"], Some(json!("x"))).await.unwrap();

        let mut keys = cache.keys("").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["mt:d:config", "mt:d:users"]);
        let blob = cache.get("mt:d:users").await.unwrap().unwrap();
        assert_eq!(
            MessagePackCodec.decode(&blob).unwrap(),
            json!({"alice": {"age": 30}, "bob": {"age": 41}})
        );
    }

    fn quick_lock(retries: u32) -> LockOptions {
        LockOptions {
            retries,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            stale: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_held_advisory_key_blocks_mutations() {
        let cache = Arc::new(MemoryCache::new("c"));
        let mut opts = options();
        opts.lock = quick_lock(3);
        let db = CacheAdapter::new(cache.clone(), opts).unwrap();
        db.connect().await.unwrap();

        // Another process holds the key
        assert!(cache.set_nx("mt:lock", b"other".to_vec(), Duration::from_secs(30)).await.unwrap());
        let blocked = db.set(&path!["users", "x"], Some(json!(1))).await;
        assert!(matches!(blocked, Err(Error::Lock(_))));
        let blocked = db.inc(&path!["n"], &Number::from(1)).await;
        assert!(matches!(blocked, Err(Error::Lock(_))));
        assert_eq!(cache.get("mt:lock").await.unwrap(), Some(b"other".to_vec()));

        cache.del("mt:lock").await.unwrap();
        db.set(&path!["users", "x"], Some(json!(1))).await.unwrap();
        assert_eq!(cache.get("mt:lock").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_instances_sharing_a_cache_do_not_lose_updates() {
        let cache = Arc::new(MemoryCache::new("c"));
        let instance = || {
            let mut opts = options();
            opts.lock = quick_lock(100_000);
            Arc::new(CacheAdapter::new(cache.clone(), opts).unwrap())
        };
        let (first, second) = (instance(), instance());
        first.connect().await.unwrap();

        let p = path!["shared", "counter"];
        let mut handles = Vec::new();
        for i in 0..200 {
            let db = if i % 2 == 0 { first.clone() } else { second.clone() };
            let p = p.clone();
            handles.push(tokio::spawn(async move { db.inc(&p, &Number::from(1)).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(first.get(&p).await.unwrap(), Some(json!(200)));
        assert_eq!(second.get(&p).await.unwrap(), Some(json!(200)));
    }
}
