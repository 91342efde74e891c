//! Fault injection wrapper
//!
//! [`FlakyAdapter`] forwards to another adapter while adding configurable
//! latency and an on/off failure switch. It shares the wrapped adapter's
//! queue, so queued operations still serialize against direct users of the
//! inner adapter. Used to exercise fallback reads and deadlines.

use super::ids::IdGenerator;
use super::Adapter;
use crate::core::error::{Error, Result};
use crate::path::Path;
use crate::queue::OpQueue;
use async_trait::async_trait;
use serde_json::{Number, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Adapter wrapper with injectable latency and failures
pub struct FlakyAdapter {
    name: String,
    inner: Arc<dyn Adapter>,
    latency_ms: AtomicU64,
    failing: AtomicBool,
}

impl FlakyAdapter {
    /// Wrap `inner` with no latency and no failures
    pub fn new(inner: Arc<dyn Adapter>) -> Self {
        Self {
            name: format!("flaky:{}", inner.name()),
            inner,
            latency_ms: AtomicU64::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Delay every primitive by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis().min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }

    /// Make every call fail (`true`) or pass through (`false`)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Wrapped adapter
    pub fn inner(&self) -> &Arc<dyn Adapter> {
        &self.inner
    }

    async fn gate(&self, operation: &str) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.failing.load(Ordering::Relaxed) {
            return Err(Error::backend(&self.name, format!("injected failure in {}", operation)));
        }
        Ok(())
    }
}

impl std::fmt::Debug for FlakyAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlakyAdapter")
            .field("name", &self.name)
            .field("latency_ms", &self.latency_ms.load(Ordering::Relaxed))
            .field("failing", &self.failing.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl Adapter for FlakyAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue(&self) -> &OpQueue {
        self.inner.queue()
    }

    fn ids(&self) -> &IdGenerator {
        self.inner.ids()
    }

    async fn connect(&self) -> Result<()> {
        self.gate("connect").await?;
        self.inner.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }

    async fn read(&self, path: &Path) -> Result<Option<Value>> {
        self.gate("read").await?;
        self.inner.read(path).await
    }

    async fn write(&self, path: &Path, value: Value) -> Result<()> {
        self.gate("write").await?;
        self.inner.write(path, value).await
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        self.gate("remove").await?;
        self.inner.remove(path).await
    }

    async fn increment(&self, path: &Path, delta: &Number) -> Result<bool> {
        self.gate("increment").await?;
        self.inner.increment(path, delta).await
    }

    async fn begin_exclusive(&self) -> Result<()> {
        self.inner.begin_exclusive().await
    }

    async fn end_exclusive(&self) -> Result<()> {
        self.inner.end_exclusive().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;
    use crate::storage::table::{MemoryTable, TableAdapter, TableOptions};
    use crate::storage::AdapterRegistry;
    use serde_json::json;
    use std::time::Instant;

    fn wrapped() -> FlakyAdapter {
        let options = TableOptions {
            registry: Arc::new(AdapterRegistry::new()),
            ..TableOptions::default()
        };
        let inner = TableAdapter::new(Arc::new(MemoryTable::new("t")), options).unwrap();
        FlakyAdapter::new(Arc::new(inner))
    }

    #[tokio::test]
    async fn test_failure_switch() {
        let db = wrapped();
        db.connect().await.unwrap();
        db.set(&path!["k"], Some(json!("v"))).await.unwrap();
        db.set_failing(true);
        assert!(matches!(db.get(&path!["k"]).await, Err(Error::Backend { .. })));
        assert!(db.set(&path!["k"], Some(json!(1))).await.is_err());
        db.set_failing(false);
        assert_eq!(db.get(&path!["k"]).await.unwrap(), Some(json!("v")));
        assert!(db.queue().is_idle());
    }

    #[tokio::test]
    async fn test_latency_is_applied() {
        let db = wrapped();
        db.connect().await.unwrap();
        db.set_latency(Duration::from_millis(30));
        let started = Instant::now();
        db.get(&path!["k"]).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
