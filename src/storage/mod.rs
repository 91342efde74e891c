//! Storage layer for Massive Tree
//!
//! Every storage model implements the same [`Adapter`] contract. An adapter
//! supplies a handful of primitives (`read`, `write`, `remove`, optionally a
//! native `increment`) plus its [`OpQueue`] and identifier generator; the
//! path-addressed surface (`get`, `set`, `inc`, `upd`, `add`, `pop`, ...) is
//! provided on top of those primitives and runs every mutation through the
//! queue.
//!
//! Concrete adapters:
//! - [`tree::TreeAdapter`]: whole tree in memory, persisted to one file
//! - [`table::TableAdapter`]: one row per leaf in a flat key/value table
//! - [`document::DocumentAdapter`]: one document per top-level segment
//! - [`cache::CacheAdapter`]: one encoded blob per top-level segment
//! - [`json::JsonAdapter`]: one native JSON document per top-level segment

pub mod cache;
pub mod codec;
pub mod document;
pub mod flaky;
pub mod ids;
pub mod json;
pub mod registry;
pub mod table;
pub mod tree;

pub use codec::{JsonCodec, MessagePackCodec, ValueCodec};
pub use ids::{IdConfig, IdGenerator};
pub use registry::AdapterRegistry;

use crate::core::error::{Error, Result};
use crate::path::tree::{add_numbers, entries_of, keys_of, len_of, type_name, values_of};
use crate::path::Path;
use crate::queue::OpQueue;
use async_trait::async_trait;
use serde_json::{Map, Number, Value};
use std::future::Future;

/// Update callback for [`Adapter::upd`].
///
/// Called exactly once inside the queued critical section with the current
/// value (`None` when absent). Returning `None` deletes the path.
pub type UpdateFn = Box<dyn FnOnce(Option<Value>) -> Option<Value> + Send>;

/// Attempts at drawing an unused identifier in [`Adapter::add`]
pub const MAX_ID_ATTEMPTS: usize = 8;

/// Common contract implemented by every storage model
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Identity used in logs and errors, e.g. `tree:/var/db.json`
    fn name(&self) -> &str;

    /// Queue shared by every adapter addressing the same physical store
    fn queue(&self) -> &OpQueue;

    /// Identifier generator for [`Adapter::add`]
    fn ids(&self) -> &IdGenerator;

    /// Open the underlying client or file
    async fn connect(&self) -> Result<()>;

    /// Release the underlying client
    async fn disconnect(&self) -> Result<()>;

    /// Read the value at `path`; the root always yields a map
    async fn read(&self, path: &Path) -> Result<Option<Value>>;

    /// Store `value` at `path`, replacing whatever was there
    async fn write(&self, path: &Path, value: Value) -> Result<()>;

    /// Remove `path` and everything beneath it
    async fn remove(&self, path: &Path) -> Result<()>;

    /// Native atomic increment. Returns `false` when the backend has no such
    /// operator (or declined), in which case a queued read-modify-write runs.
    async fn increment(&self, _path: &Path, _delta: &Number) -> Result<bool> {
        Ok(false)
    }

    /// Hook run at the start of every queued mutation (cross-process locking)
    async fn begin_exclusive(&self) -> Result<()> {
        Ok(())
    }

    /// Hook run at the end of every queued mutation, whether it failed or not
    async fn end_exclusive(&self) -> Result<()> {
        Ok(())
    }

    /// Value at `path`, or `None`. Never fails for a missing path.
    async fn get(&self, path: &Path) -> Result<Option<Value>> {
        self.read(path).await
    }

    /// True if a value exists at `path`
    async fn has(&self, path: &Path) -> Result<bool> {
        Ok(self.read(path).await?.is_some())
    }

    /// Store a value; `None` deletes instead
    async fn set(&self, path: &Path, value: Option<Value>) -> Result<Path> {
        exclusive(self, async {
            match value {
                Some(value) => self.write(path, value).await?,
                None => self.remove(path).await?,
            }
            Ok(path.clone())
        })
        .await
    }

    /// Delete `path` and every descendant
    async fn del(&self, path: &Path) -> Result<()> {
        exclusive(self, self.remove(path)).await
    }

    /// Add `delta` to the number at `path` (missing counts as zero)
    async fn inc(&self, path: &Path, delta: &Number) -> Result<Path> {
        exclusive(self, async {
            if !self.increment(path, delta).await? {
                let current = self.read(path).await?;
                let next = add_numbers(current.as_ref(), delta, path)?;
                self.write(path, next).await?;
            }
            Ok(path.clone())
        })
        .await
    }

    /// Subtract `delta` from the number at `path`
    async fn dec(&self, path: &Path, delta: &Number) -> Result<Path> {
        self.inc(path, &crate::path::tree::negate(delta)).await
    }

    /// Atomic read-modify-write through `update`
    async fn upd(&self, path: &Path, update: UpdateFn) -> Result<Path> {
        exclusive(self, async {
            let current = self.read(path).await?;
            match update(current) {
                Some(next) => self.write(path, next).await?,
                None => self.remove(path).await?,
            }
            Ok(path.clone())
        })
        .await
    }

    /// Store `value` under a freshly generated child of `parent`
    async fn add(&self, parent: &Path, value: Value) -> Result<Path> {
        exclusive(self, async {
            for _ in 0..MAX_ID_ATTEMPTS {
                let child = parent.child(self.ids().generate());
                if self.read(&child).await?.is_none() {
                    self.write(&child, value).await?;
                    return Ok(child);
                }
                tracing::debug!("Identifier collision at {} in {}, re-rolling", child, self.name());
            }
            Err(Error::internal(format!(
                "No free identifier under {} after {} attempts",
                parent, MAX_ID_ATTEMPTS
            )))
        })
        .await
    }

    /// Remove and return the last element of the list at `path`; `None` for
    /// missing or non-list values
    async fn pop(&self, path: &Path) -> Result<Option<Value>> {
        exclusive(self, take_from_list(self, path, ListEnd::Back)).await
    }

    /// Remove and return the first element of the list at `path`
    async fn shift(&self, path: &Path) -> Result<Option<Value>> {
        exclusive(self, take_from_list(self, path, ListEnd::Front)).await
    }

    /// Keys of the map (or indexes of the list) at `path`
    async fn keys(&self, path: &Path) -> Result<Vec<String>> {
        Ok(self.read(path).await?.map(|v| keys_of(&v)).unwrap_or_default())
    }

    /// Children of the map or list at `path`
    async fn values(&self, path: &Path) -> Result<Vec<Value>> {
        Ok(self.read(path).await?.map(|v| values_of(&v)).unwrap_or_default())
    }

    /// `(key, child)` pairs of the map or list at `path`
    async fn entries(&self, path: &Path) -> Result<Vec<(String, Value)>> {
        Ok(self.read(path).await?.map(|v| entries_of(&v)).unwrap_or_default())
    }

    /// Number of children at `path`
    async fn len(&self, path: &Path) -> Result<usize> {
        Ok(self.read(path).await?.map(|v| len_of(&v)).unwrap_or(0))
    }
}

/// Run `op` inside the adapter's queue, bracketed by its exclusive hooks.
///
/// The end hook runs even when `op` fails; the operation's own error wins.
pub async fn exclusive<A, F, T>(adapter: &A, op: F) -> Result<T>
where
    A: Adapter + ?Sized,
    F: Future<Output = Result<T>>,
{
    adapter
        .queue()
        .enqueue(async {
            adapter.begin_exclusive().await?;
            let outcome = op.await;
            let released = adapter.end_exclusive().await;
            let value = outcome?;
            released?;
            Ok(value)
        })
        .await
}

enum ListEnd {
    Front,
    Back,
}

async fn take_from_list<A>(adapter: &A, path: &Path, end: ListEnd) -> Result<Option<Value>>
where
    A: Adapter + ?Sized,
{
    let Some(Value::Array(mut items)) = adapter.read(path).await? else {
        return Ok(None);
    };
    let taken = match end {
        ListEnd::Back => items.pop(),
        ListEnd::Front if !items.is_empty() => Some(items.remove(0)),
        ListEnd::Front => None,
    };
    if taken.is_some() {
        adapter.write(path, Value::Array(items)).await?;
    }
    Ok(taken)
}

/// Reject root writes of anything but a map
pub(crate) fn root_map(adapter: &str, value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::invalid_input(format!(
            "{}: the root can only hold a map, got {}",
            adapter,
            type_name(&other)
        ))),
    }
}

/// Shared adapter test-suite; every adapter runs it against its own backend.
#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use crate::path;
    use serde_json::json;
    use std::sync::Arc;

    /// Run the whole contract against fresh adapters from `make`
    pub async fn run_all<F>(make: F)
    where
        F: Fn() -> Arc<dyn Adapter>,
    {
        set_then_get(make()).await;
        missing_is_none(make()).await;
        nested_write_keeps_siblings(make()).await;
        delete_removes_descendants(make()).await;
        write_beneath_scalar(make()).await;
        write_inside_nested_list(make()).await;
        reserved_characters(make()).await;
        compound_operations(make()).await;
        concurrent_increments(make(), 100).await;
        root_operations(make()).await;
    }

    async fn set_then_get(db: Arc<dyn Adapter>) {
        db.connect().await.unwrap();
        for (i, value) in [
            json!(1),
            json!("text"),
            json!(null),
            json!(true),
            json!(2.5),
            json!([1, {"a": 2}, [3]]),
            json!({"x": {"y": {"z": 1}}, "w": []}),
        ]
        .into_iter()
        .enumerate()
        {
            let p = path!["values", i];
            assert_eq!(db.set(&p, Some(value.clone())).await.unwrap(), p);
            assert_eq!(db.get(&p).await.unwrap(), Some(value), "{}", db.name());
        }
    }

    async fn missing_is_none(db: Arc<dyn Adapter>) {
        db.connect().await.unwrap();
        assert_eq!(db.get(&path!["nope"]).await.unwrap(), None);
        assert_eq!(db.get(&path!["nope", "deeper"]).await.unwrap(), None);
        db.set(&path!["scalar"], Some(json!(3))).await.unwrap();
        assert_eq!(db.get(&path!["scalar", "below"]).await.unwrap(), None);
        assert!(!db.has(&path!["nope"]).await.unwrap());
        assert!(db.has(&path!["scalar"]).await.unwrap());
    }

    async fn nested_write_keeps_siblings(db: Arc<dyn Adapter>) {
        db.connect().await.unwrap();
        db.set(&path!["x"], Some(json!({"a": 1, "b": 2}))).await.unwrap();
        db.set(&path!["x", "b"], Some(json!(3))).await.unwrap();
        assert_eq!(db.get(&path!["x"]).await.unwrap(), Some(json!({"a": 1, "b": 3})));
        db.set(&path!["x", "c", "d"], Some(json!("deep"))).await.unwrap();
        assert_eq!(
            db.get(&path!["x"]).await.unwrap(),
            Some(json!({"a": 1, "b": 3, "c": {"d": "deep"}}))
        );
        assert_eq!(db.get(&path!["x", "a"]).await.unwrap(), Some(json!(1)));
    }

    async fn delete_removes_descendants(db: Arc<dyn Adapter>) {
        db.connect().await.unwrap();
        db.set(&path!["t", "p"], Some(json!({"q": {"r": 1}, "s": 2}))).await.unwrap();
        db.set(&path!["t", "p", "q", "extra"], Some(json!(5))).await.unwrap();
        db.set(&path!["t", "sibling"], Some(json!("stay"))).await.unwrap();
        db.set(&path!["t", "pp"], Some(json!("prefix-neighbour"))).await.unwrap();

        db.del(&path!["t", "p"]).await.unwrap();
        assert_eq!(db.get(&path!["t", "p"]).await.unwrap(), None);
        assert_eq!(db.get(&path!["t", "p", "q"]).await.unwrap(), None);
        assert_eq!(db.get(&path!["t", "p", "q", "r"]).await.unwrap(), None);
        assert_eq!(db.get(&path!["t", "p", "q", "extra"]).await.unwrap(), None);
        assert_eq!(db.get(&path!["t", "sibling"]).await.unwrap(), Some(json!("stay")));
        assert_eq!(db.get(&path!["t", "pp"]).await.unwrap(), Some(json!("prefix-neighbour")));

        // Deleting inside a value stored as a whole map
        db.set(&path!["m"], Some(json!({"a": 1, "b": 2}))).await.unwrap();
        db.del(&path!["m", "a"]).await.unwrap();
        assert_eq!(db.get(&path!["m"]).await.unwrap(), Some(json!({"b": 2})));
    }

    async fn write_beneath_scalar(db: Arc<dyn Adapter>) {
        db.connect().await.unwrap();
        db.set(&path!["s"], Some(json!(1))).await.unwrap();
        db.set(&path!["s", "child"], Some(json!(2))).await.unwrap();
        assert_eq!(db.get(&path!["s"]).await.unwrap(), Some(json!({"child": 2})));
    }

    async fn write_inside_nested_list(db: Arc<dyn Adapter>) {
        db.connect().await.unwrap();
        db.set(&path!["x"], Some(json!({"l": [1, 2], "a": 1}))).await.unwrap();
        db.set(&path!["x", "l", 0], Some(json!(9))).await.unwrap();
        assert_eq!(db.get(&path!["x"]).await.unwrap(), Some(json!({"a": 1, "l": [9, 2]})));
        db.set(&path!["x", "l", 2], Some(json!(3))).await.unwrap();
        assert_eq!(db.get(&path!["x", "l"]).await.unwrap(), Some(json!([9, 2, 3])));
        assert_eq!(db.get(&path!["x", "a"]).await.unwrap(), Some(json!(1)));
    }

    async fn reserved_characters(db: Arc<dyn Adapter>) {
        db.connect().await.unwrap();
        let literal = path!["k.e$y", "a b[0]", "~1"];
        let nested = path!["k", "e$y"];
        db.set(&literal, Some(json!("literal"))).await.unwrap();
        db.set(&nested, Some(json!("nested"))).await.unwrap();
        db.set(&path!["k_e"], Some(json!("wildcard-neighbour"))).await.unwrap();
        assert_eq!(db.get(&literal).await.unwrap(), Some(json!("literal")));
        assert_eq!(db.get(&nested).await.unwrap(), Some(json!("nested")));
        assert_eq!(
            db.get(&path!["k.e$y"]).await.unwrap(),
            Some(json!({"a b[0]": {"~1": "literal"}}))
        );
        assert_eq!(db.get(&path!["k"]).await.unwrap(), Some(json!({"e$y": "nested"})));
        db.del(&path!["k"]).await.unwrap();
        assert_eq!(db.get(&literal).await.unwrap(), Some(json!("literal")));
        assert_eq!(db.get(&path!["k_e"]).await.unwrap(), Some(json!("wildcard-neighbour")));
    }

    async fn compound_operations(db: Arc<dyn Adapter>) {
        db.connect().await.unwrap();
        let n = path!["counters", "n"];
        db.inc(&n, &Number::from(5)).await.unwrap();
        db.dec(&n, &Number::from(2)).await.unwrap();
        assert_eq!(db.get(&n).await.unwrap(), Some(json!(3)));

        db.set(&path!["counters", "word"], Some(json!("x"))).await.unwrap();
        assert!(db.inc(&path!["counters", "word"], &Number::from(1)).await.is_err());

        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = calls.clone();
        db.upd(
            &n,
            Box::new(move |current| {
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Some(json!(current.and_then(|v| v.as_i64()).unwrap_or(0) * 10))
            }),
        )
        .await
        .unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(db.get(&n).await.unwrap(), Some(json!(30)));

        db.upd(&n, Box::new(|_| None)).await.unwrap();
        assert_eq!(db.get(&n).await.unwrap(), None);

        let added = db.add(&path!["items"], json!({"title": "first"})).await.unwrap();
        assert_eq!(added.len(), 2);
        assert_eq!(added.first(), Some("items"));
        assert_eq!(db.get(&added).await.unwrap(), Some(json!({"title": "first"})));
        let second = db.add(&path!["items"], json!(2)).await.unwrap();
        assert_ne!(added, second);
        assert_eq!(db.len(&path!["items"]).await.unwrap(), 2);

        let list = path!["list"];
        db.set(&list, Some(json!([1, 2, 3]))).await.unwrap();
        assert_eq!(db.pop(&list).await.unwrap(), Some(json!(3)));
        assert_eq!(db.shift(&list).await.unwrap(), Some(json!(1)));
        assert_eq!(db.get(&list).await.unwrap(), Some(json!([2])));
        assert_eq!(db.pop(&path!["absent-list"]).await.unwrap(), None);
        db.set(&path!["not-a-list"], Some(json!(7))).await.unwrap();
        assert_eq!(db.shift(&path!["not-a-list"]).await.unwrap(), None);
        assert_eq!(db.get(&path!["not-a-list"]).await.unwrap(), Some(json!(7)));

        db.set(&path!["obj"], Some(json!({"a": 1, "b": 2}))).await.unwrap();
        let mut keys = db.keys(&path!["obj"]).await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(db.values(&path!["obj"]).await.unwrap().len(), 2);
        assert_eq!(db.entries(&path!["obj"]).await.unwrap().len(), 2);
        assert_eq!(db.len(&path!["missing"]).await.unwrap(), 0);
        assert!(db.keys(&path!["missing"]).await.unwrap().is_empty());

        // Setting "absent" deletes
        db.set(&path!["obj"], None).await.unwrap();
        assert_eq!(db.get(&path!["obj"]).await.unwrap(), None);
    }

    /// `n` concurrent increments of one counter must all land
    pub async fn concurrent_increments(db: Arc<dyn Adapter>, n: usize) {
        db.connect().await.unwrap();
        let p = path!["race", "counter"];
        let mut handles = Vec::new();
        for _ in 0..n {
            let db = db.clone();
            let p = p.clone();
            handles.push(tokio::spawn(async move { db.inc(&p, &Number::from(1)).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(db.get(&p).await.unwrap(), Some(json!(n)), "{}", db.name());
    }

    async fn root_operations(db: Arc<dyn Adapter>) {
        db.connect().await.unwrap();
        db.set(&path!["a"], Some(json!(1))).await.unwrap();
        db.set(&path!["b", "c"], Some(json!(2))).await.unwrap();
        assert_eq!(db.get(&Path::root()).await.unwrap(), Some(json!({"a": 1, "b": {"c": 2}})));

        db.set(&Path::root(), Some(json!({"fresh": true}))).await.unwrap();
        assert_eq!(db.get(&Path::root()).await.unwrap(), Some(json!({"fresh": true})));
        assert!(db.set(&Path::root(), Some(json!(5))).await.is_err());

        db.del(&Path::root()).await.unwrap();
        assert_eq!(db.get(&Path::root()).await.unwrap(), Some(json!({})));
        assert_eq!(db.get(&path!["fresh"]).await.unwrap(), None);
    }
}
