//! Native JSON-tree adapter
//!
//! Each top-level segment is one JSON document `{namespace}:{segment}` in a
//! store that understands JSON paths. Nested reads and writes are addressed
//! in the store's path language. Deployed servers disagree on the syntax
//! (`$.a.b` against `.a.b`), so every call probes the known
//! [`PathDialect`]s in order, starting with the last one that worked, and
//! moves on when a dialect errors or matches nothing. Segments and map keys
//! go through [`JSON_PATH_CODEC`] so they are always plain identifiers.

pub mod memory;

pub use memory::MemoryJsonClient;

use super::ids::IdGenerator;
use super::registry::AdapterRegistry;
use super::{root_map, Adapter};
use crate::core::error::{Error, Result};
use crate::path::tree::{delete_in, set_in};
use crate::path::{KeyCodec, Path, JSON_PATH_CODEC};
use crate::queue::OpQueue;
use async_trait::async_trait;
use serde_json::{Map, Number, Value};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of a path-addressed command
#[derive(Debug, Clone, PartialEq)]
pub enum PathReply<T> {
    /// The path matched
    Found(T),
    /// The path (or the document) did not match anything
    NoMatch,
}

/// JSON path syntaxes understood by different server versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathDialect {
    /// `$` root, `$.a.b` children
    Standard,
    /// `.` root, `.a.b` children
    Legacy,
}

impl PathDialect {
    /// Probe order
    pub const ALL: [PathDialect; 2] = [PathDialect::Standard, PathDialect::Legacy];

    /// Render a path relative to the document root
    pub fn render(self, path: &Path) -> String {
        let root = match self {
            PathDialect::Standard => "$",
            PathDialect::Legacy => ".",
        };
        if path.is_root() {
            return root.to_string();
        }
        let body = JSON_PATH_CODEC.encode(path);
        match self {
            PathDialect::Standard => format!("$.{}", body),
            PathDialect::Legacy => format!(".{}", body),
        }
    }
}

/// Minimal contract of a JSON document store
#[async_trait]
pub trait JsonClient: Send + Sync + fmt::Debug {
    /// Identity of the physical store, e.g. `redis://host:6379/0`
    fn identity(&self) -> String;

    /// Open the connection
    async fn connect(&self) -> Result<()>;

    /// Close the connection
    async fn disconnect(&self) -> Result<()>;

    /// Value at `path` inside document `key`
    async fn json_get(&self, key: &str, path: &str) -> Result<PathReply<Value>>;

    /// Store `value` at `path`; matches nothing when the parent is missing
    async fn json_set(&self, key: &str, path: &str, value: &Value) -> Result<PathReply<()>>;

    /// Delete the value at `path`
    async fn json_del(&self, key: &str, path: &str) -> Result<PathReply<()>>;

    /// Add `delta` to the number at `path`, returning the new number
    async fn json_numincrby(&self, key: &str, path: &str, delta: &Number) -> Result<PathReply<Value>>;

    /// Delete a whole document
    async fn del(&self, key: &str) -> Result<()>;

    /// Document keys starting with `prefix`
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Options for [`JsonAdapter`]
#[derive(Debug, Clone)]
pub struct JsonOptions {
    /// Key namespace shared by every document of this tree
    pub namespace: String,
    /// Identifier generator for `add`
    pub ids: IdGenerator,
    /// Registry the shared queue is looked up in
    pub registry: Arc<AdapterRegistry>,
}

impl JsonOptions {
    /// Defaults for `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ids: IdGenerator::default(),
            registry: AdapterRegistry::global(),
        }
    }
}

/// Adapter storing one native JSON document per top-level segment
#[derive(Debug)]
pub struct JsonAdapter {
    name: String,
    namespace: String,
    client: Arc<dyn JsonClient>,
    ids: IdGenerator,
    queue: Arc<OpQueue>,
    preferred: AtomicUsize,
}

impl JsonAdapter {
    /// Wrap a JSON store client
    pub fn new(client: Arc<dyn JsonClient>, options: JsonOptions) -> Result<Self> {
        let name = format!("json:{}/{}", client.identity(), options.namespace);
        let queue = options.registry.shared(&name, OpQueue::new)?;
        Ok(Self {
            name,
            namespace: options.namespace,
            client,
            ids: options.ids,
            queue,
            preferred: AtomicUsize::new(0),
        })
    }

    /// Dialect that answered most recently
    pub fn dialect(&self) -> PathDialect {
        PathDialect::ALL[self.preferred.load(Ordering::Relaxed) % PathDialect::ALL.len()]
    }

    fn prefix(&self) -> String {
        format!("{}:", self.namespace)
    }

    fn key(&self, segment: &str) -> String {
        format!("{}{}", self.prefix(), JSON_PATH_CODEC.encode_segment(segment))
    }

    /// Try each dialect until one matches.
    ///
    /// Returns `NoMatch` only when every dialect answered without matching;
    /// if some dialect failed and none matched, the last failure is returned.
    async fn probe<T, F, Fut>(&self, path: &Path, mut call: F) -> Result<PathReply<T>>
    where
        F: FnMut(String) -> Fut + Send,
        Fut: Future<Output = Result<PathReply<T>>> + Send,
        T: Send,
    {
        let start = self.preferred.load(Ordering::Relaxed);
        let mut failure = None;
        let mut matched_nothing = false;
        for offset in 0..PathDialect::ALL.len() {
            let index = (start + offset) % PathDialect::ALL.len();
            let dialect = PathDialect::ALL[index];
            match call(dialect.render(path)).await {
                Ok(PathReply::Found(found)) => {
                    if index != start {
                        debug!("{} now probing {:?} paths first", self.name, dialect);
                        self.preferred.store(index, Ordering::Relaxed);
                    }
                    return Ok(PathReply::Found(found));
                }
                Ok(PathReply::NoMatch) => matched_nothing = true,
                Err(e) => {
                    debug!("{:?} path syntax rejected by {}: {}", dialect, self.name, e);
                    failure = Some(e);
                }
            }
        }
        match failure {
            Some(e) if !matched_nothing => Err(e),
            _ => Ok(PathReply::NoMatch),
        }
    }

    async fn get_in_doc(&self, key: &str, path: &Path) -> Result<Option<Value>> {
        let reply = self
            .probe(path, |p| async move { self.client.json_get(key, &p).await })
            .await?;
        Ok(match reply {
            PathReply::Found(value) => Some(JSON_PATH_CODEC.decode_keys(value)),
            PathReply::NoMatch => None,
        })
    }

    async fn set_in_doc(&self, key: &str, path: &Path, value: &Value) -> Result<bool> {
        let reply = self
            .probe(path, |p| async move { self.client.json_set(key, &p, value).await })
            .await?;
        Ok(matches!(reply, PathReply::Found(())))
    }

    /// Create the document and every missing intermediate map above `path`
    async fn synthesize_parents(&self, key: &str, path: &Path) -> Result<()> {
        let empty = Value::Object(Map::new());
        if self.get_in_doc(key, &Path::root()).await?.is_none() {
            debug!("Creating document {} in {}", key, self.name);
            self.set_in_doc(key, &Path::root(), &empty).await?;
        }
        for ancestor in path.ancestors() {
            match self.get_in_doc(key, &ancestor).await? {
                Some(Value::Object(_)) | Some(Value::Array(_)) => {}
                _ => {
                    self.set_in_doc(key, &ancestor, &empty).await?;
                }
            }
        }
        Ok(())
    }

    async fn write_nested(&self, top: &str, rest: &Path, value: Value) -> Result<()> {
        let key = self.key(top);
        let encoded = JSON_PATH_CODEC.encode_keys(value.clone());
        if self.set_in_doc(&key, rest, &encoded).await? {
            return Ok(());
        }
        self.synthesize_parents(&key, rest).await?;
        if self.set_in_doc(&key, rest, &encoded).await? {
            return Ok(());
        }

        // e.g. a list index past the end; patch the whole document instead
        debug!("Path {} unreachable in {}, rewriting document", rest, key);
        let mut document = self
            .get_in_doc(&key, &Path::root())
            .await?
            .unwrap_or_else(|| Value::Object(Map::new()));
        set_in(&mut document, rest.segments(), value)?;
        let document = JSON_PATH_CODEC.encode_keys(document);
        if self.set_in_doc(&key, &Path::root(), &document).await? {
            Ok(())
        } else {
            Err(Error::backend(&self.name, format!("could not write {}", rest)))
        }
    }

    async fn top_segments(&self) -> Result<Vec<String>> {
        let prefix = self.prefix();
        Ok(self
            .client
            .keys(&prefix)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(|s| JSON_PATH_CODEC.decode_segment(s)))
            .collect())
    }
}

#[async_trait]
impl Adapter for JsonAdapter {
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
        info!("Connected {}", self.name);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await
    }

    async fn read(&self, path: &Path) -> Result<Option<Value>> {
        let Some((top, rest)) = path.split_first() else {
            let mut root = Map::new();
            for segment in self.top_segments().await? {
                if let Some(value) = self.get_in_doc(&self.key(&segment), &Path::root()).await? {
                    root.insert(segment, value);
                }
            }
            return Ok(Some(Value::Object(root)));
        };
        self.get_in_doc(&self.key(top), &rest).await
    }

    async fn write(&self, path: &Path, value: Value) -> Result<()> {
        let Some((top, rest)) = path.split_first() else {
            let map = root_map(&self.name, value)?;
            for segment in self.top_segments().await? {
                self.client.del(&self.key(&segment)).await?;
            }
            for (segment, value) in map {
                self.write_nested(&segment, &Path::root(), value).await?;
            }
            return Ok(());
        };
        self.write_nested(top, &rest, value).await
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let Some((top, rest)) = path.split_first() else {
            for segment in self.top_segments().await? {
                self.client.del(&self.key(&segment)).await?;
            }
            return Ok(());
        };
        let key = self.key(top);
        if rest.is_root() {
            return self.client.del(&key).await;
        }
        let key = key.as_str();
        let reply = self
            .probe(&rest, |p| async move { self.client.json_del(key, &p).await })
            .await?;
        if reply == PathReply::NoMatch {
            // Nothing matched under any dialect; make sure it is really gone
            if let Some(mut document) = self.get_in_doc(key, &Path::root()).await? {
                if delete_in(&mut document, rest.segments()).is_some() {
                    let document = JSON_PATH_CODEC.encode_keys(document);
                    self.set_in_doc(key, &Path::root(), &document).await?;
                }
            }
        }
        Ok(())
    }

    async fn increment(&self, path: &Path, delta: &Number) -> Result<bool> {
        let Some((top, rest)) = path.split_first() else {
            return Ok(false);
        };
        let key = self.key(top);
        let key = key.as_str();
        let reply = self
            .probe(&rest, |p| async move { self.client.json_numincrby(key, &p, delta).await })
            .await;
        match reply {
            Ok(PathReply::Found(_)) => Ok(true),
            Ok(PathReply::NoMatch) => Ok(false),
            Err(e) => {
                debug!("Native increment of {} rejected ({}), falling back", path, e);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;
    use crate::storage::contract;
    use serde_json::json;

    fn options() -> JsonOptions {
        let mut options = JsonOptions::new("mt");
        options.registry = Arc::new(AdapterRegistry::new());
        options
    }

    #[test]
    fn test_dialect_rendering() {
        let p = path!["a b", "c"];
        assert_eq!(PathDialect::Standard.render(&p), "$.a~000020b.c");
        assert_eq!(PathDialect::Legacy.render(&p), ".a~000020b.c");
        assert_eq!(PathDialect::Standard.render(&Path::root()), "$");
        assert_eq!(PathDialect::Legacy.render(&Path::root()), ".");
    }

    #[tokio::test]
    async fn test_adapter_contract_per_dialect() {
        for dialects in [
            vec![PathDialect::Standard, PathDialect::Legacy],
            vec![PathDialect::Standard],
            vec![PathDialect::Legacy],
        ] {
            contract::run_all(|| {
                let client = Arc::new(MemoryJsonClient::new("j").with_dialects(&dialects));
                Arc::new(JsonAdapter::new(client, options()).unwrap()) as Arc<dyn Adapter>
            })
            .await;
        }
    }

    #[tokio::test]
    async fn test_500_concurrent_increments() {
        let db = JsonAdapter::new(Arc::new(MemoryJsonClient::new("j")), options()).unwrap();
        contract::concurrent_increments(Arc::new(db), 500).await;
    }

    #[tokio::test]
    async fn test_legacy_server_switches_preference() {
        let client = Arc::new(MemoryJsonClient::new("j").with_dialects(&[PathDialect::Legacy]));
        let db = JsonAdapter::new(client, options()).unwrap();
        db.connect().await.unwrap();
        assert_eq!(db.dialect(), PathDialect::Standard);
        db.set(&path!["a", "b", "c"], Some(json!(1))).await.unwrap();
        assert_eq!(db.dialect(), PathDialect::Legacy);
        assert_eq!(db.get(&path!["a"]).await.unwrap(), Some(json!({"b": {"c": 1}})));
    }

    #[tokio::test]
    async fn test_missing_parents_are_synthesized() {
        let client = Arc::new(MemoryJsonClient::new("j"));
        let db = JsonAdapter::new(client.clone(), options()).unwrap();
        db.connect().await.unwrap();
        db.set(&path!["doc", "x", "y", "z"], Some(json!("deep"))).await.unwrap();
        assert_eq!(
            client.json_get("mt:doc", "$").await.unwrap(),
            PathReply::Found(json!({"x": {"y": {"z": "deep"}}}))
        );
    }

    #[tokio::test]
    async fn test_list_append_and_index_past_end() {
        let db = JsonAdapter::new(Arc::new(MemoryJsonClient::new("j")), options()).unwrap();
        db.connect().await.unwrap();
        db.set(&path!["doc", "l"], Some(json!([1]))).await.unwrap();
        db.set(&path!["doc", "l", 1], Some(json!(2))).await.unwrap();
        assert_eq!(db.get(&path!["doc", "l"]).await.unwrap(), Some(json!([1, 2])));
        let err = db.set(&path!["doc", "l", 5], Some(json!(3))).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(db.get(&path!["doc", "l"]).await.unwrap(), Some(json!([1, 2])));
    }
}
