//! Document-store adapter
//!
//! Every top-level segment is one document `{ "_id": <segment>, "v": <value> }`.
//! Nested writes and increments go through the store's dot-path update
//! operators (`$set`, `$unset`, `$inc`) on `v.<seg>.<seg>...`, with segments
//! and map keys passed through [`DOCUMENT_CODEC`] so `.`, `$` and NUL never
//! reach the store unescaped. Whenever the store rejects a nested operator
//! (for instance `$set` beneath a scalar), the adapter falls back to
//! rewriting the whole document from inside the queue.

pub mod memory;

pub use memory::MemoryDocuments;

use super::ids::IdGenerator;
use super::registry::AdapterRegistry;
use super::{root_map, Adapter};
use crate::core::error::Result;
use crate::path::tree::{delete_in, get_in, set_in};
use crate::path::{KeyCodec, Path, DOCUMENT_CODEC};
use crate::queue::OpQueue;
use async_trait::async_trait;
use serde_json::{json, Map, Number, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Field holding the stored value inside each document
pub const VALUE_FIELD: &str = "v";

/// Dot-path update applied to one document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    /// `$set` pairs of field path and value
    pub set: Vec<(String, Value)>,
    /// `$unset` field paths
    pub unset: Vec<String>,
    /// `$inc` pairs of field path and delta
    pub inc: Vec<(String, Number)>,
}

impl Update {
    /// Single `$set`
    pub fn set(field: impl Into<String>, value: Value) -> Self {
        Self {
            set: vec![(field.into(), value)],
            ..Self::default()
        }
    }

    /// Single `$unset`
    pub fn unset(field: impl Into<String>) -> Self {
        Self {
            unset: vec![field.into()],
            ..Self::default()
        }
    }

    /// Single `$inc`
    pub fn inc(field: impl Into<String>, delta: Number) -> Self {
        Self {
            inc: vec![(field.into(), delta)],
            ..Self::default()
        }
    }
}

/// Minimal contract of a document collection
#[async_trait]
pub trait DocumentClient: Send + Sync + fmt::Debug {
    /// Identity of the physical collection, e.g. `mongodb://host/db.tree`
    fn identity(&self) -> String;

    /// Open the connection
    async fn connect(&self) -> Result<()>;

    /// Close the connection
    async fn disconnect(&self) -> Result<()>;

    /// Document with the given `_id`
    async fn find_one(&self, id: &str) -> Result<Option<Map<String, Value>>>;

    /// Every document
    async fn find_all(&self) -> Result<Vec<Map<String, Value>>>;

    /// Insert or replace the document with the given `_id`
    async fn replace_one(&self, id: &str, document: Map<String, Value>) -> Result<()>;

    /// Apply dot-path operators; returns whether a document matched or was upserted
    async fn update_one(&self, id: &str, update: Update, upsert: bool) -> Result<bool>;

    /// Delete the document with the given `_id`
    async fn delete_one(&self, id: &str) -> Result<()>;

    /// Delete every document
    async fn delete_all(&self) -> Result<()>;
}

/// Options for [`DocumentAdapter`]
#[derive(Debug, Clone)]
pub struct DocumentOptions {
    /// Identifier generator for `add`
    pub ids: IdGenerator,
    /// Registry the shared queue is looked up in
    pub registry: Arc<AdapterRegistry>,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self {
            ids: IdGenerator::default(),
            registry: AdapterRegistry::global(),
        }
    }
}

/// Adapter storing one document per top-level segment
#[derive(Debug)]
pub struct DocumentAdapter {
    name: String,
    client: Arc<dyn DocumentClient>,
    ids: IdGenerator,
    queue: Arc<OpQueue>,
}

impl DocumentAdapter {
    /// Wrap a document client
    pub fn new(client: Arc<dyn DocumentClient>, options: DocumentOptions) -> Result<Self> {
        let name = format!("document:{}", client.identity());
        let queue = options.registry.shared(&name, OpQueue::new)?;
        Ok(Self {
            name,
            client,
            ids: options.ids,
            queue,
        })
    }

    /// `_id` of the document holding `segment`
    fn id(segment: &str) -> String {
        DOCUMENT_CODEC.encode_segment(segment)
    }

    /// Dot path of `rest` inside a document
    fn field(rest: &Path) -> String {
        if rest.is_root() {
            VALUE_FIELD.to_string()
        } else {
            format!("{}.{}", VALUE_FIELD, DOCUMENT_CODEC.encode(rest))
        }
    }

    fn document(id: &str, value: Value) -> Map<String, Value> {
        let mut document = Map::new();
        document.insert("_id".to_string(), Value::String(id.to_string()));
        document.insert(VALUE_FIELD.to_string(), DOCUMENT_CODEC.encode_keys(value));
        document
    }

    fn value_of(mut document: Map<String, Value>) -> Option<Value> {
        document.remove(VALUE_FIELD).map(|v| DOCUMENT_CODEC.decode_keys(v))
    }

    async fn load(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.client.find_one(id).await?.and_then(Self::value_of))
    }

    async fn read_all(&self) -> Result<Value> {
        let mut root = Map::new();
        for mut document in self.client.find_all().await? {
            let Some(Value::String(id)) = document.remove("_id") else {
                continue;
            };
            if let Some(value) = Self::value_of(document) {
                root.insert(DOCUMENT_CODEC.decode_segment(&id), value);
            }
        }
        Ok(Value::Object(root))
    }

    /// Read-modify-write of one whole document
    async fn rewrite<F>(&self, id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Value) -> Result<()> + Send,
    {
        let mut value = self.load(id).await?.unwrap_or_else(|| json!({}));
        mutate(&mut value)?;
        self.client.replace_one(id, Self::document(id, value)).await
    }
}

#[async_trait]
impl Adapter for DocumentAdapter {
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
            return self.read_all().await.map(Some);
        };
        let Some(value) = self.load(&Self::id(top)).await? else {
            return Ok(None);
        };
        Ok(get_in(&value, rest.segments()).cloned())
    }

    async fn write(&self, path: &Path, value: Value) -> Result<()> {
        let Some((top, rest)) = path.split_first() else {
            let map = root_map(&self.name, value)?;
            self.client.delete_all().await?;
            for (segment, value) in map {
                let id = Self::id(&segment);
                self.client.replace_one(&id, Self::document(&id, value)).await?;
            }
            return Ok(());
        };

        let id = Self::id(top);
        if rest.is_root() {
            return self.client.replace_one(&id, Self::document(&id, value)).await;
        }

        let update = Update::set(Self::field(&rest), DOCUMENT_CODEC.encode_keys(value.clone()));
        if let Err(e) = self.client.update_one(&id, update, true).await {
            debug!("$set on {} rejected ({}), rewriting document", path, e);
            self.rewrite(&id, |doc| set_in(doc, rest.segments(), value)).await?;
        }
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let Some((top, rest)) = path.split_first() else {
            return self.client.delete_all().await;
        };
        let id = Self::id(top);
        if rest.is_root() {
            return self.client.delete_one(&id).await;
        }

        let Some(current) = self.load(&id).await? else {
            return Ok(());
        };
        let parent = rest.parent().unwrap_or_default();
        match get_in(&current, parent.segments()) {
            // `$unset` would leave a null hole inside a list
            Some(Value::Array(_)) => {
                self.rewrite(&id, |doc| {
                    delete_in(doc, rest.segments());
                    Ok(())
                })
                .await
            }
            Some(Value::Object(_)) => {
                self.client.update_one(&id, Update::unset(Self::field(&rest)), false).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn increment(&self, path: &Path, delta: &Number) -> Result<bool> {
        let Some((top, rest)) = path.split_first() else {
            return Ok(false);
        };
        let update = Update::inc(Self::field(&rest), delta.clone());
        match self.client.update_one(&Self::id(top), update, true).await {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!("$inc on {} rejected ({}), falling back", path, e);
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

    fn adapter() -> (Arc<MemoryDocuments>, DocumentAdapter) {
        let client = Arc::new(MemoryDocuments::new("tree"));
        let options = DocumentOptions {
            registry: Arc::new(AdapterRegistry::new()),
            ..DocumentOptions::default()
        };
        (client.clone(), DocumentAdapter::new(client, options).unwrap())
    }

    #[tokio::test]
    async fn test_adapter_contract() {
        contract::run_all(|| Arc::new(adapter().1) as Arc<dyn Adapter>).await;
    }

    #[tokio::test]
    async fn test_500_concurrent_increments() {
        contract::concurrent_increments(Arc::new(adapter().1), 500).await;
    }

    #[tokio::test]
    async fn test_reserved_field_characters_are_escaped() {
        let (client, db) = adapter();
        db.connect().await.unwrap();
        db.set(&path!["$user.name", "a.b"], Some(json!({"$k": 1}))).await.unwrap();

        let stored = client.find_one("~2user~1name").await.unwrap().unwrap();
        assert_eq!(stored["v"], json!({"a~1b": {"~2k": 1}}));
        assert_eq!(
            db.get(&path!["$user.name"]).await.unwrap(),
            Some(json!({"a.b": {"$k": 1}}))
        );
    }

    #[tokio::test]
    async fn test_list_element_delete_splices() {
        let (_, db) = adapter();
        db.connect().await.unwrap();
        db.set(&path!["doc", "l"], Some(json!([1, 2, 3]))).await.unwrap();
        db.del(&path!["doc", "l", 1]).await.unwrap();
        assert_eq!(db.get(&path!["doc", "l"]).await.unwrap(), Some(json!([1, 3])));
    }

    #[tokio::test]
    async fn test_native_increment() {
        let (client, db) = adapter();
        db.connect().await.unwrap();
        db.inc(&path!["stats", "views"], &Number::from(2)).await.unwrap();
        assert_eq!(client.update_count(), 1);
        assert_eq!(db.get(&path!["stats"]).await.unwrap(), Some(json!({"views": 2})));
    }
}
