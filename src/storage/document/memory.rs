//! In-process document collection
//!
//! Applies `$set`/`$unset`/`$inc` with the usual document-store rules:
//! field names may not contain `.` or NUL or start with `$`, missing
//! intermediate fields are created as sub-documents, and descending through
//! a scalar is an error.

use super::{DocumentClient, Update};
use crate::core::error::{Error, Result};
use crate::path::tree::{add_numbers, get_in_mut, is_composite, type_name};
use crate::path::Path;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Collection {
    documents: RwLock<BTreeMap<String, Map<String, Value>>>,
    connected: AtomicBool,
    updates: AtomicUsize,
}

/// Document collection kept in memory; clones share the same documents
#[derive(Debug, Clone)]
pub struct MemoryDocuments {
    name: String,
    inner: Arc<Collection>,
}

impl MemoryDocuments {
    /// Create an empty collection
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Collection::default()),
        }
    }

    /// Number of `update_one` calls served
    pub fn update_count(&self) -> usize {
        self.inner.updates.load(Ordering::Relaxed)
    }

    fn ensure_connected(&self) -> Result<()> {
        if !self.inner.connected.load(Ordering::Acquire) {
            return Err(Error::NotConnected(self.identity()));
        }
        Ok(())
    }

    fn reject(&self, message: String) -> Error {
        Error::backend(self.identity(), message)
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.starts_with('$') || name.contains('.') || name.contains('\0') {
            return Err(self.reject(format!("invalid field name `{}`", name)));
        }
        Ok(())
    }

    fn check_fields(&self, value: &Value) -> Result<()> {
        match value {
            Value::Object(map) => map.iter().try_for_each(|(name, child)| {
                self.check_name(name)?;
                self.check_fields(child)
            }),
            Value::Array(items) => items.iter().try_for_each(|item| self.check_fields(item)),
            _ => Ok(()),
        }
    }

    /// Container holding the last segment of `field`, creating sub-documents
    fn container<'a>(&self, document: &'a mut Value, field: &str) -> Result<(&'a mut Value, String)> {
        let segments: Vec<&str> = field.split('.').collect();
        for segment in &segments {
            if segment.is_empty() || segment.starts_with('$') {
                return Err(self.reject(format!("invalid field path `{}`", field)));
            }
        }
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| self.reject("empty field path".to_string()))?;
        let mut current = document;
        for segment in parents {
            current = match current {
                Value::Object(map) => map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                Value::Array(items) => {
                    let index = segment
                        .parse::<usize>()
                        .map_err(|_| self.reject(format!("cannot index list with `{}`", segment)))?;
                    if index > items.len() {
                        return Err(self.reject(format!("list index {} is past the end", index)));
                    }
                    if index == items.len() {
                        items.push(Value::Null);
                    }
                    let slot = &mut items[index];
                    if slot.is_null() {
                        *slot = Value::Object(Map::new());
                    }
                    slot
                }
                other => {
                    return Err(self.reject(format!(
                        "cannot create field `{}` in {} at `{}`",
                        segment,
                        type_name(other),
                        field
                    )))
                }
            };
        }
        if !is_composite(current) {
            return Err(self.reject(format!(
                "cannot create field `{}` in {} at `{}`",
                last,
                type_name(current),
                field
            )));
        }
        Ok((current, last.to_string()))
    }

    fn apply(&self, document: &mut Value, update: Update) -> Result<()> {
        for (field, value) in update.set {
            self.check_fields(&value)?;
            let (container, last) = self.container(document, &field)?;
            store(container, &last, value).map_err(|m| self.reject(m))?;
        }
        for field in update.unset {
            let segments: Vec<String> = field.split('.').map(str::to_string).collect();
            let Some((last, parents)) = segments.split_last() else {
                continue;
            };
            match get_in_mut(document, parents) {
                Some(Value::Object(map)) => {
                    map.remove(last);
                }
                Some(Value::Array(items)) => {
                    if let Some(slot) = last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                        *slot = Value::Null;
                    }
                }
                _ => {}
            }
        }
        for (field, delta) in update.inc {
            let (container, last) = self.container(document, &field)?;
            let current = match &*container {
                Value::Object(map) => map.get(&last).cloned(),
                Value::Array(items) => last.parse::<usize>().ok().and_then(|i| items.get(i).cloned()),
                _ => None,
            };
            if matches!(current, Some(Value::Null)) {
                return Err(self.reject(format!("cannot apply $inc to null at `{}`", field)));
            }
            let next = add_numbers(current.as_ref(), &delta, &Path::from(field.as_str()))
                .map_err(|e| self.reject(e.to_string()))?;
            store(container, &last, next).map_err(|m| self.reject(m))?;
        }
        Ok(())
    }
}

fn store(container: &mut Value, last: &str, value: Value) -> std::result::Result<(), String> {
    match container {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = last
                .parse::<usize>()
                .map_err(|_| format!("cannot index list with `{}`", last))?;
            if index > items.len() {
                return Err(format!("list index {} is past the end", index));
            }
            if index == items.len() {
                items.push(value);
            } else {
                items[index] = value;
            }
            Ok(())
        }
        other => Err(format!("cannot store into {}", type_name(other))),
    }
}

#[async_trait]
impl DocumentClient for MemoryDocuments {
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

    async fn find_one(&self, id: &str) -> Result<Option<Map<String, Value>>> {
        self.ensure_connected()?;
        Ok(self.inner.documents.read().get(id).cloned())
    }

    async fn find_all(&self) -> Result<Vec<Map<String, Value>>> {
        self.ensure_connected()?;
        Ok(self.inner.documents.read().values().cloned().collect())
    }

    async fn replace_one(&self, id: &str, mut document: Map<String, Value>) -> Result<()> {
        self.ensure_connected()?;
        document.remove("_id");
        self.check_fields(&Value::Object(document.clone()))?;
        document.insert("_id".to_string(), Value::String(id.to_string()));
        self.inner.documents.write().insert(id.to_string(), document);
        Ok(())
    }

    async fn update_one(&self, id: &str, update: Update, upsert: bool) -> Result<bool> {
        self.ensure_connected()?;
        self.inner.updates.fetch_add(1, Ordering::Relaxed);
        let mut documents = self.inner.documents.write();
        let mut document = match documents.get(id) {
            Some(existing) => Value::Object(existing.clone()),
            None if upsert => Value::Object(Map::new()),
            None => return Ok(false),
        };
        // Applied to a copy so a rejected operator leaves the document untouched
        self.apply(&mut document, update)?;
        if let Value::Object(mut map) = document {
            map.insert("_id".to_string(), Value::String(id.to_string()));
            documents.insert(id.to_string(), map);
        }
        Ok(true)
    }

    async fn delete_one(&self, id: &str) -> Result<()> {
        self.ensure_connected()?;
        self.inner.documents.write().remove(id);
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        self.ensure_connected()?;
        self.inner.documents.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Number};

    async fn connected() -> MemoryDocuments {
        let docs = MemoryDocuments::new("c");
        docs.connect().await.unwrap();
        docs
    }

    #[tokio::test]
    async fn test_set_creates_sub_documents() {
        let docs = connected().await;
        assert!(docs.update_one("a", Update::set("v.x.y", json!(1)), true).await.unwrap());
        let doc = docs.find_one("a").await.unwrap().unwrap();
        assert_eq!(Value::Object(doc), json!({"_id": "a", "v": {"x": {"y": 1}}}));
        assert!(!docs.update_one("missing", Update::set("v", json!(1)), false).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_through_scalar_is_rejected() {
        let docs = connected().await;
        docs.update_one("a", Update::set("v", json!(5)), true).await.unwrap();
        let rejected = docs.update_one("a", Update::set("v.x", json!(1)), true).await;
        assert!(matches!(rejected, Err(Error::Backend { .. })));
        let doc = docs.find_one("a").await.unwrap().unwrap();
        assert_eq!(doc["v"], json!(5));
    }

    #[tokio::test]
    async fn test_list_index_past_end_is_rejected() {
        let docs = connected().await;
        docs.update_one("a", Update::set("v", json!([1])), true).await.unwrap();
        docs.update_one("a", Update::set("v.1", json!(2)), true).await.unwrap();
        assert_eq!(docs.find_one("a").await.unwrap().unwrap()["v"], json!([1, 2]));

        let huge = format!("v.{}", usize::MAX);
        assert!(docs.update_one("a", Update::set(huge.as_str(), json!(3)), true).await.is_err());
        assert!(docs.update_one("a", Update::set("v.4000000000.x", json!(3)), true).await.is_err());
        assert!(docs.update_one("a", Update::inc("v.9", Number::from(1)), true).await.is_err());
        assert_eq!(docs.find_one("a").await.unwrap().unwrap()["v"], json!([1, 2]));
    }

    #[tokio::test]
    async fn test_field_names_are_validated() {
        let docs = connected().await;
        let mut doc = Map::new();
        doc.insert("v".into(), json!({"a.b": 1}));
        assert!(docs.replace_one("a", doc).await.is_err());
        assert!(docs.update_one("a", Update::set("v.$x", json!(1)), true).await.is_err());
    }

    #[tokio::test]
    async fn test_inc_and_unset() {
        let docs = connected().await;
        docs.update_one("a", Update::inc("v.n", Number::from(3)), true).await.unwrap();
        docs.update_one("a", Update::inc("v.n", Number::from(-1)), true).await.unwrap();
        assert_eq!(docs.find_one("a").await.unwrap().unwrap()["v"], json!({"n": 2}));
        docs.update_one("a", Update::set("v.s", json!("x")), true).await.unwrap();
        assert!(docs.update_one("a", Update::inc("v.s", Number::from(1)), true).await.is_err());
        docs.update_one("a", Update::unset("v.n"), false).await.unwrap();
        assert_eq!(docs.find_one("a").await.unwrap().unwrap()["v"], json!({"s": "x"}));
        assert_eq!(docs.update_count(), 5);
    }
}
