//! In-process table client

use super::{like_match, Durability, TableClient};
use crate::core::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Table kept in a sorted map; clones share the same rows
#[derive(Debug, Clone)]
pub struct MemoryTable {
    name: String,
    rows: Arc<RwLock<BTreeMap<String, Value>>>,
    durability: Arc<RwLock<Option<Durability>>>,
}

impl MemoryTable {
    /// Create an empty table
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Arc::new(RwLock::new(BTreeMap::new())),
            durability: Arc::new(RwLock::new(None)),
        }
    }

    /// Stored keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        self.rows.read().keys().cloned().collect()
    }

    /// Durability of the open connection, `None` while disconnected
    pub fn durability(&self) -> Option<Durability> {
        *self.durability.read()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.durability.read().is_none() {
            return Err(Error::NotConnected(self.identity()));
        }
        Ok(())
    }
}

#[async_trait]
impl TableClient for MemoryTable {
    fn identity(&self) -> String {
        format!("memory:{}", self.name)
    }

    async fn connect(&self, durability: Durability) -> Result<()> {
        *self.durability.write() = Some(durability);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        *self.durability.write() = None;
        Ok(())
    }

    async fn get_row(&self, key: &str) -> Result<Option<Value>> {
        self.ensure_connected()?;
        Ok(self.rows.read().get(key).cloned())
    }

    async fn put_rows(&self, rows: Vec<(String, Value)>) -> Result<()> {
        self.ensure_connected()?;
        self.rows.write().extend(rows);
        Ok(())
    }

    async fn delete_row(&self, key: &str) -> Result<()> {
        self.ensure_connected()?;
        self.rows.write().remove(key);
        Ok(())
    }

    async fn rows_like(&self, pattern: &str) -> Result<Vec<(String, Value)>> {
        self.ensure_connected()?;
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|(key, _)| like_match(pattern, key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn delete_like(&self, pattern: &str) -> Result<()> {
        self.ensure_connected()?;
        self.rows.write().retain(|key, _| !like_match(pattern, key));
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.ensure_connected()?;
        self.rows.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_rows_and_patterns() {
        let table = MemoryTable::new("t");
        assert!(matches!(table.get_row("a").await, Err(Error::NotConnected(_))));

        table.connect(Durability::Safe).await.unwrap();
        assert_eq!(table.durability(), Some(Durability::Safe));
        table
            .put_rows(vec![
                ("a.x".into(), json!(1)),
                ("a.y".into(), json!(2)),
                ("ab".into(), json!(3)),
            ])
            .await
            .unwrap();
        assert_eq!(table.rows_like("a.%").await.unwrap().len(), 2);
        table.delete_like("a.%").await.unwrap();
        assert_eq!(table.keys(), vec!["ab"]);

        let clone = table.clone();
        clone.clear().await.unwrap();
        assert!(table.keys().is_empty());
    }
}
