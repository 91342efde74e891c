//! Flat key/value table adapter
//!
//! Each stored value occupies one `(key, json)` row where the key is the
//! [`TABLE_CODEC`] encoding of its path. A composite written in one call is
//! stored as a single row; writing beneath it later expands that row into
//! one row per leaf so every path's value lives in exactly one place:
//! either its own row, inside an ancestor row, or spread over descendant
//! rows.
//!
//! Prefix scans go through SQL `LIKE` patterns with `\` as the escape
//! character, so the separator and the `%`/`_` wildcards inside keys always
//! match literally.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryTable;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteTable;

use super::ids::IdGenerator;
use super::registry::AdapterRegistry;
use super::{root_map, Adapter};
use crate::core::error::Result;
use crate::path::tree::{delete_in, flatten_leaves, get_in, is_composite, set_in, unflatten};
use crate::path::{KeyCodec, Path, TABLE_CODEC};
use crate::queue::OpQueue;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Escape character used in every `LIKE` pattern
pub const LIKE_ESCAPE: char = '\\';

/// Durability tier requested from the table backend on connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// No fsync; fastest, may lose recent writes on power loss
    Fast,
    /// Write-ahead log with relaxed syncing
    #[default]
    Balanced,
    /// Full sync on every commit
    Safe,
}

/// Minimal contract of a flat `(key, value)` table
#[async_trait]
pub trait TableClient: Send + Sync + fmt::Debug {
    /// Identity of the physical table, e.g. `sqlite:/var/app.db#tree`
    fn identity(&self) -> String;

    /// Open the connection with the requested durability tier
    async fn connect(&self, durability: Durability) -> Result<()>;

    /// Close the connection
    async fn disconnect(&self) -> Result<()>;

    /// Row stored under exactly `key`
    async fn get_row(&self, key: &str) -> Result<Option<Value>>;

    /// Insert or replace rows
    async fn put_rows(&self, rows: Vec<(String, Value)>) -> Result<()>;

    /// Delete the row stored under exactly `key`
    async fn delete_row(&self, key: &str) -> Result<()>;

    /// Rows whose key matches a `LIKE` pattern escaped with [`LIKE_ESCAPE`]
    async fn rows_like(&self, pattern: &str) -> Result<Vec<(String, Value)>>;

    /// Delete rows whose key matches a `LIKE` pattern escaped with [`LIKE_ESCAPE`]
    async fn delete_like(&self, pattern: &str) -> Result<()>;

    /// Delete every row
    async fn clear(&self) -> Result<()>;
}

/// `LIKE` pattern matching every key that starts with `prefix`
pub fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_') || c == LIKE_ESCAPE {
            pattern.push(LIKE_ESCAPE);
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Case-sensitive `LIKE` evaluation with [`LIKE_ESCAPE`] as escape character
pub fn like_match(pattern: &str, text: &str) -> bool {
    #[derive(Clone, Copy)]
    enum Token {
        Any,
        One,
        Char(char),
    }
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '%' => Token::Any,
            '_' => Token::One,
            c if c == LIKE_ESCAPE => Token::Char(chars.next().unwrap_or(LIKE_ESCAPE)),
            c => Token::Char(c),
        });
    }
    let text: Vec<char> = text.chars().collect();

    // reachable[j]: the tokens consumed so far can match text[..j]
    let mut reachable = vec![false; text.len() + 1];
    reachable[0] = true;
    for token in tokens {
        let mut next = vec![false; text.len() + 1];
        for j in 0..=text.len() {
            if !reachable[j] {
                continue;
            }
            match token {
                Token::Any => next[j..].iter_mut().for_each(|r| *r = true),
                Token::One if j < text.len() => next[j + 1] = true,
                Token::Char(c) if j < text.len() && text[j] == c => next[j + 1] = true,
                _ => {}
            }
        }
        reachable = next;
    }
    reachable[text.len()]
}

/// Options for [`TableAdapter`]
#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Durability tier passed to the client on connect
    pub durability: Durability,
    /// Identifier generator for `add`
    pub ids: IdGenerator,
    /// Registry the shared queue is looked up in
    pub registry: Arc<AdapterRegistry>,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            durability: Durability::default(),
            ids: IdGenerator::default(),
            registry: AdapterRegistry::global(),
        }
    }
}

/// Adapter storing the tree as flattened rows
#[derive(Debug)]
pub struct TableAdapter {
    name: String,
    client: Arc<dyn TableClient>,
    durability: Durability,
    ids: IdGenerator,
    queue: Arc<OpQueue>,
}

impl TableAdapter {
    /// Wrap a table client
    pub fn new(client: Arc<dyn TableClient>, options: TableOptions) -> Result<Self> {
        let name = format!("table:{}", client.identity());
        let queue = options.registry.shared(&name, OpQueue::new)?;
        Ok(Self {
            name,
            client,
            durability: options.durability,
            ids: options.ids,
            queue,
        })
    }

    /// Durability tier requested on connect
    pub fn durability(&self) -> Durability {
        self.durability
    }

    fn key(path: &Path) -> String {
        TABLE_CODEC.encode(path)
    }

    fn descendants(path: &Path) -> String {
        like_prefix(&format!("{}{}", Self::key(path), TABLE_CODEC.separator))
    }

    /// Nearest stored ancestor row of `path`, if any
    async fn ancestor_row(&self, path: &Path) -> Result<Option<(Path, Value)>> {
        let mut ancestors: Vec<Path> = path.ancestors().collect();
        ancestors.reverse();
        for ancestor in ancestors {
            if let Some(row) = self.client.get_row(&Self::key(&ancestor)).await? {
                return Ok(Some((ancestor, row)));
            }
        }
        Ok(None)
    }

    async fn read_all(&self) -> Result<Value> {
        let rows = self.client.rows_like("%").await?;
        unflatten(rows.into_iter().map(|(key, value)| (TABLE_CODEC.decode(&key), value)))
    }

    async fn write_root(&self, value: Value) -> Result<()> {
        let map = root_map(&self.name, value)?;
        self.client.clear().await?;
        let rows: Vec<(String, Value)> = map
            .into_iter()
            .map(|(segment, value)| (Self::key(&Path::root().child(segment)), value))
            .collect();
        if !rows.is_empty() {
            self.client.put_rows(rows).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Adapter for TableAdapter {
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
        self.client.connect(self.durability).await?;
        info!("Connected {} ({:?} durability)", self.name, self.durability);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await
    }

    async fn read(&self, path: &Path) -> Result<Option<Value>> {
        if path.is_root() {
            return self.read_all().await.map(Some);
        }
        if let Some(row) = self.client.get_row(&Self::key(path)).await? {
            return Ok(Some(row));
        }
        if let Some((ancestor, row)) = self.ancestor_row(path).await? {
            let relative = path.strip_prefix(&ancestor).unwrap_or_default();
            return Ok(get_in(&row, relative.segments()).cloned());
        }
        let rows = self.client.rows_like(&Self::descendants(path)).await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let leaves = rows.into_iter().filter_map(|(key, value)| {
            TABLE_CODEC
                .decode(&key)
                .strip_prefix(path)
                .map(|relative| (relative, value))
        });
        unflatten(leaves).map(Some)
    }

    async fn write(&self, path: &Path, value: Value) -> Result<()> {
        if path.is_root() {
            return self.write_root(value).await;
        }

        if let Some((ancestor, row)) = self.ancestor_row(path).await? {
            let ancestor_key = Self::key(&ancestor);
            match row {
                Value::Array(_) => {
                    // Lists stay whole; patch the element in place
                    let mut row = row;
                    let relative = path.strip_prefix(&ancestor).unwrap_or_default();
                    set_in(&mut row, relative.segments(), value)?;
                    return self.client.put_rows(vec![(ancestor_key, row)]).await;
                }
                Value::Object(_) => {
                    debug!("Expanding {} into leaf rows before writing {}", ancestor, path);
                    // A list leaf above the target keeps its row and is patched
                    let mut rows = Vec::new();
                    let mut patched = false;
                    for (leaf, mut leaf_value) in flatten_leaves(&ancestor, &row) {
                        if leaf == ancestor || leaf.starts_with(path) {
                            continue;
                        }
                        if leaf.is_ancestor_of(path) {
                            if !leaf_value.is_array() {
                                continue;
                            }
                            let relative = path.strip_prefix(&leaf).unwrap_or_default();
                            set_in(&mut leaf_value, relative.segments(), value.clone())?;
                            patched = true;
                        }
                        rows.push((Self::key(&leaf), leaf_value));
                    }
                    self.client.delete_row(&ancestor_key).await?;
                    if !rows.is_empty() {
                        self.client.put_rows(rows).await?;
                    }
                    if patched {
                        return Ok(());
                    }
                }
                _ => self.client.delete_row(&ancestor_key).await?,
            }
        }

        self.client.delete_like(&Self::descendants(path)).await?;
        self.client.put_rows(vec![(Self::key(path), value)]).await
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        if path.is_root() {
            return self.client.clear().await;
        }
        self.client.delete_row(&Self::key(path)).await?;
        self.client.delete_like(&Self::descendants(path)).await?;
        if let Some((ancestor, mut row)) = self.ancestor_row(path).await? {
            if is_composite(&row) {
                let relative = path.strip_prefix(&ancestor).unwrap_or_default();
                if delete_in(&mut row, relative.segments()).is_some() {
                    self.client.put_rows(vec![(Self::key(&ancestor), row)]).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;
    use crate::storage::contract;
    use serde_json::json;

    fn adapter() -> (Arc<MemoryTable>, TableAdapter) {
        let client = Arc::new(MemoryTable::new("tree"));
        let options = TableOptions {
            registry: Arc::new(AdapterRegistry::new()),
            ..TableOptions::default()
        };
        (client.clone(), TableAdapter::new(client, options).unwrap())
    }

    #[test]
    fn test_like_prefix_escapes_wildcards() {
        assert_eq!(like_prefix("a_b%c\\d."), "a\\_b\\%c\\\\d.%");
        let pattern = like_prefix("k_e.");
        assert!(like_match(&pattern, "k_e.x"));
        assert!(!like_match(&pattern, "kxe.x"));
        assert!(!like_match(&pattern, "k_e"));
    }

    #[test]
    fn test_like_match_semantics() {
        assert!(like_match("%", ""));
        assert!(like_match("a_c", "abc"));
        assert!(!like_match("a_c", "ac"));
        assert!(like_match("a%c", "abbbc"));
        assert!(!like_match("A%", "abc"));
        assert!(like_match("100\\%", "100%"));
        assert!(!like_match("100\\%", "1000"));
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
    async fn test_expansion_keeps_one_row_per_value() {
        let (client, db) = adapter();
        db.connect().await.unwrap();
        db.set(&path!["x"], Some(json!({"a": 1, "b": {"c": 2}}))).await.unwrap();
        assert_eq!(client.keys(), vec!["x"]);

        db.set(&path!["x", "b", "d"], Some(json!(3))).await.unwrap();
        assert_eq!(client.keys(), vec!["x.a", "x.b.c", "x.b.d"]);
        assert_eq!(
            db.get(&path!["x"]).await.unwrap(),
            Some(json!({"a": 1, "b": {"c": 2, "d": 3}}))
        );
    }

    #[tokio::test]
    async fn test_write_inside_list_row() {
        let (client, db) = adapter();
        db.connect().await.unwrap();
        db.set(&path!["l"], Some(json!([1, {"a": 2}]))).await.unwrap();
        db.set(&path!["l", 1, "a"], Some(json!(5))).await.unwrap();
        assert_eq!(client.keys(), vec!["l"]);
        assert_eq!(db.get(&path!["l"]).await.unwrap(), Some(json!([1, {"a": 5}])));
    }

    #[tokio::test]
    async fn test_separator_inside_segment_is_not_nesting() {
        let (client, db) = adapter();
        db.connect().await.unwrap();
        db.set(&path!["a.b"], Some(json!(1))).await.unwrap();
        db.set(&path!["a", "b"], Some(json!(2))).await.unwrap();
        assert_eq!(client.keys(), vec!["a.b", "a~1b"]);
        db.del(&path!["a"]).await.unwrap();
        assert_eq!(db.get(&path!["a.b"]).await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let (_, db) = adapter();
        assert!(db.get(&path!["x"]).await.is_err());
    }
}
