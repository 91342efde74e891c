//! In-process JSON document store
//!
//! Understands dotted paths in either dialect (or only the ones it was
//! restricted to). Member names are `[A-Za-z0-9_~]+`; numeric members index
//! lists. Like the real servers, `set` only succeeds when the parent exists
//! and new documents can only be created at the root.

use super::{JsonClient, PathDialect, PathReply};
use crate::core::error::{Error, Result};
use crate::path::tree::{add_numbers, delete_in, get_in, get_in_mut, type_name};
use crate::path::Path;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Number, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Store {
    documents: DashMap<String, Value>,
    connected: AtomicBool,
}

/// JSON store kept in memory; clones share the same documents
#[derive(Debug, Clone)]
pub struct MemoryJsonClient {
    name: String,
    dialects: Vec<PathDialect>,
    inner: Arc<Store>,
}

impl MemoryJsonClient {
    /// Store understanding every dialect
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dialects: PathDialect::ALL.to_vec(),
            inner: Arc::new(Store::default()),
        }
    }

    /// Restrict the path syntaxes this store accepts
    pub fn with_dialects(mut self, dialects: &[PathDialect]) -> Self {
        self.dialects = dialects.to_vec();
        self
    }

    fn ensure_connected(&self) -> Result<()> {
        if !self.inner.connected.load(Ordering::Acquire) {
            return Err(Error::NotConnected(self.identity()));
        }
        Ok(())
    }

    fn syntax_error(&self, path: &str) -> Error {
        Error::backend(self.identity(), format!("unsupported path syntax `{}`", path))
    }

    /// Parse a dotted path into raw member names
    fn parse(&self, path: &str) -> Result<Vec<String>> {
        let body = if self.dialects.contains(&PathDialect::Standard) && path.starts_with('$') {
            &path[1..]
        } else if self.dialects.contains(&PathDialect::Legacy) && path.starts_with('.') {
            if path == "." {
                ""
            } else {
                path
            }
        } else {
            return Err(self.syntax_error(path));
        };
        if body.is_empty() {
            return Ok(Vec::new());
        }
        let Some(members) = body.strip_prefix('.') else {
            return Err(self.syntax_error(path));
        };
        members
            .split('.')
            .map(|member| {
                let valid = !member.is_empty()
                    && member.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '~');
                if valid {
                    Ok(member.to_string())
                } else {
                    Err(self.syntax_error(path))
                }
            })
            .collect()
    }
}

#[async_trait]
impl JsonClient for MemoryJsonClient {
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

    async fn json_get(&self, key: &str, path: &str) -> Result<PathReply<Value>> {
        self.ensure_connected()?;
        let members = self.parse(path)?;
        let Some(document) = self.inner.documents.get(key) else {
            return Ok(PathReply::NoMatch);
        };
        Ok(match get_in(&document, &members) {
            Some(value) => PathReply::Found(value.clone()),
            None => PathReply::NoMatch,
        })
    }

    async fn json_set(&self, key: &str, path: &str, value: &Value) -> Result<PathReply<()>> {
        self.ensure_connected()?;
        let members = self.parse(path)?;
        let Some((last, parents)) = members.split_last() else {
            self.inner.documents.insert(key.to_string(), value.clone());
            return Ok(PathReply::Found(()));
        };
        let Some(mut document) = self.inner.documents.get_mut(key) else {
            return Ok(PathReply::NoMatch);
        };
        Ok(match get_in_mut(&mut document, parents) {
            Some(Value::Object(map)) => {
                map.insert(last.clone(), value.clone());
                PathReply::Found(())
            }
            Some(Value::Array(items)) => match last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(slot) => {
                    *slot = value.clone();
                    PathReply::Found(())
                }
                None => PathReply::NoMatch,
            },
            _ => PathReply::NoMatch,
        })
    }

    async fn json_del(&self, key: &str, path: &str) -> Result<PathReply<()>> {
        self.ensure_connected()?;
        let members = self.parse(path)?;
        if members.is_empty() {
            return Ok(match self.inner.documents.remove(key) {
                Some(_) => PathReply::Found(()),
                None => PathReply::NoMatch,
            });
        }
        let Some(mut document) = self.inner.documents.get_mut(key) else {
            return Ok(PathReply::NoMatch);
        };
        Ok(match delete_in(&mut document, &members) {
            Some(_) => PathReply::Found(()),
            None => PathReply::NoMatch,
        })
    }

    async fn json_numincrby(&self, key: &str, path: &str, delta: &Number) -> Result<PathReply<Value>> {
        self.ensure_connected()?;
        let members = self.parse(path)?;
        let Some(mut document) = self.inner.documents.get_mut(key) else {
            return Ok(PathReply::NoMatch);
        };
        let Some(slot) = get_in_mut(&mut document, &members) else {
            return Ok(PathReply::NoMatch);
        };
        if !slot.is_number() {
            return Err(Error::backend(
                self.identity(),
                format!("expected number at `{}`, found {}", path, type_name(slot)),
            ));
        }
        let next = add_numbers(Some(&*slot), delta, &Path::from(path))?;
        *slot = next.clone();
        Ok(PathReply::Found(next))
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.ensure_connected()?;
        self.inner.documents.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.ensure_connected()?;
        Ok(self
            .inner
            .documents
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }
}
