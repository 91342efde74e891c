//! Shared adapter state keyed by storage target
//!
//! Two adapters addressing the same file, table, collection or namespace must
//! share one in-memory state and one [`OpQueue`](crate::queue::OpQueue),
//! otherwise the queue would not serialize everyone touching that store. The
//! registry hands out that shared state. A process-wide instance is used by
//! default; tests inject their own or call [`AdapterRegistry::clear`].

use crate::core::error::{Error, Result};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type Shared = Arc<dyn Any + Send + Sync>;

/// Registry of per-target shared state
#[derive(Default)]
pub struct AdapterRegistry {
    entries: DashMap<String, Shared>,
}

static GLOBAL: Lazy<Arc<AdapterRegistry>> = Lazy::new(|| Arc::new(AdapterRegistry::new()));

impl AdapterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry
    pub fn global() -> Arc<AdapterRegistry> {
        GLOBAL.clone()
    }

    /// Fetch the state registered for `target`, creating it with `init` on first use
    pub fn shared<T, F>(&self, target: &str, init: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let entry = self
            .entries
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(init()) as Shared)
            .clone();
        entry.downcast::<T>().map_err(|_| {
            Error::internal(format!("Target `{}` is registered with a different state type", target))
        })
    }

    /// True if `target` has shared state
    pub fn contains(&self, target: &str) -> bool {
        self.entries.contains_key(target)
    }

    /// Number of registered targets
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget one target; live adapters keep their state
    pub fn remove(&self, target: &str) -> bool {
        self.entries.remove(target).is_some()
    }

    /// Forget every target
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("targets", &self.entries.len())
            .finish()
    }
}

/// Canonical identity for a file target that may not exist yet.
///
/// The parent directory is canonicalised when possible so `./a/../db.json`
/// and `db.json` share one entry.
pub fn canonical_file(file: &Path) -> PathBuf {
    let absolute = if file.is_absolute() {
        file.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(file))
            .unwrap_or_else(|_| file.to_path_buf())
    };
    match (absolute.parent(), absolute.file_name()) {
        (Some(dir), Some(name)) => dir
            .canonicalize()
            .map(|dir| dir.join(name))
            .unwrap_or_else(|_| absolute.clone()),
        _ => absolute,
    }
}
