//! Whole-tree adapter backed by a single file
//!
//! The tree lives in memory and every mutation rewrites the file atomically
//! (temp file in the same directory, fsync, rename). In multi-process mode
//! each queued mutation takes the sibling `.lock` file, reloads the file,
//! applies the change and persists before releasing, and plain reads reload
//! first, so cooperating processes never lose each other's updates.

use super::codec::{JsonCodec, ValueCodec};
use super::ids::IdGenerator;
use super::registry::{canonical_file, AdapterRegistry};
use super::{root_map, Adapter};
use crate::core::error::{Error, Result};
use crate::path::tree::{delete_in, get_in, set_in};
use crate::path::Path;
use crate::queue::{FileLock, LockOptions, OpQueue};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Options for [`TreeAdapter`]
#[derive(Debug, Clone)]
pub struct TreeOptions {
    /// File holding the encoded tree
    pub file: PathBuf,
    /// Coordinate with other processes through a lock file
    pub multiprocess: bool,
    /// Encoding of the file contents
    pub codec: Arc<dyn ValueCodec>,
    /// Identifier generator for `add`
    pub ids: IdGenerator,
    /// Lock retry tuning (multi-process mode only)
    pub lock: LockOptions,
    /// Registry the shared state is looked up in
    pub registry: Arc<AdapterRegistry>,
}

impl TreeOptions {
    /// Single-process JSON file with default settings
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            multiprocess: false,
            codec: Arc::new(JsonCodec::default()),
            ids: IdGenerator::default(),
            lock: LockOptions::default(),
            registry: AdapterRegistry::global(),
        }
    }

    /// Enable or disable cross-process coordination
    pub fn multiprocess(mut self, enabled: bool) -> Self {
        self.multiprocess = enabled;
        self
    }

    /// Use another file encoding
    pub fn codec(mut self, codec: Arc<dyn ValueCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Use another registry (tests, isolated instances)
    pub fn registry(mut self, registry: Arc<AdapterRegistry>) -> Self {
        self.registry = registry;
        self
    }
}

/// State shared by every adapter opened on the same file
#[derive(Debug, Default)]
struct TreeState {
    queue: OpQueue,
    tree: RwLock<Value>,
    loaded: OnceCell<()>,
    held: Mutex<Option<FileLock>>,
}

/// Adapter keeping the whole tree in one file
#[derive(Debug)]
pub struct TreeAdapter {
    name: String,
    file: PathBuf,
    multiprocess: bool,
    codec: Arc<dyn ValueCodec>,
    ids: IdGenerator,
    lock: LockOptions,
    state: Arc<TreeState>,
}

impl TreeAdapter {
    /// Open (lazily) the tree stored in `options.file`
    pub fn new(options: TreeOptions) -> Result<Self> {
        let file = canonical_file(&options.file);
        let name = format!("tree:{}", file.display());
        let state = options.registry.shared(&name, TreeState::default)?;
        Ok(Self {
            name,
            file,
            multiprocess: options.multiprocess,
            codec: options.codec,
            ids: options.ids,
            lock: options.lock,
            state,
        })
    }

    /// Backing file
    pub fn file(&self) -> &FsPath {
        &self.file
    }

    async fn ensure_loaded(&self) -> Result<()> {
        self.state
            .loaded
            .get_or_try_init(|| async { self.reload().await })
            .await?;
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let tree = match tokio::fs::read(&self.file).await {
            Ok(bytes) if bytes.is_empty() => Value::Object(Map::new()),
            Ok(bytes) => self.codec.decode(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Object(Map::new()),
            Err(e) => return Err(e.into()),
        };
        if !tree.is_object() {
            return Err(Error::backend(&self.name, "file does not hold a map at the root"));
        }
        *self.state.tree.write() = tree;
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        self.ensure_loaded().await?;
        if self.multiprocess && self.state.held.lock().is_none() {
            self.reload().await?;
        }
        Ok(())
    }

    /// Persist `next` and only then make it the in-memory tree
    async fn commit(&self, next: Value) -> Result<()> {
        let bytes = self.codec.encode(&next)?;
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || write_atomic(&file, &bytes))
            .await
            .map_err(|e| Error::internal(format!("Persist task failed: {}", e)))??;
        *self.state.tree.write() = next;
        Ok(())
    }

    fn snapshot(&self) -> Value {
        self.state.tree.read().clone()
    }
}

fn write_atomic(file: &FsPath, bytes: &[u8]) -> Result<()> {
    let dir = file
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| FsPath::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(file).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl Adapter for TreeAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue(&self) -> &OpQueue {
        &self.state.queue
    }

    fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    async fn connect(&self) -> Result<()> {
        self.ensure_loaded().await?;
        info!(
            "Opened {} ({} codec, multiprocess: {})",
            self.name,
            self.codec.name(),
            self.multiprocess
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.held.lock().take();
        debug!("Closed {}", self.name);
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<Option<Value>> {
        self.refresh().await?;
        let tree = self.state.tree.read();
        Ok(get_in(&tree, path.segments()).cloned())
    }

    async fn write(&self, path: &Path, value: Value) -> Result<()> {
        self.refresh().await?;
        let next = if path.is_root() {
            Value::Object(root_map(&self.name, value)?)
        } else {
            let mut next = self.snapshot();
            set_in(&mut next, path.segments(), value)?;
            next
        };
        self.commit(next).await
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        self.refresh().await?;
        let mut next = self.snapshot();
        if delete_in(&mut next, path.segments()).is_none() {
            return Ok(());
        }
        self.commit(next).await
    }

    async fn begin_exclusive(&self) -> Result<()> {
        self.ensure_loaded().await?;
        if !self.multiprocess {
            return Ok(());
        }
        let lock = FileLock::acquire(&self.file, &self.lock).await?;
        *self.state.held.lock() = Some(lock);
        // Another process may have written since our last look
        if let Err(e) = self.reload().await {
            self.state.held.lock().take();
            return Err(e);
        }
        Ok(())
    }

    async fn end_exclusive(&self) -> Result<()> {
        self.state.held.lock().take();
        Ok(())
    }
}
