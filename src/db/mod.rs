//! Multi-backend orchestrator
//!
//! [`Database`] puts an ordered list of adapters behind one path-addressed
//! API. Index 0 is the primary. Writes go to every adapter (or only the
//! primary), reads try adapters in order (or race them), and every operation
//! races a deadline at this boundary. Adapters are never locked against each
//! other: under partial failure they may diverge until [`Database::migrate`]
//! or [`Database::sync_all`] repairs them.

pub mod migrate;

pub use migrate::{MigrateOptions, MigrationProgress, MigrationReport};

use crate::core::error::{Error, Result};
use crate::path::Path;
use crate::storage::Adapter;
use crate::system::metrics::{Metrics, Timer};
use futures::future::{join_all, select_ok};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Orchestrator construction options. Timeouts are milliseconds; 0 disables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseOptions {
    /// Send writes to every adapter instead of only the primary
    pub write_all: bool,

    /// Try adapters in order on reads instead of racing them
    pub read_first: bool,

    /// Fail writes and `connect` when the primary fails
    pub fail_on_primary_error: bool,

    /// Connect on first use instead of failing with `NotConnected`
    pub lazy_connect: bool,

    /// Budget for any operation without a more specific one
    pub timeout: u64,

    /// Budget for reads, overriding `timeout`
    pub read_timeout: Option<u64>,

    /// Budget for writes, overriding `timeout`
    pub write_timeout: Option<u64>,

    /// Budget for `connect`, overriding `timeout`
    pub connect_timeout: Option<u64>,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            write_all: true,
            read_first: true,
            fail_on_primary_error: true,
            lazy_connect: true,
            timeout: 0,
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
        }
    }
}

impl DatabaseOptions {
    /// Deadline for reads, `None` when disabled
    pub fn read_budget(&self) -> Option<Duration> {
        budget(self.read_timeout, self.timeout)
    }

    /// Deadline for writes, `None` when disabled
    pub fn write_budget(&self) -> Option<Duration> {
        budget(self.write_timeout, self.timeout)
    }

    /// Deadline for `connect`, `None` when disabled
    pub fn connect_budget(&self) -> Option<Duration> {
        budget(self.connect_timeout, self.timeout)
    }
}

fn budget(specific: Option<u64>, general: u64) -> Option<Duration> {
    match specific.unwrap_or(general) {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    }
}

/// Connection lifecycle of a [`Database`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or the last attempt failed
    Unconnected,
    /// A connect is in flight
    Connecting,
    /// At least the required adapters are connected
    Connected,
    /// Explicitly disconnected; a later operation may reconnect
    Disconnected,
}

/// Outcome of [`Database::connect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectReport {
    /// Adapters that connected
    pub connected: usize,
    /// Adapters configured
    pub total: usize,
}

/// Ordered set of adapters behind one path-addressed API
pub struct Database {
    adapters: Vec<Arc<dyn Adapter>>,
    options: DatabaseOptions,
    state: parking_lot::Mutex<ConnectionState>,
    connecting: tokio::sync::Mutex<()>,
}

/// Update callback for [`Database::upd`]. It runs once, on the adapter whose
/// result is then mirrored to the others.
pub type SharedUpdateFn = Arc<dyn Fn(Option<Value>) -> Option<Value> + Send + Sync>;

impl Database {
    /// Build an orchestrator over `adapters`; index 0 is the primary
    pub fn new(adapters: Vec<Arc<dyn Adapter>>, options: DatabaseOptions) -> Result<Self> {
        if adapters.is_empty() {
            return Err(Error::invalid_input("a database needs at least one adapter"));
        }
        debug!(
            "Database over [{}] with {:?}",
            adapters.iter().map(|a| a.name()).collect::<Vec<_>>().join(", "),
            options
        );
        Ok(Self {
            adapters,
            options,
            state: parking_lot::Mutex::new(ConnectionState::Unconnected),
            connecting: tokio::sync::Mutex::new(()),
        })
    }

    /// Single-adapter database with default options
    pub fn single(adapter: Arc<dyn Adapter>) -> Self {
        Self {
            adapters: vec![adapter],
            options: DatabaseOptions::default(),
            state: parking_lot::Mutex::new(ConnectionState::Unconnected),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    /// Options this database was built with
    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Adapter at `index`
    pub fn adapter(&self, index: usize) -> Option<&Arc<dyn Adapter>> {
        self.adapters.get(index)
    }

    /// All adapters in priority order
    pub fn adapters(&self) -> &[Arc<dyn Adapter>] {
        &self.adapters
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock() = next;
    }

    /// Connect every adapter in parallel.
    ///
    /// Partial failure is tolerated unless the primary fails and
    /// `fail_on_primary_error` is set, or nothing connects at all.
    pub async fn connect(&self) -> Result<ConnectReport> {
        let _guard = self.connecting.lock().await;
        self.connect_locked().await
    }

    async fn connect_locked(&self) -> Result<ConnectReport> {
        self.set_state(ConnectionState::Connecting);
        let adapters = self.adapters.clone();
        let attempt = async move { Ok::<_, Error>(join_all(adapters.iter().map(|adapter| adapter.connect())).await) };

        let results = match deadline("connect", self.options.connect_budget(), attempt).await {
            Ok(results) => results,
            Err(e) => {
                self.set_state(ConnectionState::Unconnected);
                Metrics::global().record("connect", false);
                return Err(e);
            }
        };

        let total = results.len();
        let mut connected = 0;
        let mut primary_error = None;
        let mut last_error = None;
        for (index, (adapter, result)) in self.adapters.iter().zip(results).enumerate() {
            match result {
                Ok(()) => connected += 1,
                Err(e) => {
                    warn!("Adapter {} failed to connect: {}", adapter.name(), e);
                    if index == 0 {
                        primary_error = Some(e);
                    } else {
                        last_error = Some(e);
                    }
                }
            }
        }

        let failure = match primary_error {
            Some(e) if self.options.fail_on_primary_error => Some(e),
            Some(e) if connected == 0 => Some(all_failed("connect", total, Some(e))),
            _ if connected == 0 => Some(all_failed("connect", total, last_error)),
            _ => None,
        };
        if let Some(e) = failure {
            self.set_state(ConnectionState::Unconnected);
            Metrics::global().record("connect", false);
            return Err(e);
        }

        self.set_state(ConnectionState::Connected);
        Metrics::global().record("connect", true);
        info!("Connected {}/{} adapters", connected, total);
        Ok(ConnectReport { connected, total })
    }

    /// Disconnect every adapter; failures are logged, the first is returned
    pub async fn disconnect(&self) -> Result<()> {
        let _guard = self.connecting.lock().await;
        let results = join_all(self.adapters.iter().map(|adapter| adapter.disconnect())).await;
        self.set_state(ConnectionState::Disconnected);
        info!("Disconnected {} adapters", self.adapters.len());

        let mut first = None;
        for (adapter, result) in self.adapters.iter().zip(results) {
            if let Err(e) = result {
                warn!("Adapter {} failed to disconnect: {}", adapter.name(), e);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Connect lazily, or fail when lazy connect is off
    pub(crate) async fn ensure_connected(&self) -> Result<()> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        if !self.options.lazy_connect {
            return Err(Error::NotConnected(format!(
                "database is {:?} and lazy connect is disabled",
                self.state()
            )));
        }
        let _guard = self.connecting.lock().await;
        // Someone else may have connected while we waited
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        debug!("Connecting lazily");
        self.connect_locked().await.map(|_| ())
    }

    /// Value at `path`, or `None`
    pub async fn get(&self, path: &Path) -> Result<Option<Value>> {
        let path = path.clone();
        self.read("get", move |adapter| {
            let path = path.clone();
            async move { adapter.get(&path).await }
        })
        .await
    }

    /// True if a value exists at `path`
    pub async fn has(&self, path: &Path) -> Result<bool> {
        let path = path.clone();
        self.read("has", move |adapter| {
            let path = path.clone();
            async move { adapter.has(&path).await }
        })
        .await
    }

    /// Keys of the map (or indexes of the list) at `path`
    pub async fn keys(&self, path: &Path) -> Result<Vec<String>> {
        let path = path.clone();
        self.read("keys", move |adapter| {
            let path = path.clone();
            async move { adapter.keys(&path).await }
        })
        .await
    }

    /// Children of the map or list at `path`
    pub async fn values(&self, path: &Path) -> Result<Vec<Value>> {
        let path = path.clone();
        self.read("values", move |adapter| {
            let path = path.clone();
            async move { adapter.values(&path).await }
        })
        .await
    }

    /// `(key, child)` pairs at `path`
    pub async fn entries(&self, path: &Path) -> Result<Vec<(String, Value)>> {
        let path = path.clone();
        self.read("entries", move |adapter| {
            let path = path.clone();
            async move { adapter.entries(&path).await }
        })
        .await
    }

    /// Number of children at `path`
    pub async fn len(&self, path: &Path) -> Result<usize> {
        let path = path.clone();
        self.read("len", move |adapter| {
            let path = path.clone();
            async move { adapter.len(&path).await }
        })
        .await
    }

    /// Store `value` at `path`; `None` deletes
    pub async fn set(&self, path: &Path, value: Option<Value>) -> Result<Path> {
        let path = path.clone();
        self.write("set", move |adapter| {
            let path = path.clone();
            let value = value.clone();
            async move { adapter.set(&path, value).await }
        })
        .await
    }

    /// Delete `path` and everything beneath it
    pub async fn del(&self, path: &Path) -> Result<()> {
        let path = path.clone();
        self.write("del", move |adapter| {
            let path = path.clone();
            async move { adapter.del(&path).await }
        })
        .await
    }

    /// Add `delta` to the number at `path`
    pub async fn inc(&self, path: &Path, delta: impl Into<Number>) -> Result<Path> {
        let path = path.clone();
        let delta = delta.into();
        self.write("inc", move |adapter| {
            let path = path.clone();
            let delta = delta.clone();
            async move { adapter.inc(&path, &delta).await }
        })
        .await
    }

    /// Subtract `delta` from the number at `path`
    pub async fn dec(&self, path: &Path, delta: impl Into<Number>) -> Result<Path> {
        let path = path.clone();
        let delta = delta.into();
        self.write("dec", move |adapter| {
            let path = path.clone();
            let delta = delta.clone();
            async move { adapter.dec(&path, &delta).await }
        })
        .await
    }

    /// Remove and return the last element of the list at `path`
    pub async fn pop(&self, path: &Path) -> Result<Option<Value>> {
        let path = path.clone();
        self.write("pop", move |adapter| {
            let path = path.clone();
            async move { adapter.pop(&path).await }
        })
        .await
    }

    /// Remove and return the first element of the list at `path`
    pub async fn shift(&self, path: &Path) -> Result<Option<Value>> {
        let path = path.clone();
        self.write("shift", move |adapter| {
            let path = path.clone();
            async move { adapter.shift(&path).await }
        })
        .await
    }

    /// Store `value` under a fresh identifier beneath `parent`.
    ///
    /// The identifier is drawn by the first adapter that accepts the value;
    /// the same path is then written to the others.
    pub async fn add(&self, parent: &Path, value: Value) -> Result<Path> {
        let parent = parent.clone();
        self.replicate("add", move |adapter| {
            let parent = parent.clone();
            let value = value.clone();
            async move {
                let path = adapter.add(&parent, value.clone()).await?;
                Ok((path, Some(value)))
            }
        })
        .await
    }

    /// Atomic read-modify-write.
    ///
    /// `update` runs on the first adapter that accepts it and its result is
    /// written to the others, so every adapter ends up with the same value.
    pub async fn upd(&self, path: &Path, update: SharedUpdateFn) -> Result<Path> {
        let path = path.clone();
        self.replicate("upd", move |adapter| {
            let path = path.clone();
            let update = update.clone();
            async move {
                let outcome = Arc::new(parking_lot::Mutex::new(None));
                let seen = outcome.clone();
                let once: crate::storage::UpdateFn = Box::new(move |current| {
                    let next = update(current);
                    *seen.lock() = Some(next.clone());
                    next
                });
                let path = adapter.upd(&path, once).await?;
                let next = outcome.lock().take().flatten();
                Ok((path, next))
            }
        })
        .await
    }

    async fn read<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn Adapter>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_connected().await?;
        let timer = Metrics::global().timer(operation);
        let adapters = self.adapters.clone();
        let read_first = self.options.read_first;

        let fan_in = async move {
            if read_first {
                first_success(operation, &adapters, &op).await
            } else {
                race(operation, &adapters, &op).await
            }
        };
        let result = deadline(operation, self.options.read_budget(), fan_in).await;
        finish(operation, timer, &result);
        result
    }

    async fn write<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn Adapter>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_connected().await?;
        let timer = Metrics::global().timer(operation);
        let adapters = self.adapters.clone();
        let write_all = self.options.write_all;
        let fatal = self.options.fail_on_primary_error;

        let fan_out = async move {
            if !write_all || adapters.len() == 1 {
                return op(adapters[0].clone()).await;
            }
            let results = join_all(adapters.iter().map(|adapter| op(adapter.clone()))).await;
            settle(operation, &adapters, results, fatal)
        };
        let result = deadline(operation, self.options.write_budget(), fan_out).await;
        finish(operation, timer, &result);
        result
    }

    /// Run `origin` on adapters in order until one succeeds, then mirror the
    /// `(path, value)` it reports to every later adapter with `set`.
    async fn replicate<F, Fut>(&self, operation: &'static str, origin: F) -> Result<Path>
    where
        F: Fn(Arc<dyn Adapter>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(Path, Option<Value>)>> + Send + 'static,
    {
        self.ensure_connected().await?;
        let timer = Metrics::global().timer(operation);
        let adapters = self.adapters.clone();
        let write_all = self.options.write_all;
        let fatal = self.options.fail_on_primary_error;

        let fan_out = async move {
            let mut origin_at = None;
            let mut first_error = None;
            for (index, adapter) in adapters.iter().enumerate() {
                match origin(adapter.clone()).await {
                    Ok(outcome) => {
                        origin_at = Some((index, outcome));
                        break;
                    }
                    Err(e) if index == 0 && (fatal || !write_all) => return Err(e),
                    Err(e) => {
                        warn!("`{}` failed on {}: {}", operation, adapter.name(), e);
                        first_error.get_or_insert(e);
                    }
                }
            }

            let Some((index, (path, value))) = origin_at else {
                return Err(all_failed(operation, adapters.len(), first_error));
            };
            if write_all {
                for adapter in &adapters[index + 1..] {
                    if let Err(e) = adapter.set(&path, value.clone()).await {
                        Metrics::global().replica_failures.inc();
                        warn!("Mirroring `{}` to {} failed: {}", operation, adapter.name(), e);
                    }
                }
            }
            Ok(path)
        };
        let result = deadline(operation, self.options.write_budget(), fan_out).await;
        finish(operation, timer, &result);
        result
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("adapters", &self.adapters.iter().map(|a| a.name().to_string()).collect::<Vec<_>>())
            .field("options", &self.options)
            .field("state", &self.state())
            .finish()
    }
}

/// Race `op` against `budget`.
///
/// The operation runs as its own task so that expiry only abandons the wait;
/// the underlying work carries on and its outcome is unknown to the caller.
async fn deadline<T, F>(operation: &'static str, budget: Option<Duration>, op: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let Some(budget) = budget else {
        return op.await;
    };
    let task = tokio::spawn(op);
    match tokio::time::timeout(budget, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(Error::internal(format!("`{}` task failed: {}", operation, e))),
        Err(_) => {
            Metrics::global().timeouts.with_label_values(&[operation]).inc();
            warn!("`{}` exceeded its {}ms budget", operation, budget.as_millis());
            Err(Error::Timeout {
                operation: operation.to_string(),
                budget,
            })
        }
    }
}

async fn first_success<T, F, Fut>(operation: &'static str, adapters: &[Arc<dyn Adapter>], op: &F) -> Result<T>
where
    F: Fn(Arc<dyn Adapter>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;
    for (index, adapter) in adapters.iter().enumerate() {
        match op(adapter.clone()).await {
            Ok(value) => {
                if index > 0 {
                    Metrics::global().read_fallbacks.inc();
                    info!("`{}` served by fallback adapter {}", operation, adapter.name());
                }
                return Ok(value);
            }
            Err(e) => {
                debug!("`{}` failed on {}: {}", operation, adapter.name(), e);
                last_error = Some(e);
            }
        }
    }
    Err(all_failed(operation, adapters.len(), last_error))
}

/// First adapter to succeed; failures only surface when every adapter fails
async fn race<T, F, Fut>(operation: &'static str, adapters: &[Arc<dyn Adapter>], op: &F) -> Result<T>
where
    F: Fn(Arc<dyn Adapter>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = adapters.iter().map(|adapter| Box::pin(op(adapter.clone())));
    match select_ok(attempts).await {
        Ok((value, _rest)) => Ok(value),
        Err(last) => Err(all_failed(operation, adapters.len(), Some(last))),
    }
}

/// Pick the result of a write-all fan-out
fn settle<T>(operation: &str, adapters: &[Arc<dyn Adapter>], results: Vec<Result<T>>, fatal: bool) -> Result<T> {
    let mut results = adapters.iter().zip(results);
    let Some((primary, primary_result)) = results.next() else {
        return Err(Error::internal(format!("`{}` reached no adapter", operation)));
    };

    let mut fallback = None;
    for (adapter, result) in results {
        match result {
            Ok(value) => {
                fallback.get_or_insert(value);
            }
            Err(e) => {
                Metrics::global().replica_failures.inc();
                warn!("`{}` failed on {}: {}", operation, adapter.name(), e);
            }
        }
    }

    match (primary_result, fallback) {
        (Ok(value), _) => Ok(value),
        (Err(e), _) if fatal => Err(e),
        (Err(e), Some(value)) => {
            warn!("`{}` failed on primary {}: {}", operation, primary.name(), e);
            Ok(value)
        }
        (Err(e), None) => Err(e),
    }
}

/// A single adapter's error passes through unchanged; several are aggregated
fn all_failed(operation: &str, attempted: usize, last: Option<Error>) -> Error {
    match last {
        Some(e) if attempted == 1 => e,
        Some(e) => Error::AllBackendsFailed {
            operation: operation.to_string(),
            attempted,
            last: Box::new(e),
        },
        None => Error::internal(format!("`{}` reached no adapter", operation)),
    }
}

fn finish<T>(operation: &str, timer: Timer, result: &Result<T>) {
    timer.finish();
    Metrics::global().record(operation, result.is_ok());
}
