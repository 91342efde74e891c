//! Leaf-by-leaf copying between adapters
//!
//! A migration reads the source's whole tree, flattens it into leaves and
//! writes each leaf into the target individually. A failed leaf is recorded
//! and the job carries on.

use super::Database;
use crate::core::error::{Error, Result};
use crate::path::tree::flatten_leaves;
use crate::path::Path;
use crate::storage::Adapter;
use crate::system::metrics::Metrics;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default number of leaves written concurrently between progress reports
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Progress callback invoked after every batch
pub type ProgressFn = Arc<dyn Fn(MigrationProgress) + Send + Sync>;

/// Options for [`Database::migrate`] and [`Database::sync_all`]
#[derive(Clone)]
pub struct MigrateOptions {
    /// Delete everything in the target before copying
    pub clear: bool,
    /// Leaves written per batch
    pub batch_size: usize,
    /// Called after every batch
    pub progress: Option<ProgressFn>,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            clear: false,
            batch_size: DEFAULT_BATCH_SIZE,
            progress: None,
        }
    }
}

impl MigrateOptions {
    /// Clear the target first
    pub fn clear(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    /// Set the batch size (at least one)
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Report progress through `progress`
    pub fn on_progress(mut self, progress: impl Fn(MigrationProgress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }
}

impl std::fmt::Debug for MigrateOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrateOptions")
            .field("clear", &self.clear)
            .field("batch_size", &self.batch_size)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Snapshot passed to the progress callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationProgress {
    /// Leaves written so far
    pub migrated: usize,
    /// Leaves that failed so far
    pub errors: usize,
    /// Leaves in the source
    pub total: usize,
}

/// Result of one migration
#[derive(Debug, Default)]
pub struct MigrationReport {
    /// Leaves written
    pub migrated: usize,
    /// Leaves that failed
    pub errors: usize,
    /// One [`Error::MigrationLeaf`] per failed leaf
    pub failures: Vec<Error>,
}

impl MigrationReport {
    /// True if every leaf was copied
    pub fn is_complete(&self) -> bool {
        self.errors == 0
    }
}

impl Database {
    /// Copy every leaf of adapter `from` into adapter `to`
    pub async fn migrate(&self, from: usize, to: usize, options: &MigrateOptions) -> Result<MigrationReport> {
        if from == to {
            return Err(Error::invalid_input(format!("cannot migrate adapter {} onto itself", from)));
        }
        let (Some(source), Some(target)) = (self.adapter(from), self.adapter(to)) else {
            return Err(Error::invalid_input(format!(
                "migration {} -> {} is out of range for {} adapters",
                from,
                to,
                self.adapters().len()
            )));
        };
        self.ensure_connected().await?;

        let root = Path::root();
        let tree = source.get(&root).await?.unwrap_or_default();
        let leaves: Vec<_> = flatten_leaves(&root, &tree)
            .into_iter()
            .filter(|(path, _)| !path.is_root())
            .collect();
        let total = leaves.len();
        info!("Migrating {} leaves from {} to {}", total, source.name(), target.name());

        if options.clear {
            debug!("Clearing {} before migration", target.name());
            target.del(&root).await?;
        }

        let metrics = Metrics::global();
        let mut report = MigrationReport::default();
        for batch in leaves.chunks(options.batch_size.max(1)) {
            let written = join_all(batch.iter().map(|(path, value)| target.set(path, Some(value.clone())))).await;
            for ((path, _), result) in batch.iter().zip(written) {
                match result {
                    Ok(_) => {
                        report.migrated += 1;
                        metrics.migrated_leaves.inc();
                    }
                    Err(e) => {
                        warn!("Leaf {} failed to migrate: {}", path, e);
                        report.errors += 1;
                        metrics.migration_errors.inc();
                        report.failures.push(Error::MigrationLeaf {
                            path: path.to_string(),
                            source: Box::new(e),
                        });
                    }
                }
            }
            if let Some(progress) = &options.progress {
                progress(MigrationProgress {
                    migrated: report.migrated,
                    errors: report.errors,
                    total,
                });
            }
        }

        info!(
            "Migration {} -> {} finished: {} migrated, {} errors",
            source.name(),
            target.name(),
            report.migrated,
            report.errors
        );
        Ok(report)
    }

    /// Migrate from the primary into every other adapter in turn
    pub async fn sync_all(&self, options: &MigrateOptions) -> Result<Vec<MigrationReport>> {
        let mut reports = Vec::with_capacity(self.adapters().len().saturating_sub(1));
        for to in 1..self.adapters().len() {
            reports.push(self.migrate(0, to, options).await?);
        }
        Ok(reports)
    }
}
