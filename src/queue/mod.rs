//! Per-backend operation queue
//!
//! Every physical store owns exactly one [`OpQueue`]. Compound operations
//! (increment, update-by-function, append-with-id, pop, shift) and plain
//! writes are funneled through it so at most one of them is in flight per
//! store. The gate is a fair `tokio` mutex, so waiters run in submission
//! order, and a failing operation releases it like any other.

pub mod file_lock;

pub use file_lock::{FileLock, LockOptions};

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// FIFO serialization primitive for one physical backend instance
#[derive(Debug, Default)]
pub struct OpQueue {
    gate: Mutex<()>,
    pending: AtomicUsize,
}

/// Decrements the pending counter even when the operation is dropped mid-flight
struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl OpQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` once every previously enqueued operation has finished.
    ///
    /// The future is not polled before its turn, so any reads it performs
    /// observe the effects of all earlier operations.
    pub async fn enqueue<F, T>(&self, op: F) -> T
    where
        F: Future<Output = T>,
    {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let _pending = PendingGuard(&self.pending);
        let _turn = self.gate.lock().await;
        op.await
    }

    /// Operations queued or running right now
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// True when nothing is queued or running
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }
}
