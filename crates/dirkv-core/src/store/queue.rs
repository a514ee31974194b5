//! Per-path operation ordering.
//!
//! Every canonical path owns a strict FIFO queue. The queue is never
//! materialized as a list: each slot keeps the receiver of the slot issued
//! before it and the sender its successor will wait on, so the table only has
//! to remember the most recent slot per path.
//!
//! # Ordering
//!
//! - A slot is reserved synchronously by [`OperationQueues::enqueue`], so queue
//!   order is the caller's issue order even if futures are polled out of order.
//! - A slot's turn comes when its predecessor is dropped, whether that
//!   operation succeeded, failed or was cancelled.
//! - The table entry for a path is removed when its latest slot drops, so idle
//!   paths cost nothing.
//!
//! # Deadlock Prevention
//!
//! An operation only ever waits on its own slot and on slots of strict
//! ancestors of its path (while converting or waiting for a conversion), and
//! it releases an ancestor slot as soon as the conversion is done.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::metrics::StoreMetrics;
use super::path::CanonicalPath;

/// Latest reserved slot for a path.
#[derive(Debug)]
struct QueueTail {
    seq: u64,
    finished: oneshot::Receiver<()>,
}

/// Table of per-path queues owned by one store instance.
#[derive(Debug)]
pub struct OperationQueues {
    tails: Arc<DashMap<CanonicalPath, QueueTail>>,
    next_seq: AtomicU64,
    metrics: Arc<StoreMetrics>,
}

impl OperationQueues {
    pub fn new(metrics: Arc<StoreMetrics>) -> Self {
        Self {
            tails: Arc::new(DashMap::new()),
            next_seq: AtomicU64::new(0),
            metrics,
        }
    }

    /// Reserve the next slot in `path`'s queue.
    ///
    /// The slot must be awaited with [`QueueSlot::wait_turn`] before touching
    /// the path; dropping it hands the turn to the next slot.
    pub fn enqueue(&self, path: &CanonicalPath) -> QueueSlot {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (finished_tx, finished_rx) = oneshot::channel();

        let predecessor = self
            .tails
            .insert(path.clone(), QueueTail { seq, finished: finished_rx })
            .map(|tail| tail.finished);

        self.metrics.record_operation_queued();
        if predecessor.is_some() {
            self.metrics.record_queue_wait();
        }
        trace!(path = %path, seq, queued_behind = predecessor.is_some(), "Reserved queue slot");

        QueueSlot {
            tails: Arc::clone(&self.tails),
            path: path.clone(),
            seq,
            predecessor,
            _finished: finished_tx,
        }
    }

    /// Number of paths with at least one outstanding slot.
    pub fn len(&self) -> usize {
        self.tails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tails.is_empty()
    }
}

/// A reserved position in a path's queue.
///
/// Dropping the slot releases the path to the next operation.
#[derive(Debug)]
pub struct QueueSlot {
    tails: Arc<DashMap<CanonicalPath, QueueTail>>,
    path: CanonicalPath,
    seq: u64,
    predecessor: Option<oneshot::Receiver<()>>,
    _finished: oneshot::Sender<()>,
}

impl QueueSlot {
    /// Wait until every earlier slot on this path has been released.
    pub async fn wait_turn(&mut self) {
        if let Some(predecessor) = self.predecessor.take() {
            debug!(path = %self.path, seq = self.seq, "Waiting for earlier operation on path");
            // The sender is dropped, never sent on; either outcome means done.
            let _ = predecessor.await;
        }
    }

    #[inline]
    pub fn path(&self) -> &CanonicalPath {
        &self.path
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        let seq = self.seq;
        self.tails.remove_if(&self.path, |_, tail| tail.seq == seq);
    }
}
