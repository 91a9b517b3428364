//! Ingest buffer between the receive loop and the flush scheduler
//!
//! The receive loop appends, the scheduler drains. Once the open batch reaches
//! `max_size` the append that filled it seals it into a bounded queue the
//! scheduler consumes, so the open batch never grows past the limit while a
//! write is in flight. The mutex guards only the push, the swap and the
//! non-blocking enqueue, never any I/O.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use lobrec_schema::OrderBookUpdate;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::error;

use crate::metrics;

/// Updates accumulated between two flushes. Immutable once drained.
#[derive(Debug, Default)]
pub struct Batch {
    updates: Vec<OrderBookUpdate>,
}

impl Batch {
    pub(crate) fn from_updates(updates: Vec<OrderBookUpdate>) -> Self {
        Self { updates }
    }

    pub fn updates(&self) -> &[OrderBookUpdate] {
        &self.updates
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Channel of the first update, which names the output file.
    pub fn channel(&self) -> Option<&str> {
        self.updates.first().map(|u| u.channel())
    }

    /// Local time range covered, in receipt order.
    pub fn local_time_range(&self) -> Option<(i64, i64)> {
        let first = self.updates.first()?.local_time();
        let last = self.updates.last()?.local_time();
        Some((first, last))
    }

    /// Split into one batch per channel, keeping receipt order inside each.
    pub fn into_channel_groups(self) -> Vec<Batch> {
        let mut groups: Vec<Batch> = Vec::new();
        for update in self.updates {
            match groups
                .iter_mut()
                .find(|g| g.channel() == Some(update.channel()))
            {
                Some(group) => group.updates.push(update),
                None => groups.push(Batch::from_updates(vec![update])),
            }
        }
        groups
    }

    /// SHA-256 over the JSON encoding of every update, for manual recovery audits.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for update in &self.updates {
            match serde_json::to_vec(update) {
                Ok(bytes) => hasher.update(&bytes),
                Err(_) => hasher.update(format!("{:?}", update).as_bytes()),
            }
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Receiving end of the sealed-batch queue, owned by the flush scheduler.
pub type SealedBatches = mpsc::Receiver<Batch>;

pub struct IngestBuffer {
    open: Mutex<Vec<OrderBookUpdate>>,
    max_size: usize,
    max_sealed: usize,
    sealed: mpsc::Sender<Batch>,
    overflowed: AtomicU64,
}

impl IngestBuffer {
    /// Buffer sealing at `max_size` updates, with room for `max_sealed`
    /// sealed batches waiting on the scheduler.
    pub fn new(max_size: usize, max_sealed: usize) -> (Self, SealedBatches) {
        let max_sealed = max_sealed.max(1);
        let (sealed, rx) = mpsc::channel(max_sealed);
        let buffer = Self {
            open: Mutex::new(Vec::new()),
            max_size: max_size.max(1),
            max_sealed,
            sealed,
            overflowed: AtomicU64::new(0),
        };
        (buffer, rx)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<OrderBookUpdate>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fresh(&self) -> Vec<OrderBookUpdate> {
        Vec::with_capacity(self.max_size.min(4096))
    }

    /// Add an update to the open batch. Returns the open batch size afterwards.
    ///
    /// The append that brings the open batch to `max_size` seals it and hands
    /// it to the scheduler. If the sealed queue is full the batch is dropped
    /// and logged with its digest; the receive path never waits on disk.
    pub fn append(&self, update: OrderBookUpdate) -> usize {
        let mut open = self.lock();
        open.push(update);
        if open.len() < self.max_size {
            return open.len();
        }

        let batch = Batch::from_updates(std::mem::replace(&mut *open, self.fresh()));
        // Enqueued under the lock so a concurrent drain cannot overtake it.
        let rejected = match self.sealed.try_send(batch) {
            Ok(()) => None,
            Err(TrySendError::Full(batch)) | Err(TrySendError::Closed(batch)) => Some(batch),
        };
        drop(open);

        if let Some(batch) = rejected {
            self.discard(batch);
        }
        0
    }

    fn discard(&self, batch: Batch) {
        self.overflowed.fetch_add(1, Ordering::Relaxed);
        metrics::inc_unrecoverable_batch();
        let (first_local_time, last_local_time) = batch.local_time_range().unwrap_or_default();
        error!(
            rows = batch.len(),
            max_sealed = self.max_sealed,
            first_local_time,
            last_local_time,
            digest = %batch.digest(),
            "Sealed batch queue full; batch dropped"
        );
    }

    /// Seal the open batch and swap in a fresh one.
    pub fn drain(&self) -> Batch {
        let fresh = self.fresh();
        let sealed = std::mem::replace(&mut *self.lock(), fresh);
        Batch::from_updates(sealed)
    }

    /// Updates in the open batch.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Sealed batches waiting for the scheduler.
    pub fn sealed_pending(&self) -> usize {
        self.max_sealed - self.sealed.capacity()
    }

    /// Sealed batches dropped because the queue was full.
    pub fn overflowed_batches(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }
}
