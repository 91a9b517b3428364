//! Flush scheduler
//!
//! Drains the ingest buffer on a fixed interval, persists batches the buffer
//! sealed at its size limit as soon as they arrive, and drains once more on
//! shutdown. Both paths share one write path. Writes run on the blocking pool
//! so the receive loop never waits on disk.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{Batch, IngestBuffer, SealedBatches};
use crate::config::Config;
use crate::error::RecorderError;
use crate::metrics;
use crate::parquet_writer::{ColumnarWriter, FileEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Timer,
    BufferFull,
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Timer => "timer",
            FlushTrigger::BufferFull => "buffer_full",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// Where one channel group of a batch ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum Persisted {
    Primary(FileEntry),
    Fallback(FileEntry),
    /// Neither location accepted the rows.
    Lost { rows: usize, digest: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlushReport {
    pub trigger: FlushTrigger,
    pub rows: usize,
    pub persisted: Vec<Persisted>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub flushes: u64,
    pub eager_flushes: u64,
    pub files_written: u64,
    pub rows_written: u64,
    pub fallback_files: u64,
    /// Batches that reached no directory, including ones dropped by a full sealed queue.
    pub lost_batches: u64,
}

impl FlushStats {
    fn record(&mut self, report: &FlushReport) {
        self.flushes += 1;
        if report.trigger == FlushTrigger::BufferFull {
            self.eager_flushes += 1;
        }
        for persisted in &report.persisted {
            match persisted {
                Persisted::Primary(entry) => {
                    self.files_written += 1;
                    self.rows_written += entry.rows as u64;
                }
                Persisted::Fallback(entry) => {
                    self.fallback_files += 1;
                    self.rows_written += entry.rows as u64;
                }
                Persisted::Lost { .. } => self.lost_batches += 1,
            }
        }
    }
}

pub struct FlushScheduler {
    buffer: Arc<IngestBuffer>,
    sealed: SealedBatches,
    writer: Arc<ColumnarWriter>,
    fallback: Arc<ColumnarWriter>,
    interval: Duration,
    write_attempts: u32,
    retry_delay: Duration,
    stats: FlushStats,
}

impl FlushScheduler {
    pub fn new(config: &Config, buffer: Arc<IngestBuffer>, sealed: SealedBatches) -> Self {
        let compression = config.storage.compression;
        Self::with_writers(
            buffer,
            sealed,
            ColumnarWriter::new(&config.storage.data_dir, compression),
            ColumnarWriter::new(config.fallback_dir(), compression),
            config.flush.interval,
            config.flush.write_attempts,
            config.flush.retry_delay,
        )
    }

    pub fn with_writers(
        buffer: Arc<IngestBuffer>,
        sealed: SealedBatches,
        writer: ColumnarWriter,
        fallback: ColumnarWriter,
        interval: Duration,
        write_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            buffer,
            sealed,
            writer: Arc::new(writer),
            fallback: Arc::new(fallback),
            interval,
            write_attempts: write_attempts.max(1),
            retry_delay,
            stats: FlushStats::default(),
        }
    }

    pub fn stats(&self) -> FlushStats {
        let mut stats = self.stats;
        stats.lost_batches += self.buffer.overflowed_batches();
        stats
    }

    /// Flush until `shutdown` fires, then drain one last time.
    ///
    /// The timer keeps its cadence regardless of size-triggered flushes.
    pub async fn run(mut self, shutdown: CancellationToken) -> FlushStats {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.interval.as_secs_f64(),
            max_buffer_size = self.buffer.max_size(),
            "Flush scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(batch) = self.sealed.recv() => {
                    metrics::inc_eager_flush();
                    let mut batches = vec![batch];
                    batches.extend(self.take_sealed());
                    self.flush_batches(FlushTrigger::BufferFull, batches).await;
                }
                _ = ticker.tick() => {
                    self.flush_once(FlushTrigger::Timer).await;
                }
            }
        }

        self.flush_once(FlushTrigger::Shutdown).await;
        let stats = self.stats();
        info!(
            flushes = stats.flushes,
            eager_flushes = stats.eager_flushes,
            files_written = stats.files_written,
            rows_written = stats.rows_written,
            fallback_files = stats.fallback_files,
            lost_batches = stats.lost_batches,
            "Flush scheduler stopped"
        );
        stats
    }

    fn take_sealed(&mut self) -> Vec<Batch> {
        let mut batches = Vec::new();
        while let Ok(batch) = self.sealed.try_recv() {
            batches.push(batch);
        }
        batches
    }

    /// Persist every sealed batch plus the open one. Nothing buffered writes nothing.
    pub async fn flush_once(&mut self, trigger: FlushTrigger) -> Option<FlushReport> {
        let open = self.buffer.drain();
        let mut batches = self.take_sealed();
        batches.push(open);
        self.flush_batches(trigger, batches).await
    }

    /// Write batches oldest first. Local times never repeat, so the first one
    /// of each batch orders them even when a seal raced the drain.
    async fn flush_batches(
        &mut self,
        trigger: FlushTrigger,
        mut batches: Vec<Batch>,
    ) -> Option<FlushReport> {
        metrics::set_buffer_depth(self.buffer.len());
        batches.retain(|b| !b.is_empty());
        if batches.is_empty() {
            debug!(trigger = trigger.as_str(), "Nothing to flush");
            return None;
        }
        batches.sort_by_key(|b| b.local_time_range().map(|(first, _)| first));

        let rows = batches.iter().map(Batch::len).sum();
        let mut persisted = Vec::new();
        for batch in batches {
            for group in batch.into_channel_groups() {
                persisted.push(self.persist(Arc::new(group)).await);
            }
        }

        let report = FlushReport {
            trigger,
            rows,
            persisted,
        };
        self.stats.record(&report);
        debug!(trigger = trigger.as_str(), rows, "Flush complete");
        Some(report)
    }

    /// Primary directory with bounded retries, then the fallback directory.
    /// A batch is never handed back to the live buffer.
    async fn persist(&self, batch: Arc<Batch>) -> Persisted {
        for attempt in 1..=self.write_attempts {
            match write_blocking(&self.writer, &batch).await {
                Ok(entry) => {
                    metrics::record_file_written(entry.rows);
                    return Persisted::Primary(entry);
                }
                Err(e) => {
                    metrics::inc_write_retry();
                    warn!(
                        error = %e,
                        attempt,
                        max_attempts = self.write_attempts,
                        rows = batch.len(),
                        "Parquet write failed"
                    );
                }
            }
            if attempt < self.write_attempts {
                sleep(self.retry_delay).await;
            }
        }

        match write_blocking(&self.fallback, &batch).await {
            Ok(entry) => {
                metrics::inc_fallback_write();
                error!(
                    path = %entry.path.display(),
                    rows = entry.rows,
                    "Primary data directory rejected batch; written to fallback directory"
                );
                Persisted::Fallback(entry)
            }
            Err(e) => {
                let digest = batch.digest();
                let (first_local_time, last_local_time) =
                    batch.local_time_range().unwrap_or_default();
                metrics::inc_unrecoverable_batch();
                error!(
                    error = %e,
                    rows = batch.len(),
                    channel = batch.channel().unwrap_or_default(),
                    first_local_time,
                    last_local_time,
                    digest = %digest,
                    "Batch could not be persisted anywhere; data lost"
                );
                Persisted::Lost {
                    rows: batch.len(),
                    digest,
                }
            }
        }
    }
}

async fn write_blocking(
    writer: &Arc<ColumnarWriter>,
    batch: &Arc<Batch>,
) -> Result<FileEntry, RecorderError> {
    let writer = Arc::clone(writer);
    let batch = Arc::clone(batch);
    let flushed_at = Utc::now();
    tokio::task::spawn_blocking(move || writer.write(&batch, flushed_at))
        .await
        .map_err(|e| RecorderError::Write(format!("write task failed: {}", e)))?
}
