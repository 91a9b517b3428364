//! Daily compaction
//!
//! Folds the per-flush files of one date directory into a single
//! `{channel}_merged.parquet` per channel. Sources are removed only after the
//! merged file is committed, and an existing merged file is folded in again,
//! so a rerun after new flushes picks up where the last one stopped.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use lobrec_schema::OrderBookUpdate;
use tracing::{info, warn};

use crate::buffer::Batch;
use crate::error::RecorderError;
use crate::parquet_writer::{read_updates, ColumnarWriter, FileEntry, MERGED_SUFFIX};

/// Outcome for one channel of one date.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeStats {
    pub date: NaiveDate,
    pub channel: String,
    /// Per-flush files folded in (or that would be, on a dry run).
    pub files_merged: usize,
    pub rows: usize,
    /// `None` on a dry run.
    pub output: Option<FileEntry>,
}

#[derive(Debug, Default)]
struct ChannelFiles {
    merged: Option<PathBuf>,
    parts: Vec<PathBuf>,
}

/// Merge every date from `start` to `end`, inclusive. Missing dates are skipped.
pub fn merge_range(
    writer: &ColumnarWriter,
    start: NaiveDate,
    end: NaiveDate,
    dry_run: bool,
) -> Result<Vec<MergeStats>, RecorderError> {
    if end < start {
        return Err(RecorderError::Config(format!(
            "merge range ends ({}) before it starts ({})",
            end, start
        )));
    }
    let mut stats = Vec::new();
    for date in start.iter_days().take_while(|d| *d <= end) {
        stats.extend(merge_date(writer, date, dry_run)?);
    }
    Ok(stats)
}

/// Merge the per-flush files of one date, channel by channel.
pub fn merge_date(
    writer: &ColumnarWriter,
    date: NaiveDate,
    dry_run: bool,
) -> Result<Vec<MergeStats>, RecorderError> {
    let dir = writer.date_dir(date);
    if !dir.is_dir() {
        info!(dir = %dir.display(), "No data for date");
        return Ok(Vec::new());
    }

    let mut stats = Vec::new();
    for (channel, files) in scan(&dir)? {
        if files.parts.is_empty() {
            info!(date = %date, channel = %channel, "Already merged");
            continue;
        }
        if dry_run {
            for part in &files.parts {
                info!(date = %date, channel = %channel, file = %part.display(), "Would merge");
            }
            stats.push(MergeStats {
                date,
                channel,
                files_merged: files.parts.len(),
                rows: 0,
                output: None,
            });
            continue;
        }
        stats.push(merge_channel(writer, date, channel, files)?);
    }
    Ok(stats)
}

fn merge_channel(
    writer: &ColumnarWriter,
    date: NaiveDate,
    channel: String,
    files: ChannelFiles,
) -> Result<MergeStats, RecorderError> {
    let mut chunks: Vec<Vec<OrderBookUpdate>> = Vec::new();
    for path in files.merged.iter().chain(&files.parts) {
        let updates = read_updates(path)?;
        if !updates.is_empty() {
            chunks.push(updates);
        }
    }
    // Each file covers a contiguous run of local times.
    chunks.sort_by_key(|updates| updates.first().map(|u| u.local_time()));
    let updates: Vec<OrderBookUpdate> = chunks.into_iter().flatten().collect();
    let rows = updates.len();

    let output = if updates.is_empty() {
        None
    } else {
        Some(writer.write_merged(&Batch::from_updates(updates), date)?)
    };

    for part in &files.parts {
        if let Err(e) = fs::remove_file(part) {
            warn!(file = %part.display(), error = %e, "Failed to remove merged source file");
        }
    }

    info!(
        date = %date,
        channel = %channel,
        files_merged = files.parts.len(),
        rows,
        "Merged daily files"
    );
    Ok(MergeStats {
        date,
        channel,
        files_merged: files.parts.len(),
        rows,
        output,
    })
}

/// Group the committed Parquet files of a date directory by channel.
/// Per-flush files come back in name order.
fn scan(dir: &Path) -> Result<BTreeMap<String, ChannelFiles>, RecorderError> {
    let mut by_channel: BTreeMap<String, ChannelFiles> = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(stem) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(".parquet"))
        else {
            continue;
        };
        let Some((channel, rest)) = stem.split_once('_') else {
            warn!(file = %path.display(), "Skipping file without a channel prefix");
            continue;
        };

        let files = by_channel.entry(channel.to_string()).or_default();
        if rest == MERGED_SUFFIX {
            files.merged = Some(path);
        } else {
            files.parts.push(path);
        }
    }
    for files in by_channel.values_mut() {
        files.parts.sort();
    }
    Ok(by_channel)
}
