use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use lobrec_schema::{
    from_record_batch, to_record_batch, OrderBookUpdate, LOCAL_TIME_UNIT, SCHEMA_NAME,
    SCHEMA_VERSION,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::{EnabledStatistics, WriterProperties};
use tracing::{info, warn};

use crate::buffer::Batch;
use crate::config::CompressionKind;
use crate::error::RecorderError;

/// Stem suffix of the per-channel file produced by daily compaction.
pub const MERGED_SUFFIX: &str = "merged";

/// A committed Parquet file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub rows: usize,
    pub bytes: u64,
    pub first_local_time: i64,
    pub last_local_time: i64,
}

/// Writes sealed batches as date-partitioned Parquet files under one directory.
#[derive(Debug, Clone)]
pub struct ColumnarWriter {
    base_dir: PathBuf,
    compression: Compression,
}

impl ColumnarWriter {
    pub fn new(base_dir: impl Into<PathBuf>, compression: CompressionKind) -> Self {
        Self {
            base_dir: base_dir.into(),
            compression: compression.to_parquet(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn properties(&self) -> WriterProperties {
        WriterProperties::builder()
            .set_compression(self.compression)
            .set_max_row_group_size(100_000)
            .set_data_page_size_limit(1024 * 1024)
            .set_statistics_enabled(EnabledStatistics::Chunk)
            .set_created_by("lobrec-recorder".to_string())
            .set_key_value_metadata(Some(vec![
                KeyValue::new("lobrec.schema_name".to_string(), SCHEMA_NAME.to_string()),
                KeyValue::new("lobrec.schema_version".to_string(), SCHEMA_VERSION.to_string()),
                KeyValue::new("lobrec.local_time_unit".to_string(), LOCAL_TIME_UNIT.to_string()),
            ]))
            .build()
    }

    /// `{base}/{YYYY-MM-DD}`
    pub fn date_dir(&self, date: NaiveDate) -> PathBuf {
        self.base_dir.join(date.format("%Y-%m-%d").to_string())
    }

    /// Write one single-channel batch as a new per-flush file. The file only
    /// appears under its final name once it is fully written and synced.
    pub fn write(
        &self,
        batch: &Batch,
        flushed_at: DateTime<Utc>,
    ) -> Result<FileEntry, RecorderError> {
        let channel = batch
            .channel()
            .ok_or_else(|| RecorderError::Write("refusing to write an empty batch".into()))?;

        let dir = self.date_dir(flushed_at.date_naive());
        fs::create_dir_all(&dir)?;
        let stem = format!("{}_{}", channel, flushed_at.format("%Y%m%dT%H%M%S%.3fZ"));
        self.commit(batch, unique_path(&dir, &stem))
    }

    /// Write the compacted file for one channel and date, atomically replacing
    /// any earlier one.
    pub fn write_merged(&self, batch: &Batch, date: NaiveDate) -> Result<FileEntry, RecorderError> {
        let channel = batch
            .channel()
            .ok_or_else(|| RecorderError::Write("refusing to write an empty batch".into()))?;

        let dir = self.date_dir(date);
        fs::create_dir_all(&dir)?;
        self.commit(batch, dir.join(format!("{}_{}.parquet", channel, MERGED_SUFFIX)))
    }

    fn commit(&self, batch: &Batch, final_path: PathBuf) -> Result<FileEntry, RecorderError> {
        let (first_local_time, last_local_time) = batch
            .local_time_range()
            .ok_or_else(|| RecorderError::Write("refusing to write an empty batch".into()))?;
        let tmp_path = tmp_path_for(&final_path);

        let record_batch = to_record_batch(batch.updates())?;
        if let Err(e) = self.write_file(&tmp_path, &record_batch) {
            remove_tmp(&tmp_path);
            return Err(e);
        }
        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            remove_tmp(&tmp_path);
            return Err(e.into());
        }

        let entry = FileEntry {
            bytes: fs::metadata(&final_path)?.len(),
            path: final_path,
            rows: record_batch.num_rows(),
            first_local_time,
            last_local_time,
        };
        info!(
            path = %entry.path.display(),
            rows = entry.rows,
            bytes = entry.bytes,
            first_local_time = entry.first_local_time,
            last_local_time = entry.last_local_time,
            "Wrote parquet file"
        );
        Ok(entry)
    }

    fn write_file(
        &self,
        path: &Path,
        record_batch: &arrow::record_batch::RecordBatch,
    ) -> Result<(), RecorderError> {
        let file = File::create(path)?;
        let mut writer =
            ArrowWriter::try_new(file.try_clone()?, record_batch.schema(), Some(self.properties()))?;
        writer.write(record_batch)?;
        writer.close()?;
        file.sync_all()?;
        Ok(())
    }
}

fn tmp_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn remove_tmp(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove temporary file");
        }
    }
}

/// First free `{stem}.parquet`, `{stem}_1.parquet`, `{stem}_2.parquet`, ...
fn unique_path(dir: &Path, stem: &str) -> PathBuf {
    let candidate = dir.join(format!("{stem}.parquet"));
    if !candidate.exists() {
        return candidate;
    }
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}_{n}.parquet"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Read every update back from a file written by [`ColumnarWriter`], in file order.
pub fn read_updates(path: &Path) -> Result<Vec<OrderBookUpdate>, RecorderError> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?.build()?;
    let mut updates = Vec::new();
    for batch in reader {
        updates.extend(from_record_batch(&batch?)?);
    }
    Ok(updates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lobrec_schema::PriceLevel;
    use tempfile::TempDir;

    fn update(local_time: i64) -> OrderBookUpdate {
        OrderBookUpdate::new(
            "BTC",
            "l2Book",
            1_760_000_000_000 + local_time,
            local_time,
            vec![
                PriceLevel::new(64_000.5, 0.25, 3),
                PriceLevel::new(64_000.0, 1.5, 7),
            ],
            vec![PriceLevel::new(64_001.0, 0.75, 2)],
        )
    }

    fn flush_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 5).unwrap()
    }

    fn list_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_write_and_read_back() {
        let tmp = TempDir::new().unwrap();
        let writer = ColumnarWriter::new(tmp.path(), CompressionKind::Snappy);
        let updates: Vec<OrderBookUpdate> = (1..=7).map(update).collect();
        let batch = Batch::from_updates(updates.clone());

        let entry = writer.write(&batch, flush_time()).unwrap();
        assert_eq!(entry.rows, 7);
        assert_eq!(entry.first_local_time, 1);
        assert_eq!(entry.last_local_time, 7);
        assert!(entry.bytes > 0);
        assert_eq!(
            entry.path,
            tmp.path()
                .join("2026-10-16")
                .join("l2Book_20261016T120005.000Z.parquet")
        );

        assert_eq!(read_updates(&entry.path).unwrap(), updates);
    }

    #[test]
    fn test_no_tmp_files_left_behind() {
        let tmp = TempDir::new().unwrap();
        let writer = ColumnarWriter::new(tmp.path(), CompressionKind::Zstd);
        writer
            .write(&Batch::from_updates(vec![update(1)]), flush_time())
            .unwrap();

        let names = list_files(&tmp.path().join("2026-10-16"));
        assert_eq!(names.len(), 1);
        assert!(names.iter().all(|n| !n.ends_with(".tmp")));
    }

    #[test]
    fn test_same_timestamp_gets_disambiguator() {
        let tmp = TempDir::new().unwrap();
        let writer = ColumnarWriter::new(tmp.path(), CompressionKind::Uncompressed);
        for t in 0..3 {
            writer
                .write(&Batch::from_updates(vec![update(t)]), flush_time())
                .unwrap();
        }

        let names = list_files(&tmp.path().join("2026-10-16"));
        assert_eq!(
            names,
            vec![
                "l2Book_20261016T120005.000Z.parquet",
                "l2Book_20261016T120005.000Z_1.parquet",
                "l2Book_20261016T120005.000Z_2.parquet",
            ]
        );
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let writer = ColumnarWriter::new(tmp.path(), CompressionKind::Snappy);
        let err = writer.write(&Batch::default(), flush_time()).unwrap_err();
        assert!(matches!(err, RecorderError::Write(_)));
        assert!(list_files(tmp.path()).is_empty());
    }

    #[test]
    fn test_unwritable_directory_fails() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("blocked");
        fs::write(&blocker, b"not a directory").unwrap();

        let writer = ColumnarWriter::new(&blocker, CompressionKind::Snappy);
        let err = writer
            .write(&Batch::from_updates(vec![update(1)]), flush_time())
            .unwrap_err();
        assert_eq!(err.kind(), "write");
    }

    #[test]
    fn test_file_metadata_carries_schema_version() {
        let tmp = TempDir::new().unwrap();
        let writer = ColumnarWriter::new(tmp.path(), CompressionKind::Snappy);
        let entry = writer
            .write(&Batch::from_updates(vec![update(1)]), flush_time())
            .unwrap();

        let builder =
            ParquetRecordBatchReaderBuilder::try_new(File::open(&entry.path).unwrap()).unwrap();
        let kv = builder
            .metadata()
            .file_metadata()
            .key_value_metadata()
            .cloned()
            .unwrap_or_default();
        let version = kv
            .iter()
            .find(|kv| kv.key == "lobrec.schema_version")
            .and_then(|kv| kv.value.clone());
        assert_eq!(version.as_deref(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_write_merged_replaces_previous() {
        let tmp = TempDir::new().unwrap();
        let writer = ColumnarWriter::new(tmp.path(), CompressionKind::Snappy);
        let date = flush_time().date_naive();

        writer
            .write_merged(&Batch::from_updates(vec![update(1)]), date)
            .unwrap();
        let entry = writer
            .write_merged(&Batch::from_updates(vec![update(1), update(2)]), date)
            .unwrap();

        assert_eq!(
            entry.path,
            tmp.path().join("2026-10-16").join("l2Book_merged.parquet")
        );
        assert_eq!(list_files(&tmp.path().join("2026-10-16")), vec!["l2Book_merged.parquet"]);
        assert_eq!(read_updates(&entry.path).unwrap().len(), 2);
    }
}
