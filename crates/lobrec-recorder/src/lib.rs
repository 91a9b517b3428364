//! lobrec-recorder: L2 order book recorder
//!
//! Subscribes to per-instrument book channels over a WebSocket feed, buffers
//! decoded updates in memory and flushes them to date-partitioned Parquet
//! files on a timer. [`compaction`] folds a day's per-flush files into one
//! file per channel.

pub mod backoff;
pub mod buffer;
pub mod clock;
pub mod codec;
pub mod compaction;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod parquet_writer;
pub mod recorder;
pub mod scheduler;
pub mod server;
pub mod transport;

pub use config::Config;
pub use connection::{ConnectionState, SessionStatus};
pub use error::{DecodeError, RecorderError};
pub use parquet_writer::{read_updates, FileEntry};
pub use recorder::Recorder;
