use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::codec::{Subscription, L2_BOOK_CHANNEL};
use crate::error::RecorderError;

/// Channels whose payload maps onto the order book record.
pub const SUPPORTED_CHANNELS: &[&str] = &[L2_BOOK_CHANNEL];

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub feed: FeedConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub flush: FlushConfig,
    #[serde(default = "default_shutdown_grace", deserialize_with = "de_duration")]
    pub shutdown_grace: Duration,
    /// Bind address for /health, /ready and /metrics. Disabled when absent.
    #[serde(default)]
    pub health_addr: Option<SocketAddr>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    pub url: String,
    pub instruments: Vec<String>,
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,
    #[serde(default = "default_connect_timeout", deserialize_with = "de_duration")]
    pub connect_timeout: Duration,
    #[serde(default = "default_subscribe_timeout", deserialize_with = "de_duration")]
    pub subscribe_timeout: Duration,
    #[serde(default = "default_ping_interval", deserialize_with = "de_duration")]
    pub ping_interval: Duration,
    #[serde(default = "default_staleness_window", deserialize_with = "de_duration")]
    pub staleness_window: Duration,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base", deserialize_with = "de_duration")]
    pub base: Duration,
    #[serde(default = "default_backoff_max", deserialize_with = "de_duration")]
    pub max: Duration,
    /// A session that stayed up this long resets the backoff curve.
    #[serde(default = "default_backoff_reset_after", deserialize_with = "de_duration")]
    pub reset_after: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: default_backoff_base(),
            max: default_backoff_max(),
            reset_after: default_backoff_reset_after(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub fallback_dir: Option<PathBuf>,
    #[serde(default)]
    pub compression: CompressionKind,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    #[default]
    Snappy,
    Zstd,
    Uncompressed,
}

impl CompressionKind {
    pub fn to_parquet(self) -> parquet::basic::Compression {
        match self {
            CompressionKind::Snappy => parquet::basic::Compression::SNAPPY,
            CompressionKind::Zstd => {
                parquet::basic::Compression::ZSTD(parquet::basic::ZstdLevel::default())
            }
            CompressionKind::Uncompressed => parquet::basic::Compression::UNCOMPRESSED,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FlushConfig {
    #[serde(default = "default_flush_interval", deserialize_with = "de_duration")]
    pub interval: Duration,
    /// Buffered update count that triggers an early flush.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    /// Sealed batches allowed to wait while a write is in flight.
    #[serde(default = "default_max_sealed_batches")]
    pub max_sealed_batches: usize,
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,
    #[serde(default = "default_retry_delay", deserialize_with = "de_duration")]
    pub retry_delay: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: default_flush_interval(),
            max_buffer_size: default_max_buffer_size(),
            max_sealed_batches: default_max_sealed_batches(),
            write_attempts: default_write_attempts(),
            retry_delay: default_retry_delay(),
        }
    }
}

fn default_channels() -> Vec<String> {
    vec![L2_BOOK_CHANNEL.to_string()]
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_subscribe_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_ping_interval() -> Duration {
    Duration::from_secs(50)
}
fn default_staleness_window() -> Duration {
    Duration::from_secs(100)
}
fn default_backoff_base() -> Duration {
    Duration::from_secs(1)
}
fn default_backoff_max() -> Duration {
    Duration::from_secs(60)
}
fn default_backoff_reset_after() -> Duration {
    Duration::from_secs(60)
}
fn default_flush_interval() -> Duration {
    Duration::from_secs(120)
}
fn default_max_buffer_size() -> usize {
    5000
}
fn default_max_sealed_batches() -> usize {
    8
}
fn default_write_attempts() -> u32 {
    3
}
fn default_retry_delay() -> Duration {
    Duration::from_millis(500)
}
fn default_shutdown_grace() -> Duration {
    Duration::from_secs(15)
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Parse a duration string like "500ms", "30s", "15m", "1h", "1d".
pub fn parse_duration(s: &str) -> Result<Duration, RecorderError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(RecorderError::Config("Empty duration".to_string()));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| RecorderError::Config(format!("Missing unit in duration: {}", s)))?;
    let (num_str, unit) = s.split_at(split);
    let num: u64 = num_str
        .parse()
        .map_err(|_| RecorderError::Config(format!("Invalid duration: {}", s)))?;

    if num == 0 {
        return Err(RecorderError::Config(format!(
            "Duration must be greater than zero: {}",
            s
        )));
    }

    let seconds_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(num)),
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 60 * 60 * 24,
        _ => return Err(RecorderError::Config(format!("Unknown unit: {}", unit))),
    };
    num.checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| RecorderError::Config(format!("Duration out of range: {}", s)))
}

impl Config {
    /// Load and validate a YAML config file.
    pub fn load(path: &Path) -> Result<Self, RecorderError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RecorderError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, RecorderError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|e| RecorderError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RecorderError> {
        let url = url::Url::parse(&self.feed.url)
            .map_err(|e| RecorderError::Config(format!("invalid feed url: {}", e)))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(RecorderError::Config(format!(
                "feed url must use ws:// or wss://, got {}",
                url.scheme()
            )));
        }

        if self.feed.instruments.is_empty() {
            return Err(RecorderError::Config("feed.instruments is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for instrument in &self.feed.instruments {
            if instrument.trim().is_empty() {
                return Err(RecorderError::Config("empty instrument name".to_string()));
            }
            if !seen.insert(instrument.as_str()) {
                return Err(RecorderError::Config(format!(
                    "duplicate instrument: {}",
                    instrument
                )));
            }
        }

        if self.feed.channels.is_empty() {
            return Err(RecorderError::Config("feed.channels is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for channel in &self.feed.channels {
            if !SUPPORTED_CHANNELS.contains(&channel.as_str()) {
                return Err(RecorderError::Config(format!(
                    "unsupported channel: {} (supported: {:?})",
                    channel, SUPPORTED_CHANNELS
                )));
            }
            if !seen.insert(channel.as_str()) {
                return Err(RecorderError::Config(format!("duplicate channel: {}", channel)));
            }
        }

        if self.feed.staleness_window <= self.feed.ping_interval {
            return Err(RecorderError::Config(format!(
                "feed.staleness_window ({:?}) must exceed feed.ping_interval ({:?})",
                self.feed.staleness_window, self.feed.ping_interval
            )));
        }

        if self.backoff.max < self.backoff.base {
            return Err(RecorderError::Config(format!(
                "backoff.max ({:?}) is below backoff.base ({:?})",
                self.backoff.max, self.backoff.base
            )));
        }

        if self.storage.data_dir.as_os_str().is_empty() {
            return Err(RecorderError::Config("storage.data_dir is empty".to_string()));
        }

        if self.flush.max_buffer_size == 0 {
            return Err(RecorderError::Config(
                "flush.max_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.flush.max_sealed_batches == 0 {
            return Err(RecorderError::Config(
                "flush.max_sealed_batches must be greater than zero".to_string(),
            ));
        }
        if self.flush.write_attempts == 0 {
            return Err(RecorderError::Config(
                "flush.write_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// One subscription per (instrument, channel), instruments outermost, in config order.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.feed
            .instruments
            .iter()
            .flat_map(|instrument| {
                self.feed
                    .channels
                    .iter()
                    .map(move |channel| Subscription::new(channel.clone(), instrument.clone()))
            })
            .collect()
    }

    pub fn fallback_dir(&self) -> PathBuf {
        self.storage
            .fallback_dir
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("_recovery"))
    }
}
