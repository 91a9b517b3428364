use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Subscribe acknowledgements not received within {0:?}")]
    SubscribeTimeout(std::time::Duration),

    #[error("No message received within staleness window of {0:?}")]
    StaleConnection(std::time::Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Write error: {0}")]
    Write(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Schema error: {0}")]
    Schema(#[from] lobrec_schema::SchemaError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Task failed: {0}")]
    Task(String),

    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimeout(std::time::Duration),

    #[error("{0} batch(es) could not be persisted")]
    DataLoss(u64),
}

/// A single inbound message could not be turned into an update. Never fatal.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl DecodeError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::Json(_) => "json",
            DecodeError::MissingField(_) => "missing_field",
            DecodeError::InvalidField { .. } => "invalid_field",
        }
    }
}

impl RecorderError {
    pub fn kind(&self) -> &'static str {
        match self {
            RecorderError::Config(_) => "config",
            RecorderError::Connect(_) => "connect",
            RecorderError::SubscribeTimeout(_) => "subscribe_timeout",
            RecorderError::StaleConnection(_) => "stale_connection",
            RecorderError::Transport(_) => "transport",
            RecorderError::Decode(_) => "decode",
            RecorderError::Write(_)
            | RecorderError::Io(_)
            | RecorderError::Serialization(_)
            | RecorderError::Schema(_)
            | RecorderError::Arrow(_)
            | RecorderError::Parquet(_) => "write",
            RecorderError::Task(_) => "task",
            RecorderError::ShutdownTimeout(_) => "shutdown_timeout",
            RecorderError::DataLoss(_) => "data_loss",
        }
    }
}
