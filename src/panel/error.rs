//! Error types for panel construction
//!
//! `PanelError` is the single error surfaced by the library. Conditions that
//! are expected during a run (an exhausted candidate pool, a firm that was
//! already processed) are not errors and never show up here.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("partition file not found: {}", path.display())]
    MissingPartitionFile { path: PathBuf },

    #[error("malformed seal date '{raw}' for firm '{firm}'")]
    MalformedSealDate { firm: String, raw: String },

    /// A store mutation (load/free) failed and was rolled back
    #[error("store mutation failed: {0}")]
    StoreMutation(String),

    /// A partition file lacks a required column or has an unusable type
    #[error("partition schema mismatch: {0}")]
    Schema(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("worker failed: {0}")]
    Worker(String),
}

impl From<tokio::task::JoinError> for PanelError {
    fn from(err: tokio::task::JoinError) -> Self {
        PanelError::Worker(err.to_string())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
