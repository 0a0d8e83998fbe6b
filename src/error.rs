//! Error types for the trade replay server

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Source error: {message}")]
    Source { message: String },

    #[error("Subscriber error: {message}")]
    Subscriber { message: String },

    #[error("record timestamp regression: {current} follows {previous}")]
    OrderingViolation {
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },
}

pub type Result<T> = std::result::Result<T, ReplayError>;
