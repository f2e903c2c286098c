use thiserror::Error;

/// Failure classes for a single audit run.
///
/// Registry transport problems are deliberately absent: the CVR client
/// degrades to a cached or Unknown-risk verdict instead of erroring, so an
/// audit completes even when the registry is down.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Unusable image: {0}")]
    Image(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Invalid CVR number: {0}")]
    InvalidCvr(String),
}

pub type Result<T> = std::result::Result<T, AuditError>;
