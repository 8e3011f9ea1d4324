use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("input has no column named '{0}'")]
    MissingColumn(String),
    #[error("resolution cache at {path} is unreadable: {reason}")]
    CacheUnreadable { path: PathBuf, reason: String },
    #[error("failed to persist {} cache entries: {source}", keys.len())]
    FlushFailed {
        keys: Vec<String>,
        #[source]
        source: Box<AppError>,
    },
}

impl AppError {
    /// Failures that only cost extra provider calls and never abort a run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AppError::CacheUnreadable { .. })
    }
}
