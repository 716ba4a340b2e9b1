use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("czkawka_cli binary not found at {}", .0.display())]
    ToolMissing(PathBuf),
}
