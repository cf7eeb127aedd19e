use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to resolve required path: {0}")]
    Path(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Parse(String),
    #[error("storage unavailable: {0}")]
    Storage(String),
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    #[error("unknown job: {0}")]
    UnknownJob(String),
}
