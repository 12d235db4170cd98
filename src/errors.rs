use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("a pending lookup already exists for row {0}")]
    DuplicateRequest(usize),
    #[error("no pending lookup exists for row {0}")]
    NoSuchRequest(usize),
    #[error("lookup cancelled")]
    Cancelled,
    #[error("lookup queue is shutting down")]
    Shutdown,
    #[error("lookup failed{}: {detail}", status_suffix(.status))]
    LookupFailed { status: Option<u16>, detail: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("{0}")]
    Config(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|code| format!(" with status {code}"))
        .unwrap_or_default()
}

impl AppError {
    pub fn lookup_failed(status: Option<u16>, detail: impl Into<String>) -> Self {
        AppError::LookupFailed {
            status,
            detail: detail.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }
}
