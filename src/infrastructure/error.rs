use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

impl From<reqwest::Error> for InfraError {
    fn from(error: reqwest::Error) -> Self {
        Self::Http(error.to_string())
    }
}
