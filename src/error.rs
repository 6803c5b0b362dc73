use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HearthError {
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Parsing error: {0}")]
    Parsing(String),

    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("Refresh failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Listener error: {0}")]
    Listener(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for HearthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HearthError::Upstream(format!("request timed out: {}", err))
        } else {
            HearthError::Upstream(err.to_string())
        }
    }
}

impl From<serde_json::Error> for HearthError {
    fn from(err: serde_json::Error) -> Self {
        HearthError::Parsing(err.to_string())
    }
}

impl From<std::io::Error> for HearthError {
    fn from(err: std::io::Error) -> Self {
        HearthError::Io(err.to_string())
    }
}
