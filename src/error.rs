use thiserror::Error;

/// Outcome classes for a single call against a remote service.
///
/// Every client returns `RemoteResult<T>` so callers can match on the class
/// instead of inspecting service-specific error payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    Denied(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("already exists: {0}")]
    Conflict(String),

    #[error("invalid request or response: {0}")]
    Invalid(String),
}

impl RemoteError {
    /// Worth retrying under the active backoff policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    /// Classify an HTTP status code returned by a REST API.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 | 410 => RemoteError::NotFound(message),
            401 | 403 => RemoteError::Denied(message),
            409 => RemoteError::Conflict(message),
            408 | 429 | 500..=599 => RemoteError::Transient(message),
            _ => RemoteError::Invalid(message),
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[derive(Error, Debug)]
pub enum TransxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote service error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Job error: {0}")]
    Job(String),

    #[error("File not found: {0}")]
    FileNotFound(String),
}

pub type Result<T> = std::result::Result<T, TransxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(RemoteError::from_status(404, "x"), RemoteError::NotFound("x".into()));
        assert_eq!(RemoteError::from_status(403, "x"), RemoteError::Denied("x".into()));
        assert_eq!(RemoteError::from_status(409, "x"), RemoteError::Conflict("x".into()));
        assert!(RemoteError::from_status(503, "x").is_transient());
        assert!(RemoteError::from_status(429, "x").is_transient());
        assert_eq!(RemoteError::from_status(400, "x"), RemoteError::Invalid("x".into()));
    }
}
