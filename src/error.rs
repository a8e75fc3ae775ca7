use thiserror::Error;

#[derive(Debug, Error)]
pub enum FramewrightError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Unknown dependency: {0}")]
    UnknownDependency(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Classifies a failure for retry decisions.
///
/// Decided once where the error is created, never by inspecting it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Connection reset, timeout, 5xx-equivalent.
    Transient,
    /// The dependency asked us to slow down.
    RateLimited,
    /// Validation or business failure; retrying cannot help.
    NonRetryable,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::RateLimited => write!(f, "rate_limited"),
            ErrorClass::NonRetryable => write!(f, "non_retryable"),
        }
    }
}

/// Implemented by every error a unit of work can return.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

impl Classify for std::io::Error {
    fn class(&self) -> ErrorClass {
        use std::io::ErrorKind;
        match self.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock => ErrorClass::Transient,
            _ => ErrorClass::NonRetryable,
        }
    }
}
