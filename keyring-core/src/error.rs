//! Keyring error codes and formatting

use serde::Serialize;
use thiserror::Error;

/// Error codes surfaced to keyring callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Startup
    Configuration,

    // Client input
    Validation,
    Conflict,
    NotFound,

    // Engine
    Applicative,
    Persistence,

    // Dispatcher
    Timeout,
    NoHandler,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "ConfigurationError",
            Self::Validation => "ValidationError",
            Self::Conflict => "Conflict",
            Self::NotFound => "NotFound",
            Self::Applicative => "ApplicativeError",
            Self::Persistence => "PersistenceError",
            Self::Timeout => "Timeout",
            Self::NoHandler => "NoHandler",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Timeout => 503,
            Self::Configuration | Self::Applicative | Self::Persistence | Self::NoHandler => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-facing keyring error
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct KeyringError {
    pub code: ErrorCode,
    pub message: String,
    pub request_id: String,
}

impl KeyringError {
    pub fn new(code: ErrorCode, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: request_id.into(),
        }
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    /// Format as the JSON error body returned by the HTTP surface
    pub fn to_json(&self) -> String {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct JsonError<'a> {
            code: &'a str,
            message: &'a str,
            request_id: &'a str,
        }

        let error = JsonError {
            code: self.code.as_str(),
            message: &self.message,
            request_id: &self.request_id,
        };

        serde_json::to_string(&error).unwrap_or_else(|_| {
            format!(r#"{{"code":"{}","message":"{}"}}"#, self.code.as_str(), self.message)
        })
    }
}
