//! Keystore errors

use keyring_core::ErrorCode;
use thiserror::Error;

use crate::container::ContainerError;

/// Failures raised by the keystore engine and codec
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// Bad open-time parameters; fatal at startup
    #[error("{message}")]
    Configuration {
        message: String,
        #[source]
        source: Option<ContainerError>,
    },

    /// Bad record shape
    #[error("{0}")]
    Validation(String),

    /// Duplicate alias on add
    #[error("{0}")]
    Conflict(String),

    /// Failure reading, decrypting or encrypting an entry
    #[error("{message}")]
    Applicative {
        message: String,
        #[source]
        source: Option<ContainerError>,
    },

    /// The commit step could not write or replace the container file
    #[error("{message}")]
    Persistence {
        message: String,
        #[source]
        source: ContainerError,
    },
}

impl KeystoreError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn applicative(message: impl Into<String>, source: ContainerError) -> Self {
        Self::Applicative {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Configuration { .. } => ErrorCode::Configuration,
            Self::Validation(_) => ErrorCode::Validation,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::Applicative { .. } => ErrorCode::Applicative,
            Self::Persistence { .. } => ErrorCode::Persistence,
        }
    }
}
