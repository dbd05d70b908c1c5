//! Core types for keyring
//!
//! This crate provides the error taxonomy and request identifiers shared by
//! the keystore engine and the HTTP front end.

pub mod error;
pub mod request_id;

pub use error::{ErrorCode, KeyringError};
pub use request_id::{RequestId, REQUEST_ID_HEADER};
