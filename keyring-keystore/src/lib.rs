//! Secret-key store for keyring
//!
//! Provides an encrypted, file-backed keystore with:
//! - list-aliases, list-keys, get-key, add-key, delete-key
//! - Atomic temp-file-then-rename commits
//! - A single worker thread that owns the store and executes one command at a time

pub mod codec;
pub mod container;
pub mod dispatcher;
pub mod engine;
mod error;
pub mod handlers;

pub use codec::{SecretKeyRecord, WireSecretKey};
pub use container::KdfParams;
pub use dispatcher::{Command, CommandExecutor, DispatchFailure, Dispatcher, Reply};
pub use engine::{KeystoreEngine, KeystoreSettings, AUTHORIZED_CONTAINER_TYPE};
pub use error::KeystoreError;
pub use handlers::{secrets_router, KeystoreState};
