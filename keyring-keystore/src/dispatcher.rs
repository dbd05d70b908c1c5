//! Single-writer command dispatcher
//!
//! Any number of tasks may [`Dispatcher::submit`] named commands. They are
//! queued to one dedicated worker thread, which owns the executor (normally a
//! [`KeystoreEngine`]) and runs commands strictly one at a time. No other code
//! holds a reference to the engine, so no locking is needed inside it.
//!
//! A caller-side timeout only stops waiting. The command stays queued and still
//! runs, so a timed-out mutation has an unknown outcome.

use keyring_core::ErrorCode;
use std::collections::{BTreeMap, BTreeSet};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{self, SecretKeyRecord};
use crate::engine::KeystoreEngine;
use crate::error::KeystoreError;

pub const LIST_ALIASES: &str = "list-aliases";
pub const LIST_KEYS: &str = "list-keys";
pub const GET_KEY: &str = "get-key";
pub const ADD_KEY: &str = "add-key";
pub const DELETE_KEY: &str = "delete-key";

/// Commands that may wait in the queue before submitters are held back
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// A parsed command with its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ListAliases,
    ListKeys,
    GetKey(String),
    /// JSON wire record
    AddKey(String),
    DeleteKey(String),
}

impl Command {
    /// Resolve a command name and payload; `None` if no handler is registered for `name`
    pub fn parse(name: &str, payload: String) -> Option<Self> {
        match name {
            LIST_ALIASES => Some(Self::ListAliases),
            LIST_KEYS => Some(Self::ListKeys),
            GET_KEY => Some(Self::GetKey(payload)),
            ADD_KEY => Some(Self::AddKey(payload)),
            DELETE_KEY => Some(Self::DeleteKey(payload)),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ListAliases => LIST_ALIASES,
            Self::ListKeys => LIST_KEYS,
            Self::GetKey(_) => GET_KEY,
            Self::AddKey(_) => ADD_KEY,
            Self::DeleteKey(_) => DELETE_KEY,
        }
    }
}

/// Successful command results
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Aliases(BTreeSet<String>),
    Keys(BTreeMap<String, SecretKeyRecord>),
    Key(Option<SecretKeyRecord>),
    Created(String),
    Deleted,
}

#[derive(Debug, Error)]
pub enum DispatchFailure {
    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("No handler registered for '{0}'")]
    NoHandler(String),

    #[error("{message}")]
    Applicative { code: ErrorCode, message: String },
}

impl DispatchFailure {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::NoHandler(_) => ErrorCode::NoHandler,
            Self::Applicative { code, .. } => *code,
        }
    }
}

impl From<KeystoreError> for DispatchFailure {
    fn from(e: KeystoreError) -> Self {
        Self::Applicative {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

/// Something the worker can run commands against
pub trait CommandExecutor: Send + 'static {
    fn execute(&mut self, command: Command) -> Result<Reply, KeystoreError>;
}

impl CommandExecutor for KeystoreEngine {
    fn execute(&mut self, command: Command) -> Result<Reply, KeystoreError> {
        match command {
            Command::ListAliases => Ok(Reply::Aliases(self.list_aliases())),
            Command::ListKeys => self.list_keys().map(Reply::Keys),
            Command::GetKey(alias) => self.get_key(&alias).map(Reply::Key),
            Command::AddKey(body) => {
                let record = codec::decode_json(&body)?;
                self.add_key(record).map(Reply::Created)
            }
            Command::DeleteKey(alias) => self.delete_key(&alias).map(|()| Reply::Deleted),
        }
    }
}

struct Envelope {
    command: Command,
    reply_tx: oneshot::Sender<Result<Reply, KeystoreError>>,
}

/// Cloneable submission handle to the worker
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Envelope>,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("command", &self.command.name())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Start the worker thread with `executor` as its exclusive state.
    ///
    /// The worker exits once every `Dispatcher` clone has been dropped and the
    /// queue is drained; join the returned handle to wait for it.
    pub fn spawn<E: CommandExecutor>(
        executor: E,
        queue_depth: usize,
    ) -> std::io::Result<(Self, JoinHandle<()>)> {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let handle = std::thread::Builder::new()
            .name("keystore-worker".to_string())
            .spawn(move || run_worker(executor, rx))?;
        Ok((Self { tx }, handle))
    }

    /// Submit a named command and wait up to `timeout` for its reply.
    ///
    /// Time spent waiting for queue capacity counts against `timeout`.
    pub async fn submit(
        &self,
        name: &str,
        payload: impl Into<String>,
        timeout: Duration,
    ) -> Result<Reply, DispatchFailure> {
        let command = Command::parse(name, payload.into())
            .ok_or_else(|| DispatchFailure::NoHandler(name.to_string()))?;

        let deadline = Instant::now() + timeout;
        let (reply_tx, reply_rx) = oneshot::channel();

        match tokio::time::timeout_at(deadline, self.tx.send(Envelope { command, reply_tx })).await {
            Err(_) => return Err(DispatchFailure::Timeout(timeout)),
            Ok(Err(_)) => return Err(DispatchFailure::NoHandler(name.to_string())),
            Ok(Ok(())) => {}
        }

        match tokio::time::timeout_at(deadline, reply_rx).await {
            Err(_) => {
                debug!(command = %name, ?timeout, "Gave up waiting for reply");
                Err(DispatchFailure::Timeout(timeout))
            }
            // Worker went away without replying
            Ok(Err(_)) => Err(DispatchFailure::NoHandler(name.to_string())),
            Ok(Ok(result)) => result.map_err(DispatchFailure::from),
        }
    }
}

fn run_worker<E: CommandExecutor>(mut executor: E, mut rx: mpsc::Receiver<Envelope>) {
    info!("Keystore worker started");

    while let Some(Envelope { command, reply_tx }) = rx.blocking_recv() {
        let name = command.name();
        debug!(command = name, "Executing command");

        let result = executor.execute(command);
        if let Err(e) = &result {
            warn!(command = name, code = %e.code(), error = %e, "Command failed");
        }

        if reply_tx.send(result).is_err() {
            debug!(command = name, "Caller stopped waiting, reply dropped");
        }
    }

    info!("Keystore worker stopped");
}
