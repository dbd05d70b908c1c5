//! Encrypted container file
//!
//! File format:
//! - magic: `KRNGSTR1` (8 bytes)
//! - KDF memory KiB, iterations, parallelism: 3 x u32 little endian
//! - container salt: 16 bytes
//! - key-wrap salt: 16 bytes
//! - nonce: 24 bytes (XChaCha20-Poly1305)
//! - ciphertext: AEAD output over the JSON entry table
//!
//! Everything before the nonce is bound as associated data. Each secret key
//! entry is additionally wrapped under a key derived from the key password,
//! with its alias as associated data.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// File magic (8 bytes)
pub const CONTAINER_MAGIC: &[u8; 8] = b"KRNGSTR1";

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;

/// Magic, three KDF parameters and two salts
const HEADER_LEN: usize = 8 + 12 + 2 * SALT_LEN;

/// Current entry table version
const PAYLOAD_VERSION: u32 = 1;

/// Upper bounds on KDF costs read from an unauthenticated header
pub const MAX_KDF_MEMORY_KIB: u32 = 4 * 1024 * 1024;
pub const MAX_KDF_ITERATIONS: u32 = 64;
pub const MAX_KDF_PARALLELISM: u32 = 64;

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid container magic")]
    InvalidMagic,

    #[error("Invalid container format: {0}")]
    InvalidFormat(String),

    #[error("Key derivation failed: {0}")]
    Kdf(String),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Reject costs outside `1..=MAX_*` before any memory is allocated for them
    pub fn check(&self) -> Result<(), ContainerError> {
        let bounded = |name: &str, value: u32, max: u32| {
            if value == 0 || value > max {
                Err(ContainerError::InvalidFormat(format!(
                    "KDF {} {} outside 1..={}",
                    name, value, max
                )))
            } else {
                Ok(())
            }
        };
        bounded("memory_kib", self.memory_kib, MAX_KDF_MEMORY_KIB)?;
        bounded("iterations", self.iterations, MAX_KDF_ITERATIONS)?;
        bounded("parallelism", self.parallelism, MAX_KDF_PARALLELISM)
    }
}

/// An entry of the container, keyed by alias
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entry {
    SecretKey {
        algorithm: String,
        format: String,
        /// base64(nonce || ciphertext) under the key-wrap key
        wrapped_key: String,
        created_at: DateTime<Utc>,
    },
    TrustedCertificate {
        /// base64 DER
        certificate: String,
        created_at: DateTime<Utc>,
    },
}

impl Entry {
    pub fn is_key(&self) -> bool {
        matches!(self, Self::SecretKey { .. })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryTable {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, Entry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    kdf: KdfParams,
    store_salt: [u8; SALT_LEN],
    wrap_salt: [u8; SALT_LEN],
}

impl Header {
    fn generate(kdf: KdfParams) -> Self {
        let mut rng = rand::thread_rng();
        let mut store_salt = [0u8; SALT_LEN];
        let mut wrap_salt = [0u8; SALT_LEN];
        rng.fill(&mut store_salt);
        rng.fill(&mut wrap_salt);
        Self {
            kdf,
            store_salt,
            wrap_salt,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN);
        bytes.extend_from_slice(CONTAINER_MAGIC);
        bytes.extend_from_slice(&self.kdf.memory_kib.to_le_bytes());
        bytes.extend_from_slice(&self.kdf.iterations.to_le_bytes());
        bytes.extend_from_slice(&self.kdf.parallelism.to_le_bytes());
        bytes.extend_from_slice(&self.store_salt);
        bytes.extend_from_slice(&self.wrap_salt);
        bytes
    }

    fn parse(bytes: &[u8]) -> Result<Self, ContainerError> {
        if bytes.len() < HEADER_LEN + NONCE_LEN + TAG_LEN {
            if bytes.len() >= CONTAINER_MAGIC.len() && &bytes[..8] != CONTAINER_MAGIC {
                return Err(ContainerError::InvalidMagic);
            }
            return Err(ContainerError::InvalidFormat(format!(
                "file too short ({} bytes)",
                bytes.len()
            )));
        }
        if &bytes[..8] != CONTAINER_MAGIC {
            return Err(ContainerError::InvalidMagic);
        }

        let kdf = KdfParams {
            memory_kib: read_u32(bytes, 8),
            iterations: read_u32(bytes, 12),
            parallelism: read_u32(bytes, 16),
        };
        kdf.check()?;
        let mut store_salt = [0u8; SALT_LEN];
        let mut wrap_salt = [0u8; SALT_LEN];
        store_salt.copy_from_slice(&bytes[20..20 + SALT_LEN]);
        wrap_salt.copy_from_slice(&bytes[20 + SALT_LEN..HEADER_LEN]);

        Ok(Self {
            kdf,
            store_salt,
            wrap_salt,
        })
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

/// Handle to an open container: the cached keys plus the last committed entries
pub struct Container {
    path: PathBuf,
    header: Header,
    store_key: Zeroizing<[u8; KEY_LEN]>,
    wrap_key: Zeroizing<[u8; KEY_LEN]>,
    entries: BTreeMap<String, Entry>,
    /// Makes the next `reload` fail
    #[cfg(test)]
    pub(crate) fail_next_reload: bool,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("path", &self.path)
            .field("kdf", &self.header.kdf)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Open the container at `path`, creating an empty one if the file does not exist
    pub fn open_or_create(
        path: &Path,
        password: &str,
        key_password: &str,
        kdf: KdfParams,
    ) -> Result<Self, ContainerError> {
        if !path.exists() {
            kdf.check()?;
            let header = Header::generate(kdf);
            let mut container = Self::with_header(path, header, password, key_password)?;
            container.commit(BTreeMap::new())?;
            info!(path = %path.display(), "Created empty container");
            return Ok(container);
        }

        let bytes = fs::read(path)?;
        let header = Header::parse(&bytes)?;
        let mut container = Self::with_header(path, header, password, key_password)?;
        container.entries = container.decrypt_table(&bytes)?;
        debug!(path = %path.display(), entries = container.entries.len(), "Loaded container");
        Ok(container)
    }

    fn with_header(
        path: &Path,
        header: Header,
        password: &str,
        key_password: &str,
    ) -> Result<Self, ContainerError> {
        let store_key = derive_key(password.as_bytes(), &header.store_salt, header.kdf)?;
        let wrap_key = derive_key(key_password.as_bytes(), &header.wrap_salt, header.kdf)?;
        Ok(Self {
            path: path.to_path_buf(),
            header,
            store_key,
            wrap_key,
            entries: BTreeMap::new(),
            #[cfg(test)]
            fail_next_reload: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries as of the last load or commit
    pub fn entries(&self) -> &BTreeMap<String, Entry> {
        &self.entries
    }

    /// Re-read the committed file, replacing the in-memory entries.
    ///
    /// On error the in-memory entries are left as they were.
    pub fn reload(&mut self) -> Result<(), ContainerError> {
        #[cfg(test)]
        {
            if std::mem::take(&mut self.fail_next_reload) {
                return Err(ContainerError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "reload disabled for this test",
                )));
            }
        }

        let bytes = fs::read(&self.path)?;
        let header = Header::parse(&bytes)?;
        if header != self.header {
            return Err(ContainerError::InvalidFormat(
                "container header changed since open".to_string(),
            ));
        }
        self.entries = self.decrypt_table(&bytes)?;
        Ok(())
    }

    /// Encrypt `entries` and atomically replace the container file with them.
    ///
    /// Once the file is replaced `entries` become the in-memory state. If the
    /// commit fails, neither the file nor the in-memory entries change.
    pub fn commit(&mut self, entries: BTreeMap<String, Entry>) -> Result<(), ContainerError> {
        let table = EntryTable {
            version: PAYLOAD_VERSION,
            entries,
        };
        let plaintext = Zeroizing::new(serde_json::to_vec(&table)?);

        let header = self.header.to_bytes();
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill(&mut nonce);

        let ciphertext = cipher(&self.store_key)
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_slice(),
                    aad: &header,
                },
            )
            .map_err(|_| ContainerError::EncryptionFailed)?;

        let mut bytes = header;
        bytes.extend_from_slice(&nonce);
        bytes.extend_from_slice(&ciphertext);

        write_atomically(&self.path, &bytes)?;
        self.entries = table.entries;
        Ok(())
    }

    /// Encrypt key material for storage under `alias`
    pub fn wrap_key(&self, alias: &str, material: &[u8]) -> Result<String, ContainerError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill(&mut nonce);

        let ciphertext = cipher(&self.wrap_key)
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: material,
                    aad: alias.as_bytes(),
                },
            )
            .map_err(|_| ContainerError::EncryptionFailed)?;

        let mut wrapped = nonce.to_vec();
        wrapped.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(wrapped))
    }

    /// Recover key material stored under `alias`
    pub fn unwrap_key(
        &self,
        alias: &str,
        wrapped: &str,
    ) -> Result<Zeroizing<Vec<u8>>, ContainerError> {
        let wrapped = general_purpose::STANDARD
            .decode(wrapped)
            .map_err(|e| ContainerError::InvalidFormat(format!("wrapped key: {}", e)))?;
        if wrapped.len() < NONCE_LEN + TAG_LEN {
            return Err(ContainerError::InvalidFormat(
                "wrapped key too short".to_string(),
            ));
        }

        let (nonce, ciphertext) = wrapped.split_at(NONCE_LEN);
        let material = cipher(&self.wrap_key)
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: alias.as_bytes(),
                },
            )
            .map_err(|_| ContainerError::DecryptionFailed)?;
        Ok(Zeroizing::new(material))
    }

    fn decrypt_table(&self, bytes: &[u8]) -> Result<BTreeMap<String, Entry>, ContainerError> {
        let (aad, rest) = bytes.split_at(HEADER_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let plaintext = Zeroizing::new(
            cipher(&self.store_key)
                .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
                .map_err(|_| ContainerError::DecryptionFailed)?,
        );

        let table: EntryTable = serde_json::from_slice(&plaintext)?;
        if table.version != PAYLOAD_VERSION {
            return Err(ContainerError::InvalidFormat(format!(
                "unsupported entry table version {}",
                table.version
            )));
        }
        Ok(table.entries)
    }
}

fn cipher(key: &[u8; KEY_LEN]) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(Key::from_slice(key))
}

fn derive_key(
    password: &[u8],
    salt: &[u8],
    kdf: KdfParams,
) -> Result<Zeroizing<[u8; KEY_LEN]>, ContainerError> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(KEY_LEN))
        .map_err(|e| ContainerError::Kdf(format!("invalid Argon2 params: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password, salt, &mut *key)
        .map_err(|e| ContainerError::Kdf(format!("Argon2id hash failed: {}", e)))?;
    Ok(key)
}

/// Cheap KDF settings so tests don't spend their time in Argon2
#[cfg(test)]
pub(crate) const TEST_KDF: KdfParams = KdfParams {
    memory_kib: 64,
    iterations: 1,
    parallelism: 1,
};

/// Sibling path used while writing a new version of `path`
pub fn staging_path(path: &Path) -> PathBuf {
    let mut staged = OsString::from(path.as_os_str());
    staged.push(".tmp");
    PathBuf::from(staged)
}

/// Write `bytes` to a sibling temporary file, then rename it over `path`
/// and sync the directory so the rename survives a crash.
///
/// `path` itself is never opened for writing, so a failure at any step leaves
/// its previous contents intact.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp_path = staging_path(path);

    let result = fs::File::create(&tmp_path).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    fs::rename(&tmp_path, path)?;
    sync_parent_dir(path)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
