//! Secret store engine
//!
//! Owns the open container and implements list/get/add/delete on top of it.
//! Every mutation is staged on a copy of the entry table and committed with a
//! temp-file-then-rename write; the copy only becomes live once the rename
//! succeeds. A failed commit therefore leaves both disk and memory at their
//! previous state.
//!
//! The engine takes `&mut self` for mutations and holds no locks; callers are
//! expected to route all access through a single owner (see `dispatcher`).

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::codec::SecretKeyRecord;
use crate::container::{Container, ContainerError, Entry, KdfParams};
use crate::error::KeystoreError;

/// The only container type accepted in the trusted deployment profile
pub const AUTHORIZED_CONTAINER_TYPE: &str = "SEALED";

/// Parameters needed to open a container
#[derive(Clone)]
pub struct KeystoreSettings {
    pub container_type: String,
    pub password: Zeroizing<String>,
    pub path: PathBuf,
    pub key_password: Zeroizing<String>,
    pub kdf: KdfParams,
}

impl KeystoreSettings {
    pub fn new(
        container_type: impl Into<String>,
        password: impl Into<String>,
        path: impl Into<PathBuf>,
        key_password: impl Into<String>,
    ) -> Self {
        Self {
            container_type: container_type.into(),
            password: Zeroizing::new(password.into()),
            path: path.into(),
            key_password: Zeroizing::new(key_password.into()),
            kdf: KdfParams::default(),
        }
    }

    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    fn check(&self) -> Result<(), KeystoreError> {
        require(&self.container_type, "Keystore Type")?;
        require(&self.password, "Keystore Password")?;
        require(&self.path.to_string_lossy(), "Keystore Path")?;
        require(&self.key_password, "Key Password")?;

        if self.container_type != AUTHORIZED_CONTAINER_TYPE {
            return Err(KeystoreError::configuration(format!(
                "Only the {} type is authorized for the keystore (got '{}')",
                AUTHORIZED_CONTAINER_TYPE, self.container_type
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for KeystoreSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoreSettings")
            .field("container_type", &self.container_type)
            .field("password", &"<redacted>")
            .field("path", &self.path)
            .field("key_password", &"<redacted>")
            .field("kdf", &self.kdf)
            .finish()
    }
}

fn require(value: &str, field: &str) -> Result<(), KeystoreError> {
    if value.is_empty() {
        return Err(KeystoreError::configuration(format!("{} is required", field)));
    }
    Ok(())
}

/// The secret store engine
#[derive(Debug)]
pub struct KeystoreEngine {
    container: Container,
}

impl KeystoreEngine {
    /// Open (or create) the container at `path`
    pub fn open(
        container_type: &str,
        password: &str,
        path: impl AsRef<Path>,
        key_password: &str,
    ) -> Result<Self, KeystoreError> {
        Self::open_with(&KeystoreSettings::new(
            container_type,
            password,
            path.as_ref(),
            key_password,
        ))
    }

    pub fn open_with(settings: &KeystoreSettings) -> Result<Self, KeystoreError> {
        settings.check()?;

        let container = Container::open_or_create(
            &settings.path,
            &settings.password,
            &settings.key_password,
            settings.kdf,
        )
        .map_err(|e| {
            let message = match &e {
                ContainerError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                    "Wrong KeyStore path"
                }
                ContainerError::Io(_) => "Unable to read KeyStore file",
                ContainerError::DecryptionFailed => "Wrong KeyStore password",
                _ => "Unable to initialize KeyStore",
            };
            KeystoreError::Configuration {
                message: message.to_string(),
                source: Some(e),
            }
        })?;

        info!(
            path = %settings.path.display(),
            entries = container.entries().len(),
            "Keystore opened"
        );
        Ok(Self { container })
    }

    pub fn path(&self) -> &Path {
        self.container.path()
    }

    /// Aliases of all secret key entries
    pub fn list_aliases(&self) -> BTreeSet<String> {
        self.container
            .entries()
            .iter()
            .filter(|(_, entry)| entry.is_key())
            .map(|(alias, _)| alias.clone())
            .collect()
    }

    /// Every secret key entry, decoded, ordered by alias
    pub fn list_keys(&self) -> Result<BTreeMap<String, SecretKeyRecord>, KeystoreError> {
        let mut keys = BTreeMap::new();
        for (alias, entry) in self.container.entries() {
            if let Some(record) = self.decode_entry(alias, entry)? {
                keys.insert(alias.clone(), record);
            }
        }
        Ok(keys)
    }

    /// A single secret key, if `alias` names one
    pub fn get_key(&self, alias: &str) -> Result<Option<SecretKeyRecord>, KeystoreError> {
        match self.container.entries().get(alias) {
            Some(entry) => self.decode_entry(alias, entry),
            None => Ok(None),
        }
    }

    /// Store a new secret key and commit the container
    pub fn add_key(&mut self, record: SecretKeyRecord) -> Result<String, KeystoreError> {
        record.validate()?;

        let alias = record.alias;
        if self.container.entries().contains_key(&alias) {
            return Err(KeystoreError::Conflict("SecretKey already exists".to_string()));
        }

        let wrapped_key = self
            .container
            .wrap_key(&alias, &record.key_material)
            .map_err(|e| {
                KeystoreError::applicative(
                    format!("Unable to add alias '{}' into the keystore instance", alias),
                    e,
                )
            })?;

        let mut staged = self.container.entries().clone();
        staged.insert(
            alias.clone(),
            Entry::SecretKey {
                algorithm: record.algorithm,
                format: record.format,
                wrapped_key,
                created_at: Utc::now(),
            },
        );

        self.persist(staged)?;
        info!(alias = %alias, "Secret key added");
        Ok(alias)
    }

    /// Remove a secret key; absent aliases are not an error
    pub fn delete_key(&mut self, alias: &str) -> Result<(), KeystoreError> {
        let mut staged = self.container.entries().clone();
        if staged.remove(alias).is_none() {
            debug!(alias = %alias, "Delete of unknown alias, nothing to commit");
            return Ok(());
        }

        self.persist(staged)?;
        info!(alias = %alias, "Secret key deleted");
        Ok(())
    }

    /// Commit `staged`, making it the live state, then re-read the file.
    ///
    /// Once the rename has happened the staged table is live even if the
    /// re-read fails, so memory never falls behind a committed file.
    fn persist(&mut self, staged: BTreeMap<String, Entry>) -> Result<(), KeystoreError> {
        self.container.commit(staged).map_err(|e| {
            warn!(path = %self.container.path().display(), error = %e, "Keystore commit failed");
            KeystoreError::Persistence {
                message: "Unable to save the key".to_string(),
                source: e,
            }
        })?;

        if let Err(e) = self.container.reload() {
            warn!(
                path = %self.container.path().display(),
                error = %e,
                "Reload after commit failed, keeping committed entries"
            );
        }
        Ok(())
    }

    fn decode_entry(
        &self,
        alias: &str,
        entry: &Entry,
    ) -> Result<Option<SecretKeyRecord>, KeystoreError> {
        let Entry::SecretKey {
            algorithm,
            format,
            wrapped_key,
            ..
        } = entry
        else {
            return Ok(None);
        };

        let material = self
            .container
            .unwrap_key(alias, wrapped_key)
            .map_err(|e| KeystoreError::applicative("Unable to read key", e))?;

        Ok(Some(SecretKeyRecord {
            alias: alias.to_string(),
            algorithm: algorithm.clone(),
            format: format.clone(),
            key_material: material,
        }))
    }
}
