//! Configuration management

use keyring_keystore::{KdfParams, KeystoreSettings, AUTHORIZED_CONTAINER_TYPE};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

/// Main configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub keystore: KeystoreConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Per-command dispatcher timeout in milliseconds
    #[serde(default = "default_process_timeout_ms")]
    pub process_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            process_timeout_ms: default_process_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn process_timeout(&self) -> Duration {
        Duration::from_millis(self.process_timeout_ms)
    }
}

#[derive(Deserialize)]
pub struct KeystoreConfig {
    #[serde(rename = "type", default = "default_keystore_type")]
    pub keystore_type: String,

    #[serde(default = "default_keystore_path")]
    pub path: PathBuf,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub key_password: Option<String>,

    #[serde(default)]
    pub kdf: KdfParams,
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            keystore_type: default_keystore_type(),
            path: default_keystore_path(),
            password: None,
            key_password: None,
            kdf: KdfParams::default(),
        }
    }
}

impl std::fmt::Debug for KeystoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoreConfig")
            .field("keystore_type", &self.keystore_type)
            .field("path", &self.path)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_password", &self.key_password.as_ref().map(|_| "<redacted>"))
            .field("kdf", &self.kdf)
            .finish()
    }
}

impl KeystoreConfig {
    /// Settings for opening the engine. Missing passwords become empty
    /// strings, which the engine rejects as a configuration error.
    pub fn settings(&self) -> KeystoreSettings {
        let mut settings = KeystoreSettings::new(
            self.keystore_type.clone(),
            String::new(),
            self.path.clone(),
            String::new(),
        )
        .with_kdf(self.kdf);
        if let Some(password) = &self.password {
            settings.password = Zeroizing::new(password.clone());
        }
        if let Some(key_password) = &self.key_password {
            settings.key_password = Zeroizing::new(key_password.clone());
        }
        settings
    }
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_process_timeout_ms() -> u64 {
    10_000
}

fn default_keystore_type() -> String {
    AUTHORIZED_CONTAINER_TYPE.to_string()
}

fn default_keystore_path() -> PathBuf {
    PathBuf::from("keyring.store")
}

impl Config {
    /// Load configuration from an optional file and the environment.
    ///
    /// Without an explicit file, `keyring.toml` in the working directory is
    /// used if present. Environment variables use the `KEYRING_` prefix with
    /// `__` between sections, e.g. `KEYRING_KEYSTORE__PASSWORD`.
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let file_source = match file {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("keyring").required(false),
        };

        let config = config::Config::builder()
            .add_source(file_source)
            .add_source(
                config::Environment::with_prefix("KEYRING")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        Ok(config.try_deserialize::<Config>()?)
    }
}
