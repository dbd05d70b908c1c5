//! Secret key records and their JSON wire form

use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::KeystoreError;

/// Format recorded when a client does not name one
pub const DEFAULT_KEY_FORMAT: &str = "RAW";

/// A single alias-keyed secret
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKeyRecord {
    /// Unique identifier within the store
    pub alias: String,
    /// Key algorithm, e.g. "AES"
    pub algorithm: String,
    /// Encoding of the key material, e.g. "RAW"
    pub format: String,
    /// Raw secret bytes
    pub key_material: Zeroizing<Vec<u8>>,
}

impl SecretKeyRecord {
    pub fn new(
        alias: impl Into<String>,
        algorithm: impl Into<String>,
        format: impl Into<String>,
        key_material: Vec<u8>,
    ) -> Self {
        Self {
            alias: alias.into(),
            algorithm: algorithm.into(),
            format: format.into(),
            key_material: Zeroizing::new(key_material),
        }
    }

    /// Check required fields, reporting only the first one missing.
    ///
    /// Fields are checked in the order alias, key, algorithm.
    pub fn validate(&self) -> Result<(), KeystoreError> {
        if self.alias.is_empty() {
            return Err(missing("Alias"));
        }
        if self.key_material.is_empty() {
            return Err(missing("Key"));
        }
        if self.algorithm.is_empty() {
            return Err(missing("Algorithm"));
        }
        Ok(())
    }

    /// Key material as standard base64
    pub fn b64_key(&self) -> String {
        general_purpose::STANDARD.encode(self.key_material.as_slice())
    }
}

impl std::fmt::Debug for SecretKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKeyRecord")
            .field("alias", &self.alias)
            .field("algorithm", &self.algorithm)
            .field("format", &self.format)
            .field("key_material", &"<redacted>")
            .finish()
    }
}

/// JSON shape exchanged with clients:
/// `{"alias", "algorithm", "format", "b64Key"}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSecretKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b64_key: Option<String>,
}

/// Convert a record to its wire form
pub fn encode(record: &SecretKeyRecord) -> Result<WireSecretKey, KeystoreError> {
    record.validate()?;

    Ok(WireSecretKey {
        alias: Some(record.alias.clone()),
        algorithm: Some(record.algorithm.clone()),
        format: Some(record.format.clone()),
        b64_key: Some(record.b64_key()),
    })
}

/// Convert a wire form to a record
pub fn decode(wire: WireSecretKey) -> Result<SecretKeyRecord, KeystoreError> {
    let alias = non_empty(wire.alias).ok_or_else(|| missing("Alias"))?;
    let b64_key = non_empty(wire.b64_key).ok_or_else(|| missing("Key"))?;
    let algorithm = non_empty(wire.algorithm).ok_or_else(|| missing("Algorithm"))?;
    let format = non_empty(wire.format).unwrap_or_else(|| DEFAULT_KEY_FORMAT.to_string());

    let key_material = general_purpose::STANDARD
        .decode(b64_key.trim())
        .map_err(|e| KeystoreError::Validation(format!("Key is not valid base64: {}", e)))?;
    if key_material.is_empty() {
        return Err(missing("Key"));
    }

    Ok(SecretKeyRecord::new(alias, algorithm, format, key_material))
}

/// Parse a JSON document into a record
pub fn decode_json(body: &str) -> Result<SecretKeyRecord, KeystoreError> {
    if body.trim().is_empty() {
        return Err(KeystoreError::Validation(
            "SecretKey is missing from the request body".to_string(),
        ));
    }

    let wire: WireSecretKey = serde_json::from_str(body)
        .map_err(|e| KeystoreError::Validation(format!("Malformed SecretKey: {}", e)))?;
    decode(wire)
}

/// Aliases in ascending lexicographic order, without duplicates
pub fn sorted_alias_list<I>(aliases: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    let mut aliases: Vec<String> = aliases.into_iter().map(Into::into).collect();
    aliases.sort();
    aliases.dedup();
    aliases
}

fn missing(field: &str) -> KeystoreError {
    KeystoreError::Validation(format!("{} is missing", field))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
