use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// The encryption type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionType {
    /// The array is not encrypted.
    #[default]
    None,
    /// AES-256-GCM with a 32-byte key.
    Aes256Gcm,
}

impl EncryptionType {
    /// The required key length in bytes.
    #[must_use]
    pub const fn key_length(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Aes256Gcm => 32,
        }
    }
}

/// An encryption key offered at array creation or open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    encryption_type: EncryptionType,
    key: Vec<u8>,
}

impl EncryptionKey {
    /// An unencrypted-array key.
    #[must_use]
    pub fn none() -> Self {
        Self {
            encryption_type: EncryptionType::None,
            key: Vec::new(),
        }
    }

    /// Create a key of the given type.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if `key` does not have the length
    /// the encryption type requires.
    pub fn new(encryption_type: EncryptionType, key: &[u8]) -> Result<Self> {
        if key.len() != encryption_type.key_length() {
            return Err(Error::InvalidArgument(format!(
                "encryption key must be {} bytes, got {}",
                encryption_type.key_length(),
                key.len()
            )));
        }
        Ok(Self {
            encryption_type,
            key: key.to_vec(),
        })
    }

    /// The encryption type of the key.
    #[must_use]
    pub fn encryption_type(&self) -> EncryptionType {
        self.encryption_type
    }
}

/// The key-validation record stored inside the array schema at creation.
///
/// Every open recomputes the salted digest of the offered key and compares
/// it against this record; a mismatch fails with [`Error::Unauthorized`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValidation {
    encryption_type: EncryptionType,
    salt: String,
    digest: String,
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::new(), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

fn salted_digest(salt: &str, key: &EncryptionKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update([key.encryption_type as u8]);
    hasher.update(&key.key);
    hex(&hasher.finalize())
}

impl KeyValidation {
    /// Create the validation record for `key` with a fresh random salt.
    #[must_use]
    pub fn create(key: &EncryptionKey) -> Self {
        let salt = hex(uuid::Uuid::new_v4().as_bytes());
        let digest = salted_digest(&salt, key);
        Self {
            encryption_type: key.encryption_type,
            salt,
            digest,
        }
    }

    /// Check an offered key against the record.
    ///
    /// # Errors
    /// Returns [`Error::Unauthorized`] if the key type or digest disagrees.
    pub fn check(&self, key: &EncryptionKey) -> Result<()> {
        if key.encryption_type != self.encryption_type
            || salted_digest(&self.salt, key) != self.digest
        {
            return Err(Error::Unauthorized);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_length_enforced() {
        assert!(EncryptionKey::new(EncryptionType::Aes256Gcm, &[0; 16]).is_err());
        assert!(EncryptionKey::new(EncryptionType::Aes256Gcm, &[0; 32]).is_ok());
        assert!(EncryptionKey::new(EncryptionType::None, &[]).is_ok());
    }

    #[test]
    fn validation_round_trip() {
        let key = EncryptionKey::new(EncryptionType::Aes256Gcm, &[7; 32]).unwrap();
        let validation = KeyValidation::create(&key);
        validation.check(&key).unwrap();

        let other = EncryptionKey::new(EncryptionType::Aes256Gcm, &[8; 32]).unwrap();
        assert!(matches!(validation.check(&other), Err(Error::Unauthorized)));
        assert!(matches!(
            validation.check(&EncryptionKey::none()),
            Err(Error::Unauthorized)
        ));
    }

    #[test]
    fn record_survives_serialization() {
        let key = EncryptionKey::none();
        let validation = KeyValidation::create(&key);
        let json = serde_json::to_string(&validation).unwrap();
        let back: KeyValidation = serde_json::from_str(&json).unwrap();
        back.check(&key).unwrap();
    }
}
