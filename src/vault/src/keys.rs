//! Master key and data key management
//!
//! Envelope layout: a tenant-independent master key, supplied by the operator,
//! wraps one or more randomly generated data keys. Only data keys ever touch
//! field plaintext. Wrapped data keys are safe to persist next to the data.

use crate::cipher;
use crate::error::{Result, VaultError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of every symmetric key handled by the vault (AES-256)
pub const KEY_LEN: usize = 32;

/// Key derivation context for the PII lookup-hash key
const LOOKUP_KEY_CONTEXT: &str = "tessera-vault 2024-01 pii lookup hash key";

/// Operator-supplied master key
///
/// Never hard-coded: construct it from configuration with
/// [`MasterKey::from_base64`] or [`MasterKey::from_env`].
#[derive(Clone)]
pub struct MasterKey {
    material: [u8; KEY_LEN],
}

impl MasterKey {
    /// Create a master key from raw bytes (must be exactly 32 bytes)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let material: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            VaultError::Key(format!(
                "master key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })?;

        if material.iter().all(|b| *b == 0) {
            return Err(VaultError::Key("master key must not be all zeroes".to_string()));
        }

        Ok(Self { material })
    }

    /// Decode a base64 master key
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| VaultError::Key(format!("master key is not valid base64: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Read a base64 master key from the named environment variable
    pub fn from_env(var: &str) -> Result<Self> {
        let encoded = std::env::var(var).map_err(|_| {
            VaultError::InvalidConfiguration(format!("environment variable {} is not set", var))
        })?;
        Self::from_base64(&encoded)
    }

    /// Wrap a data key for storage
    pub fn wrap(&self, key: &DataKey) -> Result<WrappedDataKey> {
        let aad = wrap_aad(key.id);
        let (nonce, ciphertext) = cipher::seal(&self.material, &key.material, aad.as_bytes())?;

        Ok(WrappedDataKey {
            key_id: key.id,
            nonce,
            ciphertext,
        })
    }

    /// Unwrap a previously wrapped data key
    pub fn unwrap_data_key(&self, wrapped: &WrappedDataKey) -> Result<DataKey> {
        let aad = wrap_aad(wrapped.key_id);
        let plaintext = cipher::open(
            &self.material,
            &wrapped.nonce,
            &wrapped.ciphertext,
            aad.as_bytes(),
        )
        .map_err(|_| VaultError::Key(format!("data key {} failed to unwrap", wrapped.key_id)))?;

        let material: [u8; KEY_LEN] = plaintext.as_slice().try_into().map_err(|_| {
            VaultError::Key(format!("data key {} has invalid length", wrapped.key_id))
        })?;

        Ok(DataKey {
            id: wrapped.key_id,
            material,
        })
    }

    /// Derive the keyed-hash key used for encrypted-field lookups
    pub(crate) fn lookup_key(&self) -> [u8; KEY_LEN] {
        blake3::derive_key(LOOKUP_KEY_CONTEXT, &self.material)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

fn wrap_aad(key_id: u32) -> String {
    format!("tessera-data-key:v{}", key_id)
}

/// Symmetric data key used for field encryption
#[derive(Clone)]
pub struct DataKey {
    id: u32,
    material: [u8; KEY_LEN],
}

impl DataKey {
    /// Generate a fresh random data key
    pub fn generate(id: u32) -> Self {
        let mut material = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut material);
        Self { id, material }
    }

    /// Key identifier embedded in every ciphertext it produces
    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn material(&self) -> &[u8; KEY_LEN] {
        &self.material
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKey")
            .field("id", &self.id)
            .field("material", &"[REDACTED]")
            .finish()
    }
}

/// A data key encrypted under the master key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedDataKey {
    /// Data key identifier
    pub key_id: u32,

    /// AES-GCM nonce used for wrapping
    pub nonce: Vec<u8>,

    /// Encrypted key material plus authentication tag
    pub ciphertext: Vec<u8>,
}
