//! Field-level PII encryption and token hashing
//!
//! Ciphertexts are rendered as `v{key_id}.{base64(nonce || ciphertext || tag)}`
//! so rotated data keys can keep decrypting older values.

use crate::cipher::{self, NONCE_LEN};
use crate::error::{Result, VaultError};
use crate::hashing::{self, GlobalSalt, TenantSalt, TokenDigest};
use crate::keys::{DataKey, MasterKey, WrappedDataKey, KEY_LEN};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::BTreeMap;
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for the credential vault
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Master key wrapping every data key
    pub master_key: MasterKey,

    /// Deployment-wide salt mixed into every token digest
    pub global_salt: GlobalSalt,
}

impl VaultConfig {
    /// Load both secrets from environment variables (base64 encoded)
    pub fn from_env(master_key_var: &str, global_salt_var: &str) -> Result<Self> {
        Ok(Self {
            master_key: MasterKey::from_env(master_key_var)?,
            global_salt: GlobalSalt::from_env(global_salt_var)?,
        })
    }
}

struct KeyRing {
    active: u32,
    keys: BTreeMap<u32, DataKey>,
    wrapped: Vec<WrappedDataKey>,
}

/// Envelope-encrypting vault for PII fields and bearer-token digests
pub struct CredentialVault {
    master: MasterKey,
    global_salt: GlobalSalt,
    lookup_key: [u8; KEY_LEN],
    ring: RwLock<KeyRing>,
}

impl CredentialVault {
    /// Create a vault with a freshly generated data key
    pub fn new(config: VaultConfig) -> Result<Self> {
        let key = DataKey::generate(1);
        let wrapped = config.master_key.wrap(&key)?;

        let mut keys = BTreeMap::new();
        keys.insert(key.id(), key);

        info!("Credential vault initialized with data key v1");

        Ok(Self {
            lookup_key: config.master_key.lookup_key(),
            master: config.master_key,
            global_salt: config.global_salt,
            ring: RwLock::new(KeyRing {
                active: 1,
                keys,
                wrapped: vec![wrapped],
            }),
        })
    }

    /// Reopen a vault from previously exported wrapped data keys
    ///
    /// The highest key id becomes the active encryption key.
    pub fn open(config: VaultConfig, wrapped: Vec<WrappedDataKey>) -> Result<Self> {
        let mut keys = BTreeMap::new();
        for entry in &wrapped {
            let key = config.master_key.unwrap_data_key(entry)?;
            keys.insert(key.id(), key);
        }

        let active = *keys
            .keys()
            .next_back()
            .ok_or_else(|| VaultError::Key("no wrapped data keys supplied".to_string()))?;

        debug!("Credential vault reopened with {} data keys, active v{}", keys.len(), active);

        Ok(Self {
            lookup_key: config.master_key.lookup_key(),
            master: config.master_key,
            global_salt: config.global_salt,
            ring: RwLock::new(KeyRing {
                active,
                keys,
                wrapped,
            }),
        })
    }

    /// Encrypt a PII field value
    ///
    /// Non-deterministic: a fresh nonce is drawn for every call.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let ring = self.read_ring()?;
        let key = ring
            .keys
            .get(&ring.active)
            .ok_or_else(|| VaultError::Key(format!("active data key v{} missing", ring.active)))?;

        let aad = field_aad(key.id());
        let (nonce, ciphertext) = cipher::seal(key.material(), plaintext.as_bytes(), aad.as_bytes())?;

        let mut combined = nonce;
        combined.extend_from_slice(&ciphertext);

        Ok(format!("v{}.{}", key.id(), STANDARD.encode(combined)))
    }

    /// Decrypt a PII field value produced by [`CredentialVault::encrypt`]
    pub fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let (key_id, payload) = parse_envelope(ciphertext)?;

        let combined = STANDARD
            .decode(payload)
            .map_err(|e| VaultError::DecryptionFailed(format!("invalid base64: {}", e)))?;

        // nonce plus a 16-byte tag at minimum
        if combined.len() < NONCE_LEN + 16 {
            return Err(VaultError::DecryptionFailed("ciphertext too short".to_string()));
        }
        let (nonce, sealed) = combined.split_at(NONCE_LEN);

        let ring = self.read_ring()?;
        let key = ring.keys.get(&key_id).ok_or_else(|| {
            VaultError::DecryptionFailed(format!("unknown data key v{}", key_id))
        })?;

        let aad = field_aad(key_id);
        let plaintext = cipher::open(key.material(), nonce, sealed, aad.as_bytes()).map_err(|e| {
            warn!(target: "security", key_id, "field decryption failed");
            e
        })?;

        String::from_utf8(plaintext)
            .map_err(|_| VaultError::DecryptionFailed("plaintext is not valid UTF-8".to_string()))
    }

    /// Generate a new data key and make it the active encryption key
    ///
    /// Returns the new key id. Existing ciphertexts remain decryptable.
    pub fn rotate_data_key(&self) -> Result<u32> {
        let mut ring = self
            .ring
            .write()
            .map_err(|e| VaultError::KeyRingUnavailable(e.to_string()))?;

        let next = ring.active + 1;
        let key = DataKey::generate(next);
        let wrapped = self.master.wrap(&key)?;

        ring.keys.insert(next, key);
        ring.wrapped.push(wrapped);
        ring.active = next;

        info!("Data key rotated to v{}", next);
        Ok(next)
    }

    /// Id of the key used for new encryptions
    pub fn active_key_id(&self) -> Result<u32> {
        Ok(self.read_ring()?.active)
    }

    /// Wrapped data keys, for persisting alongside encrypted data
    pub fn wrapped_keys(&self) -> Result<Vec<WrappedDataKey>> {
        Ok(self.read_ring()?.wrapped.clone())
    }

    /// Dual-salted digest of a bearer token
    pub fn hash_token(&self, token: &str, tenant_salt: &TenantSalt) -> TokenDigest {
        hashing::hash_token(token, tenant_salt, &self.global_salt)
    }

    /// Compare a presented token against a stored digest in constant time
    pub fn verify_token(&self, token: &str, tenant_salt: &TenantSalt, expected: &TokenDigest) -> bool {
        self.hash_token(token, tenant_salt) == *expected
    }

    /// Non-reversible lookup hash used for equality search on an encrypted field
    pub fn lookup_hash(&self, field: &str, value: &str) -> String {
        hashing::lookup_hash(&self.lookup_key, field, value)
    }

    fn read_ring(&self) -> Result<std::sync::RwLockReadGuard<'_, KeyRing>> {
        self.ring
            .read()
            .map_err(|e| VaultError::KeyRingUnavailable(e.to_string()))
    }
}

fn field_aad(key_id: u32) -> String {
    format!("tessera-field:v{}", key_id)
}

fn parse_envelope(ciphertext: &str) -> Result<(u32, &str)> {
    let rest = ciphertext
        .strip_prefix('v')
        .ok_or_else(|| VaultError::DecryptionFailed("missing key version prefix".to_string()))?;

    let (version, payload) = rest
        .split_once('.')
        .ok_or_else(|| VaultError::DecryptionFailed("malformed ciphertext envelope".to_string()))?;

    let key_id = version
        .parse::<u32>()
        .map_err(|_| VaultError::DecryptionFailed(format!("invalid key version '{}'", version)))?;

    Ok((key_id, payload))
}
