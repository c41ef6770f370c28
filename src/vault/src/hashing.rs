//! One-way hashing: bearer-token digests and encrypted-field lookup hashes
//!
//! Token digests are keyed by a key derived from *both* the global salt and the
//! tenant salt, so neither salt alone is enough to precompute digests.

use crate::error::{Result, VaultError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

const SALT_LEN: usize = 32;
const TOKEN_DOMAIN: &[u8] = b"tessera-token-v1";

/// Per-tenant salt, generated once at tenant creation and never changed
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSalt([u8; SALT_LEN]);

impl TenantSalt {
    /// Generate a fresh random salt
    pub fn generate() -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Self(salt)
    }

    pub fn from_bytes(bytes: [u8; SALT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_LEN] {
        &self.0
    }
}

impl fmt::Debug for TenantSalt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TenantSalt([REDACTED])")
    }
}

/// Deployment-wide salt supplied by the operator
#[derive(Clone)]
pub struct GlobalSalt([u8; SALT_LEN]);

impl GlobalSalt {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let salt: [u8; SALT_LEN] = bytes.try_into().map_err(|_| {
            VaultError::Key(format!(
                "global salt must be {} bytes, got {}",
                SALT_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(salt))
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| VaultError::Key(format!("global salt is not valid base64: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Read a base64 salt from the named environment variable
    pub fn from_env(var: &str) -> Result<Self> {
        let encoded = std::env::var(var).map_err(|_| {
            VaultError::InvalidConfiguration(format!("environment variable {} is not set", var))
        })?;
        Self::from_base64(&encoded)
    }
}

impl fmt::Debug for GlobalSalt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GlobalSalt([REDACTED])")
    }
}

/// Digest of a bearer token
///
/// Equality is constant-time (delegates to `blake3::Hash`).
#[derive(Clone, PartialEq, Eq)]
pub struct TokenDigest(blake3::Hash);

impl TokenDigest {
    /// Lowercase hex rendering, suitable for a database column
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Parse a digest previously produced by [`TokenDigest::to_hex`]
    pub fn from_hex(hex: &str) -> Result<Self> {
        blake3::Hash::from_hex(hex)
            .map(Self)
            .map_err(|e| VaultError::Key(format!("invalid token digest: {}", e)))
    }
}

impl fmt::Debug for TokenDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenDigest({})", self.to_hex())
    }
}

impl fmt::Display for TokenDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Hash a bearer token for storage or comparison
pub fn hash_token(token: &str, tenant_salt: &TenantSalt, global_salt: &GlobalSalt) -> TokenDigest {
    let mut kdf = blake3::Hasher::new_keyed(&global_salt.0);
    kdf.update(TOKEN_DOMAIN);
    kdf.update(tenant_salt.as_bytes());
    let token_key = kdf.finalize();

    TokenDigest(blake3::keyed_hash(token_key.as_bytes(), token.as_bytes()))
}

/// Keyed, deterministic hash of a field value for equality search
pub(crate) fn lookup_hash(key: &[u8; 32], field: &str, value: &str) -> String {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(field.as_bytes());
    hasher.update(&[0u8]);
    hasher.update(value.as_bytes());
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn global() -> GlobalSalt {
        GlobalSalt::from_bytes(&[3u8; SALT_LEN]).unwrap()
    }

    #[test]
    fn test_token_hash_deterministic() {
        let tenant = TenantSalt::from_bytes([1u8; SALT_LEN]);
        let a = hash_token("bearer-abc", &tenant, &global());
        let b = hash_token("bearer-abc", &tenant, &global());
        assert_eq!(a, b);
    }

    #[test]
    fn test_token_hash_differs_across_tenants() {
        let t1 = TenantSalt::from_bytes([1u8; SALT_LEN]);
        let t2 = TenantSalt::from_bytes([2u8; SALT_LEN]);
        assert_ne!(
            hash_token("bearer-abc", &t1, &global()),
            hash_token("bearer-abc", &t2, &global())
        );
    }

    #[test]
    fn test_token_hash_depends_on_global_salt() {
        let tenant = TenantSalt::from_bytes([1u8; SALT_LEN]);
        let other = GlobalSalt::from_bytes(&[4u8; SALT_LEN]).unwrap();
        assert_ne!(
            hash_token("bearer-abc", &tenant, &global()),
            hash_token("bearer-abc", &tenant, &other)
        );
    }

    #[test]
    fn test_digest_hex_roundtrip() {
        let tenant = TenantSalt::generate();
        let digest = hash_token("t", &tenant, &global());
        let parsed = TokenDigest::from_hex(&digest.to_hex()).unwrap();
        assert_eq!(digest, parsed);
        assert!(TokenDigest::from_hex("zz").is_err());
    }

    #[test]
    fn test_global_salt_length() {
        assert!(GlobalSalt::from_bytes(&[0u8; 8]).is_err());
    }

    #[test]
    fn test_lookup_hash_separates_fields() {
        let key = [5u8; 32];
        assert_eq!(
            lookup_hash(&key, "email", "a@example.com"),
            lookup_hash(&key, "email", "a@example.com")
        );
        assert_ne!(
            lookup_hash(&key, "email", "a@example.com"),
            lookup_hash(&key, "phone", "a@example.com")
        );
    }

    proptest! {
        #[test]
        fn prop_distinct_tenant_salts_give_distinct_digests(
            token in ".{0,64}",
            a in any::<[u8; 32]>(),
            b in any::<[u8; 32]>(),
        ) {
            prop_assume!(a != b);
            let d1 = hash_token(&token, &TenantSalt::from_bytes(a), &global());
            let d2 = hash_token(&token, &TenantSalt::from_bytes(b), &global());
            prop_assert_ne!(d1, d2);
        }
    }
}
