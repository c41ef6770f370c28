//! # Tessera Credential Vault
//!
//! Secure handling of sensitive identity attributes.
//!
//! ## Features
//!
//! - **Envelope Encryption**: AES-256-GCM data keys wrapped by an operator-supplied master key
//! - **Key Rotation**: Ciphertexts carry their data key id; retired keys still decrypt
//! - **Token Hashing**: BLAKE3 digests keyed by both a per-tenant and a global salt
//! - **Lookup Hashes**: Deterministic keyed hashes for equality search on encrypted fields
//!
//! ## Module Structure
//!
//! ```text
//! vault/
//! ├── keys/          - Master key, data keys, wrapping
//! ├── cipher/        - AES-256-GCM seal/open
//! ├── hashing/       - Salts, token digests, lookup hashes
//! └── credential/    - CredentialVault facade
//! ```

pub mod cipher;
pub mod credential;
pub mod error;
pub mod hashing;
pub mod keys;

pub use credential::{CredentialVault, VaultConfig};
pub use error::{Result, VaultError};
pub use hashing::{hash_token, GlobalSalt, TenantSalt, TokenDigest};
pub use keys::{DataKey, MasterKey, WrappedDataKey};
