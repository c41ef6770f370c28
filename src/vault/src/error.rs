//! Error types for the vault module

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    /// Key material is missing, malformed or has the wrong length
    #[error("Key error: {0}")]
    Key(String),

    /// Operator-supplied configuration is missing or invalid
    #[error("Invalid vault configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Ciphertext could not be authenticated or decoded.
    ///
    /// Never downgraded to an empty plaintext.
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Internal lock was poisoned by a panicking writer
    #[error("Key ring unavailable: {0}")]
    KeyRingUnavailable(String),
}
