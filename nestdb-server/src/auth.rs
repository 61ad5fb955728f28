//! Shared-secret authentication.
//!
//! The configured secret is kept only as a SHA-256 digest. Secrets supplied
//! by clients in `init` are hashed and compared against it.

use sha2::{Digest, Sha256};

/// Validates `init` secrets against the configured one.
#[derive(Debug, Clone, Default)]
pub struct SecretValidator {
    /// SHA-256 hex digest of the configured secret. `None` disables auth.
    secret_hash: Option<String>,
}

impl SecretValidator {
    /// Creates a validator for a plaintext secret. `None` disables auth.
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            secret_hash: secret.map(Self::hash_secret),
        }
    }

    /// Creates a validator from an already hashed secret.
    pub fn from_hash(hash: Option<String>) -> Self {
        Self {
            secret_hash: hash.map(|h| h.to_lowercase()),
        }
    }

    /// A validator that accepts everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Returns whether a secret is configured.
    pub fn is_enabled(&self) -> bool {
        self.secret_hash.is_some()
    }

    /// Checks a supplied secret. Always succeeds when auth is disabled.
    pub fn validate(&self, supplied: Option<&str>) -> bool {
        match (&self.secret_hash, supplied) {
            (None, _) => true,
            (Some(expected), Some(secret)) => Self::hash_secret(secret) == *expected,
            (Some(_), None) => false,
        }
    }

    /// Hashes a secret using SHA-256, returning a lowercase hex string.
    pub fn hash_secret(secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hex::encode(hasher.finalize())
    }
}
