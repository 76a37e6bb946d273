//! Passphrase key derivation and verification.
//!
//! Master keys come from Argon2id. A vault proves a passphrase by opening a
//! small key check sealed under the master key at creation time.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::aead::{open, seal};
use crate::keys::{MasterKey, Salt, KEY_LENGTH};
use vaultdrive_common::{Error, Result};

const KEY_CHECK: &[u8] = b"VAULTDRIVE_KEY_CHECK_V1";

/// Argon2id cost parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_cost: u32,
    /// Number of iterations.
    pub time_cost: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl KdfParams {
    const fn new(memory_cost: u32, time_cost: u32, parallelism: u32) -> Self {
        Self {
            memory_cost,
            time_cost,
            parallelism,
        }
    }

    /// 64 MiB, 3 passes.
    pub fn interactive() -> Self {
        Self::new(64 * 1024, 3, 4)
    }

    /// 32 MiB, 3 passes.
    pub fn moderate() -> Self {
        Self::new(32 * 1024, 3, 2)
    }

    /// 256 MiB, 4 passes. May take several seconds.
    pub fn sensitive() -> Self {
        Self::new(256 * 1024, 4, 4)
    }

    /// Minimal cost for tests. Never use for real vaults.
    pub fn insecure_fast() -> Self {
        Self::new(1024, 1, 1)
    }

    /// Resolve a named strength level.
    pub fn from_strength(strength: &str) -> Result<Self> {
        match strength {
            "interactive" => Ok(Self::interactive()),
            "moderate" => Ok(Self::moderate()),
            "sensitive" => Ok(Self::sensitive()),
            other => Err(Error::InvalidInput(format!(
                "Unknown KDF strength '{}': use interactive, moderate or sensitive",
                other
            ))),
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Derive a master key from a passphrase and salt.
///
/// # Errors
/// - Empty passphrase
/// - Parameters Argon2 rejects
pub fn derive_key(passphrase: &[u8], salt: &Salt, params: &KdfParams) -> Result<MasterKey> {
    if passphrase.is_empty() {
        return Err(Error::InvalidInput("Password cannot be empty".to_string()));
    }

    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(KEY_LENGTH),
    )
    .map_err(|e| Error::Crypto(format!("Invalid KDF parameters: {}", e)))?;

    let mut key = [0u8; KEY_LENGTH];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params)
        .hash_password_into(passphrase, salt.as_bytes(), &mut key)
        .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;

    Ok(MasterKey::from_bytes(key))
}

/// Seal the key check for `master_key`, bound to `context`.
pub fn seal_key_check(master_key: &MasterKey, context: &[u8]) -> Result<Vec<u8>> {
    seal(master_key.as_bytes(), KEY_CHECK, context)
}

/// Whether `master_key` opens a key check sealed for `context`.
pub fn verify_key_check(master_key: &MasterKey, key_check: &[u8], context: &[u8]) -> bool {
    match open(master_key.as_bytes(), key_check, context) {
        Ok(plaintext) => plaintext.len() == KEY_CHECK.len() && bool::from(plaintext.ct_eq(KEY_CHECK)),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(passphrase: &[u8], salt: u8) -> MasterKey {
        derive_key(passphrase, &Salt::from_bytes([salt; 32]), &KdfParams::insecure_fast()).unwrap()
    }

    #[test]
    fn test_derive_key_deterministic() {
        assert_eq!(key(b"pw-123", 42).as_bytes(), key(b"pw-123", 42).as_bytes());
        assert_ne!(key(b"pw-123", 1).as_bytes(), key(b"pw-123", 2).as_bytes());
        assert_ne!(key(b"pw-123", 1).as_bytes(), key(b"pw-124", 1).as_bytes());
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        let result = derive_key(b"", &Salt::generate(), &KdfParams::insecure_fast());
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = KdfParams {
            memory_cost: 1,
            time_cost: 1,
            parallelism: 1,
        };
        assert!(matches!(
            derive_key(b"pw", &Salt::generate(), &params),
            Err(Error::Crypto(_))
        ));
    }

    #[test]
    fn test_key_check() {
        let right = key(b"secure-password", 99);
        let wrong = key(b"wrong-password", 99);

        let check = seal_key_check(&right, b"vault-a").unwrap();
        assert!(verify_key_check(&right, &check, b"vault-a"));
        assert!(!verify_key_check(&wrong, &check, b"vault-a"));
        assert!(!verify_key_check(&right, &check, b"vault-b"));
        assert!(!verify_key_check(&right, b"garbage", b"vault-a"));
    }

    #[test]
    fn test_strength_names() {
        assert_eq!(KdfParams::from_strength("moderate").unwrap(), KdfParams::moderate());
        assert!(KdfParams::from_strength("extreme").is_err());
    }
}
