//! Key material.
//!
//! Secret keys zeroize on drop and never print their bytes.

use std::fmt;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of KDF salts in bytes.
pub const SALT_LENGTH: usize = 32;

macro_rules! secret_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Zeroize, ZeroizeOnDrop)]
        pub struct $name([u8; KEY_LENGTH]);

        impl $name {
            pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
                Self(key)
            }

            /// Borrow the key bytes. Do not copy them elsewhere.
            pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "([REDACTED])"))
            }
        }
    };
}

secret_key!(
    /// Key derived from the vault passphrase. Only used to derive other keys
    /// and to seal the key check.
    MasterKey
);

secret_key!(
    /// Key sealing document bodies.
    ContentKey
);

impl MasterKey {
    /// Derive the content key for `purpose`.
    pub fn derive_content_key(&self, purpose: &[u8]) -> ContentKey {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(b"vaultdrive-content-key");
        hasher.update(self.0);
        hasher.update(purpose);

        let mut derived = [0u8; KEY_LENGTH];
        derived.copy_from_slice(&hasher.finalize());
        ContentKey::from_bytes(derived)
    }
}

/// Salt for key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt([u8; SALT_LENGTH]);

impl Salt {
    pub fn generate() -> Self {
        let mut salt = [0u8; SALT_LENGTH];
        rand::thread_rng().fill_bytes(&mut salt);
        Self(salt)
    }

    pub fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }
}
