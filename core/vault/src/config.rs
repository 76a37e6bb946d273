//! Vault descriptor persisted at the vault root.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use vaultdrive_common::{Error, Result, VaultId};
use vaultdrive_crypto::{derive_key, seal_key_check, verify_key_check, KdfParams, MasterKey, Salt};
use vaultdrive_storage::{DEFAULT_EXTENSION, DESCRIPTOR_FILE};

/// Vault format version for migration support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultVersion {
    pub major: u32,
    pub minor: u32,
}

impl VaultVersion {
    /// Current vault format version.
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    /// Check if this version is compatible with the current version.
    pub fn is_compatible(&self) -> bool {
        self.major == Self::CURRENT.major
    }
}

impl Default for VaultVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Passphrase material for keyed codecs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySlot {
    /// Salt for master key derivation.
    pub salt: Salt,
    /// KDF parameters.
    pub kdf_params: KdfParams,
    /// Key check sealed under the master key, bound to the vault id.
    pub key_verification: Vec<u8>,
}

/// Vault descriptor.
///
/// Stored as [`DESCRIPTOR_FILE`] at the vault root next to the encrypted
/// documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Unique vault identifier.
    pub id: VaultId,
    /// Vault format version.
    pub version: VaultVersion,
    /// Codec algorithm id.
    pub algorithm: String,
    /// Reserved extension of encrypted documents.
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Present when the codec needs a master key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_slot: Option<KeySlot>,
    /// Vault creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub modified_at: DateTime<Utc>,
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

impl VaultConfig {
    /// Create a descriptor.
    ///
    /// A key slot is created when `password` is given.
    ///
    /// # Errors
    /// - Password empty
    /// - KDF failure
    pub fn new(
        id: VaultId,
        algorithm: impl Into<String>,
        password: Option<&[u8]>,
        kdf_params: KdfParams,
    ) -> Result<Self> {
        let key_slot = match password {
            Some(password) => {
                let salt = Salt::generate();
                let master_key = derive_key(password, &salt, &kdf_params)?;
                let key_verification = seal_key_check(&master_key, id.as_str().as_bytes())?;
                Some(KeySlot {
                    salt,
                    kdf_params,
                    key_verification,
                })
            }
            None => None,
        };

        let now = Utc::now();
        Ok(Self {
            id,
            version: VaultVersion::CURRENT,
            algorithm: algorithm.into(),
            extension: default_extension(),
            key_slot,
            created_at: now,
            modified_at: now,
        })
    }

    /// Whether unlocking needs a password.
    pub fn is_keyed(&self) -> bool {
        self.key_slot.is_some()
    }

    /// Derive and verify the master key.
    ///
    /// Returns `Ok(None)` for vaults without a key slot.
    ///
    /// # Errors
    /// - Password missing for a keyed vault
    /// - Wrong password
    pub fn master_key(&self, password: Option<&[u8]>) -> Result<Option<MasterKey>> {
        let Some(slot) = &self.key_slot else {
            return Ok(None);
        };
        let password = password.ok_or_else(|| {
            Error::NotPermitted(format!("Vault '{}' requires a password", self.id))
        })?;

        let master_key = derive_key(password, &slot.salt, &slot.kdf_params)?;
        if verify_key_check(&master_key, &slot.key_verification, self.id.as_str().as_bytes()) {
            Ok(Some(master_key))
        } else {
            Err(Error::NotPermitted("Invalid password".to_string()))
        }
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Whether `root` holds a descriptor.
    pub async fn exists(root: &Path) -> bool {
        fs::try_exists(root.join(DESCRIPTOR_FILE))
            .await
            .unwrap_or(false)
    }

    /// Load the descriptor from a vault root.
    ///
    /// # Errors
    /// - Descriptor missing or malformed
    /// - Incompatible format version
    pub async fn load(root: &Path) -> Result<Self> {
        let path = root.join(DESCRIPTOR_FILE);
        let json = match fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!(
                    "No vault descriptor at {}",
                    root.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };

        let config = Self::from_json(&json)?;
        if !config.version.is_compatible() {
            return Err(Error::Vault(format!(
                "Unsupported vault version {}.{}",
                config.version.major, config.version.minor
            )));
        }
        Ok(config)
    }

    /// Write the descriptor to a vault root.
    pub async fn save(&self, root: &Path) -> Result<()> {
        fs::create_dir_all(root).await?;
        fs::write(root.join(DESCRIPTOR_FILE), self.to_json()?).await?;
        debug!(vault = %self.id, root = %root.display(), "Saved vault descriptor");
        Ok(())
    }

    /// Record a modification.
    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}
