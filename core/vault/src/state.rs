//! Locked/Unlocked state machine of a vault.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::content::ContentMap;
use vaultdrive_common::{Error, LockState, PersistFailure, Result, VaultId};
use vaultdrive_crypto::CryptoCodec;
use vaultdrive_storage::EncryptedStore;

/// Outcome of a plaintext migration pass.
#[derive(Debug, Default, Clone)]
pub struct MigrationReport {
    /// Files encoded and removed as plaintext.
    pub migrated: Vec<String>,
    /// Files left in place.
    pub failed: Vec<PersistFailure>,
}

/// A vault's lifecycle state together with its content map.
///
/// While `Locked` the map is empty and documents exist only in the store.
/// While `Unlocked` the map holds every decodable document. The `&mut self`
/// receivers of [`VaultState::unlock`] and [`VaultState::lock`] keep two
/// transitions from touching the same store at once.
pub struct VaultState {
    id: VaultId,
    store: Arc<dyn EncryptedStore>,
    codec: Arc<dyn CryptoCodec>,
    content: ContentMap,
    state: LockState,
    /// Documents that failed to decode on the last unlock.
    skipped: HashSet<String>,
}

impl VaultState {
    /// Create a locked vault over `store`.
    pub fn new(id: VaultId, store: Arc<dyn EncryptedStore>, codec: Arc<dyn CryptoCodec>) -> Self {
        Self {
            id,
            store,
            codec,
            content: ContentMap::new(),
            state: LockState::Locked,
            skipped: HashSet::new(),
        }
    }

    /// Create a locked vault and migrate any plaintext found in the store.
    pub async fn open(
        id: VaultId,
        store: Arc<dyn EncryptedStore>,
        codec: Arc<dyn CryptoCodec>,
    ) -> Result<Self> {
        let vault = Self::new(id, store, codec);
        let report = vault.migrate().await?;
        if !report.migrated.is_empty() || !report.failed.is_empty() {
            info!(
                vault = %vault.id,
                migrated = report.migrated.len(),
                failed = report.failed.len(),
                "Migrated plaintext files"
            );
        }
        Ok(vault)
    }

    pub fn id(&self) -> &VaultId {
        &self.id
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn is_unlocked(&self) -> bool {
        self.state == LockState::Unlocked
    }

    /// Handle to the shared content map.
    pub fn content(&self) -> ContentMap {
        self.content.clone()
    }

    pub fn store(&self) -> &Arc<dyn EncryptedStore> {
        &self.store
    }

    /// Documents left encrypted by the last unlock.
    pub fn skipped(&self) -> Vec<String> {
        let mut skipped: Vec<String> = self.skipped.iter().cloned().collect();
        skipped.sort();
        skipped
    }

    /// Encode every plaintext file of the store in place.
    ///
    /// A file whose encoded counterpart already exists is left alone so an
    /// existing document is never overwritten.
    pub async fn migrate(&self) -> Result<MigrationReport> {
        let mut report = MigrationReport::default();
        let plaintext = self.store.scan_plaintext().await?;
        if plaintext.is_empty() {
            return Ok(report);
        }

        let existing: HashSet<String> = self
            .store
            .scan()
            .await?
            .into_iter()
            .map(|file| file.name)
            .collect();

        for path in plaintext {
            if existing.contains(&path) {
                warn!(vault = %self.id, path = %path, "Encrypted counterpart exists, not migrating");
                report.failed.push(PersistFailure {
                    path,
                    reason: "encrypted counterpart already exists".to_string(),
                });
                continue;
            }

            match self.migrate_one(&path).await {
                Ok(()) => {
                    debug!(vault = %self.id, path = %path, "Migrated plaintext file");
                    report.migrated.push(path);
                }
                Err(e) => {
                    warn!(vault = %self.id, path = %path, error = %e, "Plaintext migration failed");
                    report.failed.push(PersistFailure {
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    async fn migrate_one(&self, path: &str) -> Result<()> {
        let plaintext = self.store.read_plaintext(path).await?;
        let encoded = self.codec.encrypt_bytes(&plaintext)?;
        self.store.write(path, encoded).await?;
        self.store.remove_plaintext(path).await
    }

    /// Decode the store into the content map.
    ///
    /// Documents that fail to decode are logged, skipped and stay encrypted
    /// on disk. Unlocking an unlocked vault reports the current state.
    ///
    /// # Errors
    /// - The store cannot be enumerated
    pub async fn unlock(&mut self) -> Result<LockState> {
        if self.state == LockState::Unlocked {
            debug!(vault = %self.id, "Unlock requested while already unlocked");
            return Ok(self.state);
        }

        self.content.clear();
        self.skipped.clear();

        let files = self.store.scan().await?;
        let total = files.len();

        for file in files {
            match self.decode(&file).await {
                Ok(plaintext) => {
                    self.content.insert(file.name, plaintext);
                }
                Err(e) => {
                    warn!(vault = %self.id, path = %file.name, error = %e, "Skipping undecodable document");
                    self.skipped.insert(file.name);
                }
            }
        }

        self.state = LockState::Unlocked;
        info!(
            vault = %self.id,
            documents = self.content.len(),
            skipped = total - self.content.len(),
            "Vault unlocked"
        );
        Ok(self.state)
    }

    async fn decode(&self, file: &vaultdrive_storage::EncryptedFile) -> Result<Vec<u8>> {
        let ciphertext = self.store.read(file).await?;
        self.codec
            .decrypt_bytes(&ciphertext)
            .map_err(|e| Error::Decrypt {
                path: file.name.clone(),
                reason: e.to_string(),
            })
    }

    /// Encode the content map back into the store and clear it.
    ///
    /// Every entry is attempted. If any fails, the vault stays unlocked with
    /// its map intact, no stale file is deleted, and the failures come back
    /// as one [`Error::LockFailed`]. Locking a locked vault reports the
    /// current state.
    pub async fn lock(&mut self) -> Result<LockState> {
        if self.state == LockState::Locked {
            debug!(vault = %self.id, "Lock requested while already locked");
            return Ok(self.state);
        }

        let keys = self.content.keys();
        let mut failures = Vec::new();

        for key in &keys {
            // Entries may vanish if a caller still holds the map.
            let Some(plaintext) = self.content.get(key) else {
                continue;
            };
            if let Err(e) = self.persist(key, &plaintext).await {
                error!(vault = %self.id, path = %key, error = %e, "Failed to persist document");
                failures.push(PersistFailure {
                    path: key.clone(),
                    reason: e.to_string(),
                });
            }
        }

        if !failures.is_empty() {
            return Err(Error::LockFailed { failures });
        }

        let live: HashSet<&str> = keys.iter().map(String::as_str).collect();
        for file in self.store.scan().await? {
            if live.contains(file.name.as_str()) || self.skipped.contains(&file.name) {
                continue;
            }
            match self.store.remove(&file.name).await {
                Ok(()) => debug!(vault = %self.id, path = %file.name, "Removed stale document"),
                Err(e) => warn!(vault = %self.id, path = %file.name, error = %e, "Failed to remove stale document"),
            }
        }

        self.content.clear();
        self.skipped.clear();
        self.state = LockState::Locked;
        info!(vault = %self.id, documents = keys.len(), "Vault locked");
        Ok(self.state)
    }

    async fn persist(&self, key: &str, plaintext: &[u8]) -> Result<()> {
        let encoded = self
            .codec
            .encrypt_bytes(plaintext)
            .map_err(|e| Error::Encrypt {
                path: key.to_string(),
                reason: e.to_string(),
            })?;
        self.store.write(key, encoded).await
    }
}

impl std::fmt::Debug for VaultState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultState")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("content", &self.content)
            .finish_non_exhaustive()
    }
}
