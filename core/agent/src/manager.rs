//! Vault manager for creating, unlocking and locking vaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::settings::AgentSettings;
use vaultdrive_common::{Error, Result, VaultId};
use vaultdrive_crypto::{create_default_registry, CodecRegistry, CryptoCodec};
use vaultdrive_drive::{DriveHost, DriverOptions, MountHandle, MountPointAllocator, Teardown};
use vaultdrive_storage::LocalStore;
use vaultdrive_vault::{MigrationReport, VaultConfig, VaultState};

/// Externally visible state of one vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VaultStatus {
    pub id: String,
    pub root: PathBuf,
    pub algorithm: String,
    pub mounted: bool,
    pub locked: bool,
    pub mount_point: Option<PathBuf>,
    /// Documents left encrypted by the last unlock.
    pub skipped: Vec<String>,
}

/// A registered vault.
struct ManagedVault {
    root: PathBuf,
    config: VaultConfig,
    /// Present from unlock until a successful lock.
    state: Option<VaultState>,
    mount: Option<MountHandle>,
}

impl ManagedVault {
    fn status(&self) -> VaultStatus {
        VaultStatus {
            id: self.config.id.to_string(),
            root: self.root.clone(),
            algorithm: self.config.algorithm.clone(),
            mounted: self.mount.as_ref().is_some_and(MountHandle::is_running),
            locked: !self.state.as_ref().is_some_and(VaultState::is_unlocked),
            mount_point: self.mount.as_ref().map(|m| m.mount_point().to_path_buf()),
            skipped: self.state.as_ref().map(VaultState::skipped).unwrap_or_default(),
        }
    }
}

/// Owns every known vault and drives their lifecycles.
///
/// Unlock decodes the vault and then mounts it. Lock unmounts first and
/// then persists, so no callback can touch the map while it is encoded.
pub struct VaultManager {
    settings: AgentSettings,
    settings_path: Option<PathBuf>,
    registry: CodecRegistry,
    host: Box<dyn DriveHost>,
    allocator: MountPointAllocator,
    vaults: Mutex<HashMap<String, ManagedVault>>,
}

impl VaultManager {
    /// Create a manager with the built-in codecs.
    pub fn new(settings: AgentSettings, host: Box<dyn DriveHost>) -> Self {
        Self::with_registry(settings, host, create_default_registry())
    }

    /// Create with a custom codec registry.
    pub fn with_registry(
        settings: AgentSettings,
        host: Box<dyn DriveHost>,
        registry: CodecRegistry,
    ) -> Self {
        let allocator = MountPointAllocator::new(&settings.mount_base);
        Self {
            settings,
            settings_path: None,
            registry,
            host,
            allocator,
            vaults: Mutex::new(HashMap::new()),
        }
    }

    /// Persist known vault locations to `path` whenever they change.
    pub fn persist_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_path = Some(path.into());
        self
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn registry(&self) -> &CodecRegistry {
        &self.registry
    }

    /// Register every vault listed in the settings.
    ///
    /// Vaults whose descriptor cannot be loaded are logged and skipped.
    pub async fn load_known(&self) -> usize {
        let known: Vec<(String, PathBuf)> = self
            .settings
            .vaults
            .iter()
            .map(|(id, root)| (id.clone(), root.clone()))
            .collect();

        let mut loaded = 0;
        for (id, root) in known {
            match self.register(&id, &root).await {
                Ok(()) => loaded += 1,
                Err(e) => warn!(vault = %id, root = %root.display(), error = %e, "Skipping known vault"),
            }
        }
        loaded
    }

    /// Create a vault at `root`.
    ///
    /// # Preconditions
    /// - No descriptor exists at `root`
    /// - Keyed algorithms need a passphrase
    ///
    /// # Postconditions
    /// - Descriptor written, vault registered and locked
    pub async fn create(
        &self,
        id: &str,
        root: &Path,
        algorithm: Option<&str>,
        passphrase: Option<&[u8]>,
    ) -> Result<VaultStatus> {
        let vault_id = VaultId::new(id)?;
        let algorithm = algorithm.unwrap_or(&self.settings.default_algorithm);

        let password = if self.registry.requires_key(algorithm)? {
            let password = passphrase.ok_or_else(|| {
                Error::InvalidInput(format!("Codec '{}' requires a passphrase", algorithm))
            })?;
            Some(password)
        } else {
            None
        };

        if self.vaults.lock().await.contains_key(id) {
            return Err(Error::AlreadyExists(format!("Vault '{}' is already registered", id)));
        }
        if VaultConfig::exists(root).await {
            return Err(Error::AlreadyExists(format!(
                "A vault already exists at {}",
                root.display()
            )));
        }

        let config = VaultConfig::new(vault_id, algorithm, password, self.settings.kdf_params()?)?;
        config.save(root).await?;
        info!(vault = %id, root = %root.display(), algorithm, "Vault created");

        self.insert(root, config).await?;
        self.remember(id, root).await?;
        self.status(id).await
    }

    /// Register an existing vault.
    ///
    /// # Errors
    /// - No descriptor at `root`
    /// - Descriptor belongs to another id
    pub async fn open(&self, id: &str, root: &Path) -> Result<VaultStatus> {
        self.register(id, root).await?;
        self.remember(id, root).await?;
        self.status(id).await
    }

    async fn register(&self, id: &str, root: &Path) -> Result<()> {
        let config = VaultConfig::load(root).await?;
        if config.id.as_str() != id {
            return Err(Error::InvalidInput(format!(
                "Vault at {} is '{}', not '{}'",
                root.display(),
                config.id,
                id
            )));
        }
        self.insert(root, config).await
    }

    async fn insert(&self, root: &Path, config: VaultConfig) -> Result<()> {
        let mut vaults = self.vaults.lock().await;
        let id = config.id.to_string();
        if vaults.contains_key(&id) {
            debug!(vault = %id, "Vault already registered");
            return Ok(());
        }
        vaults.insert(
            id,
            ManagedVault {
                root: root.to_path_buf(),
                config,
                state: None,
                mount: None,
            },
        );
        Ok(())
    }

    async fn remember(&self, id: &str, root: &Path) -> Result<()> {
        let Some(path) = &self.settings_path else {
            return Ok(());
        };
        let mut settings = AgentSettings::load(path).await?;
        if settings.vaults.get(id).map(PathBuf::as_path) == Some(root) {
            return Ok(());
        }
        settings.vaults.insert(id.to_string(), root.to_path_buf());
        settings.save(path).await
    }

    fn codec(&self, config: &VaultConfig, passphrase: Option<&[u8]>) -> Result<Arc<dyn CryptoCodec>> {
        let master_key = config.master_key(passphrase)?;
        self.registry.resolve(&config.algorithm, master_key.as_ref())
    }

    fn store(root: &Path, config: &VaultConfig) -> Result<Arc<LocalStore>> {
        Ok(Arc::new(LocalStore::new(root, config.extension.as_str())?))
    }

    /// Decode a vault and mount it.
    ///
    /// Unlocking a mounted vault reports its status.
    ///
    /// # Errors
    /// - Unknown vault
    /// - Wrong or missing passphrase
    /// - Store unreadable
    /// - No mount point or the host refuses the mount; the vault stays locked
    pub async fn unlock(&self, id: &str, passphrase: Option<&[u8]>) -> Result<VaultStatus> {
        let mut vaults = self.vaults.lock().await;
        let vault = vaults
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Vault '{}' is not registered", id)))?;

        if vault.mount.is_some() {
            debug!(vault = %id, "Unlock requested while mounted");
            return Ok(vault.status());
        }

        let resumed = vault.state.as_ref().is_some_and(VaultState::is_unlocked);
        let mut state = match vault.state.take() {
            // A previous lock failed; the map is still live.
            Some(state) if resumed => state,
            _ => {
                let codec = self.codec(&vault.config, passphrase)?;
                let store = Self::store(&vault.root, &vault.config)?;
                VaultState::open(vault.config.id.clone(), store, codec).await?
            }
        };
        state.unlock().await?;

        let options = DriverOptions {
            volume_root: Some(vault.root.clone()),
            strict_rename: self.settings.strict_rename,
            volume_label: id.to_string(),
            ..DriverOptions::default()
        };

        match MountHandle::start(self.host.as_ref(), &self.allocator, state.content(), options) {
            Ok(mount) => {
                info!(
                    vault = %id,
                    mount_point = %mount.mount_point().display(),
                    "Vault unlocked and mounted"
                );
                vault.mount = Some(mount);
                vault.state = Some(state);
                Ok(vault.status())
            }
            Err(e) => {
                if resumed {
                    warn!(vault = %id, error = %e, "Mount failed, unpersisted map kept");
                    vault.state = Some(state);
                } else {
                    warn!(vault = %id, error = %e, "Mount failed, vault stays locked");
                }
                Err(e)
            }
        }
    }

    /// Unmount a vault and persist it.
    ///
    /// Teardown always succeeds, forced if necessary. A failed persist keeps
    /// the vault unlocked and unmounted so the lock can be retried.
    ///
    /// # Errors
    /// - Unknown vault
    /// - [`Error::LockFailed`] when documents could not be persisted
    pub async fn lock(&self, id: &str) -> Result<VaultStatus> {
        let mut vaults = self.vaults.lock().await;
        let vault = vaults
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Vault '{}' is not registered", id)))?;

        if let Some(mount) = vault.mount.take() {
            let grace = self.settings.unmount_grace();
            let join_timeout = self.settings.join_timeout();
            let teardown = tokio::task::spawn_blocking(move || mount.stop(grace, join_timeout))
                .await
                .unwrap_or_else(|e| {
                    warn!(vault = %id, error = %e, "Unmount task failed");
                    Teardown::Abandoned
                });
            match teardown {
                Teardown::Clean => debug!(vault = %id, "Unmounted"),
                other => warn!(vault = %id, teardown = ?other, "Unmount was forced"),
            }
        }

        let Some(state) = vault.state.as_mut() else {
            debug!(vault = %id, "Lock requested while locked");
            return Ok(vault.status());
        };
        state.lock().await?;
        vault.state = None;
        info!(vault = %id, "Vault locked");
        Ok(vault.status())
    }

    /// Lock every unlocked vault. Returns the first error after trying all.
    pub async fn lock_all(&self) -> Result<()> {
        let ids: Vec<String> = self.vaults.lock().await.keys().cloned().collect();
        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.lock(&id).await {
                warn!(vault = %id, error = %e, "Lock failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Encode plaintext files of a locked vault in place.
    pub async fn migrate(&self, id: &str, passphrase: Option<&[u8]>) -> Result<MigrationReport> {
        let vaults = self.vaults.lock().await;
        let vault = vaults
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("Vault '{}' is not registered", id)))?;
        if vault.state.is_some() {
            return Err(Error::NotPermitted(format!("Vault '{}' is unlocked", id)));
        }

        let codec = self.codec(&vault.config, passphrase)?;
        let store = Self::store(&vault.root, &vault.config)?;
        VaultState::new(vault.config.id.clone(), store, codec)
            .migrate()
            .await
    }

    pub async fn status(&self, id: &str) -> Result<VaultStatus> {
        self.vaults
            .lock()
            .await
            .get(id)
            .map(ManagedVault::status)
            .ok_or_else(|| Error::NotFound(format!("Vault '{}' is not registered", id)))
    }

    /// Status of every registered vault, by id.
    pub async fn list(&self) -> Vec<VaultStatus> {
        let mut statuses: Vec<VaultStatus> = self
            .vaults
            .lock()
            .await
            .values()
            .map(ManagedVault::status)
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Driver of a mounted vault, for in-process access.
    pub async fn driver(&self, id: &str) -> Option<Arc<vaultdrive_drive::VaultDriver>> {
        self.vaults
            .lock()
            .await
            .get(id)
            .and_then(|v| v.mount.as_ref())
            .map(|m| Arc::clone(m.driver()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use vaultdrive_crypto::{ALGORITHM_PLAIN, ALGORITHM_XCHACHA};
    use vaultdrive_drive::{CreateDisposition, HeadlessHost, ReadOutcome};

    fn manager(dir: &TempDir) -> VaultManager {
        let settings = AgentSettings {
            mount_base: dir.path().join("mounts"),
            default_algorithm: ALGORITHM_PLAIN.to_string(),
            unmount_grace_ms: 200,
            join_timeout_ms: 200,
            ..AgentSettings::default()
        };
        VaultManager::new(settings, Box::new(HeadlessHost))
    }

    #[tokio::test]
    async fn test_create_unlock_write_lock_roundtrip() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("vault");
        let manager = manager(&dir);

        let status = manager.create("notes", &root, None, None).await.unwrap();
        assert!(status.locked);
        assert!(!status.mounted);

        let status = manager.unlock("notes", None).await.unwrap();
        assert!(!status.locked);
        assert!(status.mounted);
        assert!(status.mount_point.is_some());

        let driver = manager.driver("notes").await.unwrap();
        driver
            .create("docs/a.txt", CreateDisposition::Create, false)
            .unwrap();
        driver.write("docs/a.txt", 0, b"hello").unwrap();

        let status = manager.lock("notes").await.unwrap();
        assert!(status.locked);
        assert!(!status.mounted);
        assert!(manager.driver("notes").await.is_none());
        assert!(root.join("docs").join("a.txt.cv").exists());

        manager.unlock("notes", None).await.unwrap();
        let driver = manager.driver("notes").await.unwrap();
        assert_eq!(
            driver.read("docs/a.txt", 0, 16).unwrap(),
            ReadOutcome::Data(b"hello".to_vec())
        );
        manager.lock("notes").await.unwrap();
    }

    #[tokio::test]
    async fn test_keyed_vault_needs_passphrase() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("secret");
        let manager = manager(&dir);

        let result = manager
            .create("secret", &root, Some(ALGORITHM_XCHACHA), None)
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));

        manager
            .create("secret", &root, Some(ALGORITHM_XCHACHA), Some(b"correct horse"))
            .await
            .unwrap();

        let wrong = manager.unlock("secret", Some(b"wrong")).await;
        assert!(matches!(wrong, Err(Error::NotPermitted(_))));
        assert!(manager.status("secret").await.unwrap().locked);

        let status = manager.unlock("secret", Some(b"correct horse")).await.unwrap();
        assert!(status.mounted);
        manager.lock("secret").await.unwrap();
    }

    #[tokio::test]
    async fn test_create_refuses_existing_vault() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("vault");
        let manager = manager(&dir);

        manager.create("one", &root, None, None).await.unwrap();
        let result = manager.create("two", &root, None, None).await;
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_open_checks_id() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("vault");
        manager(&dir).create("notes", &root, None, None).await.unwrap();

        let fresh = manager(&dir);
        assert!(matches!(
            fresh.open("other", &root).await,
            Err(Error::InvalidInput(_))
        ));
        let status = fresh.open("notes", &root).await.unwrap();
        assert_eq!(status.id, "notes");
        assert!(status.locked);
    }

    #[tokio::test]
    async fn test_unknown_vault() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        assert!(matches!(
            manager.unlock("ghost", None).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(manager.lock("ghost").await, Err(Error::NotFound(_))));
        assert!(matches!(manager.status("ghost").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unlock_and_lock_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager
            .create("notes", &dir.path().join("vault"), None, None)
            .await
            .unwrap();

        let first = manager.unlock("notes", None).await.unwrap();
        let second = manager.unlock("notes", None).await.unwrap();
        assert_eq!(first.mount_point, second.mount_point);

        manager.lock("notes").await.unwrap();
        let status = manager.lock("notes").await.unwrap();
        assert!(status.locked);
    }

    #[tokio::test]
    async fn test_list_sorted_and_distinct_mount_points() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        for id in ["b", "a"] {
            manager
                .create(id, &dir.path().join(id), None, None)
                .await
                .unwrap();
            manager.unlock(id, None).await.unwrap();
        }

        let list = manager.list().await;
        let ids: Vec<&str> = list.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_ne!(list[0].mount_point, list[1].mount_point);

        manager.lock_all().await.unwrap();
        assert!(manager.list().await.iter().all(|s| s.locked && !s.mounted));
    }

    #[tokio::test]
    async fn test_migrate_locked_vault_only() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("vault");
        let manager = manager(&dir);
        manager.create("notes", &root, None, None).await.unwrap();
        std::fs::write(root.join("plain.txt"), b"draft").unwrap();

        let report = manager.migrate("notes", None).await.unwrap();
        assert_eq!(report.migrated, vec!["plain.txt".to_string()]);
        assert!(root.join("plain.txt.cv").exists());
        assert!(!root.join("plain.txt").exists());

        manager.unlock("notes", None).await.unwrap();
        assert!(matches!(
            manager.migrate("notes", None).await,
            Err(Error::NotPermitted(_))
        ));
        manager.lock("notes").await.unwrap();
    }

    #[tokio::test]
    async fn test_known_vaults_persisted() {
        let dir = TempDir::new().unwrap();
        let settings_path = dir.path().join("settings.json");
        let root = dir.path().join("vault");

        manager(&dir)
            .persist_to(&settings_path)
            .create("notes", &root, None, None)
            .await
            .unwrap();

        let mut settings = AgentSettings::load(&settings_path).await.unwrap();
        assert_eq!(settings.vaults.get("notes"), Some(&root));

        settings.mount_base = dir.path().join("mounts");
        settings
            .vaults
            .insert("missing".to_string(), dir.path().join("nowhere"));
        let reloaded = VaultManager::new(settings, Box::new(HeadlessHost));
        assert_eq!(reloaded.load_known().await, 1);
        assert_eq!(reloaded.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_waits_bounded_time() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager
            .create("notes", &dir.path().join("vault"), None, None)
            .await
            .unwrap();
        manager.unlock("notes", None).await.unwrap();

        let started = std::time::Instant::now();
        manager.lock("notes").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
