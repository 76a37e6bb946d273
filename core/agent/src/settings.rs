//! Process configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use vaultdrive_common::{Error, Result};
use vaultdrive_crypto::{KdfParams, ALGORITHM_XCHACHA};

/// Environment variable naming the settings file.
pub const CONFIG_ENV: &str = "VAULTDRIVE_CONFIG";

const SETTINGS_FILE: &str = "settings.json";
const APP_DIR: &str = "vaultdrive";

/// Agent settings.
///
/// Missing fields fall back to their defaults, so a partial file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Directory under which drive identities become mount directories.
    pub mount_base: PathBuf,
    /// Codec used by newly created vaults.
    pub default_algorithm: String,
    /// Argon2id strength for new key slots.
    pub kdf_strength: String,
    /// Wait after a polite unmount request.
    pub unmount_grace_ms: u64,
    /// Wait after forcing an unmount.
    pub join_timeout_ms: u64,
    /// Refuse renames onto existing paths unless replacing was requested.
    pub strict_rename: bool,
    /// Known vaults by id.
    pub vaults: BTreeMap<String, PathBuf>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            mount_base: default_data_dir().join("mounts"),
            default_algorithm: ALGORITHM_XCHACHA.to_string(),
            kdf_strength: "interactive".to_string(),
            unmount_grace_ms: 2_000,
            join_timeout_ms: 5_000,
            strict_rename: false,
            vaults: BTreeMap::new(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

impl AgentSettings {
    /// Settings file used when neither a path nor [`CONFIG_ENV`] is given.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join(SETTINGS_FILE)
    }

    /// Resolve the settings file: explicit path, then [`CONFIG_ENV`], then
    /// the per-user default.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => Self::default_path(),
        }
    }

    /// Load settings from `path`. A missing file yields the defaults.
    ///
    /// # Errors
    /// - File unreadable
    /// - Malformed JSON
    pub async fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path).await {
            Ok(json) => {
                debug!(path = %path.display(), "Loaded agent settings");
                Self::from_json(&json)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No settings file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Write settings to `path`, creating parent directories.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, self.to_json()?).await?;
        debug!(path = %path.display(), "Saved agent settings");
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn unmount_grace(&self) -> Duration {
        Duration::from_millis(self.unmount_grace_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// KDF parameters for new key slots.
    pub fn kdf_params(&self) -> Result<KdfParams> {
        KdfParams::from_strength(&self.kdf_strength)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings = AgentSettings::from_json(r#"{"strict_rename": true}"#).unwrap();
        assert!(settings.strict_rename);
        assert_eq!(settings.unmount_grace_ms, 2_000);
        assert_eq!(settings.default_algorithm, ALGORITHM_XCHACHA);
        assert!(settings.vaults.is_empty());
    }

    #[test]
    fn test_durations() {
        let settings = AgentSettings {
            unmount_grace_ms: 250,
            join_timeout_ms: 1_500,
            ..AgentSettings::default()
        };
        assert_eq!(settings.unmount_grace(), Duration::from_millis(250));
        assert_eq!(settings.join_timeout(), Duration::from_millis(1_500));
    }

    #[test]
    fn test_explicit_path_wins() {
        let path = PathBuf::from("/tmp/explicit.json");
        assert_eq!(AgentSettings::resolve_path(Some(&path)), path);
    }

    #[test]
    fn test_unknown_kdf_strength() {
        let settings = AgentSettings {
            kdf_strength: "extreme".to_string(),
            ..AgentSettings::default()
        };
        assert!(settings.kdf_params().is_err());
    }

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = AgentSettings::load(&dir.path().join("absent.json"))
            .await
            .unwrap();
        assert_eq!(settings, AgentSettings::default());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);

        let mut settings = AgentSettings::default();
        settings.mount_base = dir.path().join("mounts");
        settings
            .vaults
            .insert("work".to_string(), dir.path().join("work"));
        settings.save(&path).await.unwrap();

        let loaded = AgentSettings::load(&path).await.unwrap();
        assert_eq!(loaded, settings);
    }

    #[tokio::test]
    async fn test_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, "{ not json").unwrap();

        let result = AgentSettings::load(&path).await;
        assert!(matches!(result, Err(Error::Serialization(_))));
    }
}
