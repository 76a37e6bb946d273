//! Host volume statistics.

use std::path::Path;

use vaultdrive_common::{Error, Result};

/// Space figures of the host volume under a vault root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeStats {
    /// Free bytes, including those reserved for the superuser.
    pub free: u64,
    /// Bytes available to unprivileged callers.
    pub available: u64,
    /// Total size of the volume.
    pub total: u64,
    /// Allocation unit of the volume.
    pub block_size: u64,
}

impl VolumeStats {
    /// Bytes in use.
    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }
}

/// Query the volume containing `root`.
///
/// # Errors
/// - The host refuses the query or the path does not exist
pub fn volume_stats(root: &Path) -> Result<VolumeStats> {
    let stats = fs2::statvfs(root).map_err(|e| {
        Error::Storage(format!("Volume query failed for {}: {}", root.display(), e))
    })?;

    Ok(VolumeStats {
        free: stats.free_space(),
        available: stats.available_space(),
        total: stats.total_space(),
        block_size: stats.allocation_granularity(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_volume_stats_for_existing_dir() {
        let temp = TempDir::new().unwrap();
        let stats = volume_stats(temp.path()).unwrap();

        assert!(stats.total > 0);
        assert!(stats.free <= stats.total);
        assert_eq!(stats.used(), stats.total - stats.free);
    }

    #[test]
    fn test_volume_stats_missing_path_fails() {
        let temp = TempDir::new().unwrap();
        assert!(volume_stats(&temp.path().join("missing")).is_err());
    }
}
