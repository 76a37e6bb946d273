//! Filesystem operation contract over a vault's content map.
//!
//! [`VaultDriver`] implements every callback a host filesystem API needs:
//! create, read, write, close, cleanup, delete, rename, enumerate, stat and
//! volume queries. Callbacks are synchronous and may run concurrently from
//! any number of host dispatch threads. Each one resolves its target by path
//! on every call, so handle tokens carry no state.
//!
//! Errors are returned as [`DriverError`] status values. Nothing panics or
//! unwinds across this boundary.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::namespace::{self, ChildKind};
use crate::shadow::{ShadowPolicy, TempFileTracker};
use vaultdrive_storage::volume_stats;
use vaultdrive_vault::{write_document, CapacityError, ContentMap, MoveError};

/// Status of a failed driver callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Malformed call.
    #[error("Invalid parameter")]
    InvalidParameter,
    /// Access outside the mounted drive.
    #[error("Access denied")]
    AccessDenied,
    /// No such virtual path.
    #[error("No such file or directory")]
    NotFound,
    /// Exclusive create or strict rename onto an existing path.
    #[error("Name collision")]
    NameCollision,
    /// Unexpected internal fault.
    #[error("I/O error")]
    IoError,
    /// Volume query could not be delegated to the host.
    #[error("Unsuccessful")]
    Unsuccessful,
}

impl DriverError {
    /// NT status code for kernel-mode hosts.
    pub fn ntstatus(self) -> u32 {
        match self {
            DriverError::InvalidParameter => 0xC000_000D,
            DriverError::AccessDenied => 0xC000_0022,
            DriverError::NotFound => 0xC000_0034,
            DriverError::NameCollision => 0xC000_0035,
            DriverError::IoError => 0xC000_0185,
            DriverError::Unsuccessful => 0xC000_0001,
        }
    }

    /// POSIX errno for FUSE-style hosts.
    pub fn errno(self) -> i32 {
        match self {
            DriverError::InvalidParameter => libc::EINVAL,
            DriverError::AccessDenied => libc::EACCES,
            DriverError::NotFound => libc::ENOENT,
            DriverError::NameCollision => libc::EEXIST,
            DriverError::IoError | DriverError::Unsuccessful => libc::EIO,
        }
    }
}

/// Result of a driver callback.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// How `create` treats existing and missing paths.
///
/// Discriminants follow the NT create disposition values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CreateDisposition {
    /// Replace if present, create otherwise.
    Supersede = 0,
    /// Open an existing path.
    Open = 1,
    /// Create a new path.
    Create = 2,
    /// Open if present, create otherwise.
    OpenIf = 3,
    /// Truncate if present, create otherwise.
    Overwrite = 4,
    /// Truncate if present, create otherwise.
    OverwriteIf = 5,
}

impl TryFrom<u32> for CreateDisposition {
    type Error = DriverError;

    fn try_from(value: u32) -> DriverResult<Self> {
        match value {
            0 => Ok(Self::Supersede),
            1 => Ok(Self::Open),
            2 => Ok(Self::Create),
            3 => Ok(Self::OpenIf),
            4 => Ok(Self::Overwrite),
            5 => Ok(Self::OverwriteIf),
            _ => Err(DriverError::InvalidParameter),
        }
    }
}

/// Successful `create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateOutcome {
    /// Opaque token, unique per successful call.
    pub handle: u64,
    /// Whether a directory was opened.
    pub is_directory: bool,
    /// Whether the path existed before the call.
    pub existed: bool,
}

/// Successful `read`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes starting at the requested offset.
    Data(Vec<u8>),
    /// Offset at or past the end of the document.
    EndOfFile,
}

impl ReadOutcome {
    /// NT status signalled for [`ReadOutcome::EndOfFile`].
    pub const END_OF_FILE_STATUS: u32 = 0xC000_0011;
}

/// One file or directory as reported by `stat` and `enumerate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub modified: SystemTime,
}

/// Space figures reported for the drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub label: String,
    pub total: u64,
    pub free: u64,
    pub available: u64,
    pub block_size: u64,
}

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Drive letter the driver answers to. Paths carrying another drive
    /// prefix are refused.
    pub identity: Option<char>,
    /// Host directory whose volume backs space queries.
    pub volume_root: Option<PathBuf>,
    /// Label reported by volume queries.
    pub volume_label: String,
    /// Fail renames onto an existing path unless replacing was requested.
    pub strict_rename: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            identity: None,
            volume_root: None,
            volume_label: "vaultdrive".to_string(),
            strict_rename: false,
        }
    }
}

/// Filesystem driver for one unlocked vault.
pub struct VaultDriver {
    content: ContentMap,
    tracker: TempFileTracker,
    options: DriverOptions,
    next_handle: AtomicU64,
    live: Arc<AtomicBool>,
    timestamp: SystemTime,
}

impl VaultDriver {
    /// Create a driver over `content` with the default shadow policy.
    pub fn new(content: ContentMap, options: DriverOptions) -> Self {
        Self::with_tracker(content, options, TempFileTracker::default())
    }

    /// Create a driver with a custom shadow policy.
    pub fn with_policy(
        content: ContentMap,
        options: DriverOptions,
        policy: Box<dyn ShadowPolicy>,
    ) -> Self {
        Self::with_tracker(content, options, TempFileTracker::new(policy))
    }

    fn with_tracker(content: ContentMap, options: DriverOptions, tracker: TempFileTracker) -> Self {
        Self {
            content,
            tracker,
            options,
            next_handle: AtomicU64::new(1),
            live: Arc::new(AtomicBool::new(false)),
            timestamp: SystemTime::now(),
        }
    }

    pub fn content(&self) -> &ContentMap {
        &self.content
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    /// Timestamp reported for every entry.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Refuse paths addressing another drive.
    fn check_root(&self, raw: &str) -> DriverResult<()> {
        match (namespace::split_drive(raw).0, self.options.identity) {
            (Some(drive), Some(identity)) if drive == identity.to_ascii_uppercase() => Ok(()),
            (Some(drive), _) => {
                warn!(drive = %drive, path = %raw, "Refusing access outside the mounted drive");
                Err(DriverError::AccessDenied)
            }
            (None, _) => Ok(()),
        }
    }

    /// Resolve a path that is about to be created or modified.
    fn resolve_for_update(&self, raw: &str) -> DriverResult<String> {
        self.check_root(raw)?;
        let key = namespace::to_virtual_path(raw);
        if !key.is_empty()
            && key
                .split(namespace::SEPARATOR)
                .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(DriverError::InvalidParameter);
        }
        Ok(key)
    }

    fn issue(&self, is_directory: bool, existed: bool) -> CreateOutcome {
        CreateOutcome {
            handle: self.next_handle.fetch_add(1, Ordering::Relaxed),
            is_directory,
            existed,
        }
    }

    /// Open or create `path`.
    pub fn create(
        &self,
        path: &str,
        disposition: CreateDisposition,
        is_directory_hint: bool,
    ) -> DriverResult<CreateOutcome> {
        let key = self.resolve_for_update(path)?;
        debug!(path = %key, ?disposition, directory = is_directory_hint, "create");

        if self.content.with_read(|entries| namespace::is_directory(entries, &key)) {
            return Ok(self.issue(true, true));
        }

        // Directories only exist through their contents, so a new one is an
        // open without an entry.
        if is_directory_hint && !self.content.contains(&key) {
            return match disposition {
                CreateDisposition::Open => Err(DriverError::NotFound),
                _ => Ok(self.issue(true, false)),
            };
        }

        let existed = match disposition {
            CreateDisposition::Supersede
            | CreateDisposition::Overwrite
            | CreateDisposition::OverwriteIf => self.content.truncate_or_create(&key),
            CreateDisposition::Create => {
                if !self.content.insert_if_absent(&key) {
                    return Err(DriverError::NameCollision);
                }
                false
            }
            CreateDisposition::Open => {
                if !self.content.contains(&key) {
                    return Err(DriverError::NotFound);
                }
                true
            }
            CreateDisposition::OpenIf => !self.content.insert_if_absent(&key),
        };

        Ok(self.issue(false, existed))
    }

    /// Read up to `length` bytes at `offset`.
    pub fn read(&self, path: &str, offset: u64, length: usize) -> DriverResult<ReadOutcome> {
        let key = namespace::to_virtual_path(path);
        trace!(path = %key, offset, length, "read");

        self.content
            .with_entry(&key, |data| {
                let size = data.len() as u64;
                if offset >= size {
                    return ReadOutcome::EndOfFile;
                }
                let available = (size - offset).min(length as u64) as usize;
                let start = offset as usize;
                ReadOutcome::Data(data[start..start + available].to_vec())
            })
            .ok_or(DriverError::NotFound)
    }

    /// Write `bytes` at `offset`, creating the document if needed.
    ///
    /// Returns the number of bytes written. Directories, paths below an
    /// existing document and sizes the map cannot hold are refused.
    pub fn write(&self, path: &str, offset: u64, bytes: &[u8]) -> DriverResult<usize> {
        let key = self.resolve_for_update(path)?;
        trace!(path = %key, offset, length = bytes.len(), "write");

        if key.is_empty() {
            return Err(DriverError::InvalidParameter);
        }
        if offset
            .checked_add(bytes.len() as u64)
            .is_none_or(|end| end > isize::MAX as u64)
        {
            return Err(DriverError::InvalidParameter);
        }

        self.content.with_exclusive(|entries| {
            if namespace::is_directory(entries, &key) || has_document_ancestor(entries, &key) {
                return Err(DriverError::InvalidParameter);
            }
            let written = match entries.get_mut(&key) {
                Some(data) => write_document(data, offset, bytes),
                None => {
                    let mut data = Vec::new();
                    let written = write_document(&mut data, offset, bytes);
                    if written.is_ok() {
                        entries.insert(key.clone(), data);
                    }
                    written
                }
            };
            written.map_err(|e| capacity_refused(&key, e))
        })?;
        Ok(bytes.len())
    }

    /// Last handle to `path` closed.
    ///
    /// Closing a document purges the shadows tracked for it, then removes
    /// every untracked lock file left in the map.
    pub fn close(&self, path: &str) {
        let key = namespace::to_virtual_path(path);
        debug!(path = %key, "close");

        if key.is_empty() || self.tracker.is_shadow(&key) {
            return;
        }

        let shadows = self.tracker.take_shadows(&key);

        self.content.with_exclusive(|entries| {
            // Renames register shadows while holding this lock.
            let tracked = self.tracker.tracked();
            for shadow in &shadows {
                if entries.remove(shadow).is_some() {
                    debug!(original = %key, shadow = %shadow, "Purged shadow file");
                }
            }
            entries.retain(|name, _| {
                let stale = self.tracker.is_lock_file(name) && !tracked.contains(name);
                if stale {
                    debug!(path = %name, "Swept stale lock file");
                }
                !stale
            });
        });
    }

    /// Handle cleanup; removes `path` and its shadows when `delete_on_close`.
    pub fn cleanup(&self, path: &str, delete_on_close: bool) {
        if !delete_on_close {
            return;
        }
        let key = namespace::to_virtual_path(path);
        debug!(path = %key, "cleanup with delete-on-close");

        let shadows = self.tracker.take_shadows(&key);
        self.tracker.forget(&key);
        self.content.with_exclusive(|entries| {
            entries.remove(&key);
            for shadow in &shadows {
                entries.remove(shadow);
            }
        });
    }

    /// Remove a document.
    ///
    /// Directories exist only through their contents and cannot be removed
    /// while they are visible.
    pub fn delete(&self, path: &str) -> DriverResult<()> {
        let key = self.resolve_for_update(path)?;
        debug!(path = %key, "delete");

        if key.is_empty() {
            return Err(DriverError::AccessDenied);
        }
        if self.content.remove(&key).is_some() {
            self.tracker.forget(&key);
            return Ok(());
        }
        if self.content.with_read(|entries| namespace::is_directory(entries, &key)) {
            return Err(DriverError::AccessDenied);
        }
        Err(DriverError::NotFound)
    }

    /// Move `old_path` to `new_path`.
    ///
    /// Unless the driver runs with `strict_rename`, an existing destination
    /// is replaced even when `replace_if_existing` is false.
    pub fn rename(
        &self,
        old_path: &str,
        new_path: &str,
        replace_if_existing: bool,
    ) -> DriverResult<()> {
        let (old_drive, _) = namespace::split_drive(old_path);
        let (new_drive, _) = namespace::split_drive(new_path);
        if old_drive.is_some() && new_drive.is_some() && old_drive != new_drive {
            warn!(from = %old_path, to = %new_path, "Refusing cross-volume rename");
            return Err(DriverError::AccessDenied);
        }

        let from = self.resolve_for_update(old_path)?;
        let to = self.resolve_for_update(new_path)?;
        debug!(from = %from, to = %to, replace = replace_if_existing, "rename");

        if from.is_empty() || to.is_empty() {
            return Err(DriverError::AccessDenied);
        }
        if from == to {
            return if self.content.contains(&from)
                || self.content.with_read(|entries| namespace::is_directory(entries, &from))
            {
                Ok(())
            } else {
                Err(DriverError::NotFound)
            };
        }

        let overwrite = replace_if_existing || !self.options.strict_rename;

        if self.content.with_read(|entries| namespace::is_directory(entries, &to)) {
            return Err(DriverError::NameCollision);
        }

        let moved = self
            .content
            .move_entry(&from, &to, overwrite, || self.tracker.on_rename(&from, &to));

        match moved {
            Ok(()) => Ok(()),
            Err(MoveError::DestinationExists) => Err(DriverError::NameCollision),
            Err(MoveError::SourceMissing) => self.rename_directory(&from, &to, overwrite),
        }
    }

    /// Move every document below `from` to the same place below `to`.
    fn rename_directory(&self, from: &str, to: &str, overwrite: bool) -> DriverResult<()> {
        let from_prefix = format!("{}{}", from, namespace::SEPARATOR);
        let to_prefix = format!("{}{}", to, namespace::SEPARATOR);
        if to.starts_with(&from_prefix) {
            return Err(DriverError::InvalidParameter);
        }

        let moved = self.content.with_exclusive(|entries| {
            let sources: Vec<String> = entries
                .keys()
                .filter(|k| k.starts_with(&from_prefix))
                .cloned()
                .collect();
            if sources.is_empty() {
                return Err(DriverError::NotFound);
            }

            let targets: Vec<(String, String)> = sources
                .into_iter()
                .map(|source| {
                    let target = format!("{}{}", to_prefix, &source[from_prefix.len()..]);
                    (source, target)
                })
                .collect();
            if !overwrite && targets.iter().any(|(_, target)| entries.contains_key(target)) {
                return Err(DriverError::NameCollision);
            }

            for (source, target) in &targets {
                if let Some(data) = entries.remove(source) {
                    entries.insert(target.clone(), data);
                }
                self.tracker.on_rename(source, target);
            }
            Ok(targets.len())
        })?;

        debug!(from = %from, to = %to, documents = moved, "Renamed directory");
        Ok(())
    }

    /// Direct children of the directory at `path`.
    pub fn enumerate(&self, path: &str) -> DriverResult<Vec<EntryInfo>> {
        let key = namespace::to_virtual_path(path);
        trace!(path = %key, "enumerate");

        let children = self
            .content
            .with_read(|entries| namespace::list_children(entries, &key));

        Ok(children
            .into_iter()
            .map(|child| match child.kind {
                ChildKind::File(size) => EntryInfo {
                    name: child.name,
                    is_directory: false,
                    size,
                    modified: self.timestamp,
                },
                ChildKind::Directory => EntryInfo {
                    name: child.name,
                    is_directory: true,
                    size: 0,
                    modified: self.timestamp,
                },
            })
            .collect())
    }

    /// Attributes of `path`.
    pub fn stat(&self, path: &str) -> DriverResult<EntryInfo> {
        let key = namespace::to_virtual_path(path);
        trace!(path = %key, "stat");

        let name = namespace::file_name(&key).to_string();
        self.content.with_read(|entries| {
            if namespace::is_directory(entries, &key) {
                return Ok(EntryInfo {
                    name,
                    is_directory: true,
                    size: 0,
                    modified: self.timestamp,
                });
            }
            entries
                .get(&key)
                .map(|data| EntryInfo {
                    name,
                    is_directory: false,
                    size: data.len() as u64,
                    modified: self.timestamp,
                })
                .ok_or(DriverError::NotFound)
        })
    }

    /// Space figures of the host volume under the vault root.
    pub fn volume_stat(&self) -> DriverResult<VolumeInfo> {
        let root = self
            .options
            .volume_root
            .as_ref()
            .ok_or(DriverError::Unsuccessful)?;

        let stats = volume_stats(root).map_err(|e| {
            warn!(root = %root.display(), error = %e, "Volume query failed");
            DriverError::Unsuccessful
        })?;

        Ok(VolumeInfo {
            label: self.options.volume_label.clone(),
            total: stats.total,
            free: stats.free,
            available: stats.available,
            block_size: stats.block_size,
        })
    }

    /// Resize a document, zero-filling when it grows.
    pub fn set_end_of_file(&self, path: &str, length: u64) -> DriverResult<()> {
        let key = self.resolve_for_update(path)?;
        debug!(path = %key, length, "set_end_of_file");

        if length > isize::MAX as u64 {
            return Err(DriverError::InvalidParameter);
        }
        match self.content.set_len(&key, length) {
            Ok(true) => Ok(()),
            Ok(false) => Err(DriverError::NotFound),
            Err(e) => Err(capacity_refused(&key, e)),
        }
    }

    /// The host reports the drive as reachable.
    pub fn mounted(&self) {
        self.live.store(true, Ordering::SeqCst);
        info!(identity = ?self.options.identity, "Drive mounted");
    }

    /// The host reports the drive as gone.
    pub fn unmounted(&self) {
        self.live.store(false, Ordering::SeqCst);
        info!(identity = ?self.options.identity, "Drive unmounted");
    }

    /// Whether the drive is currently reachable.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Shared handle to the live flag.
    pub fn live_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.live)
    }
}

/// Whether some proper ancestor of `key` is a document.
fn has_document_ancestor(entries: &HashMap<String, Vec<u8>>, key: &str) -> bool {
    let mut current = namespace::parent(key);
    while !current.is_empty() {
        if entries.contains_key(current) {
            return true;
        }
        current = namespace::parent(current);
    }
    false
}

fn capacity_refused(key: &str, error: CapacityError) -> DriverError {
    warn!(path = %key, error = %error, "Refusing oversized document");
    DriverError::InvalidParameter
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    fn driver() -> VaultDriver {
        VaultDriver::new(
            ContentMap::new(),
            DriverOptions {
                identity: Some('Z'),
                ..DriverOptions::default()
            },
        )
    }

    fn names(entries: &[EntryInfo]) -> Vec<String> {
        let mut names: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_disposition_matrix() {
        let driver = driver();
        driver.write("\\p.txt", 0, b"data").unwrap();

        assert_eq!(
            driver.create("\\p.txt", CreateDisposition::Create, false),
            Err(DriverError::NameCollision)
        );
        assert_eq!(
            driver.create("\\missing.txt", CreateDisposition::Open, false),
            Err(DriverError::NotFound)
        );

        let outcome = driver
            .create("\\new.txt", CreateDisposition::OpenIf, false)
            .unwrap();
        assert!(!outcome.existed);
        assert_eq!(driver.stat("\\new.txt").unwrap().size, 0);

        let outcome = driver.create("\\p.txt", CreateDisposition::OpenIf, false).unwrap();
        assert!(outcome.existed);
        assert_eq!(driver.stat("\\p.txt").unwrap().size, 4);

        assert!(driver.create("\\p.txt", CreateDisposition::Open, false).is_ok());
        assert_eq!(
            CreateDisposition::try_from(9),
            Err(DriverError::InvalidParameter)
        );
        assert_eq!(CreateDisposition::try_from(5), Ok(CreateDisposition::OverwriteIf));
    }

    #[test]
    fn test_overwrite_truncates_in_place() {
        let driver = driver();
        let observer = driver.content().clone();
        driver.write("\\doc.txt", 0, b"hello").unwrap();

        for disposition in [
            CreateDisposition::Supersede,
            CreateDisposition::Overwrite,
            CreateDisposition::OverwriteIf,
        ] {
            driver.write("\\doc.txt", 0, b"hello").unwrap();
            let outcome = driver.create("\\doc.txt", disposition, false).unwrap();
            assert!(outcome.existed);
            assert_eq!(observer.size_of("doc.txt"), Some(0));
        }

        let outcome = driver
            .create("\\fresh.txt", CreateDisposition::Overwrite, false)
            .unwrap();
        assert!(!outcome.existed);
        assert!(observer.contains("fresh.txt"));
    }

    #[test]
    fn test_handles_are_unique() {
        let driver = driver();
        let a = driver.create("\\", CreateDisposition::Open, true).unwrap();
        let b = driver.create("\\x", CreateDisposition::OpenIf, false).unwrap();
        let c = driver.create("\\x", CreateDisposition::Open, false).unwrap();

        assert!(a.is_directory);
        assert!(a.handle < b.handle && b.handle < c.handle);
    }

    #[test]
    fn test_read_boundary() {
        let driver = driver();
        driver.write("\\f.bin", 0, b"0123456789").unwrap();

        assert_eq!(driver.read("\\f.bin", 10, 10).unwrap(), ReadOutcome::EndOfFile);
        assert_eq!(driver.read("\\f.bin", 42, 1).unwrap(), ReadOutcome::EndOfFile);
        assert_eq!(
            driver.read("\\f.bin", 9, 10).unwrap(),
            ReadOutcome::Data(b"9".to_vec())
        );
        assert_eq!(
            driver.read("\\f.bin", 2, 3).unwrap(),
            ReadOutcome::Data(b"234".to_vec())
        );
        assert_eq!(driver.read("\\nope", 0, 1), Err(DriverError::NotFound));
    }

    #[test]
    fn test_write_extends_with_zeros() {
        let driver = driver();
        assert_eq!(driver.write("\\sparse", 3, b"ab").unwrap(), 2);
        assert_eq!(driver.content().get("sparse").unwrap(), vec![0, 0, 0, b'a', b'b']);

        driver.write("\\sparse", 0, b"XYZ").unwrap();
        assert_eq!(driver.content().get("sparse").unwrap(), b"XYZab");
    }

    #[test]
    fn test_write_rejects_directories_and_root() {
        let driver = driver();
        driver.write("\\dir\\a.txt", 0, b"1").unwrap();

        assert_eq!(driver.write("\\dir", 0, b"x"), Err(DriverError::InvalidParameter));
        assert_eq!(driver.write("\\", 0, b"x"), Err(DriverError::InvalidParameter));
        assert_eq!(
            driver.write("\\a\\..\\b", 0, b"x"),
            Err(DriverError::InvalidParameter)
        );
        assert_eq!(
            driver.write("\\big", u64::MAX, b"x"),
            Err(DriverError::InvalidParameter)
        );
    }

    #[test]
    fn test_oversized_offsets_are_refused() {
        let driver = driver();
        driver.write("\\sparse", 0, b"abc").unwrap();
        let huge = isize::MAX as u64 + 1;

        assert_eq!(
            driver.write("\\sparse", huge, b"x"),
            Err(DriverError::InvalidParameter)
        );
        assert_eq!(
            driver.write("\\fresh", huge - 1, b"x"),
            Err(DriverError::InvalidParameter)
        );
        assert_eq!(
            driver.set_end_of_file("\\sparse", huge),
            Err(DriverError::InvalidParameter)
        );
        assert_eq!(driver.content().get("sparse").unwrap(), b"abc");
        assert!(!driver.content().contains("fresh"));
    }

    #[test]
    fn test_write_below_document_is_refused() {
        let driver = driver();
        driver.write("\\a.txt", 0, b"file").unwrap();

        assert_eq!(
            driver.write("\\a.txt\\x", 0, b"x"),
            Err(DriverError::InvalidParameter)
        );
        assert_eq!(
            driver.write("\\a.txt\\deep\\y", 0, b"y"),
            Err(DriverError::InvalidParameter)
        );
        assert_eq!(driver.content().keys(), vec!["a.txt".to_string()]);
        assert!(!driver.stat("\\a.txt").unwrap().is_directory);
    }

    #[test]
    fn test_directory_inference() {
        let driver = driver();
        driver.write("\\a\\b.txt", 0, b"xyz").unwrap();

        let stat = driver.stat("\\a").unwrap();
        assert!(stat.is_directory);
        assert_eq!(stat.name, "a");
        assert!(driver.stat("\\").unwrap().is_directory);

        let root = driver.enumerate("\\").unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].name, "a");
        assert!(root[0].is_directory);
        assert_eq!(root[0].size, 0);

        let a = driver.enumerate("\\a").unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].size, 3);
        assert_eq!(a[0].modified, driver.timestamp());

        assert!(driver.enumerate("\\empty").unwrap().is_empty());
        assert_eq!(driver.stat("\\zzz"), Err(DriverError::NotFound));

        let opened = driver.create("\\a", CreateDisposition::Open, false).unwrap();
        assert!(opened.is_directory);
    }

    #[test]
    fn test_new_directory_open() {
        let driver = driver();
        let outcome = driver.create("\\newdir", CreateDisposition::Create, true).unwrap();
        assert!(outcome.is_directory);
        assert!(driver.content().is_empty());

        assert_eq!(
            driver.create("\\newdir", CreateDisposition::Open, true),
            Err(DriverError::NotFound)
        );
    }

    #[test]
    fn test_shadow_reconciliation() {
        let driver = driver();
        driver.create("\\doc.txt", CreateDisposition::Create, false).unwrap();
        driver.write("\\doc.txt", 0, b"draft").unwrap();

        driver.rename("\\doc.txt", "\\~$doc.txt", false).unwrap();
        driver.create("\\new.txt", CreateDisposition::Create, false).unwrap();
        driver.write("\\new.txt", 0, b"final").unwrap();
        driver.rename("\\new.txt", "\\doc.txt", false).unwrap();
        driver.close("\\doc.txt");

        let content = driver.content();
        assert!(!content.contains("~$doc.txt"));
        assert_eq!(content.get("doc.txt").unwrap(), b"final");
        assert_eq!(content.len(), 1);
    }

    #[test]
    fn test_temp_swap_save() {
        let driver = driver();
        driver.write("\\dir\\report.docx", 0, b"v1").unwrap();

        driver.write("\\dir\\~WRD0000.tmp", 0, b"v2").unwrap();
        driver.close("\\dir\\~WRD0000.tmp");
        driver.rename("\\dir\\report.docx", "\\dir\\~WRL0003.tmp", false).unwrap();
        driver.rename("\\dir\\~WRD0000.tmp", "\\dir\\report.docx", false).unwrap();
        driver.close("\\dir\\report.docx");

        let names = names(&driver.enumerate("\\dir").unwrap());
        assert_eq!(names, vec!["report.docx".to_string()]);
        assert_eq!(driver.content().get("dir/report.docx").unwrap(), b"v2");
    }

    #[test]
    fn test_close_sweeps_untracked_lock_files() {
        let driver = driver();
        driver.write("\\~$orphan.docx", 0, b"lock").unwrap();
        driver.write("\\other.docx", 0, b"x").unwrap();

        driver.close("\\~$orphan.docx");
        assert!(driver.content().contains("~$orphan.docx"));

        driver.close("\\other.docx");
        assert!(!driver.content().contains("~$orphan.docx"));
        assert!(driver.content().contains("other.docx"));
    }

    #[test]
    fn test_close_keeps_shadows_renamed_concurrently() {
        let driver = Arc::new(driver());
        for i in 0..50 {
            driver.write(&format!("\\d{}.docx", i), 0, b"v").unwrap();
        }

        let renamer = {
            let driver = Arc::clone(&driver);
            thread::spawn(move || {
                for i in 0..50 {
                    driver
                        .rename(&format!("\\d{}.docx", i), &format!("\\~$d{}.docx", i), false)
                        .unwrap();
                }
            })
        };
        for _ in 0..50 {
            driver.close("\\other.docx");
        }
        renamer.join().unwrap();

        for i in 0..50 {
            assert!(driver.content().contains(&format!("~$d{}.docx", i)));
        }
    }

    #[test]
    fn test_cleanup_delete_on_close() {
        let driver = driver();
        driver.write("\\a.txt", 0, b"a").unwrap();
        driver.rename("\\a.txt", "\\a.tmp", false).unwrap();
        driver.write("\\a.txt", 0, b"b").unwrap();

        driver.cleanup("\\a.txt", false);
        assert!(driver.content().contains("a.txt"));

        driver.cleanup("\\a.txt", true);
        assert!(driver.content().is_empty());
    }

    #[test]
    fn test_delete() {
        let driver = driver();
        driver.write("\\d\\x.txt", 0, b"1").unwrap();

        assert_eq!(driver.delete("\\d"), Err(DriverError::AccessDenied));
        assert_eq!(driver.delete("\\d\\y.txt"), Err(DriverError::NotFound));
        driver.delete("\\d\\x.txt").unwrap();
        assert!(driver.content().is_empty());
        assert_eq!(driver.delete("\\d\\x.txt"), Err(DriverError::NotFound));
    }

    #[test]
    fn test_cross_root_denial() {
        let driver = driver();
        driver.write("\\keep.txt", 0, b"1").unwrap();

        assert_eq!(
            driver.create("C:\\evil.txt", CreateDisposition::Create, false),
            Err(DriverError::AccessDenied)
        );
        assert_eq!(
            driver.rename("Z:\\keep.txt", "C:\\keep.txt", true),
            Err(DriverError::AccessDenied)
        );
        assert_eq!(
            driver.rename("\\keep.txt", "D:\\keep.txt", true),
            Err(DriverError::AccessDenied)
        );
        assert_eq!(driver.content().keys(), vec!["keep.txt".to_string()]);

        assert!(driver.create("z:\\ok.txt", CreateDisposition::Create, false).is_ok());
        assert!(driver.content().contains("ok.txt"));
    }

    #[test]
    fn test_rename_replaces_by_default() {
        let driver = driver();
        driver.write("\\a", 0, b"A").unwrap();
        driver.write("\\b", 0, b"B").unwrap();

        driver.rename("\\a", "\\b", false).unwrap();
        assert_eq!(driver.content().keys(), vec!["b".to_string()]);
        assert_eq!(driver.content().get("b").unwrap(), b"A");

        assert_eq!(driver.rename("\\a", "\\c", true), Err(DriverError::NotFound));
    }

    #[test]
    fn test_strict_rename() {
        let driver = VaultDriver::new(
            ContentMap::new(),
            DriverOptions {
                strict_rename: true,
                ..DriverOptions::default()
            },
        );
        driver.write("/a", 0, b"A").unwrap();
        driver.write("/b", 0, b"B").unwrap();

        assert_eq!(driver.rename("/a", "/b", false), Err(DriverError::NameCollision));
        assert_eq!(driver.content().get("b").unwrap(), b"B");

        driver.rename("/a", "/b", true).unwrap();
        assert_eq!(driver.content().get("b").unwrap(), b"A");
    }

    #[test]
    fn test_rename_directory() {
        let driver = driver();
        driver.write("\\old\\one.txt", 0, b"1").unwrap();
        driver.write("\\old\\sub\\two.txt", 0, b"2").unwrap();
        driver.write("\\older.txt", 0, b"3").unwrap();

        driver.rename("\\old", "\\new", false).unwrap();

        let mut keys = driver.content().keys();
        keys.sort();
        assert_eq!(keys, vec!["new/one.txt", "new/sub/two.txt", "older.txt"]);

        assert_eq!(
            driver.rename("\\new", "\\new\\inner", false),
            Err(DriverError::InvalidParameter)
        );
        assert_eq!(
            driver.rename("\\older.txt", "\\new", false),
            Err(DriverError::NameCollision)
        );
    }

    #[test]
    fn test_set_end_of_file() {
        let driver = driver();
        driver.write("\\t", 0, b"abcdef").unwrap();

        driver.set_end_of_file("\\t", 2).unwrap();
        assert_eq!(driver.content().get("t").unwrap(), b"ab");
        driver.set_end_of_file("\\t", 4).unwrap();
        assert_eq!(driver.content().get("t").unwrap(), b"ab\0\0");
        assert_eq!(driver.set_end_of_file("\\u", 1), Err(DriverError::NotFound));
    }

    #[test]
    fn test_volume_stat() {
        assert_eq!(driver().volume_stat(), Err(DriverError::Unsuccessful));

        let temp = TempDir::new().unwrap();
        let driver = VaultDriver::new(
            ContentMap::new(),
            DriverOptions {
                volume_root: Some(temp.path().to_path_buf()),
                ..DriverOptions::default()
            },
        );
        let info = driver.volume_stat().unwrap();
        assert!(info.total >= info.free);
        assert_eq!(info.label, "vaultdrive");

        let gone = VaultDriver::new(
            ContentMap::new(),
            DriverOptions {
                volume_root: Some(temp.path().join("missing")),
                ..DriverOptions::default()
            },
        );
        assert_eq!(gone.volume_stat(), Err(DriverError::Unsuccessful));
    }

    #[test]
    fn test_live_flag() {
        let driver = driver();
        let flag = driver.live_flag();
        assert!(!driver.is_live());

        driver.mounted();
        assert!(flag.load(Ordering::SeqCst));
        driver.unmounted();
        assert!(!driver.is_live());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(DriverError::NotFound.errno(), libc::ENOENT);
        assert_eq!(DriverError::NameCollision.ntstatus(), 0xC000_0035);
        assert_eq!(DriverError::AccessDenied.errno(), libc::EACCES);
    }

    #[test]
    fn test_concurrent_callbacks() {
        let driver = Arc::new(driver());
        let threads: Vec<_> = (0..4u8)
            .map(|t| {
                let driver = Arc::clone(&driver);
                thread::spawn(move || {
                    for i in 0..50u64 {
                        driver.write("\\shared.bin", u64::from(t) * 50 + i, &[t + 1]).unwrap();
                        driver.write(&format!("\\t{}\\f{}", t, i), 0, b"x").unwrap();
                        let _ = driver.enumerate("\\");
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }

        let shared = driver.content().get("shared.bin").unwrap();
        assert_eq!(shared.len(), 200);
        assert!(shared.iter().all(|b| *b != 0));
        assert_eq!(driver.enumerate("\\").unwrap().len(), 5);
    }
}
