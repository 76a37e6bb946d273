//! Encrypted store trait definition.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use vaultdrive_common::{Error, Result};

/// Extension marking a file as an encrypted vault document.
pub const DEFAULT_EXTENSION: &str = ".cv";

/// Name of the vault descriptor kept at the store root.
pub const DESCRIPTOR_FILE: &str = ".vaultdrive.json";

/// An encrypted document found while scanning a store.
///
/// Built only by scans and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedFile {
    /// Virtual path of the document, extension stripped, `/` separated.
    pub name: String,
    /// Location of the ciphertext inside the store.
    pub path: PathBuf,
    /// Ciphertext size in bytes.
    pub size: u64,
}

/// Storage backend holding a vault's encrypted documents.
///
/// Paths handed to a store are virtual paths: relative, `/` separated and
/// without the reserved extension. Implementations add the extension
/// themselves.
#[async_trait]
pub trait EncryptedStore: Send + Sync {
    /// Reserved extension, including the leading dot.
    fn extension(&self) -> &str;

    /// Host directory backing the store, if any.
    fn root(&self) -> Option<&Path>;

    /// Enumerate every encrypted document.
    async fn scan(&self) -> Result<Vec<EncryptedFile>>;

    /// Read the ciphertext of a scanned document.
    ///
    /// # Errors
    /// - Document not found
    async fn read(&self, file: &EncryptedFile) -> Result<Vec<u8>>;

    /// Write the ciphertext for `virtual_path`, creating parent directories.
    ///
    /// # Postconditions
    /// - `<virtual_path><extension>` holds exactly `data`
    async fn write(&self, virtual_path: &str, data: Vec<u8>) -> Result<()>;

    /// Remove the ciphertext for `virtual_path`.
    ///
    /// # Errors
    /// - Document not found
    async fn remove(&self, virtual_path: &str) -> Result<()>;

    /// Enumerate files lacking the reserved extension, as relative paths.
    async fn scan_plaintext(&self) -> Result<Vec<String>>;

    /// Read a plaintext file found by [`EncryptedStore::scan_plaintext`].
    async fn read_plaintext(&self, relative_path: &str) -> Result<Vec<u8>>;

    /// Remove a plaintext file once it has been migrated.
    async fn remove_plaintext(&self, relative_path: &str) -> Result<()>;
}

/// Split a virtual path into validated segments.
///
/// Accepts `/` and `\` separators and ignores a leading separator.
///
/// # Errors
/// - Empty path
/// - `.` or `..` segments, or empty segments between separators
pub(crate) fn segments(virtual_path: &str) -> Result<Vec<&str>> {
    let trimmed = virtual_path.trim_start_matches(['/', '\\']);
    if trimmed.is_empty() {
        return Err(Error::InvalidInput("Empty document path".to_string()));
    }

    let parts: Vec<&str> = trimmed.split(['/', '\\']).collect();
    for part in &parts {
        if part.is_empty() || *part == "." || *part == ".." {
            return Err(Error::InvalidInput(format!(
                "Invalid document path: {}",
                virtual_path
            )));
        }
    }
    Ok(parts)
}

/// Canonical `/` joined form of a virtual path.
pub(crate) fn canonical(virtual_path: &str) -> Result<String> {
    Ok(segments(virtual_path)?.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_accept_both_separators() {
        assert_eq!(segments("a/b\\c.txt").unwrap(), vec!["a", "b", "c.txt"]);
        assert_eq!(segments("/doc.txt").unwrap(), vec!["doc.txt"]);
        assert_eq!(canonical("\\x\\y").unwrap(), "x/y");
    }

    #[test]
    fn test_segments_reject_escapes() {
        assert!(segments("").is_err());
        assert!(segments("/").is_err());
        assert!(segments("../etc/passwd").is_err());
        assert!(segments("a/./b").is_err());
        assert!(segments("a//b").is_err());
    }
}
