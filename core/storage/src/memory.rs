//! In-memory store for testing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::store::{canonical, EncryptedFile, EncryptedStore, DEFAULT_EXTENSION};
use vaultdrive_common::{Error, Result};

/// In-memory store.
///
/// Keys are store-relative file names including the extension, so plaintext
/// and encrypted files can coexist the way they do on disk. Cloning shares
/// the underlying files.
#[derive(Clone)]
pub struct MemoryStore {
    files: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    extension: String,
}

impl MemoryStore {
    /// Create a new empty store using the default extension.
    pub fn new() -> Self {
        Self {
            files: Arc::new(RwLock::new(HashMap::new())),
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }

    /// Place a raw file in the store, bypassing the extension.
    pub fn put_raw(&self, relative_path: &str, data: Vec<u8>) -> Result<()> {
        self.files.write().insert(canonical(relative_path)?, data);
        Ok(())
    }

    /// Raw file contents, if present.
    pub fn get_raw(&self, relative_path: &str) -> Option<Vec<u8>> {
        self.files.read().get(relative_path).cloned()
    }

    /// All raw file names currently stored.
    pub fn raw_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn document_key(&self, virtual_path: &str) -> Result<String> {
        Ok(format!("{}{}", canonical(virtual_path)?, self.extension))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EncryptedStore for MemoryStore {
    fn extension(&self) -> &str {
        &self.extension
    }

    fn root(&self) -> Option<&Path> {
        None
    }

    async fn scan(&self) -> Result<Vec<EncryptedFile>> {
        let files = self.files.read();
        Ok(files
            .iter()
            .filter_map(|(key, data)| {
                let name = key.strip_suffix(&self.extension)?;
                (!name.is_empty()).then(|| EncryptedFile {
                    name: name.to_string(),
                    path: PathBuf::from(key),
                    size: data.len() as u64,
                })
            })
            .collect())
    }

    async fn read(&self, file: &EncryptedFile) -> Result<Vec<u8>> {
        let key = file.path.to_string_lossy();
        self.files
            .read()
            .get(key.as_ref())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Encrypted file not found: {}", key)))
    }

    async fn write(&self, virtual_path: &str, data: Vec<u8>) -> Result<()> {
        let key = self.document_key(virtual_path)?;
        self.files.write().insert(key, data);
        Ok(())
    }

    async fn remove(&self, virtual_path: &str) -> Result<()> {
        let key = self.document_key(virtual_path)?;
        self.files
            .write()
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("Encrypted file not found: {}", key)))
    }

    async fn scan_plaintext(&self) -> Result<Vec<String>> {
        Ok(self
            .files
            .read()
            .keys()
            .filter(|key| !key.ends_with(&self.extension) && key.as_str() != crate::DESCRIPTOR_FILE)
            .cloned()
            .collect())
    }

    async fn read_plaintext(&self, relative_path: &str) -> Result<Vec<u8>> {
        self.get_raw(&canonical(relative_path)?)
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", relative_path)))
    }

    async fn remove_plaintext(&self, relative_path: &str) -> Result<()> {
        self.files
            .write()
            .remove(&canonical(relative_path)?)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", relative_path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_scan_read() {
        let store = MemoryStore::new();
        store.write("dir/doc.txt", b"cipher".to_vec()).await.unwrap();

        let files = store.scan().await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "dir/doc.txt");
        assert_eq!(store.read(&files[0]).await.unwrap(), b"cipher");
        assert_eq!(store.raw_names(), vec!["dir/doc.txt.cv".to_string()]);
    }

    #[tokio::test]
    async fn test_remove() {
        let store = MemoryStore::new();
        store.write("doc.txt", vec![1]).await.unwrap();

        store.remove("doc.txt").await.unwrap();
        assert!(store.scan().await.unwrap().is_empty());
        assert!(store.remove("doc.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_plaintext_is_separate_from_documents() {
        let store = MemoryStore::new();
        store.put_raw("notes.txt", b"plain".to_vec()).unwrap();
        store.write("other.txt", vec![9]).await.unwrap();

        assert_eq!(store.scan_plaintext().await.unwrap(), vec!["notes.txt".to_string()]);
        assert_eq!(store.read_plaintext("notes.txt").await.unwrap(), b"plain");

        store.remove_plaintext("notes.txt").await.unwrap();
        assert!(store.scan_plaintext().await.unwrap().is_empty());
    }
}
