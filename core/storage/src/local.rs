//! Local filesystem store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, trace};

use crate::store::{canonical, segments, EncryptedFile, EncryptedStore, DESCRIPTOR_FILE};
use vaultdrive_common::{Error, Result};

/// Store backed by a directory on the host filesystem.
pub struct LocalStore {
    root: PathBuf,
    extension: String,
}

impl LocalStore {
    /// Create a store rooted at `root` using the given reserved extension.
    ///
    /// # Postconditions
    /// - Root directory exists
    ///
    /// # Errors
    /// - Extension does not start with a dot
    /// - Root cannot be created
    pub fn new(root: impl AsRef<Path>, extension: impl Into<String>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let extension = extension.into();

        if extension.len() < 2 || !extension.starts_with('.') {
            return Err(Error::InvalidInput(format!(
                "Reserved extension must start with '.': {}",
                extension
            )));
        }

        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root, extension })
    }

    fn document_path(&self, virtual_path: &str) -> Result<PathBuf> {
        let mut path = self.plain_path(virtual_path)?;
        let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(&self.extension);
        path.set_file_name(name);
        Ok(path)
    }

    fn plain_path(&self, relative_path: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for segment in segments(relative_path)? {
            path.push(segment);
        }
        Ok(path)
    }

    /// Relative `/` joined path of a file under the root.
    fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
        Some(parts?.join("/"))
    }

    /// Walk the root and return every regular file with its size.
    async fn walk(&self) -> Result<Vec<(PathBuf, u64)>> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file() {
                    let size = entry.metadata().await?.len();
                    files.push((entry.path(), size));
                }
            }
        }

        Ok(files)
    }

    fn is_descriptor(&self, path: &Path) -> bool {
        path.parent() == Some(self.root.as_path())
            && path.file_name().and_then(|n| n.to_str()) == Some(DESCRIPTOR_FILE)
    }

    /// Remove now-empty directories between `path` and the root.
    async fn prune_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            // remove_dir fails on non-empty directories, which ends the walk
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            trace!(dir = %dir.display(), "Pruned empty directory");
            current = dir.parent();
        }
    }
}

#[async_trait]
impl EncryptedStore for LocalStore {
    fn extension(&self) -> &str {
        &self.extension
    }

    fn root(&self) -> Option<&Path> {
        Some(&self.root)
    }

    async fn scan(&self) -> Result<Vec<EncryptedFile>> {
        let mut documents = Vec::new();

        for (path, size) in self.walk().await? {
            let Some(relative) = self.relative(&path) else {
                debug!(path = %path.display(), "Skipping file with non UTF-8 name");
                continue;
            };
            let Some(name) = relative.strip_suffix(&self.extension) else {
                continue;
            };
            if name.is_empty() || name.ends_with('/') {
                continue;
            }
            documents.push(EncryptedFile {
                name: name.to_string(),
                path,
                size,
            });
        }

        debug!(root = %self.root.display(), count = documents.len(), "Scanned store");
        Ok(documents)
    }

    async fn read(&self, file: &EncryptedFile) -> Result<Vec<u8>> {
        match fs::read(&file.path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(format!(
                "Encrypted file not found: {}",
                file.path.display()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, virtual_path: &str, data: Vec<u8>) -> Result<()> {
        let path = self.document_path(virtual_path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &data).await?;
        trace!(path = %path.display(), bytes = data.len(), "Wrote document");
        Ok(())
    }

    async fn remove(&self, virtual_path: &str) -> Result<()> {
        let path = self.document_path(virtual_path)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                self.prune_empty_parents(&path).await;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(format!(
                "Encrypted file not found: {}",
                canonical(virtual_path)?
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn scan_plaintext(&self) -> Result<Vec<String>> {
        let mut plaintext = Vec::new();

        for (path, _) in self.walk().await? {
            if self.is_descriptor(&path) {
                continue;
            }
            let Some(relative) = self.relative(&path) else {
                continue;
            };
            if !relative.ends_with(&self.extension) {
                plaintext.push(relative);
            }
        }

        Ok(plaintext)
    }

    async fn read_plaintext(&self, relative_path: &str) -> Result<Vec<u8>> {
        let path = self.plain_path(relative_path)?;
        Ok(fs::read(&path).await?)
    }

    async fn remove_plaintext(&self, relative_path: &str) -> Result<()> {
        let path = self.plain_path(relative_path)?;
        fs::remove_file(&path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DEFAULT_EXTENSION;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> LocalStore {
        LocalStore::new(temp.path(), DEFAULT_EXTENSION).unwrap()
    }

    #[tokio::test]
    async fn test_write_creates_directories_and_extension() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        store.write("reports/2024/q1.txt", b"cipher".to_vec()).await.unwrap();

        let on_disk = temp.path().join("reports").join("2024").join("q1.txt.cv");
        assert_eq!(std::fs::read(on_disk).unwrap(), b"cipher");
    }

    #[tokio::test]
    async fn test_scan_strips_extension() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        store.write("a.txt", vec![1, 2, 3]).await.unwrap();
        store.write("dir/b.txt", vec![4]).await.unwrap();
        std::fs::write(temp.path().join("loose.txt"), b"plain").unwrap();
        std::fs::write(temp.path().join(DESCRIPTOR_FILE), b"{}").unwrap();

        let mut files = store.scan().await.unwrap();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "dir/b.txt"]);
        assert_eq!(files[0].size, 3);
        assert_eq!(store.read(&files[1]).await.unwrap(), vec![4]);
    }

    #[tokio::test]
    async fn test_scan_plaintext_skips_descriptor() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        store.write("done.txt", vec![1]).await.unwrap();
        std::fs::create_dir_all(temp.path().join("sub")).unwrap();
        std::fs::write(temp.path().join("sub/notes.md"), b"plain").unwrap();
        std::fs::write(temp.path().join(DESCRIPTOR_FILE), b"{}").unwrap();

        let plaintext = store.scan_plaintext().await.unwrap();
        assert_eq!(plaintext, vec!["sub/notes.md".to_string()]);
        assert_eq!(store.read_plaintext("sub/notes.md").await.unwrap(), b"plain");

        store.remove_plaintext("sub/notes.md").await.unwrap();
        assert!(store.scan_plaintext().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_prunes_empty_directories() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        store.write("deep/nested/x.txt", vec![1]).await.unwrap();
        store.remove("deep/nested/x.txt").await.unwrap();

        assert!(!temp.path().join("deep").exists());
        assert!(temp.path().exists());
        assert!(matches!(
            store.remove("deep/nested/x.txt").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        assert!(store.write("../outside.txt", vec![1]).await.is_err());
        assert!(LocalStore::new(temp.path(), "cv").is_err());
    }
}
