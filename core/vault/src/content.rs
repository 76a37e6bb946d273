//! Shared in-memory document map.
//!
//! One [`ContentMap`] exists per vault. It is shared by the lock/unlock state
//! machine and every filesystem callback of the mounted drive, so all access
//! goes through a single reader/writer lock:
//! - single-key reads take the shared lock
//! - every compound read-modify-write takes the exclusive lock for the whole
//!   step, so concurrent writers to the same key never lose updates

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Why a move between keys did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveError {
    /// Source key is absent.
    SourceMissing,
    /// Destination exists and overwriting was not allowed.
    DestinationExists,
}

/// A document cannot grow to the requested size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityError {
    pub requested: u64,
}

impl std::fmt::Display for CapacityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cannot hold a document of {} bytes", self.requested)
    }
}

impl std::error::Error for CapacityError {}

/// Resize `data` to `len`, zero-filling when it grows.
///
/// Growth is reserved fallibly, so an oversized length leaves `data`
/// untouched instead of aborting.
pub fn resize_document(data: &mut Vec<u8>, len: u64) -> Result<(), CapacityError> {
    let error = CapacityError { requested: len };
    let len = usize::try_from(len)
        .ok()
        .filter(|len| *len <= isize::MAX as usize)
        .ok_or(error)?;
    if len > data.len() {
        data.try_reserve_exact(len - data.len())
            .map_err(|_| error)?;
    }
    data.resize(len, 0);
    Ok(())
}

/// Write `bytes` into `data` at `offset`, zero-filling any gap.
pub fn write_document(data: &mut Vec<u8>, offset: u64, bytes: &[u8]) -> Result<(), CapacityError> {
    let end = offset
        .checked_add(bytes.len() as u64)
        .ok_or(CapacityError { requested: u64::MAX })?;
    if (data.len() as u64) < end {
        resize_document(data, end)?;
    }
    let start = offset as usize;
    data[start..start + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Mapping from virtual path to document bytes.
#[derive(Clone, Default)]
pub struct ContentMap {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl ContentMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Current size of an entry.
    pub fn size_of(&self, key: &str) -> Option<u64> {
        self.entries.read().get(key).map(|data| data.len() as u64)
    }

    /// Copy of an entry's bytes.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.read().get(key).cloned()
    }

    /// Run `f` over an entry's bytes under the shared lock.
    pub fn with_entry<R>(&self, key: &str, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        self.entries.read().get(key).map(|data| f(data))
    }

    /// Insert or replace an entry.
    pub fn insert(&self, key: impl Into<String>, data: Vec<u8>) {
        self.entries.write().insert(key.into(), data);
    }

    /// Create an empty entry unless the key exists. Returns whether it was created.
    pub fn insert_if_absent(&self, key: &str) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(key.to_string(), Vec::new());
        true
    }

    /// Empty an existing entry in place, or create it empty.
    ///
    /// Returns whether the entry already existed.
    pub fn truncate_or_create(&self, key: &str) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(data) => {
                data.clear();
                true
            }
            None => {
                entries.insert(key.to_string(), Vec::new());
                false
            }
        }
    }

    /// Write `bytes` at `offset`, creating the entry if absent.
    ///
    /// The buffer grows to `max(len, offset + bytes.len())`; any gap is
    /// zero-filled. Returns the new entry size. A write that cannot be
    /// held leaves the map unchanged.
    pub fn write_at(&self, key: &str, offset: u64, bytes: &[u8]) -> Result<u64, CapacityError> {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(data) => {
                write_document(data, offset, bytes)?;
                Ok(data.len() as u64)
            }
            None => {
                let mut data = Vec::new();
                write_document(&mut data, offset, bytes)?;
                let len = data.len() as u64;
                entries.insert(key.to_string(), data);
                Ok(len)
            }
        }
    }

    /// Resize an entry, zero-filling when it grows. Returns false if absent.
    pub fn set_len(&self, key: &str, len: u64) -> Result<bool, CapacityError> {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(data) => {
                resize_document(data, len)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.write().remove(key)
    }

    /// Move an entry to a new key, keeping its buffer.
    ///
    /// An existing destination is dropped when `overwrite` is set.
    /// `on_moved` runs before the exclusive lock is released.
    pub fn move_entry(
        &self,
        from: &str,
        to: &str,
        overwrite: bool,
        on_moved: impl FnOnce(),
    ) -> Result<(), MoveError> {
        let mut entries = self.entries.write();
        if !entries.contains_key(from) {
            return Err(MoveError::SourceMissing);
        }
        if from == to {
            return Ok(());
        }
        if !overwrite && entries.contains_key(to) {
            return Err(MoveError::DestinationExists);
        }
        if let Some(data) = entries.remove(from) {
            entries.insert(to.to_string(), data);
        }
        on_moved();
        Ok(())
    }

    /// All keys, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Run `f` over the whole map under the shared lock.
    ///
    /// Used for listings that must see one consistent set of keys.
    pub fn with_read<R>(&self, f: impl FnOnce(&HashMap<String, Vec<u8>>) -> R) -> R {
        f(&self.entries.read())
    }

    /// Run `f` over the whole map under the exclusive lock.
    pub fn with_exclusive<R>(&self, f: impl FnOnce(&mut HashMap<String, Vec<u8>>) -> R) -> R {
        f(&mut self.entries.write())
    }
}

impl std::fmt::Debug for ContentMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentMap")
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_write_at_zero_fills_gap() {
        let map = ContentMap::new();
        assert_eq!(map.write_at("a.txt", 4, b"xy").unwrap(), 6);
        assert_eq!(map.get("a.txt").unwrap(), vec![0, 0, 0, 0, b'x', b'y']);

        assert_eq!(map.write_at("a.txt", 1, b"Q").unwrap(), 6);
        assert_eq!(map.get("a.txt").unwrap(), vec![0, b'Q', 0, 0, b'x', b'y']);
    }

    #[test]
    fn test_truncate_keeps_entry_shared() {
        let map = ContentMap::new();
        let other = map.clone();
        map.insert("doc", b"hello".to_vec());

        assert!(map.truncate_or_create("doc"));
        assert_eq!(other.size_of("doc"), Some(0));
        assert!(!map.truncate_or_create("new"));
        assert!(other.contains("new"));
    }

    #[test]
    fn test_move_entry() {
        let map = ContentMap::new();
        map.insert("a", b"1".to_vec());
        map.insert("b", b"2".to_vec());

        assert_eq!(
            map.move_entry("missing", "x", true, || {}),
            Err(MoveError::SourceMissing)
        );
        assert_eq!(
            map.move_entry("a", "b", false, || {}),
            Err(MoveError::DestinationExists)
        );
        assert_eq!(map.get("a").unwrap(), b"1");

        let mut notified = false;
        map.move_entry("a", "b", true, || notified = true).unwrap();
        assert!(notified);
        assert!(!map.contains("a"));
        assert_eq!(map.get("b").unwrap(), b"1");
    }

    #[test]
    fn test_set_len() {
        let map = ContentMap::new();
        map.insert("f", b"abcdef".to_vec());

        assert!(map.set_len("f", 3).unwrap());
        assert_eq!(map.get("f").unwrap(), b"abc");
        assert!(map.set_len("f", 5).unwrap());
        assert_eq!(map.get("f").unwrap(), b"abc\0\0");
        assert!(!map.set_len("nope", 1).unwrap());
    }

    #[test]
    fn test_oversized_growth_is_refused() {
        let map = ContentMap::new();
        map.insert("f", b"abc".to_vec());
        let huge = isize::MAX as u64 + 1;

        assert_eq!(
            map.write_at("f", huge, b"x"),
            Err(CapacityError { requested: huge + 1 })
        );
        assert_eq!(map.set_len("f", huge), Err(CapacityError { requested: huge }));
        assert_eq!(
            map.write_at("new", u64::MAX, b"x"),
            Err(CapacityError { requested: u64::MAX })
        );
        assert_eq!(map.get("f").unwrap(), b"abc");
        assert!(!map.contains("new"));
    }

    #[test]
    fn test_concurrent_writers_do_not_lose_updates() {
        let map = ContentMap::new();
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let map = map.clone();
                thread::spawn(move || {
                    for j in 0..100u64 {
                        let offset = i * 100 + j;
                        map.write_at("shared", offset, &[i as u8 + 1]).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let data = map.get("shared").unwrap();
        assert_eq!(data.len(), 800);
        assert!(data.iter().all(|b| *b != 0));
    }
}
