//! Tracking of editor shadow files.
//!
//! Document editors save atomically: they write a temporary file, move the
//! original aside, rename the temporary into place and delete the leftovers.
//! [`TempFileTracker`] remembers which transient names belong to which
//! document so closing the document can purge them. Detection is heuristic
//! and lives behind [`ShadowPolicy`].

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::trace;

use crate::namespace::{file_name, join, parent};

/// Marker prefix of editor lock files.
pub const MARKER_PREFIX: &str = "~$";

/// Extension of editor temporary files.
pub const TEMP_EXTENSION: &str = "tmp";

/// Classifies shadow names and deduces the document they belong to.
pub trait ShadowPolicy: Send + Sync {
    /// Whether `key` looks like a transient editor file.
    fn is_shadow(&self, key: &str) -> bool;

    /// Whether `key` looks like an editor lock file.
    fn is_lock_file(&self, key: &str) -> bool;

    /// Document shadowed by `destination` after renaming `source` to it.
    fn deduce_original(&self, source: &str, destination: &str) -> Option<String>;
}

/// Save pattern of common office suites: `~$` lock files and `.tmp` swaps.
#[derive(Debug, Clone)]
pub struct OfficeSavePolicy {
    marker_prefix: String,
    temp_extension: String,
}

impl OfficeSavePolicy {
    pub fn new(marker_prefix: impl Into<String>, temp_extension: impl Into<String>) -> Self {
        Self {
            marker_prefix: marker_prefix.into(),
            temp_extension: temp_extension.into(),
        }
    }

    fn has_temp_extension(&self, key: &str) -> bool {
        file_name(key)
            .rsplit_once('.')
            .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case(&self.temp_extension))
    }
}

impl Default for OfficeSavePolicy {
    fn default() -> Self {
        Self::new(MARKER_PREFIX, TEMP_EXTENSION)
    }
}

impl ShadowPolicy for OfficeSavePolicy {
    fn is_shadow(&self, key: &str) -> bool {
        self.is_lock_file(key) || self.has_temp_extension(key)
    }

    fn is_lock_file(&self, key: &str) -> bool {
        file_name(key).starts_with(&self.marker_prefix)
    }

    fn deduce_original(&self, source: &str, destination: &str) -> Option<String> {
        if self.has_temp_extension(destination) {
            return Some(source.to_string());
        }
        let name = file_name(destination).strip_prefix(self.marker_prefix.as_str())?;
        if name.is_empty() {
            return None;
        }
        Some(join(parent(source), name))
    }
}

/// Associations from documents to the shadow files they spawned.
pub struct TempFileTracker {
    policy: Box<dyn ShadowPolicy>,
    shadows: Mutex<HashMap<String, HashSet<String>>>,
}

impl TempFileTracker {
    pub fn new(policy: Box<dyn ShadowPolicy>) -> Self {
        Self {
            policy,
            shadows: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_shadow(&self, key: &str) -> bool {
        self.policy.is_shadow(key)
    }

    pub fn is_lock_file(&self, key: &str) -> bool {
        self.policy.is_lock_file(key)
    }

    /// Update associations after `source` was renamed to `destination`.
    pub fn on_rename(&self, source: &str, destination: &str) {
        let mut shadows = self.shadows.lock();

        // Neither name is a shadow under its old identity any more.
        for set in shadows.values_mut() {
            set.remove(source);
            set.remove(destination);
        }

        if self.policy.is_shadow(destination) {
            if let Some(original) = self.policy.deduce_original(source, destination) {
                trace!(original = %original, shadow = %destination, "Tracking shadow file");
                shadows
                    .entry(original)
                    .or_default()
                    .insert(destination.to_string());
            }
        }

        shadows.retain(|_, set| !set.is_empty());
    }

    /// Remove and return the shadows of `original`.
    pub fn take_shadows(&self, original: &str) -> Vec<String> {
        self.shadows
            .lock()
            .remove(original)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    }

    /// Forget `key` both as a document and as a shadow.
    pub fn forget(&self, key: &str) {
        let mut shadows = self.shadows.lock();
        shadows.remove(key);
        for set in shadows.values_mut() {
            set.remove(key);
        }
        shadows.retain(|_, set| !set.is_empty());
    }

    /// Every shadow currently associated with some document.
    pub fn tracked(&self) -> HashSet<String> {
        self.shadows.lock().values().flatten().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.shadows.lock().is_empty()
    }

    /// Drop all associations.
    pub fn clear(&self) {
        self.shadows.lock().clear();
    }
}

impl Default for TempFileTracker {
    fn default() -> Self {
        Self::new(Box::new(OfficeSavePolicy::default()))
    }
}
