//! Hierarchical view over the flat content map.
//!
//! There is no directory entity. A directory exists iff some key has it as a
//! proper prefix followed by a separator, and the empty key is the root.
//! Every listing is a single O(n) scan over the map's keys; vaults are held
//! in memory, so their size bounds this cost.

use std::collections::HashMap;

/// Separator used in virtual keys.
pub const SEPARATOR: char = '/';

/// Drive prefix and remainder of a raw host path.
///
/// `"Z:\\docs\\a.txt"` yields `(Some('Z'), "\\docs\\a.txt")`. Paths without a
/// drive prefix yield `None`.
pub fn split_drive(raw: &str) -> (Option<char>, &str) {
    let mut chars = raw.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic() => {
            (Some(letter.to_ascii_uppercase()), &raw[2..])
        }
        _ => (None, raw),
    }
}

/// Translate a host path into a content map key.
///
/// Backslashes become `/` and leading or trailing separators are removed.
/// The root maps to the empty key.
pub fn to_virtual_path(raw: &str) -> String {
    let (_, rest) = split_drive(raw);
    let normalized = rest.replace('\\', "/");
    normalized.trim_matches(SEPARATOR).to_string()
}

/// Join a directory key and a child name.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}{}{}", parent, SEPARATOR, name)
    }
}

/// Final segment of a key.
pub fn file_name(key: &str) -> &str {
    key.rsplit(SEPARATOR).next().unwrap_or(key)
}

/// Directory part of a key, empty for top-level names.
pub fn parent(key: &str) -> &str {
    key.rfind(SEPARATOR).map(|idx| &key[..idx]).unwrap_or("")
}

/// Whether `key` names a directory.
pub fn is_directory(entries: &HashMap<String, Vec<u8>>, key: &str) -> bool {
    if key.is_empty() {
        return true;
    }
    if entries.contains_key(key) {
        return false;
    }
    let prefix = format!("{}{}", key, SEPARATOR);
    entries.keys().any(|k| k.starts_with(&prefix))
}

/// Kind of a listed child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    /// Document with its current size.
    File(u64),
    /// Synthetic directory.
    Directory,
}

/// One direct child of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Child {
    pub name: String,
    pub kind: ChildKind,
}

/// Direct children of the directory `key`, in no particular order.
///
/// A name that is both a document and a prefix of other keys is reported as
/// a document.
pub fn list_children(entries: &HashMap<String, Vec<u8>>, key: &str) -> Vec<Child> {
    let prefix = if key.is_empty() {
        String::new()
    } else {
        format!("{}{}", key, SEPARATOR)
    };

    let mut children: HashMap<&str, ChildKind> = HashMap::new();
    for (k, data) in entries {
        let Some(rest) = k.strip_prefix(prefix.as_str()) else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        match rest.split_once(SEPARATOR) {
            None => {
                children.insert(rest, ChildKind::File(data.len() as u64));
            }
            Some((segment, _)) => {
                children.entry(segment).or_insert(ChildKind::Directory);
            }
        }
    }

    children
        .into_iter()
        .map(|(name, kind)| Child {
            name: name.to_string(),
            kind,
        })
        .collect()
}
