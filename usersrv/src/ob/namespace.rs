//! Object Namespace
//!
//! A flat, case-insensitive name table. Directories of named objects (the
//! object root, a device's private namespace) are each one `Namespace`.
//! Path resolution matches whole `\`-separated components.
//!
//! # References
//!
//! Based on Windows Server 2003:
//! - `base/ntos/ob/obdir.c`

use std::collections::HashMap;

use crate::status::{NtResult, NtStatus};

/// Path component separator
pub const PATH_SEPARATOR: char = '\\';

/// Named entry: the name as created plus the object
#[derive(Debug)]
struct NamedEntry<T> {
    name: String,
    object: T,
}

/// Case-insensitive name to object map
#[derive(Debug)]
pub struct Namespace<T> {
    entries: HashMap<String, NamedEntry<T>>,
}

impl<T> Default for Namespace<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn fold_case(name: &str) -> String {
    name.to_uppercase()
}

impl<T> Namespace<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert a new name
    ///
    /// Fails with `ObjectNameCollision` if the name (ignoring case) exists.
    pub fn insert(&mut self, name: &str, object: T) -> NtResult<()> {
        if name.is_empty() {
            return Err(NtStatus::ObjectNameInvalid);
        }
        let key = fold_case(name);
        if self.entries.contains_key(&key) {
            return Err(NtStatus::ObjectNameCollision);
        }
        self.entries.insert(
            key,
            NamedEntry {
                name: String::from(name),
                object,
            },
        );
        Ok(())
    }

    /// Look up a name, ignoring case
    pub fn lookup(&self, name: &str) -> Option<&T> {
        self.entries.get(&fold_case(name)).map(|e| &e.object)
    }

    /// Remove a name, returning its object
    pub fn remove(&mut self, name: &str) -> Option<T> {
        self.entries.remove(&fold_case(name)).map(|e| e.object)
    }

    /// Drop every entry the predicate rejects
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        self.entries.retain(|_, e| keep(&e.object));
    }

    /// Find the entry whose name is the longest whole-component prefix of
    /// `path`
    ///
    /// Returns the object and the rest of the path with its leading
    /// separator removed (empty when the path names the entry itself).
    pub fn find_prefix<'p>(&self, path: &'p str) -> Option<(&T, &'p str)> {
        let folded = fold_case(path);
        let mut best: Option<(&NamedEntry<T>, usize)> = None;

        for (key, entry) in &self.entries {
            if !folded.starts_with(key.as_str()) {
                continue;
            }
            let rest = &folded[key.len()..];
            if !(rest.is_empty() || rest.starts_with(PATH_SEPARATOR)) {
                continue;
            }
            if best.map_or(true, |(_, len)| key.len() > len) {
                best = Some((entry, key.len()));
            }
        }

        let (entry, len) = best?;
        // Upper-casing can change byte lengths outside ASCII
        let rest = path.get(len..)?;
        Some((&entry.object, rest.strip_prefix(PATH_SEPARATOR).unwrap_or(rest)))
    }

    /// Names as they were created
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut ns = Namespace::new();
        ns.insert("MySlot", 1).unwrap();
        assert_eq!(ns.lookup("myslot"), Some(&1));
        assert_eq!(ns.lookup("MYSLOT"), Some(&1));
        assert_eq!(ns.insert("MYSLOT", 2), Err(NtStatus::ObjectNameCollision));
        assert_eq!(ns.names().collect::<Vec<_>>(), vec!["MySlot"]);
    }

    #[test]
    fn test_find_prefix() {
        let mut ns = Namespace::new();
        ns.insert("\\Device\\MailSlot", "msfs").unwrap();
        ns.insert("\\Device", "dev").unwrap();

        assert_eq!(ns.find_prefix("\\device\\mailslot\\abc"), Some((&"msfs", "abc")));
        assert_eq!(ns.find_prefix("\\Device\\MailSlot"), Some((&"msfs", "")));
        assert_eq!(ns.find_prefix("\\Device\\MailSlotX"), Some((&"dev", "MailSlotX")));
        assert_eq!(ns.find_prefix("\\Other\\abc"), None);
    }
}
