//! Pre-load change buffer
//!
//! Holds metadata writes issued before a metafile's document has been
//! read, so callers never wait on disk I/O. The buffer is replayed into
//! the document when loading completes and then discarded.

use crate::document::Document;
use crate::types::MetadataValue;
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Buffer key: a metadata key, plus the subkey for list values
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub key: String,
    pub subkey: Option<String>,
}

impl PendingKey {
    /// Key for a scalar value
    pub fn scalar(key: &str) -> Self {
        Self {
            key: key.to_string(),
            subkey: None,
        }
    }

    /// Key for a list value (`key/subkey`)
    pub fn list(key: &str, subkey: &str) -> Self {
        Self {
            key: key.to_string(),
            subkey: Some(subkey.to_string()),
        }
    }
}

/// Buffered metadata changes, by file name
#[derive(Clone, Debug, Default)]
pub struct PendingChanges {
    files: HashMap<String, HashMap<PendingKey, MetadataValue>>,
    /// Files that received a non-default value; a direct write would have
    /// created their record even if a later write restored the default
    created: HashSet<String>,
}

impl PendingChanges {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Number of files with buffered changes
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// File names that would have a record after replay, sorted
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.created.iter().cloned().collect();
        names.sort();
        names
    }

    /// Buffer a value
    ///
    /// The value is always recorded so that it is replayed on load (a
    /// buffered default must still clear a stored attribute), but the
    /// result reports whether the value a read would see has changed.
    pub fn set(&mut self, file_name: &str, key: PendingKey, value: MetadataValue) -> bool {
        let changes = self.files.entry(file_name.to_string()).or_default();
        let changed = match changes.get(&key) {
            Some(old) => old.effective() != value.effective(),
            None => value.effective().is_some(),
        };
        if value.effective().is_some() {
            self.created.insert(file_name.to_string());
        }
        changes.insert(key, value);
        changed
    }

    /// Read a buffered scalar, or the default when nothing overrides it
    pub fn get_scalar(&self, file_name: &str, key: &str, default: &str) -> String {
        match self.lookup(file_name, &PendingKey::scalar(key)) {
            Some(MetadataValue::Scalar {
                default: stored_default,
                value,
            }) if value != stored_default => value.clone(),
            _ => default.to_string(),
        }
    }

    /// Read a buffered list, or an empty list
    pub fn get_list(&self, file_name: &str, key: &str, subkey: &str) -> Vec<String> {
        match self.lookup(file_name, &PendingKey::list(key, subkey)) {
            Some(MetadataValue::List(values)) => values.clone(),
            _ => Vec::new(),
        }
    }

    fn lookup(&self, file_name: &str, key: &PendingKey) -> Option<&MetadataValue> {
        self.files.get(file_name).and_then(|changes| changes.get(key))
    }

    /// Drop everything buffered for a file
    pub fn remove_file(&mut self, file_name: &str) -> bool {
        self.created.remove(file_name);
        self.files.remove(file_name).is_some()
    }

    /// Move buffered changes to a new file name, replacing the destination
    pub fn rename_file(&mut self, old_name: &str, new_name: &str) -> bool {
        if old_name == new_name {
            return false;
        }
        let mut changed = self.remove_file(new_name);
        if let Some(changes) = self.files.remove(old_name) {
            self.files.insert(new_name.to_string(), changes);
            changed = true;
        }
        if self.created.remove(old_name) {
            self.created.insert(new_name.to_string());
        }
        changed
    }

    /// Replay every buffered change into a document
    ///
    /// Uses the same merge rules as direct writes. Returns whether the
    /// document changed.
    pub fn apply_to(self, document: &mut Document) -> bool {
        let mut changed = false;
        for file_name in &self.created {
            changed |= document.ensure_record(file_name);
        }
        for (file_name, changes) in self.files {
            for (key, value) in changes {
                changed |= match (&value, key.subkey.as_deref()) {
                    (MetadataValue::Scalar { default, value }, None) => {
                        document.set_scalar(&file_name, &key.key, default, value)
                    }
                    (MetadataValue::List(values), Some(subkey)) => {
                        document.set_list(&file_name, &key.key, subkey, values)
                    }
                    _ => {
                        warn!(
                            "Skipping buffered change with mismatched shape: {}/{}",
                            file_name, key.key
                        );
                        false
                    }
                };
            }
        }
        changed
    }
}
