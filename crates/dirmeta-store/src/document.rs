//! In-memory metadata document
//!
//! Mirrors the sidecar XML: one [`FileRecord`] per file name, scalar
//! metadata as attributes, list metadata as child entries. The codec
//! module is the only place that knows about XML.

use crate::types::now_secs;
use std::collections::{BTreeMap, HashMap};

/// One child entry of a file record, holding one element of a list
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListEntry {
    /// List key (the element tag)
    pub key: String,
    /// Attributes; list reads look up the subkey here
    pub attributes: BTreeMap<String, String>,
}

impl ListEntry {
    /// Create an entry carrying a single subkey attribute
    pub fn new(key: impl Into<String>, subkey: impl Into<String>, value: impl Into<String>) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(subkey.into(), value.into());
        Self {
            key: key.into(),
            attributes,
        }
    }

    fn value(&self, subkey: &str) -> Option<&str> {
        self.attributes.get(subkey).map(String::as_str)
    }
}

/// Metadata for one file within a directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRecord {
    /// Decoded file name (final path component)
    pub name: String,
    /// Last modification, seconds since the Unix epoch
    pub timestamp: u64,
    /// Scalar metadata
    pub attributes: BTreeMap<String, String>,
    /// List metadata entries in document order
    pub entries: Vec<ListEntry>,
    /// Insertion order within the document
    pub(crate) sequence: u64,
}

impl FileRecord {
    fn new(name: &str, sequence: u64) -> Self {
        Self {
            name: name.to_string(),
            timestamp: now_secs(),
            attributes: BTreeMap::new(),
            entries: Vec::new(),
            sequence,
        }
    }

    /// Get a scalar attribute
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Collect the values of a list, in order
    pub fn list(&self, key: &str, subkey: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.key == key)
            .filter_map(|entry| entry.value(subkey).map(ToString::to_string))
            .collect()
    }

    /// Check whether the record carries any metadata at all
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.entries.is_empty()
    }

    fn touch(&mut self) {
        self.timestamp = now_secs();
    }
}

/// Authoritative metadata for one directory once its sidecar is loaded
#[derive(Clone, Debug, Default)]
pub struct Document {
    records: HashMap<String, FileRecord>,
    next_sequence: u64,
    materialized: bool,
}

impl Document {
    /// Create an empty, unmaterialized document
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty document that should still be written back
    pub(crate) fn materialized() -> Self {
        Self {
            materialized: true,
            ..Self::default()
        }
    }

    /// Whether this document exists on disk or has ever held a record
    ///
    /// Unmaterialized documents are never written.
    pub fn is_materialized(&self) -> bool {
        self.materialized
    }

    /// Number of file records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if there are no file records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a record by file name
    pub fn record(&self, file_name: &str) -> Option<&FileRecord> {
        self.records.get(file_name)
    }

    /// Records in document order
    pub fn records(&self) -> Vec<&FileRecord> {
        let mut records: Vec<&FileRecord> = self.records.values().collect();
        records.sort_by_key(|record| record.sequence);
        records
    }

    /// File names in document order
    pub fn file_names(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .map(|record| record.name.clone())
            .collect()
    }

    fn record_mut_or_create(&mut self, file_name: &str) -> &mut FileRecord {
        self.materialized = true;
        let sequence = self.next_sequence;
        let record = self
            .records
            .entry(file_name.to_string())
            .or_insert_with(|| FileRecord::new(file_name, sequence));
        if record.sequence == sequence {
            self.next_sequence += 1;
        }
        record
    }

    /// Create an empty record unless one exists; returns whether it was created
    pub(crate) fn ensure_record(&mut self, file_name: &str) -> bool {
        if self.records.contains_key(file_name) {
            return false;
        }
        self.record_mut_or_create(file_name).touch();
        true
    }

    /// Insert a decoded record; the first record for a name wins
    ///
    /// Returns false if a record with the same name was already present.
    pub(crate) fn insert_loaded(&mut self, mut record: FileRecord) -> bool {
        self.materialized = true;
        if self.records.contains_key(&record.name) {
            return false;
        }
        record.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.records.insert(record.name.clone(), record);
        true
    }

    /// Get a scalar value, or the default when absent
    pub fn get_scalar(&self, file_name: &str, key: &str, default: &str) -> String {
        self.record(file_name)
            .and_then(|record| record.get(key))
            .unwrap_or(default)
            .to_string()
    }

    /// Get a list value, or an empty list when absent
    pub fn get_list(&self, file_name: &str, key: &str, subkey: &str) -> Vec<String> {
        self.record(file_name)
            .map(|record| record.list(key, subkey))
            .unwrap_or_default()
    }

    /// Set a scalar value
    ///
    /// A value equal to the default is stored as the absence of the
    /// attribute. Records are created only for non-default values and are
    /// not pruned when their last attribute goes away.
    pub fn set_scalar(&mut self, file_name: &str, key: &str, default: &str, value: &str) -> bool {
        if self.get_scalar(file_name, key, default) == value {
            return false;
        }

        if value == default {
            let Some(record) = self.records.get_mut(file_name) else {
                return false;
            };
            if record.attributes.remove(key).is_none() {
                return false;
            }
            record.touch();
        } else {
            let record = self.record_mut_or_create(file_name);
            record.attributes.insert(key.to_string(), value.to_string());
            record.touch();
        }
        true
    }

    /// Set a list value by reconciling existing entries in order
    ///
    /// Entries for `key` that match the next expected value are kept;
    /// any others are dropped, and the unmatched tail of `values` is
    /// appended. Setting an identical list is a no-op.
    pub fn set_list(&mut self, file_name: &str, key: &str, subkey: &str, values: &[String]) -> bool {
        let record = if values.is_empty() {
            match self.records.get_mut(file_name) {
                Some(record) => record,
                None => return false,
            }
        } else {
            self.record_mut_or_create(file_name)
        };

        let mut expected = values.iter().peekable();
        let mut changed = false;
        record.entries.retain(|entry| {
            if entry.key != key {
                return true;
            }
            let keep = match (entry.value(subkey), expected.peek()) {
                (Some(current), Some(next)) => current == next.as_str(),
                _ => false,
            };
            if keep {
                expected.next();
            } else {
                changed = true;
            }
            keep
        });

        for value in expected {
            record.entries.push(ListEntry::new(key, subkey, value.as_str()));
            changed = true;
        }

        if changed {
            record.touch();
        }
        changed
    }

    /// Move a record to a new name, replacing whatever was there
    pub fn rename_record(&mut self, old_name: &str, new_name: &str) -> bool {
        if old_name == new_name {
            return false;
        }
        let mut changed = self.remove_record(new_name);
        if let Some(mut record) = self.records.remove(old_name) {
            record.name = new_name.to_string();
            record.touch();
            self.records.insert(new_name.to_string(), record);
            changed = true;
        }
        changed
    }

    /// Remove a record
    pub fn remove_record(&mut self, file_name: &str) -> bool {
        self.records.remove(file_name).is_some()
    }

    /// Install a deep copy of another record under `file_name`
    ///
    /// Any existing record at the destination is replaced.
    pub fn insert_copy(&mut self, source: &FileRecord, file_name: &str) {
        self.remove_record(file_name);
        let record = self.record_mut_or_create(file_name);
        record.attributes = source.attributes.clone();
        record.entries = source.entries.clone();
        record.touch();
    }
}
