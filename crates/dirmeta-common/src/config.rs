//! Configuration types for dirmeta
//!
//! This module defines the configuration shared by the metadata engine
//! and the tools built on top of it.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default number of metafile loads allowed to run at once
pub const DEFAULT_MAX_CONCURRENT_READS: usize = 10;

/// Default permission bits for newly written sidecar files (owner read/write)
pub const DEFAULT_FILE_MODE: u32 = 0o600;

/// Name of the per-user directory holding sidecar documents
pub const METAFILES_DIRECTORY_NAME: &str = "metafiles";

/// Metadata engine configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Directory holding one sidecar XML document per directory URI
    pub metafiles_dir: PathBuf,
    /// Maximum number of metafile loads in flight
    pub max_concurrent_reads: usize,
    /// URI schemes that never carry durable metadata
    pub excluded_schemes: Vec<String>,
    /// Permission bits for newly written sidecar files
    pub file_mode: u32,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            metafiles_dir: default_metafiles_dir(),
            max_concurrent_reads: DEFAULT_MAX_CONCURRENT_READS,
            excluded_schemes: default_excluded_schemes(),
            file_mode: DEFAULT_FILE_MODE,
        }
    }
}

impl MetadataConfig {
    /// Create config with a specific metafiles directory
    pub fn with_metafiles_dir(metafiles_dir: impl AsRef<Path>) -> Self {
        Self {
            metafiles_dir: metafiles_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Override the read concurrency limit (clamped to at least one)
    #[must_use]
    pub fn max_concurrent_reads(mut self, limit: usize) -> Self {
        self.max_concurrent_reads = limit.max(1);
        self
    }

    /// Validate configuration loaded from a file or built by hand
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_reads == 0 {
            return Err(Error::configuration(
                "max_concurrent_reads must be at least 1",
            ));
        }
        if self.metafiles_dir.as_os_str().is_empty() {
            return Err(Error::configuration("metafiles_dir must not be empty"));
        }
        if self.file_mode & 0o600 != 0o600 {
            return Err(Error::configuration(format!(
                "file_mode {:o} must allow owner read and write",
                self.file_mode
            )));
        }
        Ok(())
    }
}

fn default_metafiles_dir() -> PathBuf {
    std::env::var_os("HOME").map_or_else(
        || PathBuf::from(METAFILES_DIRECTORY_NAME),
        |home| {
            PathBuf::from(home)
                .join(".nautilus")
                .join(METAFILES_DIRECTORY_NAME)
        },
    )
}

fn default_excluded_schemes() -> Vec<String> {
    [
        "search",
        "x-nautilus-search",
        "ghelp",
        "gnome-help",
        "help",
        "info",
        "man",
        "pipe",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}
