//! Sidecar storage backends
//!
//! The engine only ever reads a whole sidecar or replaces it atomically,
//! so that is all a backend has to provide.

use async_trait::async_trait;
use dirmeta_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Semaphore;
use tracing::debug;

/// Whole-file storage used by metafiles
#[async_trait]
pub trait MetafileBackend: Send + Sync {
    /// Get the backend name (for logging)
    fn name(&self) -> &str;

    /// Read an entire sidecar file
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Replace a sidecar file so readers see either the old or new contents
    async fn write_atomic(&self, path: &Path, contents: Vec<u8>) -> Result<()>;
}

/// Backend storing sidecars on the local filesystem
#[derive(Clone, Debug)]
pub struct FsBackend {
    file_mode: u32,
}

impl FsBackend {
    /// Create a backend writing files with the given permission bits
    pub fn new(file_mode: u32) -> Self {
        Self { file_mode }
    }
}

impl Default for FsBackend {
    fn default() -> Self {
        Self::new(dirmeta_common::config::DEFAULT_FILE_MODE)
    }
}

#[async_trait]
impl MetafileBackend for FsBackend {
    fn name(&self) -> &str {
        "fs"
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn write_atomic(&self, path: &Path, contents: Vec<u8>) -> Result<()> {
        let path = path.to_path_buf();
        let mode = self.file_mode;
        tokio::task::spawn_blocking(move || write_atomic_blocking(&path, &contents, mode))
            .await
            .map_err(|e| Error::internal(format!("write task failed: {e}")))?
    }
}

/// Write to a uniquely named temp file beside `path`, then rename over it
fn write_atomic_blocking(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::invalid_argument(format!("no parent directory: {path:?}")))?;
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::Storage(format!("failed to create metafiles dir: {e}")))?;

    let mut builder = tempfile::Builder::new();
    builder.prefix(".dirmeta-").suffix(".tmp");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(mode));
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut temp = builder.tempfile_in(dir)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .map_err(|e| Error::Storage(format!("failed to rename sidecar: {}", e.error)))?;

    debug!("Wrote {} bytes to {:?}", contents.len(), path);
    Ok(())
}

/// In-process backend
///
/// Reads and writes can be gated so callers can hold I/O in flight, and
/// the backend records how much concurrency it observed.
#[derive(Default)]
pub struct MemoryBackend {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    read_gate: Option<Arc<Semaphore>>,
    write_gate: Option<Arc<Semaphore>>,
    fail_writes: AtomicBool,
    reads_active: AtomicUsize,
    max_reads_active: AtomicUsize,
    reads_started: AtomicUsize,
    writes_started: AtomicUsize,
    writes_finished: AtomicUsize,
}

impl MemoryBackend {
    /// Create an ungated, empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every read until a permit is released
    #[must_use]
    pub fn with_read_gate(mut self) -> Self {
        self.read_gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Hold every write until a permit is released
    #[must_use]
    pub fn with_write_gate(mut self) -> Self {
        self.write_gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Let `count` more gated reads proceed
    pub fn release_reads(&self, count: usize) {
        if let Some(gate) = &self.read_gate {
            gate.add_permits(count);
        }
    }

    /// Let `count` more gated writes proceed
    pub fn release_writes(&self, count: usize) {
        if let Some(gate) = &self.write_gate {
            gate.add_permits(count);
        }
    }

    /// Make every subsequent write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Store a file directly
    pub fn insert(&self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        self.files.lock().insert(path.into(), contents.into());
    }

    /// Get a stored file
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    /// Reads currently in progress
    pub fn reads_active(&self) -> usize {
        self.reads_active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous reads observed
    pub fn max_reads_active(&self) -> usize {
        self.max_reads_active.load(Ordering::SeqCst)
    }

    /// Reads started so far
    pub fn reads_started(&self) -> usize {
        self.reads_started.load(Ordering::SeqCst)
    }

    /// Writes started so far
    pub fn writes_started(&self) -> usize {
        self.writes_started.load(Ordering::SeqCst)
    }

    /// Writes finished so far, successful or not
    pub fn writes_finished(&self) -> usize {
        self.writes_finished.load(Ordering::SeqCst)
    }

    async fn pass_gate(gate: Option<&Arc<Semaphore>>) {
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }
}

#[async_trait]
impl MetafileBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.reads_started.fetch_add(1, Ordering::SeqCst);
        let active = self.reads_active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_reads_active.fetch_max(active, Ordering::SeqCst);

        Self::pass_gate(self.read_gate.as_ref()).await;

        let result = self
            .contents(path)
            .ok_or_else(|| Error::MetafileNotFound(path.display().to_string()));
        self.reads_active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn write_atomic(&self, path: &Path, contents: Vec<u8>) -> Result<()> {
        self.writes_started.fetch_add(1, Ordering::SeqCst);
        Self::pass_gate(self.write_gate.as_ref()).await;

        let result = if self.fail_writes.load(Ordering::SeqCst) {
            Err(Error::storage("injected write failure"))
        } else {
            self.insert(path, contents);
            Ok(())
        };
        self.writes_finished.fetch_add(1, Ordering::SeqCst);
        result
    }
}
