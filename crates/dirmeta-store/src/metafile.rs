//! Per-directory metafile
//!
//! A metafile starts unloaded. Loading goes through the service's read
//! scheduler; until the sidecar has been read, reads and writes use the
//! pre-load buffer. Once read, the document is authoritative and every
//! change schedules one coalesced write of the whole sidecar.

use crate::codec;
use crate::document::Document;
use crate::pending::{PendingChanges, PendingKey};
use crate::service::ServiceShared;
use crate::types::{MetadataValue, MetafileEvent, MetafileState, is_valid_key, is_xml_name};
use crate::uri;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LoadState {
    Unloaded,
    /// Waiting for a scheduler slot
    Queued,
    /// Holding a scheduler slot
    Reading,
    /// Excluded scheme, completing with an empty document
    Synthesizing,
    Read,
}

struct MetafileInner {
    directory_uri: String,
    sidecar_path: PathBuf,
    load: LoadState,
    pending: PendingChanges,
    document: Document,
    read_task: Option<JoinHandle<()>>,
    write_pending: bool,
    write_again: bool,
}

impl MetafileInner {
    fn is_read(&self) -> bool {
        self.load == LoadState::Read
    }
}

/// Metadata for the files of one directory
pub struct Metafile {
    shared: Arc<ServiceShared>,
    this: Weak<Metafile>,
    inner: Mutex<MetafileInner>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<MetafileEvent>>>,
    read_done: Notify,
    write_idle: Notify,
}

impl Metafile {
    pub(crate) fn new(shared: Arc<ServiceShared>, directory_uri: String) -> Arc<Self> {
        let sidecar_path = uri::sidecar_path(&shared.config.metafiles_dir, &directory_uri);
        Arc::new_cyclic(|this| Self {
            shared,
            this: this.clone(),
            inner: Mutex::new(MetafileInner {
                directory_uri,
                sidecar_path,
                load: LoadState::Unloaded,
                pending: PendingChanges::new(),
                document: Document::new(),
                read_task: None,
                write_pending: false,
                write_again: false,
            }),
            subscribers: Mutex::new(Vec::new()),
            read_done: Notify::new(),
            write_idle: Notify::new(),
        })
    }

    /// Canonical URI of the directory
    pub fn directory_uri(&self) -> String {
        self.inner.lock().directory_uri.clone()
    }

    /// Where the sidecar document is stored
    pub fn sidecar_path(&self) -> PathBuf {
        self.inner.lock().sidecar_path.clone()
    }

    pub fn state(&self) -> MetafileState {
        match self.inner.lock().load {
            LoadState::Unloaded => MetafileState::Unloaded,
            LoadState::Queued | LoadState::Reading | LoadState::Synthesizing => {
                MetafileState::Loading
            }
            LoadState::Read => MetafileState::Read,
        }
    }

    pub fn is_read(&self) -> bool {
        self.inner.lock().is_read()
    }

    /// Names of files that have metadata in the authoritative store
    pub fn file_names(&self) -> Vec<String> {
        let inner = self.inner.lock();
        if inner.is_read() {
            inner.document.file_names()
        } else {
            inner.pending.file_names()
        }
    }

    /// Receive change and ready notifications
    ///
    /// If the metafile has already been read the receiver starts with a
    /// `Ready` event.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MetafileEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = self.inner.lock();
        if inner.is_read() {
            let _ = tx.send(MetafileEvent::Ready);
        }
        self.subscribers.lock().push(tx);
        drop(inner);
        rx
    }

    fn emit(&self, event: MetafileEvent) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    // ---- Reads ----

    /// Get a scalar value, or `default` when none is stored
    pub fn get(&self, file_name: &str, key: &str, default: &str) -> String {
        if !check_arguments(file_name, key) {
            return default.to_string();
        }
        let inner = self.inner.lock();
        if inner.is_read() {
            inner.document.get_scalar(file_name, key, default)
        } else {
            inner.pending.get_scalar(file_name, key, default)
        }
    }

    /// Get a list value, or an empty list when none is stored
    pub fn get_list(&self, file_name: &str, key: &str, subkey: &str) -> Vec<String> {
        if !check_list_arguments(file_name, key, subkey) {
            return Vec::new();
        }
        let inner = self.inner.lock();
        if inner.is_read() {
            inner.document.get_list(file_name, key, subkey)
        } else {
            inner.pending.get_list(file_name, key, subkey)
        }
    }

    // ---- Writes ----

    /// Set a scalar value; storing `default` clears any override
    ///
    /// Returns whether the value a reader would see changed.
    pub fn set(&self, file_name: &str, key: &str, default: &str, value: &str) -> bool {
        if !check_arguments(file_name, key) {
            return false;
        }
        self.update(Some(file_name), |inner| {
            if inner.is_read() {
                inner.document.set_scalar(file_name, key, default, value)
            } else {
                inner.pending.set(
                    file_name,
                    PendingKey::scalar(key),
                    MetadataValue::scalar(default, value),
                )
            }
        })
    }

    /// Set a list value; an empty list clears it
    pub fn set_list(&self, file_name: &str, key: &str, subkey: &str, values: &[String]) -> bool {
        if !check_list_arguments(file_name, key, subkey) {
            return false;
        }
        self.update(Some(file_name), |inner| {
            if inner.is_read() {
                inner.document.set_list(file_name, key, subkey, values)
            } else {
                inner.pending.set(
                    file_name,
                    PendingKey::list(key, subkey),
                    MetadataValue::list(values.iter().cloned()),
                )
            }
        })
    }

    /// Remove all metadata for a file
    ///
    /// If the file is the source of a copy that has not been applied yet,
    /// the removal waits for the copy.
    pub fn remove(&self, file_name: &str) {
        if file_name.is_empty() {
            warn!("Ignoring metadata removal with an empty file name");
            return;
        }
        if let Some(this) = self.this.upgrade() {
            if self.shared.ledger.defer_removal(&this, file_name) {
                debug!("Deferred removal of {} until its copy is applied", file_name);
                return;
            }
        }
        self.remove_now(file_name);
    }

    pub(crate) fn remove_now(&self, file_name: &str) {
        self.update(None, |inner| {
            if inner.is_read() {
                inner.document.remove_record(file_name)
            } else {
                inner.pending.remove_file(file_name)
            }
        });
    }

    /// Move a file's metadata to a new name, replacing what was there
    pub fn rename(&self, old_name: &str, new_name: &str) {
        if old_name.is_empty() || new_name.is_empty() {
            warn!("Ignoring metadata rename with an empty file name");
            return;
        }
        self.update(None, |inner| {
            if inner.is_read() {
                inner.document.rename_record(old_name, new_name)
            } else {
                inner.pending.rename_file(old_name, new_name)
            }
        });
    }

    /// Copy a file's metadata into another (or the same) directory
    ///
    /// Applied at once when both metafiles are read. Otherwise the copy is
    /// deferred, both sides start loading, and the copy takes the source's
    /// state at the moment it is applied.
    pub fn copy(&self, destination: &Arc<Metafile>, source_name: &str, destination_name: &str) {
        if source_name.is_empty() || destination_name.is_empty() {
            warn!("Ignoring metadata copy with an empty file name");
            return;
        }
        if self.is_read() && destination.is_read() {
            self.copy_now(source_name, destination, destination_name);
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.shared
            .ledger
            .schedule_copy(&this, source_name, destination, destination_name);
        self.load();
        destination.load();
        // Both sides may have finished loading before the copy was recorded
        self.shared.drain_ledger();
    }

    pub(crate) fn copy_now(&self, source_name: &str, destination: &Metafile, destination_name: &str) {
        let snapshot = self.inner.lock().document.record(source_name).cloned();
        destination.update(Some(destination_name), |inner| {
            let removed = inner.document.remove_record(destination_name);
            match &snapshot {
                Some(record) => {
                    inner.document.insert_copy(record, destination_name);
                    true
                }
                None => removed,
            }
        });
    }

    /// Point the metafile at a renamed directory
    ///
    /// Loaded content is kept; the next write goes to the new sidecar.
    pub fn rename_directory(&self, new_directory_uri: &str) {
        let canonical = uri::canonicalize(new_directory_uri);
        let old_uri = {
            let mut inner = self.inner.lock();
            if inner.directory_uri == canonical {
                return;
            }
            inner.sidecar_path = uri::sidecar_path(&self.shared.config.metafiles_dir, &canonical);
            std::mem::replace(&mut inner.directory_uri, canonical.clone())
        };
        debug!("Metafile for {} now tracks {}", old_uri, canonical);
        self.shared.rekey(&old_uri, &canonical, &self.this);
    }

    /// Apply a mutation to the authoritative store
    ///
    /// On change, notifies subscribers (when `changed_file` is given) and
    /// schedules a write if the document is authoritative.
    fn update<F>(&self, changed_file: Option<&str>, apply: F) -> bool
    where
        F: FnOnce(&mut MetafileInner) -> bool,
    {
        let (changed, is_read) = {
            let mut inner = self.inner.lock();
            let changed = apply(&mut inner);
            if changed {
                if let Some(file_name) = changed_file {
                    self.emit(MetafileEvent::Changed(vec![file_name.to_string()]));
                }
            }
            (changed, inner.is_read())
        };
        if changed && is_read {
            self.request_write();
        }
        changed
    }

    // ---- Loading ----

    /// Start loading the sidecar if that has not happened yet
    pub fn load(&self) {
        let excluded = {
            let mut inner = self.inner.lock();
            if inner.load != LoadState::Unloaded {
                return;
            }
            let excluded =
                uri::is_metadata_excluded(&inner.directory_uri, &self.shared.config.excluded_schemes);
            inner.load = if excluded {
                LoadState::Synthesizing
            } else {
                LoadState::Queued
            };
            excluded
        };
        let Some(this) = self.this.upgrade() else {
            return;
        };

        if excluded {
            debug!("{} never has metadata, skipping read", self.directory_uri());
            let weak = Arc::downgrade(&this);
            let task = self.shared.runtime.spawn(async move {
                if let Some(metafile) = weak.upgrade() {
                    metafile.finish_read(Document::new());
                }
            });
            self.store_read_task(LoadState::Synthesizing, task);
        } else {
            self.shared.scheduler.request(&this);
        }
    }

    /// Wait until the metafile has been read, starting the load if needed
    pub async fn wait_until_read(&self) {
        self.load();
        loop {
            let notified = self.read_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_read() {
                return;
            }
            notified.await;
        }
    }

    /// Called by the scheduler once this metafile holds a read slot
    pub(crate) fn start_read(self: &Arc<Self>) {
        let path = {
            let mut inner = self.inner.lock();
            if inner.load != LoadState::Queued {
                drop(inner);
                debug!("Metafile promoted while not queued, releasing slot");
                self.shared.scheduler.complete();
                return;
            }
            inner.load = LoadState::Reading;
            inner.sidecar_path.clone()
        };

        let weak = Arc::downgrade(self);
        let backend = Arc::clone(&self.shared.backend);
        let task = self.shared.runtime.spawn(async move {
            let document = match backend.read(&path).await.and_then(|bytes| codec::decode(&bytes)) {
                Ok(document) => document,
                Err(e) if e.is_not_found() => {
                    debug!("No sidecar at {:?}, starting empty", path);
                    Document::new()
                }
                Err(e) => {
                    warn!("Ignoring unreadable sidecar {:?}: {}", path, e);
                    Document::new()
                }
            };
            // A metafile dropped mid-read has already released its slot
            if let Some(metafile) = weak.upgrade() {
                metafile.finish_read(document);
                metafile.shared.scheduler.complete();
            }
        });
        self.store_read_task(LoadState::Reading, task);
    }

    fn store_read_task(&self, expected: LoadState, task: JoinHandle<()>) {
        let mut inner = self.inner.lock();
        if inner.load == expected {
            inner.read_task = Some(task);
        }
    }

    /// Enter the read state: replay buffered changes, notify, drain the ledger
    fn finish_read(&self, document: Document) {
        let changed = {
            let mut inner = self.inner.lock();
            if inner.is_read() {
                return;
            }
            inner.load = LoadState::Read;
            inner.read_task = None;
            inner.document = document;
            let pending = std::mem::take(&mut inner.pending);
            let changed = if pending.is_empty() {
                false
            } else {
                debug!("Replaying buffered changes for {} files", pending.len());
                pending.apply_to(&mut inner.document)
            };
            self.emit(MetafileEvent::Ready);
            changed
        };
        debug!(
            "Metafile {} read ({} files)",
            self.directory_uri(),
            self.file_names().len()
        );

        if changed {
            self.request_write();
        }
        self.read_done.notify_waiters();
        self.shared.drain_ledger();
    }

    // ---- Write-back ----

    fn request_write(&self) {
        {
            let mut inner = self.inner.lock();
            if !inner.is_read() {
                return;
            }
            if inner.write_pending {
                inner.write_again = true;
                return;
            }
            inner.write_pending = true;
        }

        // The task keeps the metafile alive until the write finishes
        let Some(this) = self.this.upgrade() else {
            self.inner.lock().write_pending = false;
            return;
        };
        self.shared.runtime.spawn(this.run_writes());
    }

    async fn run_writes(self: Arc<Self>) {
        tokio::task::yield_now().await;
        loop {
            let job = {
                let mut inner = self.inner.lock();
                inner.write_again = false;
                inner
                    .document
                    .is_materialized()
                    .then(|| (inner.sidecar_path.clone(), codec::encode(&inner.document)))
            };

            match job {
                Some((path, Ok(bytes))) => {
                    match self.shared.backend.write_atomic(&path, bytes).await {
                        Ok(()) => debug!("Wrote metafile {:?}", path),
                        Err(e) => warn!("Failed to write metafile {:?}: {}", path, e),
                    }
                }
                Some((path, Err(e))) => warn!("Failed to encode metafile {:?}: {}", path, e),
                None => debug!("Skipping write of empty metafile"),
            }

            let again = {
                let mut inner = self.inner.lock();
                if !inner.write_again {
                    inner.write_pending = false;
                }
                inner.write_again
            };
            if !again {
                break;
            }
        }
        self.write_idle.notify_waiters();
    }

    /// Wait until no write is scheduled or in flight
    pub async fn flush(&self) {
        loop {
            let notified = self.write_idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.inner.lock().write_pending {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for Metafile {
    fn drop(&mut self) {
        let this: *const Self = self;
        let inner = self.inner.get_mut();
        // Only reachable when the runtime drops an unfinished write task
        if inner.write_pending {
            warn!("Metafile {} dropped before its write finished", inner.directory_uri);
        }

        if let Some(task) = inner.read_task.take() {
            task.abort();
        }
        let load = inner.load;
        let uri = std::mem::take(&mut inner.directory_uri);
        match load {
            LoadState::Queued => self.shared.scheduler.cancel(this, false),
            LoadState::Reading => self.shared.scheduler.cancel(this, true),
            _ => {}
        }
        self.shared.unregister(&uri, this);
    }
}

/// File names must be non-empty; keys must be XML names other than the
/// reserved attributes
fn check_arguments(file_name: &str, key: &str) -> bool {
    if file_name.is_empty() {
        warn!("Ignoring metadata access with an empty file name");
        return false;
    }
    if !is_valid_key(key) {
        warn!("Ignoring metadata access with invalid key {:?}", key);
        return false;
    }
    true
}

fn check_list_arguments(file_name: &str, key: &str, subkey: &str) -> bool {
    if !is_xml_name(subkey) {
        warn!("Ignoring list metadata access with invalid subkey {:?}", subkey);
        return false;
    }
    check_arguments(file_name, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, MetafileBackend};
    use crate::service::MetadataService;
    use dirmeta_common::MetadataConfig;
    use std::path::Path;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    fn service_with(backend: &Arc<MemoryBackend>) -> MetadataService {
        let config = MetadataConfig::with_metafiles_dir("/meta");
        MetadataService::new(config, Arc::clone(backend) as Arc<dyn MetafileBackend>).unwrap()
    }

    fn sidecar_text(backend: &MemoryBackend, metafile: &Metafile) -> String {
        String::from_utf8(backend.contents(&metafile.sidecar_path()).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_buffered_set_survives_load() {
        let backend = Arc::new(MemoryBackend::new());
        let service = service_with(&backend);
        let metafile = service.get_for_uri("file:///tmp/x");

        assert_eq!(metafile.state(), MetafileState::Unloaded);
        assert!(metafile.set("foo.txt", "keyword", "", "important"));
        assert_eq!(metafile.get("foo.txt", "keyword", ""), "important");

        metafile.wait_until_read().await;
        assert_eq!(metafile.state(), MetafileState::Read);
        assert_eq!(metafile.get("foo.txt", "keyword", ""), "important");

        metafile.flush().await;
        let xml = sidecar_text(&backend, &metafile);
        assert!(xml.contains("<file name=\"foo.txt\" keyword=\"important\" timestamp=\""));
        assert_eq!(
            metafile.sidecar_path(),
            Path::new("/meta/file%3A%2F%2F%2Ftmp%2Fx.xml")
        );
    }

    #[tokio::test]
    async fn test_buffered_writes_match_direct_writes() {
        let backend = Arc::new(MemoryBackend::new());
        let service = service_with(&backend);

        fn apply(metafile: &Metafile) {
            metafile.set("a", "keyword", "", "x");
            metafile.set("a", "keyword", "", "y");
            metafile.set_list("a", "emblem", "name", &strings(&["urgent", "new"]));
            metafile.set_list("a", "emblem", "name", &strings(&["new"]));
            metafile.set("b", "icon_scale", "1", "2");
            metafile.set("b", "icon_scale", "1", "1");
            metafile.set("c", "icon", "", "folder");
            metafile.rename("c", "d");
        }

        let buffered = service.get_for_uri("/tmp/buffered");
        apply(&buffered);
        buffered.wait_until_read().await;

        let direct = service.open("/tmp/direct");
        direct.wait_until_read().await;
        apply(&direct);

        for file in ["a", "b", "c", "d"] {
            assert_eq!(
                buffered.get(file, "keyword", ""),
                direct.get(file, "keyword", "")
            );
            assert_eq!(
                buffered.get(file, "icon_scale", "1"),
                direct.get(file, "icon_scale", "1")
            );
            assert_eq!(buffered.get(file, "icon", ""), direct.get(file, "icon", ""));
            assert_eq!(
                buffered.get_list(file, "emblem", "name"),
                direct.get_list(file, "emblem", "name")
            );
        }
        assert_eq!(buffered.get("d", "icon", ""), "folder");

        let mut buffered_names = buffered.file_names();
        let mut direct_names = direct.file_names();
        buffered_names.sort();
        direct_names.sort();
        assert_eq!(buffered_names, direct_names);
        assert_eq!(direct_names, strings(&["a", "b", "d"]));
    }

    #[tokio::test]
    async fn test_non_xml_keys_never_reach_the_sidecar() {
        let backend = Arc::new(MemoryBackend::new());
        {
            let service = service_with(&backend);
            let metafile = service.open("/tmp/x");
            metafile.wait_until_read().await;
            assert!(metafile.set("keep.txt", "keyword", "", "precious"));
            assert!(!metafile.set("a", "icon position", "", "1,2"));
            assert!(!metafile.set("a", "2nd", "", "x"));
            assert!(!metafile.set("a", "k\"=<", "", "x"));
            assert!(!metafile.set_list("a", "emblem list", "name", &strings(&["x"])));
            assert!(!metafile.set_list("a", "emblem", "sub key", &strings(&["x"])));
            assert_eq!(metafile.get("a", "icon position", "none"), "none");
            metafile.flush().await;
        }

        let service = service_with(&backend);
        let metafile = service.open("/tmp/x");
        metafile.wait_until_read().await;
        assert_eq!(metafile.get("keep.txt", "keyword", "<default>"), "precious");
        assert_eq!(metafile.file_names(), strings(&["keep.txt"]));
    }

    #[tokio::test]
    async fn test_buffered_default_clears_stored_value() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert(
            "/meta/file%3A%2F%2F%2Ftmp%2Fx.xml",
            r#"<directory><file name="a" icon_scale="3" timestamp="1"/></directory>"#,
        );
        let service = service_with(&backend);
        let metafile = service.get_for_uri("/tmp/x");

        assert!(!metafile.set("a", "icon_scale", "1", "1"));
        metafile.wait_until_read().await;
        assert_eq!(metafile.get("a", "icon_scale", "1"), "1");
    }

    #[tokio::test]
    async fn test_events_are_queued_not_synchronous() {
        let backend = Arc::new(MemoryBackend::new());
        let service = service_with(&backend);
        let metafile = service.get_for_uri("/tmp/x");
        let mut events = metafile.subscribe();

        metafile.set("a", "keyword", "", "x");
        metafile.set("a", "keyword", "", "x");
        assert_eq!(
            events.recv().await,
            Some(MetafileEvent::Changed(strings(&["a"])))
        );

        metafile.wait_until_read().await;
        assert_eq!(events.recv().await, Some(MetafileEvent::Ready));

        metafile.set("b", "keyword", "", "y");
        assert_eq!(
            events.recv().await,
            Some(MetafileEvent::Changed(strings(&["b"])))
        );
        assert!(events.try_recv().is_err());

        let mut late = metafile.subscribe();
        assert_eq!(late.try_recv().ok(), Some(MetafileEvent::Ready));
    }

    #[tokio::test]
    async fn test_load_failure_means_empty() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("/meta/file%3A%2F%2F%2Ftmp%2Fbad.xml", "<directory><file");
        let service = service_with(&backend);
        let metafile = service.open("/tmp/bad");
        metafile.wait_until_read().await;
        assert!(metafile.file_names().is_empty());
        assert!(metafile.set("a", "keyword", "", "x"));
    }

    #[tokio::test]
    async fn test_excluded_scheme_reads_empty_without_io() {
        let backend = Arc::new(MemoryBackend::new());
        let service = service_with(&backend);
        let metafile = service.get_for_uri("x-nautilus-search:///saved");
        let mut events = metafile.subscribe();

        metafile.load();
        assert_eq!(metafile.state(), MetafileState::Loading);
        assert_eq!(events.recv().await, Some(MetafileEvent::Ready));
        assert!(metafile.is_read());
        assert_eq!(backend.reads_started(), 0);
    }

    #[tokio::test]
    async fn test_unmaterialized_document_is_not_written() {
        let backend = Arc::new(MemoryBackend::new());
        let service = service_with(&backend);
        let metafile = service.open("/tmp/x");
        metafile.wait_until_read().await;

        assert!(!metafile.set("a", "icon_scale", "1", "1"));
        metafile.rename("a", "b");
        metafile.flush().await;
        assert_eq!(backend.writes_started(), 0);
    }

    #[tokio::test]
    async fn test_rename_overwrites_destination() {
        let backend = Arc::new(MemoryBackend::new());
        let service = service_with(&backend);
        let metafile = service.open("/tmp/x");
        metafile.wait_until_read().await;

        metafile.set("a", "keyword", "", "from-a");
        metafile.set("b", "keyword", "", "from-b");
        metafile.set("b", "icon", "", "only-b");
        metafile.rename("a", "b");

        assert_eq!(metafile.file_names(), strings(&["b"]));
        assert_eq!(metafile.get("b", "keyword", ""), "from-a");
        assert_eq!(metafile.get("b", "icon", ""), "");
        assert_eq!(metafile.get("a", "keyword", "none"), "none");
    }

    #[tokio::test]
    async fn test_writes_coalesce_while_in_flight() {
        let backend = Arc::new(MemoryBackend::new().with_write_gate());
        let service = service_with(&backend);
        let metafile = service.open("/tmp/x");
        metafile.wait_until_read().await;

        metafile.set("a", "keyword", "", "v0");
        while backend.writes_started() == 0 {
            tokio::task::yield_now().await;
        }
        for i in 1..=5 {
            metafile.set("a", "keyword", "", &format!("v{i}"));
        }
        backend.release_writes(10);
        metafile.flush().await;

        assert_eq!(backend.writes_started(), 2);
        assert_eq!(backend.writes_finished(), 2);
        assert!(sidecar_text(&backend, &metafile).contains("keyword=\"v5\""));
    }

    #[tokio::test]
    async fn test_failed_write_is_not_retried() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_fail_writes(true);
        let service = service_with(&backend);
        let metafile = service.open("/tmp/x");
        metafile.wait_until_read().await;

        metafile.set("a", "keyword", "", "x");
        metafile.flush().await;
        assert_eq!(backend.writes_finished(), 1);
        assert_eq!(metafile.get("a", "keyword", ""), "x");

        backend.set_fail_writes(false);
        metafile.set("a", "keyword", "", "y");
        metafile.flush().await;
        assert_eq!(backend.writes_finished(), 2);
        assert!(sidecar_text(&backend, &metafile).contains("keyword=\"y\""));
    }

    #[tokio::test]
    async fn test_copy_deferred_until_both_read() {
        let backend = Arc::new(MemoryBackend::new().with_read_gate());
        let service = service_with(&backend);
        let source = service.open("/tmp/src");
        backend.release_reads(1);
        source.wait_until_read().await;
        source.set("a", "keyword", "", "original");

        let destination = service.get_for_uri("/tmp/dst");
        let mut events = destination.subscribe();
        source.copy(&destination, "a", "b");
        assert_eq!(service.pending_copies(), 1);
        assert_eq!(destination.get("b", "keyword", ""), "");

        source.set("a", "keyword", "", "changed");
        backend.release_reads(1);
        destination.wait_until_read().await;

        assert_eq!(service.pending_copies(), 0);
        assert_eq!(destination.get("b", "keyword", ""), "changed");
        assert_eq!(events.recv().await, Some(MetafileEvent::Ready));
        assert_eq!(
            events.recv().await,
            Some(MetafileEvent::Changed(strings(&["b"])))
        );
    }

    #[tokio::test]
    async fn test_copy_between_read_metafiles_is_immediate() {
        let backend = Arc::new(MemoryBackend::new());
        let service = service_with(&backend);
        let metafile = service.open("/tmp/x");
        metafile.wait_until_read().await;
        metafile.set_list("a", "emblem", "name", &strings(&["urgent"]));

        metafile.copy(&metafile, "a", "a-copy");
        assert_eq!(service.pending_copies(), 0);
        assert_eq!(
            metafile.get_list("a-copy", "emblem", "name"),
            strings(&["urgent"])
        );
    }

    #[tokio::test]
    async fn test_remove_waits_for_pending_copy() {
        let backend = Arc::new(MemoryBackend::new().with_read_gate());
        let service = service_with(&backend);
        let source = service.open("/tmp/src");
        backend.release_reads(1);
        source.wait_until_read().await;
        source.set("foo.txt", "keyword", "", "keep-me");

        let destination = service.get_for_uri("/tmp/dst");
        source.copy(&destination, "foo.txt", "foo.txt");
        source.remove("foo.txt");
        assert_eq!(service.pending_removals(), 1);
        assert_eq!(source.get("foo.txt", "keyword", ""), "keep-me");

        backend.release_reads(1);
        destination.wait_until_read().await;

        assert_eq!(service.pending_copies(), 0);
        assert_eq!(service.pending_removals(), 0);
        assert_eq!(source.get("foo.txt", "keyword", ""), "");
        assert_eq!(destination.get("foo.txt", "keyword", ""), "keep-me");
    }

    #[tokio::test]
    async fn test_remove_before_load_drops_buffered_only() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert(
            "/meta/file%3A%2F%2F%2Ftmp%2Fx.xml",
            r#"<directory><file name="a" keyword="stored" timestamp="1"/></directory>"#,
        );
        let service = service_with(&backend);
        let metafile = service.get_for_uri("/tmp/x");

        metafile.set("a", "icon", "", "buffered");
        metafile.remove("a");
        assert_eq!(metafile.get("a", "icon", ""), "");

        metafile.wait_until_read().await;
        assert_eq!(metafile.get("a", "keyword", ""), "stored");
        assert_eq!(metafile.get("a", "icon", ""), "");
    }

    #[tokio::test]
    async fn test_rename_directory_moves_sidecar() {
        let backend = Arc::new(MemoryBackend::new());
        let service = service_with(&backend);
        let metafile = service.open("/tmp/old");
        metafile.wait_until_read().await;

        metafile.rename_directory("/tmp/new");
        assert_eq!(metafile.directory_uri(), "file:///tmp/new");
        assert!(Arc::ptr_eq(&service.get_for_uri("/tmp/new"), &metafile));

        metafile.set("a", "keyword", "", "x");
        metafile.flush().await;
        assert!(
            backend
                .contents(Path::new("/meta/file%3A%2F%2F%2Ftmp%2Fnew.xml"))
                .is_some()
        );
        assert!(
            backend
                .contents(Path::new("/meta/file%3A%2F%2F%2Ftmp%2Fold.xml"))
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_invalid_arguments_are_ignored() {
        let backend = Arc::new(MemoryBackend::new());
        let service = service_with(&backend);
        let metafile = service.get_for_uri("/tmp/x");

        assert!(!metafile.set("", "keyword", "", "x"));
        assert!(!metafile.set("a", "name", "", "x"));
        assert!(!metafile.set("a", "timestamp", "", "1"));
        assert!(!metafile.set_list("a", "", "name", &strings(&["x"])));
        assert_eq!(metafile.get("a", "name", "fallback"), "fallback");
        assert!(metafile.file_names().is_empty());
    }
}
