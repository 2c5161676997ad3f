//! Metadata service
//!
//! Owns the metafile registry, the read scheduler and the deferred
//! copy/removal ledger. Everything that used to be process-wide lives
//! here, so independent services never share state.

use crate::backend::{FsBackend, MetafileBackend};
use crate::ledger::Ledger;
use crate::metafile::Metafile;
use crate::monitor::MetafileServant;
use crate::scheduler::ReadScheduler;
use crate::uri;
use dirmeta_common::{Error, MetadataConfig, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, info};

pub(crate) struct ServiceShared {
    pub(crate) config: MetadataConfig,
    pub(crate) backend: Arc<dyn MetafileBackend>,
    pub(crate) runtime: Handle,
    pub(crate) scheduler: ReadScheduler,
    pub(crate) ledger: Ledger,
    registry: Mutex<HashMap<String, Weak<Metafile>>>,
}

impl ServiceShared {
    /// Apply every deferred copy whose endpoints are read, then every
    /// removal those copies were blocking
    pub(crate) fn drain_ledger(&self) {
        for copy in self.ledger.take_ready_copies() {
            copy.source
                .copy_now(&copy.source_name, &copy.destination, &copy.destination_name);
        }
        for removal in self.ledger.take_unblocked_removals() {
            removal.metafile.remove_now(&removal.file_name);
        }
    }

    /// Drop the registry entry for `uri` if it still points at `metafile`
    pub(crate) fn unregister(&self, uri: &str, metafile: *const Metafile) {
        let mut registry = self.registry.lock();
        if registry
            .get(uri)
            .is_some_and(|entry| entry.as_ptr() == metafile)
        {
            registry.remove(uri);
        }
    }

    /// Move a metafile to a new canonical URI
    pub(crate) fn rekey(&self, old_uri: &str, new_uri: &str, metafile: &Weak<Metafile>) {
        let mut registry = self.registry.lock();
        if registry
            .get(old_uri)
            .is_some_and(|entry| entry.ptr_eq(metafile))
        {
            registry.remove(old_uri);
        }
        if registry.insert(new_uri.to_string(), metafile.clone()).is_some() {
            debug!("Replaced registry entry for {}", new_uri);
        }
    }
}

/// Entry point for per-directory metadata
///
/// Cloning is cheap and every clone shares the same registry.
#[derive(Clone)]
pub struct MetadataService {
    shared: Arc<ServiceShared>,
}

impl MetadataService {
    /// Create a service on the current tokio runtime
    pub fn new(config: MetadataConfig, backend: Arc<dyn MetafileBackend>) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| Error::internal(format!("metadata service needs a tokio runtime: {e}")))?;

        info!(
            "Metadata service using {} backend at {:?} (max {} concurrent reads)",
            backend.name(),
            config.metafiles_dir,
            config.max_concurrent_reads
        );

        Ok(Self {
            shared: Arc::new(ServiceShared {
                scheduler: ReadScheduler::new(config.max_concurrent_reads),
                ledger: Ledger::default(),
                registry: Mutex::new(HashMap::new()),
                config,
                backend,
                runtime,
            }),
        })
    }

    /// Create a service storing sidecars on the local filesystem
    pub fn with_fs(config: MetadataConfig) -> Result<Self> {
        let backend = Arc::new(FsBackend::new(config.file_mode));
        Self::new(config, backend)
    }

    pub fn config(&self) -> &MetadataConfig {
        &self.shared.config
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.shared.runtime
    }

    /// Get the one live metafile for a directory, creating it if needed
    ///
    /// The metafile is not loaded; reads and writes are buffered until
    /// [`Metafile::load`] completes.
    pub fn get_for_uri(&self, directory_uri: &str) -> Arc<Metafile> {
        let canonical = uri::canonicalize(directory_uri);
        let mut registry = self.shared.registry.lock();
        if let Some(existing) = registry.get(&canonical).and_then(Weak::upgrade) {
            return existing;
        }

        let metafile = Metafile::new(Arc::clone(&self.shared), canonical.clone());
        registry.insert(canonical, Arc::downgrade(&metafile));
        metafile
    }

    /// Get the metafile for a directory and start loading it
    pub fn open(&self, directory_uri: &str) -> Arc<Metafile> {
        let metafile = self.get_for_uri(directory_uri);
        metafile.load();
        metafile
    }

    /// Open a servant for remote callers of a directory's metafile
    pub fn open_servant(&self, directory_uri: &str) -> MetafileServant {
        MetafileServant::new(self.clone(), self.get_for_uri(directory_uri))
    }

    /// Apply any deferred copies and removals that are now possible
    pub fn drain_ledger(&self) {
        self.shared.drain_ledger();
    }

    /// Number of metafiles currently alive
    pub fn live_metafiles(&self) -> usize {
        self.shared
            .registry
            .lock()
            .values()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    /// Copies waiting for an endpoint to load
    pub fn pending_copies(&self) -> usize {
        self.shared.ledger.copies_len()
    }

    /// Removals waiting for a copy to be applied
    pub fn pending_removals(&self) -> usize {
        self.shared.ledger.removals_len()
    }

    /// Sidecar reads currently running
    pub fn reads_in_flight(&self) -> usize {
        self.shared.scheduler.in_flight()
    }

    /// Sidecar reads waiting for a slot
    pub fn reads_queued(&self) -> usize {
        self.shared.scheduler.queued()
    }
}
