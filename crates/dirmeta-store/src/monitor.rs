//! Remote access to a metafile
//!
//! A [`MetafileServant`] is the narrow surface handed to out-of-process
//! views: plain metadata calls plus monitor registration. Monitors get
//! change and ready notifications forwarded from the metafile's event
//! channel.

use crate::metafile::Metafile;
use crate::service::MetadataService;
use crate::types::MetafileEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receiver of metafile notifications
#[async_trait]
pub trait MetafileMonitor: Send + Sync {
    /// Metadata changed for these files
    async fn metafile_changed(&self, file_names: &[String]);

    /// The metafile finished loading; any file may have changed
    async fn metafile_ready(&self);
}

/// Handle for a registered monitor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MonitorId(u64);

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "monitor-{}", self.0)
    }
}

struct Registration {
    id: MonitorId,
    monitor: Arc<dyn MetafileMonitor>,
    forwarder: JoinHandle<()>,
}

/// Servant exposing one directory's metafile
pub struct MetafileServant {
    service: MetadataService,
    metafile: Arc<Metafile>,
    monitors: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl MetafileServant {
    pub(crate) fn new(service: MetadataService, metafile: Arc<Metafile>) -> Self {
        Self {
            service,
            metafile,
            monitors: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The metafile behind this servant
    pub fn metafile(&self) -> &Arc<Metafile> {
        &self.metafile
    }

    pub fn is_read(&self) -> bool {
        self.metafile.is_read()
    }

    pub fn get(&self, file_name: &str, key: &str, default: &str) -> String {
        self.metafile.get(file_name, key, default)
    }

    pub fn get_list(&self, file_name: &str, key: &str, subkey: &str) -> Vec<String> {
        self.metafile.get_list(file_name, key, subkey)
    }

    pub fn set(&self, file_name: &str, key: &str, default: &str, value: &str) -> bool {
        self.metafile.set(file_name, key, default, value)
    }

    pub fn set_list(&self, file_name: &str, key: &str, subkey: &str, values: &[String]) -> bool {
        self.metafile.set_list(file_name, key, subkey, values)
    }

    /// Copy a file's metadata into another directory, named by URI
    pub fn copy(&self, source_name: &str, destination_directory_uri: &str, destination_name: &str) {
        let destination = self.service.get_for_uri(destination_directory_uri);
        self.metafile.copy(&destination, source_name, destination_name);
    }

    pub fn remove(&self, file_name: &str) {
        self.metafile.remove(file_name);
    }

    pub fn rename(&self, old_name: &str, new_name: &str) {
        self.metafile.rename(old_name, new_name);
    }

    pub fn rename_directory(&self, new_directory_uri: &str) {
        self.metafile.rename_directory(new_directory_uri);
    }

    /// Start forwarding notifications to a monitor and start loading
    ///
    /// Returns `None` if this monitor is already registered.
    pub fn register_monitor(&self, monitor: Arc<dyn MetafileMonitor>) -> Option<MonitorId> {
        let mut monitors = self.monitors.lock();
        if monitors
            .iter()
            .any(|registration| same_monitor(&registration.monitor, &monitor))
        {
            warn!("Monitor already registered on {}", self.metafile.directory_uri());
            return None;
        }

        let id = MonitorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut events = self.metafile.subscribe();
        let target = Arc::clone(&monitor);
        let forwarder = self.service.runtime().spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    MetafileEvent::Changed(file_names) => {
                        target.metafile_changed(&file_names).await;
                    }
                    MetafileEvent::Ready => target.metafile_ready().await,
                }
            }
        });
        monitors.push(Registration {
            id,
            monitor,
            forwarder,
        });
        drop(monitors);

        debug!("Registered {} on {}", id, self.metafile.directory_uri());
        self.metafile.load();
        Some(id)
    }

    /// Stop forwarding notifications to a monitor
    pub fn unregister_monitor(&self, id: MonitorId) -> bool {
        let registration = {
            let mut monitors = self.monitors.lock();
            let Some(index) = monitors.iter().position(|registration| registration.id == id)
            else {
                warn!("Unknown {} on {}", id, self.metafile.directory_uri());
                return false;
            };
            monitors.swap_remove(index)
        };
        registration.forwarder.abort();
        true
    }

    /// Number of registered monitors
    pub fn monitor_count(&self) -> usize {
        self.monitors.lock().len()
    }
}

impl Drop for MetafileServant {
    fn drop(&mut self) {
        for registration in self.monitors.get_mut().drain(..) {
            registration.forwarder.abort();
        }
    }
}

fn same_monitor(a: &Arc<dyn MetafileMonitor>, b: &Arc<dyn MetafileMonitor>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
