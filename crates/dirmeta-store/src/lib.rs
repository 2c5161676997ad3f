//! Dirmeta Store - Per-directory file metadata engine
//!
//! Caches extended attributes (custom icons, emblems, keywords, positions)
//! for the files of one directory and persists them as an XML sidecar.
//!
//! # Design
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  MetadataService                        │
//! │   registry: canonical URI → Weak<Metafile>              │
//! │   ReadScheduler (bounded concurrent loads, FIFO)        │
//! │   Ledger (deferred copies / removals)                   │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Metafile                            │
//! │  UNLOADED ──load──▶ LOADING ──read done──▶ READ         │
//! │                                                         │
//! │  before READ: PendingChanges (buffered writes)          │
//! │  after READ:  Document (authoritative, written back)    │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────────┐
//! │   MetafileBackend: read whole file / atomic write       │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Write Path
//! 1. Mutate the authoritative store (buffer or document)
//! 2. Queue a `Changed` event for subscribers
//! 3. If loaded, schedule one coalesced write of the whole document
//!
//! # Load Path
//! 1. Queue through the read scheduler
//! 2. Read and decode the sidecar (failure means empty)
//! 3. Replay buffered changes, signal `Ready`, drain the ledger

pub mod backend;
pub mod codec;
pub mod document;
mod ledger;
pub mod metafile;
pub mod monitor;
pub mod pending;
mod scheduler;
pub mod service;
mod typed;
pub mod types;
pub mod uri;

pub use backend::{FsBackend, MemoryBackend, MetafileBackend};
pub use document::{Document, FileRecord, ListEntry};
pub use metafile::Metafile;
pub use monitor::{MetafileMonitor, MetafileServant, MonitorId};
pub use pending::PendingChanges;
pub use service::MetadataService;
pub use types::{MetadataValue, MetafileEvent, MetafileState};
