//! Deferred copies and removals
//!
//! A copy between metafiles waits here until both ends are read. A removal
//! of a file that is still the source of such a copy waits until the copy
//! has been applied.

use crate::metafile::Metafile;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

pub(crate) struct PendingCopy {
    pub(crate) source: Arc<Metafile>,
    pub(crate) source_name: String,
    pub(crate) destination: Arc<Metafile>,
    pub(crate) destination_name: String,
}

impl PendingCopy {
    fn matches(
        &self,
        source: &Arc<Metafile>,
        source_name: &str,
        destination: &Arc<Metafile>,
        destination_name: &str,
    ) -> bool {
        Arc::ptr_eq(&self.source, source)
            && self.source_name == source_name
            && Arc::ptr_eq(&self.destination, destination)
            && self.destination_name == destination_name
    }

    fn copies_from(&self, metafile: &Arc<Metafile>, file_name: &str) -> bool {
        Arc::ptr_eq(&self.source, metafile) && self.source_name == file_name
    }

    fn is_ready(&self) -> bool {
        self.source.is_read() && self.destination.is_read()
    }
}

pub(crate) struct PendingRemoval {
    pub(crate) metafile: Arc<Metafile>,
    pub(crate) file_name: String,
}

#[derive(Default)]
struct LedgerState {
    copies: Vec<PendingCopy>,
    removals: Vec<PendingRemoval>,
}

/// Records are taken out under the lock and applied by the caller after
/// it is released, so applying them may schedule new work here.
#[derive(Default)]
pub(crate) struct Ledger {
    state: Mutex<LedgerState>,
}

impl Ledger {
    /// Record a copy; returns false if an identical copy is already pending
    pub(crate) fn schedule_copy(
        &self,
        source: &Arc<Metafile>,
        source_name: &str,
        destination: &Arc<Metafile>,
        destination_name: &str,
    ) -> bool {
        let mut state = self.state.lock();
        if state
            .copies
            .iter()
            .any(|copy| copy.matches(source, source_name, destination, destination_name))
        {
            return false;
        }
        state.copies.push(PendingCopy {
            source: Arc::clone(source),
            source_name: source_name.to_string(),
            destination: Arc::clone(destination),
            destination_name: destination_name.to_string(),
        });
        debug!(
            "Deferred metadata copy {}/{} -> {}/{}",
            source.directory_uri(),
            source_name,
            destination.directory_uri(),
            destination_name
        );
        true
    }

    /// Defer a removal if the file is still the source of a pending copy
    ///
    /// Returns false when nothing blocks the removal and the caller should
    /// remove immediately.
    pub(crate) fn defer_removal(&self, metafile: &Arc<Metafile>, file_name: &str) -> bool {
        let mut state = self.state.lock();
        if !state
            .copies
            .iter()
            .any(|copy| copy.copies_from(metafile, file_name))
        {
            return false;
        }
        let already = state
            .removals
            .iter()
            .any(|removal| Arc::ptr_eq(&removal.metafile, metafile) && removal.file_name == file_name);
        if !already {
            state.removals.push(PendingRemoval {
                metafile: Arc::clone(metafile),
                file_name: file_name.to_string(),
            });
        }
        true
    }

    /// Take every copy whose endpoints are both read
    pub(crate) fn take_ready_copies(&self) -> Vec<PendingCopy> {
        let mut state = self.state.lock();
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.copies)
            .into_iter()
            .partition(PendingCopy::is_ready);
        state.copies = waiting;
        ready
    }

    /// Take every removal no longer blocked by a pending copy
    pub(crate) fn take_unblocked_removals(&self) -> Vec<PendingRemoval> {
        let mut state = self.state.lock();
        let LedgerState { copies, removals } = &mut *state;
        let (unblocked, blocked): (Vec<_>, Vec<_>) =
            std::mem::take(removals).into_iter().partition(|removal| {
                !copies
                    .iter()
                    .any(|copy| copy.copies_from(&removal.metafile, &removal.file_name))
            });
        *removals = blocked;
        unblocked
    }

    pub(crate) fn copies_len(&self) -> usize {
        self.state.lock().copies.len()
    }

    pub(crate) fn removals_len(&self) -> usize {
        self.state.lock().removals.len()
    }
}
