//! Bounded read scheduler
//!
//! Limits how many metafiles read their sidecar at once. Requests beyond
//! the limit wait in a FIFO queue and are promoted as reads complete.

use crate::metafile::Metafile;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tracing::debug;

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<Weak<Metafile>>,
    in_flight: usize,
}

pub(crate) struct ReadScheduler {
    limit: usize,
    state: Mutex<SchedulerState>,
}

impl ReadScheduler {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Queue a metafile for reading and start whatever fits under the limit
    ///
    /// The caller has already moved the metafile to its queued state.
    pub(crate) fn request(&self, metafile: &Arc<Metafile>) {
        let ready = {
            let mut state = self.state.lock();
            state.queue.push_back(Arc::downgrade(metafile));
            self.promote(&mut state)
        };
        Self::start(ready);
    }

    /// Release the slot held by a finished read
    pub(crate) fn complete(&self) {
        let ready = {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            self.promote(&mut state)
        };
        Self::start(ready);
    }

    /// Forget a metafile that is going away
    ///
    /// A queued entry is simply dropped. If the read was in flight its slot
    /// is released without any completion notification.
    pub(crate) fn cancel(&self, metafile: *const Metafile, was_reading: bool) {
        let ready = {
            let mut state = self.state.lock();
            state.queue.retain(|queued| queued.as_ptr() != metafile);
            if !was_reading {
                return;
            }
            state.in_flight = state.in_flight.saturating_sub(1);
            self.promote(&mut state)
        };
        Self::start(ready);
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub(crate) fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    // Upgraded metafiles are returned rather than started so that no
    // strong reference is dropped while the lock is held.
    fn promote(&self, state: &mut SchedulerState) -> Vec<Arc<Metafile>> {
        let mut ready = Vec::new();
        while state.in_flight < self.limit {
            let Some(next) = state.queue.pop_front() else {
                break;
            };
            if let Some(metafile) = next.upgrade() {
                state.in_flight += 1;
                ready.push(metafile);
            }
        }
        if !ready.is_empty() {
            debug!(
                "Starting {} metafile reads ({} in flight, {} queued)",
                ready.len(),
                state.in_flight,
                state.queue.len()
            );
        }
        ready
    }

    fn start(ready: Vec<Arc<Metafile>>) {
        for metafile in ready {
            metafile.start_read();
        }
    }
}
