//! Operational state of a running batch.
//!
//! `BatchState` counts the sites currently inside a worker and remembers the
//! highest concurrency reached, so the scheduler can report on (and tests can
//! assert) the worker bound.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Represents the shared state of the batch's workers.
#[derive(Debug, Default)]
pub struct BatchState {
    /// Sites currently executing their workflows.
    pub in_flight_sites: AtomicUsize,
    /// Highest value `in_flight_sites` has reached.
    pub peak_in_flight: AtomicUsize,
    /// Outcomes written to the status store.
    pub committed_sites: AtomicUsize,
}

impl BatchState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn site_started(&self) {
        let now = self.in_flight_sites.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    pub(crate) fn site_finished(&self) {
        self.in_flight_sites.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn site_committed(&self) {
        self.committed_sites.fetch_add(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Checks if no site is executing.
    pub fn is_idle(&self) -> bool {
        self.in_flight_sites.load(Ordering::SeqCst) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_tracks_highest_concurrency() {
        let state = BatchState::new();
        state.site_started();
        state.site_started();
        state.site_finished();
        state.site_started();
        assert_eq!(state.peak(), 2);
        state.site_finished();
        state.site_finished();
        assert!(state.is_idle());
    }
}
