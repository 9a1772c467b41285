//! # Statistics Module
//!
//! Collects metrics about a check-in batch.
//!
//! ## Overview
//!
//! The `StatCollector` tracks how many sites ran, how they ended, how many were
//! filtered out before running, and how many requests each transport backend
//! served. The router and the scheduler update it concurrently; reports are
//! produced from a consistent [`StatsSnapshot`].
//!
//! ## Key Metrics Tracked
//!
//! - **Site Metrics**: Executed, succeeded, already done, failed, unsupported
//! - **Skip Metrics**: Already checked in today, inside the failure backoff window
//! - **Transport Metrics**: Requests per backend, failed requests, challenge fallbacks
//!
//! ## Example
//!
//! ```rust,ignore
//! use checkin_core::StatCollector;
//!
//! let stats = StatCollector::new();
//! println!("{}", stats.to_markdown_string());
//! println!("{}", stats.to_json_string_pretty()?);
//! ```

use crate::error::CheckinError;
use crate::outcome::SignState;
use crate::transport::TransportKind;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// A point-in-time copy of every counter, used for reporting.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sites_executed: usize,
    pub sites_succeeded: usize,
    pub sites_already_done: usize,
    pub sites_failed: usize,
    pub sites_unsupported: usize,
    pub skipped_done: usize,
    pub skipped_backoff: usize,
    pub requests_direct: usize,
    pub requests_proxy: usize,
    pub requests_browser: usize,
    pub requests_failed: usize,
    pub challenge_fallbacks: usize,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl StatsSnapshot {
    fn formatted_duration(&self) -> String {
        format!("{:.2?}", self.elapsed)
    }

    pub fn total_requests(&self) -> usize {
        self.requests_direct + self.requests_proxy + self.requests_browser
    }

    /// Counters accumulated between `earlier` and this snapshot.
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            sites_executed: self.sites_executed.saturating_sub(earlier.sites_executed),
            sites_succeeded: self.sites_succeeded.saturating_sub(earlier.sites_succeeded),
            sites_already_done: self.sites_already_done.saturating_sub(earlier.sites_already_done),
            sites_failed: self.sites_failed.saturating_sub(earlier.sites_failed),
            sites_unsupported: self.sites_unsupported.saturating_sub(earlier.sites_unsupported),
            skipped_done: self.skipped_done.saturating_sub(earlier.skipped_done),
            skipped_backoff: self.skipped_backoff.saturating_sub(earlier.skipped_backoff),
            requests_direct: self.requests_direct.saturating_sub(earlier.requests_direct),
            requests_proxy: self.requests_proxy.saturating_sub(earlier.requests_proxy),
            requests_browser: self.requests_browser.saturating_sub(earlier.requests_browser),
            requests_failed: self.requests_failed.saturating_sub(earlier.requests_failed),
            challenge_fallbacks: self.challenge_fallbacks.saturating_sub(earlier.challenge_fallbacks),
            elapsed: self.elapsed.saturating_sub(earlier.elapsed),
        }
    }

    fn success_rate(&self) -> f64 {
        if self.sites_executed > 0 {
            (self.sites_succeeded + self.sites_already_done) as f64 / self.sites_executed as f64 * 100.0
        } else {
            0.0
        }
    }
}

/// Collects and stores statistics about a batch.
#[derive(Debug)]
pub struct StatCollector {
    start_time: Instant,

    // Site outcomes
    sites_executed: AtomicUsize,
    sites_succeeded: AtomicUsize,
    sites_already_done: AtomicUsize,
    sites_failed: AtomicUsize,
    sites_unsupported: AtomicUsize,

    // Filtered before running
    skipped_done: AtomicUsize,
    skipped_backoff: AtomicUsize,

    // Transport
    requests_direct: AtomicUsize,
    requests_proxy: AtomicUsize,
    requests_browser: AtomicUsize,
    requests_failed: AtomicUsize,
    challenge_fallbacks: AtomicUsize,
}

impl StatCollector {
    /// Creates a new `StatCollector` with all counters initialized to zero.
    pub fn new() -> Self {
        StatCollector {
            start_time: Instant::now(),
            sites_executed: AtomicUsize::new(0),
            sites_succeeded: AtomicUsize::new(0),
            sites_already_done: AtomicUsize::new(0),
            sites_failed: AtomicUsize::new(0),
            sites_unsupported: AtomicUsize::new(0),
            skipped_done: AtomicUsize::new(0),
            skipped_backoff: AtomicUsize::new(0),
            requests_direct: AtomicUsize::new(0),
            requests_proxy: AtomicUsize::new(0),
            requests_browser: AtomicUsize::new(0),
            requests_failed: AtomicUsize::new(0),
            challenge_fallbacks: AtomicUsize::new(0),
        }
    }

    /// Creates a snapshot of the current statistics.
    /// This is the single source of truth for all presentation logic.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sites_executed: self.sites_executed.load(Ordering::SeqCst),
            sites_succeeded: self.sites_succeeded.load(Ordering::SeqCst),
            sites_already_done: self.sites_already_done.load(Ordering::SeqCst),
            sites_failed: self.sites_failed.load(Ordering::SeqCst),
            sites_unsupported: self.sites_unsupported.load(Ordering::SeqCst),
            skipped_done: self.skipped_done.load(Ordering::SeqCst),
            skipped_backoff: self.skipped_backoff.load(Ordering::SeqCst),
            requests_direct: self.requests_direct.load(Ordering::SeqCst),
            requests_proxy: self.requests_proxy.load(Ordering::SeqCst),
            requests_browser: self.requests_browser.load(Ordering::SeqCst),
            requests_failed: self.requests_failed.load(Ordering::SeqCst),
            challenge_fallbacks: self.challenge_fallbacks.load(Ordering::SeqCst),
            elapsed: self.start_time.elapsed(),
        }
    }

    /// Records the final state of a site that ran.
    pub(crate) fn record_site(&self, state: SignState) {
        self.sites_executed.fetch_add(1, Ordering::SeqCst);
        let counter = match state {
            SignState::Succeeded => &self.sites_succeeded,
            SignState::AlreadyDone => &self.sites_already_done,
            SignState::Unsupported => &self.sites_unsupported,
            _ => &self.sites_failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_skipped_done(&self) {
        self.skipped_done.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_skipped_backoff(&self) {
        self.skipped_backoff.fetch_add(1, Ordering::SeqCst);
    }

    /// Records one request served (or attempted) by `kind`.
    pub(crate) fn record_request(&self, kind: TransportKind, ok: bool) {
        let counter = match kind {
            TransportKind::Direct => &self.requests_direct,
            TransportKind::Proxy => &self.requests_proxy,
            TransportKind::Browser => &self.requests_browser,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        if !ok {
            self.requests_failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn record_fallback(&self) {
        self.challenge_fallbacks.fetch_add(1, Ordering::SeqCst);
    }

    /// Converts the snapshot into a JSON string.
    pub fn to_json_string(&self) -> Result<String, CheckinError> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    /// Converts the snapshot into a pretty-printed JSON string.
    pub fn to_json_string_pretty(&self) -> Result<String, CheckinError> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    /// Exports the current statistics to a Markdown formatted string.
    pub fn to_markdown_string(&self) -> String {
        let snapshot = self.snapshot();

        format!(
            r#"# Check-in Report

- **Duration**: {}
- **Success Rate**: {:.1}%

## Sites
| Metric       | Count |
|--------------|-------|
| Executed     | {}     |
| Succeeded    | {}     |
| Already Done | {}     |
| Failed       | {}     |
| Unsupported  | {}     |
| Skipped (done)    | {} |
| Skipped (backoff) | {} |

## Requests
| Backend    | Count |
|------------|-------|
| Direct     | {}     |
| Proxy      | {}     |
| Browser    | {}     |
| Failed     | {}     |
| Fallbacks  | {}     |
"#,
            snapshot.formatted_duration(),
            snapshot.success_rate(),
            snapshot.sites_executed,
            snapshot.sites_succeeded,
            snapshot.sites_already_done,
            snapshot.sites_failed,
            snapshot.sites_unsupported,
            snapshot.skipped_done,
            snapshot.skipped_backoff,
            snapshot.requests_direct,
            snapshot.requests_proxy,
            snapshot.requests_browser,
            snapshot.requests_failed,
            snapshot.challenge_fallbacks,
        )
    }
}

impl Default for StatCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\nCheck-in Statistics")?;
        writeln!(f, "-------------------")?;
        writeln!(f, "  duration : {}", self.formatted_duration())?;
        writeln!(
            f,
            "  sites    : run: {}, ok: {}, done: {}, fail: {}, unsupported: {}",
            self.sites_executed,
            self.sites_succeeded,
            self.sites_already_done,
            self.sites_failed,
            self.sites_unsupported
        )?;
        writeln!(
            f,
            "  skipped  : done today: {}, backoff: {}",
            self.skipped_done, self.skipped_backoff
        )?;
        writeln!(
            f,
            "  requests : direct: {}, proxy: {}, browser: {}, fail: {}, fallback: {}\n",
            self.requests_direct,
            self.requests_proxy,
            self.requests_browser,
            self.requests_failed,
            self.challenge_fallbacks
        )
    }
}

impl std::fmt::Display for StatCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.snapshot(), f)
    }
}
