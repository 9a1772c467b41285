//! # Status Store Module
//!
//! Persists daily check-in records and per-site failure counters.
//!
//! ## Overview
//!
//! The store answers the two questions the scheduler asks before running a
//! site (was it already checked in today, and is it inside its failure
//! backoff window) and records the outcome after the site ran. All state sits
//! behind one mutex and every mutation is flushed to disk before the lock is
//! released, so a crash mid-batch loses at most the site that was running.
//!
//! ## Layout
//!
//! ```json
//! {
//!   "records":  { "2024-05-01": { "pttime": { "state": "succeeded", ... } } },
//!   "failures": { "hdsky": { "consecutive_failures": 2, "last_failure": "..." } }
//! }
//! ```
//!
//! Files are written to a temporary sibling and renamed over the target.

use crate::error::CheckinError;
use crate::outcome::{FailureKind, SignState};
use chrono::{DateTime, Local, NaiveDate};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Outcome of one site on one day. Always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub state: SignState,
    pub message: String,
    pub timestamp: DateTime<Local>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Messages and details collected after the check-in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureCounter {
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Local>>,
}

/// Everything the store persists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    #[serde(default)]
    pub records: BTreeMap<String, BTreeMap<String, StatusRecord>>,
    #[serde(default)]
    pub failures: BTreeMap<String, FailureCounter>,
}

pub struct StatusStore {
    path: Option<PathBuf>,
    data: Mutex<StatusSnapshot>,
}

pub(crate) fn date_key(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

impl StatusStore {
    /// A store that never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(StatusSnapshot::default()),
        }
    }

    /// Opens the store at `path`. A missing file starts empty; an unreadable
    /// one is logged and replaced on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CheckinError> {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => StatusSnapshot::default(),
            Ok(text) => match serde_json::from_str(&text) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Status file {:?} is corrupt ({}), starting fresh", path, e);
                    StatusSnapshot::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No status file at {:?}, starting fresh", path);
                StatusSnapshot::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&self, date: NaiveDate, site: &str) -> Option<StatusRecord> {
        self.data
            .lock()
            .records
            .get(&date_key(date))
            .and_then(|day| day.get(site))
            .cloned()
    }

    /// Whether `site` already reached a success state on `date`.
    pub fn is_done(&self, date: NaiveDate, site: &str) -> bool {
        self.record(date, site)
            .is_some_and(|record| record.state.is_success())
    }

    pub fn failure_counter(&self, site: &str) -> FailureCounter {
        self.data
            .lock()
            .failures
            .get(site)
            .cloned()
            .unwrap_or_default()
    }

    /// Reason `site` must wait, when it has failed `threshold` times in a row
    /// and the last failure is younger than `cooldown`. A zero threshold
    /// disables backoff.
    pub fn backoff_reason(
        &self,
        site: &str,
        threshold: u32,
        cooldown: chrono::Duration,
        now: DateTime<Local>,
    ) -> Option<String> {
        if threshold == 0 {
            return None;
        }
        let counter = self.failure_counter(site);
        if counter.consecutive_failures < threshold {
            return None;
        }
        let last = counter.last_failure?;
        let elapsed = now - last;
        (elapsed < cooldown).then(|| {
            let remaining = cooldown - elapsed;
            format!(
                "{} consecutive failures, retry in {}m",
                counter.consecutive_failures,
                remaining.num_minutes().max(1)
            )
        })
    }

    /// Resets the failure counter and writes the day's success record.
    pub fn record_success(
        &self,
        site: &str,
        state: SignState,
        message: &str,
        payload: Option<Value>,
        now: DateTime<Local>,
    ) -> Result<(), CheckinError> {
        let mut data = self.data.lock();
        data.failures.remove(site);
        data.records
            .entry(date_key(now.date_naive()))
            .or_default()
            .insert(
                site.to_string(),
                StatusRecord {
                    state,
                    message: message.to_string(),
                    timestamp: now,
                    failure: None,
                    payload,
                },
            );
        self.persist(&data)
    }

    /// Increments the failure counter and writes the day's failure record.
    /// Returns the new consecutive failure count.
    pub fn record_failure(
        &self,
        site: &str,
        state: SignState,
        message: &str,
        kind: Option<FailureKind>,
        now: DateTime<Local>,
    ) -> Result<u32, CheckinError> {
        let mut data = self.data.lock();
        let counter = data.failures.entry(site.to_string()).or_default();
        counter.consecutive_failures += 1;
        counter.last_failure = Some(now);
        let failures = counter.consecutive_failures;

        data.records
            .entry(date_key(now.date_naive()))
            .or_default()
            .insert(
                site.to_string(),
                StatusRecord {
                    state,
                    message: message.to_string(),
                    timestamp: now,
                    failure: kind,
                    payload: None,
                },
            );
        self.persist(&data)?;
        Ok(failures)
    }

    /// Drops day records older than `keep_days` before `today`. Returns the
    /// number of days removed.
    pub fn prune(&self, keep_days: u32, today: NaiveDate) -> Result<usize, CheckinError> {
        let cutoff = date_key(today - chrono::Duration::days(keep_days as i64));
        let mut data = self.data.lock();
        let before = data.records.len();
        data.records.retain(|day, _| day.as_str() >= cutoff.as_str());
        let removed = before - data.records.len();
        if removed > 0 {
            info!("Pruned {} day(s) of status records", removed);
            self.persist(&data)?;
        }
        Ok(removed)
    }

    pub fn records_on(&self, date: NaiveDate) -> BTreeMap<String, StatusRecord> {
        self.data
            .lock()
            .records
            .get(&date_key(date))
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.data.lock().clone()
    }

    fn persist(&self, data: &StatusSnapshot) -> Result<(), CheckinError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_atomic(path, &serde_json::to_vec_pretty(data)?)
    }
}

/// Writes `bytes` to a temporary sibling of `path`, then renames it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckinError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, bytes).map_err(|e| {
        CheckinError::GeneralError(format!("Failed to write temporary file {:?}: {}", tmp_path, e))
    })?;
    fs::rename(&tmp_path, path).map_err(|e| {
        CheckinError::GeneralError(format!("Failed to rename {:?} to {:?}: {}", tmp_path, path, e))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn success_resets_counter_and_is_done() {
        let store = StatusStore::in_memory();
        store
            .record_failure("hdsky", SignState::Failed, "timeout", Some(FailureKind::Transport), at(8))
            .unwrap();
        assert_eq!(store.failure_counter("hdsky").consecutive_failures, 1);
        assert!(!store.is_done(at(8).date_naive(), "hdsky"));

        store
            .record_success("hdsky", SignState::Succeeded, "签到成功", None, at(9))
            .unwrap();
        assert_eq!(store.failure_counter("hdsky"), FailureCounter::default());
        assert!(store.is_done(at(9).date_naive(), "hdsky"));
    }

    #[test]
    fn backoff_needs_threshold_and_recent_failure() {
        let store = StatusStore::in_memory();
        let cooldown = chrono::Duration::hours(2);
        for hour in 1..=3 {
            store
                .record_failure("btschool", SignState::WrongAnswer, "回答错误", None, at(hour))
                .unwrap();
        }
        assert!(store.backoff_reason("btschool", 4, cooldown, at(4)).is_none());
        let reason = store.backoff_reason("btschool", 3, cooldown, at(4)).unwrap();
        assert!(reason.contains("3 consecutive failures"));
        assert!(store.backoff_reason("btschool", 3, cooldown, at(5)).is_none());
        assert!(store.backoff_reason("btschool", 0, cooldown, at(4)).is_none());
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signin_status.json");
        let store = StatusStore::open(&path).unwrap();
        store
            .record_success("pttime", SignState::AlreadyDone, "今天已签到", Some(serde_json::json!({"messages": 2})), at(10))
            .unwrap();
        store
            .record_failure("hdtime", SignState::Failed, "boom", Some(FailureKind::Rejected), at(10))
            .unwrap();
        assert!(!path.with_extension("tmp").exists());

        let reopened = StatusStore::open(&path).unwrap();
        let record = reopened.record(at(10).date_naive(), "pttime").unwrap();
        assert_eq!(record.state, SignState::AlreadyDone);
        assert_eq!(record.payload, Some(serde_json::json!({"messages": 2})));
        assert_eq!(reopened.failure_counter("hdtime").consecutive_failures, 1);
        assert_eq!(
            reopened.record(at(10).date_naive(), "hdtime").unwrap().failure,
            Some(FailureKind::Rejected)
        );
    }

    #[test]
    fn corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signin_status.json");
        fs::write(&path, "{not json").unwrap();
        let store = StatusStore::open(&path).unwrap();
        assert!(store.snapshot().records.is_empty());
    }

    #[test]
    fn prune_keeps_recent_days() {
        let store = StatusStore::in_memory();
        let today = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
        for day in [1, 2, 9, 10] {
            let ts = Local.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap();
            store
                .record_success("pttime", SignState::Succeeded, "ok", None, ts)
                .unwrap();
        }
        assert_eq!(store.prune(7, today).unwrap(), 2);
        let days: Vec<_> = store.snapshot().records.into_keys().collect();
        assert_eq!(days, vec!["2024-05-09".to_string(), "2024-05-10".to_string()]);
    }
}
