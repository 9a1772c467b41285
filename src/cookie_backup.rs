//! Backup of the last working cookie of every site.
//!
//! After a successful check-in the session cookie is saved together with the
//! date, so an expired configured cookie can be replaced by hand and failure
//! reasons can show when the site last worked.

use crate::error::CheckinError;
use crate::status_store::write_atomic;
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub date: String,
    pub cookie: String,
}

pub struct CookieBackup {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CookieBackup {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> BTreeMap<String, BackupEntry> {
        match fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!("Cookie backup {:?} is corrupt: {}", self.path, e);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        }
    }

    pub fn get(&self, site: &str) -> Option<BackupEntry> {
        let _guard = self.lock.lock();
        self.load().remove(site)
    }

    /// Date of the last backup of `site`, used as the "last worked" marker.
    pub fn last_date(&self, site: &str) -> Option<String> {
        self.get(site).map(|entry| entry.date)
    }

    pub fn save(&self, site: &str, cookie: &str, date: NaiveDate) -> Result<(), CheckinError> {
        let _guard = self.lock.lock();
        let mut backups = self.load();
        backups.insert(
            site.to_string(),
            BackupEntry {
                date: date.format("%Y-%m-%d").to_string(),
                cookie: cookie.to_string(),
            },
        );
        write_atomic(&self.path, &serde_json::to_vec_pretty(&backups)?)?;
        debug!(site = %site, "Cookie backed up");
        Ok(())
    }
}
