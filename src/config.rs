//! Configuration for a check-in run.
//!
//! The configuration is a YAML document. Every field has a default, so an
//! empty document is valid. Sites are configured either with a bare cookie
//! string or with a table:
//!
//! ```yaml
//! max_workers: 4
//! schedule_time: "08:30"
//! transport: auto
//! browser_sites: [hdsky]
//! flaresolverr: http://localhost:8191
//! sites:
//!   pttime: "uid=1; c_secure_pass=abc"
//!   hdsky:
//!     cookie: "uid=2"
//!     transport: browser
//!     login:
//!       username: me
//!       password: secret
//! ```

use crate::error::CheckinError;
use crate::transport::{TransportKind, TransportPolicy};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/139.0.0.0 Safari/537.36";

pub const DEFAULT_SCHEDULE_TIME: &str = "09:00";

pub const STATUS_FILE: &str = "signin_status.json";
pub const COOKIE_BACKUP_FILE: &str = "cookies_backup.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckinConfig {
    /// Number of sites running concurrently.
    pub max_workers: usize,
    /// Consecutive failures after which a site is held back.
    pub max_failed_attempts: u32,
    /// How long a held-back site waits before it is tried again.
    pub failed_retry_interval_hours: u64,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub get_messages: bool,
    pub get_details: bool,
    pub cookie_backup: bool,
    /// Days of status records kept after a batch.
    pub status_retention_days: u32,
    /// Local wall-clock time (`HH:MM`) of the daily batch.
    pub schedule_time: String,
    pub transport: TransportPolicy,
    pub browser_sites: Vec<String>,
    pub proxy_sites: Vec<String>,
    pub flaresolverr: Option<FlareSolverrSettings>,
    pub browser: BrowserSettings,
    /// Directory holding the status store and the cookie backup. `None`
    /// keeps all state in memory.
    pub data_dir: Option<PathBuf>,
    pub sites: BTreeMap<String, SiteSettings>,
}

impl Default for CheckinConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            max_failed_attempts: 3,
            failed_retry_interval_hours: 2,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout_secs: 60,
            get_messages: true,
            get_details: true,
            cookie_backup: true,
            status_retention_days: 7,
            schedule_time: DEFAULT_SCHEDULE_TIME.to_string(),
            transport: TransportPolicy::Auto,
            browser_sites: Vec::new(),
            proxy_sites: Vec::new(),
            flaresolverr: None,
            browser: BrowserSettings::default(),
            data_dir: None,
            sites: BTreeMap::new(),
        }
    }
}

impl CheckinConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, CheckinError> {
        let config: CheckinConfig = if yaml.trim().is_empty() {
            CheckinConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads a YAML file. Without an explicit `data_dir`, state files live
    /// next to the configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CheckinError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            CheckinError::ConfigurationError(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_yaml_str(&yaml)?;
        if config.data_dir.is_none() {
            config.data_dir = Some(
                path.parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from(".")),
            );
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CheckinError> {
        if self.max_workers == 0 {
            return Err(CheckinError::ConfigurationError(
                "max_workers must be greater than 0".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(CheckinError::ConfigurationError(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }
        self.daily_at()?;
        if let Some(solver) = &self.flaresolverr {
            if solver.server_url.trim().is_empty() {
                return Err(CheckinError::ConfigurationError(
                    "flaresolverr.server_url must not be empty".into(),
                ));
            }
        }
        if self.transport == TransportPolicy::Proxy && self.flaresolverr.is_none() {
            return Err(CheckinError::ConfigurationError(
                "transport 'proxy' requires a flaresolverr server".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Parsed `schedule_time`.
    pub fn daily_at(&self) -> Result<NaiveTime, CheckinError> {
        NaiveTime::parse_from_str(self.schedule_time.trim(), "%H:%M").map_err(|e| {
            CheckinError::ConfigurationError(format!(
                "schedule_time '{}' is not HH:MM: {e}",
                self.schedule_time
            ))
        })
    }

    pub fn failed_retry_interval(&self) -> chrono::Duration {
        chrono::Duration::hours(self.failed_retry_interval_hours as i64)
    }

    pub fn status_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(STATUS_FILE))
    }

    pub fn cookie_backup_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(COOKIE_BACKUP_FILE))
    }

    pub fn site(&self, name: &str) -> Option<&SiteSettings> {
        self.sites.get(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "FlareSolverrRepr")]
pub struct FlareSolverrSettings {
    pub server_url: String,
    pub timeout_secs: u64,
}

impl FlareSolverrSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlareSolverrRepr {
    Url(String),
    Table {
        server_url: String,
        #[serde(default = "default_solver_timeout")]
        timeout_secs: u64,
    },
}

fn default_solver_timeout() -> u64 {
    60
}

impl From<FlareSolverrRepr> for FlareSolverrSettings {
    fn from(repr: FlareSolverrRepr) -> Self {
        match repr {
            FlareSolverrRepr::Url(server_url) => Self {
                server_url,
                timeout_secs: default_solver_timeout(),
            },
            FlareSolverrRepr::Table {
                server_url,
                timeout_secs,
            } => Self {
                server_url,
                timeout_secs,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub enabled: bool,
    pub headless: bool,
    pub executable: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub arguments: Vec<String>,
    pub challenge_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            headless: true,
            executable: None,
            user_agent: None,
            arguments: Vec::new(),
            challenge_timeout_secs: 30,
            poll_interval_ms: 1000,
        }
    }
}

impl BrowserSettings {
    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.challenge_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(50))
    }
}

/// Per-site settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "SiteSettingsRepr")]
pub struct SiteSettings {
    pub cookie: Option<String>,
    pub headers: HashMap<String, String>,
    pub transport: Option<TransportKind>,
    /// Credentials used by the login workflow.
    pub login: HashMap<String, Value>,
    /// Any other key, passed to the site untouched.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SiteSettingsRepr {
    Cookie(String),
    Table {
        #[serde(default)]
        cookie: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        transport: Option<TransportKind>,
        #[serde(default)]
        login: HashMap<String, Value>,
        #[serde(flatten)]
        extra: HashMap<String, Value>,
    },
}

impl From<SiteSettingsRepr> for SiteSettings {
    fn from(repr: SiteSettingsRepr) -> Self {
        match repr {
            SiteSettingsRepr::Cookie(cookie) => SiteSettings {
                cookie: Some(cookie),
                ..SiteSettings::default()
            },
            SiteSettingsRepr::Table {
                cookie,
                headers,
                transport,
                login,
                extra,
            } => SiteSettings {
                cookie,
                headers,
                transport,
                login,
                extra,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = CheckinConfig::from_yaml_str("").unwrap();
        assert_eq!(config.max_workers, 1);
        assert_eq!(config.max_failed_attempts, 3);
        assert_eq!(config.failed_retry_interval(), chrono::Duration::hours(2));
        assert!(config.get_messages && config.get_details && config.cookie_backup);
        assert_eq!(config.transport, TransportPolicy::Auto);
        assert_eq!(config.status_retention_days, 7);
        assert_eq!(config.browser.challenge_timeout(), Duration::from_secs(30));
        assert_eq!(config.daily_at().unwrap(), NaiveTime::from_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn schedule_time_must_be_hours_and_minutes() {
        let config = CheckinConfig::from_yaml_str("schedule_time: '07:15'").unwrap();
        assert_eq!(config.daily_at().unwrap(), NaiveTime::from_hms_opt(7, 15, 0).unwrap());
        assert!(CheckinConfig::from_yaml_str("schedule_time: '25:00'").is_err());
        assert!(CheckinConfig::from_yaml_str("schedule_time: soon").is_err());
    }

    #[test]
    fn sites_accept_bare_cookie_or_table() {
        let yaml = r#"
max_workers: 2
flaresolverr: http://localhost:8191
sites:
  pttime: "uid=1; pass=x"
  hdsky:
    cookie: "uid=2"
    transport: browser
    headers:
      Referer: https://hdsky.me/
    login:
      username: me
    answer_id: 7
"#;
        let config = CheckinConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.max_workers, 2);
        assert_eq!(
            config.flaresolverr.as_ref().map(|s| s.server_url.as_str()),
            Some("http://localhost:8191")
        );

        let pttime = config.site("pttime").unwrap();
        assert_eq!(pttime.cookie.as_deref(), Some("uid=1; pass=x"));
        assert!(pttime.transport.is_none());

        let hdsky = config.site("hdsky").unwrap();
        assert_eq!(hdsky.transport, Some(TransportKind::Browser));
        assert_eq!(hdsky.headers.get("Referer").map(String::as_str), Some("https://hdsky.me/"));
        assert_eq!(hdsky.login.get("username").and_then(Value::as_str), Some("me"));
        assert_eq!(hdsky.extra.get("answer_id").and_then(Value::as_u64), Some(7));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = CheckinConfig::from_yaml_str("max_workers: 0").unwrap_err();
        assert!(matches!(err, CheckinError::ConfigurationError(_)));
    }

    #[test]
    fn proxy_policy_needs_a_server() {
        assert!(CheckinConfig::from_yaml_str("transport: proxy").is_err());
    }

    #[test]
    fn from_file_defaults_data_dir_to_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "max_workers: 3\n").unwrap();
        let config = CheckinConfig::from_file(&path).unwrap();
        assert_eq!(config.status_path(), Some(dir.path().join(STATUS_FILE)));
    }
}
