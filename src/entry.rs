//! The per-site, per-run record threaded through every work of a site.
//!
//! A `SignInEntry` is created by the scheduler for one site, handed to exactly
//! one worker, mutated by step functions and the router while the site runs,
//! and dropped once its outcome has been committed. Failures are signalled by
//! marking the entry (see [`SignInEntry::fail_with_prefix`]) and returning no
//! response, never by panicking.

use crate::outcome::FailureKind;
use crate::transport::TransportKind;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Which workflow of a site is currently running. Used as failure prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Login,
    SignIn,
    Messages,
    Details,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Login => "Login",
            Phase::SignIn => "Sign_in",
            Phase::Messages => "Messages",
            Phase::Details => "Details",
        };
        f.write_str(name)
    }
}

/// Snapshot of an entry's failure marker, used to run optional phases
/// without letting their failures leak into the sign-in outcome.
#[derive(Debug, Clone, Default)]
pub struct FailureMark {
    failed: bool,
    reason: String,
    kind: Option<FailureKind>,
}

#[derive(Debug, Clone)]
pub struct SignInEntry {
    pub site_name: String,
    /// Base url every relative work url is resolved against.
    pub url: String,
    pub cookie: Option<String>,
    pub headers: HashMap<String, String>,
    /// Transport chosen for this site, overriding the global policy.
    pub transport: Option<TransportKind>,
    /// Fragments that prove a browser page got past an anti-bot gate.
    pub success_indicators: Vec<String>,
    /// Free-form site settings (login credentials, answers, ids).
    pub site_config: HashMap<String, Value>,
    /// Unique per run; keys the transport sessions of this entry.
    pub session_id: String,
    /// Cookies held by the transport after the last request.
    pub session_cookie: Option<String>,
    /// Date of the last successful sign-in, from the cookie backup.
    pub last_date: Option<String>,
    pub result: String,
    pub messages: Option<Value>,
    pub details: Option<Value>,
    phase: Option<Phase>,
    failed: bool,
    reason: String,
    failure_kind: Option<FailureKind>,
}

impl SignInEntry {
    pub fn new(site_name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            site_name: site_name.into(),
            url: url.into(),
            cookie: None,
            headers: HashMap::new(),
            transport: None,
            success_indicators: Vec::new(),
            site_config: HashMap::new(),
            session_id: uuid::Uuid::new_v4().to_string(),
            session_cookie: None,
            last_date: None,
            result: String::new(),
            messages: None,
            details: None,
            phase: None,
            failed: false,
            reason: String::new(),
            failure_kind: None,
        }
    }

    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        let cookie = cookie.into();
        self.cookie = (!cookie.trim().is_empty()).then_some(cookie);
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn has_cookie(&self) -> bool {
        self.cookie.as_deref().is_some_and(|c| !c.trim().is_empty())
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = Some(phase);
    }

    pub fn phase(&self) -> Option<Phase> {
        self.phase
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.site_config.get(key).and_then(Value::as_str)
    }

    /// Marks the entry failed with a verbatim reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.failed = true;
        self.reason = reason.into();
    }

    /// Marks the entry failed, prefixing the running phase and suffixing the
    /// date of the last good sign-in: `Sign_in=> reason. (2024-01-01)`.
    pub fn fail_with_prefix(&mut self, reason: impl AsRef<str>) {
        let last_date = self.last_date.as_deref().unwrap_or_default();
        let full = match self.phase {
            Some(phase) => format!("{}=> {}. ({})", phase, reason.as_ref(), last_date),
            None => format!("{}. ({})", reason.as_ref(), last_date),
        };
        self.fail(full);
    }

    /// Same as [`fail_with_prefix`](Self::fail_with_prefix), also recording the kind.
    pub fn fail_with_kind(&mut self, kind: FailureKind, reason: impl AsRef<str>) {
        self.fail_with_prefix(reason);
        self.failure_kind = Some(kind);
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure_kind
    }

    pub fn failure_mark(&self) -> FailureMark {
        FailureMark {
            failed: self.failed,
            reason: self.reason.clone(),
            kind: self.failure_kind,
        }
    }

    pub fn restore_failure_mark(&mut self, mark: FailureMark) {
        self.failed = mark.failed;
        self.reason = mark.reason;
        self.failure_kind = mark.kind;
    }
}

/// Splits a `Cookie` header value (`a=1; b=2`) into name/value pairs.
pub fn parse_cookie_header(cookie: &str) -> Vec<(String, String)> {
    cookie
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Joins name/value pairs into a `Cookie` header value.
pub fn format_cookie_header<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_with_prefix_carries_phase_and_last_date() {
        let mut entry = SignInEntry::new("demo", "https://demo.example/");
        entry.last_date = Some("2024-05-01".into());
        entry.set_phase(Phase::SignIn);
        entry.fail_with_kind(FailureKind::Transport, "Network error: timeout");

        assert!(entry.is_failed());
        assert_eq!(entry.reason(), "Sign_in=> Network error: timeout. (2024-05-01)");
        assert_eq!(entry.failure_kind(), Some(FailureKind::Transport));
    }

    #[test]
    fn failure_mark_round_trips() {
        let mut entry = SignInEntry::new("demo", "https://demo.example/");
        let clean = entry.failure_mark();
        entry.fail("boom");
        entry.restore_failure_mark(clean);
        assert!(!entry.is_failed());
        assert!(entry.reason().is_empty());
    }

    #[test]
    fn cookie_header_parsing_skips_garbage() {
        let pairs = parse_cookie_header("uid=1; pass=abc==; ; junk");
        assert_eq!(
            pairs,
            vec![
                ("uid".to_string(), "1".to_string()),
                ("pass".to_string(), "abc==".to_string())
            ]
        );
        assert_eq!(format_cookie_header([("a", "1"), ("b", "2")]), "a=1; b=2");
    }

    #[test]
    fn blank_cookie_counts_as_missing() {
        let entry = SignInEntry::new("demo", "https://demo.example/").with_cookie("  ");
        assert!(!entry.has_cookie());
    }
}
