//! Request transports and the router choosing between them.
//!
//! Three interchangeable backends execute a request: a direct HTTP client with
//! a per-entry cookie jar, a remote challenge-solving proxy (FlareSolverr v1
//! API) and, behind the `browser` feature, a managed browser session. All of
//! them produce the same [`Response`]; the [`Router`] picks one per request
//! and converts every fault into a failure mark on the entry.

pub mod direct;
pub mod flaresolverr;
pub mod router;

#[cfg(feature = "browser")]
pub mod browser;

pub use direct::DirectTransport;
pub use flaresolverr::FlareSolverrTransport;
pub use router::Router;

#[cfg(feature = "browser")]
pub use browser::BrowserTransport;

use crate::entry::SignInEntry;
use crate::outcome::FailureKind;
use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

/// Concrete backend that served a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Direct,
    Proxy,
    Browser,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Direct => "direct",
            TransportKind::Proxy => "proxy",
            TransportKind::Browser => "browser",
        })
    }
}

/// Global routing policy. `Auto` consults the per-site allowlists and falls
/// back from a challenge page served to the direct client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPolicy {
    Direct,
    Proxy,
    Browser,
    #[default]
    Auto,
}

/// Uniform response shape returned by every backend.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    /// Final url after redirects.
    pub url: String,
    pub headers: HashMap<String, String>,
    /// Cookies the backend holds for the site after the request.
    pub cookies: Vec<(String, String)>,
    pub body: Bytes,
    /// Body decoded with the detected charset.
    pub text: String,
    pub served_by: TransportKind,
}

impl Response {
    /// Builds a response from already-decoded page text.
    pub fn html(
        status: u16,
        url: impl Into<String>,
        text: impl Into<String>,
        served_by: TransportKind,
    ) -> Self {
        let text = text.into();
        Self {
            status,
            url: url.into(),
            headers: HashMap::new(),
            cookies: Vec::new(),
            body: Bytes::from(text.clone().into_bytes()),
            text,
            served_by,
        }
    }

    pub fn with_cookies(mut self, cookies: Vec<(String, String)>) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Per-request knobs a step can pass to the router.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Always use the direct client, e.g. for captcha images.
    pub force_direct: bool,
    pub form: Option<Vec<(String, String)>>,
    pub json: Option<serde_json::Value>,
    pub headers: HashMap<String, String>,
    pub timeout: Option<Duration>,
    /// Accept any status code instead of failing on non-200.
    pub any_status: bool,
}

impl RequestOptions {
    /// Options for binary downloads that must not go through a proxy or browser.
    pub fn binary() -> Self {
        Self {
            force_direct: true,
            ..Self::default()
        }
    }

    pub fn form<K, V, I>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.form = Some(fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.json = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn any_status(mut self) -> Self {
        self.any_status = true;
        self
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Network error: url: {url}, error: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("url: {url} response.status_code={status}")]
    Status { url: String, status: u16 },

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Backend(String),

    #[error("url: {0} detected CloudFlare DDoS-GUARD")]
    Challenge(String),
}

impl TransportError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::Unavailable(_) => FailureKind::BackendUnavailable,
            TransportError::Challenge(_) => FailureKind::SiteOutage,
            _ => FailureKind::Transport,
        }
    }
}

/// A request backend.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn execute(
        &self,
        entry: &SignInEntry,
        method: &Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<Response, TransportError>;

    /// Drops any session state held for `entry`.
    async fn release(&self, _entry: &SignInEntry) {}
}

static CHALLENGE_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<title>Just a moment\.\.\.</title>|cf-browser-verification|/cdn-cgi/challenge-platform/|Checking your browser before accessing|security by.*Cloudflare</a>",
    )
    .expect("challenge marker pattern is valid")
});

/// Whether `html` is an anti-bot interstitial rather than the site page.
pub fn is_challenge_page(html: &str) -> bool {
    CHALLENGE_MARKERS.is_match(html)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_interstitials() {
        assert!(is_challenge_page(
            "<html><head><title>Just a moment...</title></head></html>"
        ));
        assert!(is_challenge_page(
            "<div>Performance &amp; security by <a href=\"x\">Cloudflare</a></div>"
        ));
        assert!(!is_challenge_page("<html><title>Tracker</title>欢迎回来</html>"));
    }

    #[test]
    fn policy_and_kind_parse_lowercase() {
        let policy: TransportPolicy = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(policy, TransportPolicy::Auto);
        let kind: TransportKind = serde_json::from_str("\"browser\"").unwrap();
        assert_eq!(kind, TransportKind::Browser);
        assert_eq!(TransportPolicy::default(), TransportPolicy::Auto);
    }

    #[test]
    fn transport_errors_map_to_failure_kinds() {
        assert_eq!(
            TransportError::Unavailable("down".into()).kind(),
            FailureKind::BackendUnavailable
        );
        assert_eq!(
            TransportError::Status {
                url: "u".into(),
                status: 502
            }
            .kind(),
            FailureKind::Transport
        );
    }
}
