//! Plain HTTP backend.
//!
//! Each entry gets its own `reqwest` client and cookie jar, keyed by the
//! entry's session id, so cookies set during a login or sign-in chain carry
//! over to later works of the same site without leaking into other sites.

use super::{RequestOptions, Response, Transport, TransportError, TransportKind};
use crate::entry::{parse_cookie_header, SignInEntry};
use async_trait::async_trait;
use encoding_rs::{Encoding, UTF_8};
use moka::sync::Cache;
use regex::bytes::Regex as BytesRegex;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

#[derive(Clone)]
struct DirectSession {
    client: reqwest::Client,
    jar: Arc<Jar>,
}

pub struct DirectTransport {
    user_agent: String,
    timeout: Duration,
    sessions: Cache<String, DirectSession>,
}

impl DirectTransport {
    pub fn new(user_agent: impl Into<String>, timeout: Duration) -> Self {
        Self {
            user_agent: user_agent.into(),
            timeout,
            sessions: Cache::builder()
                .max_capacity(256)
                .time_to_idle(Duration::from_secs(30 * 60))
                .build(),
        }
    }

    fn session(&self, entry: &SignInEntry) -> Result<DirectSession, TransportError> {
        if let Some(session) = self.sessions.get(&entry.session_id) {
            return Ok(session);
        }

        let jar = Arc::new(Jar::default());
        if let Some(cookie) = entry.cookie.as_deref() {
            let base = Url::parse(&entry.url)
                .map_err(|e| TransportError::Backend(format!("invalid site url {}: {e}", entry.url)))?;
            for (name, value) in parse_cookie_header(cookie) {
                jar.add_cookie_str(&format!("{name}={value}"), &base);
            }
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &entry.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(site = %entry.site_name, "Skipping invalid header '{}'", name),
            }
        }

        let client = reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .default_headers(headers)
            .cookie_provider(jar.clone())
            .timeout(self.timeout)
            .build()
            .map_err(|e| TransportError::Backend(format!("failed to build http client: {e}")))?;

        let session = DirectSession { client, jar };
        self.sessions
            .insert(entry.session_id.clone(), session.clone());
        debug!(site = %entry.site_name, "Created direct session {}", entry.session_id);
        Ok(session)
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    async fn execute(
        &self,
        entry: &SignInEntry,
        method: &Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<Response, TransportError> {
        let session = self.session(entry)?;

        let mut request = session.client.request(method.clone(), url);
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(form) = &options.form {
            request = request.form(form);
        }
        if let Some(json) = &options.json {
            request = request.json(json);
        }
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }

        let http_error = |source| TransportError::Http {
            url: url.to_string(),
            source,
        };
        let response = request.send().await.map_err(http_error)?;

        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let charset = headers
            .get("content-type")
            .and_then(|ct| charset_from_content_type(ct));
        let body = response.bytes().await.map_err(http_error)?;
        let text = decode_body(&body, charset.as_deref());

        let cookies = session
            .jar
            .cookies(&final_url)
            .and_then(|v| v.to_str().ok().map(parse_cookie_header))
            .unwrap_or_default();

        Ok(Response {
            status,
            url: final_url.to_string(),
            headers,
            cookies,
            body,
            text,
            served_by: TransportKind::Direct,
        })
    }

    async fn release(&self, entry: &SignInEntry) {
        self.sessions.invalidate(&entry.session_id);
    }
}

static META_CHARSET: LazyLock<BytesRegex> = LazyLock::new(|| {
    BytesRegex::new(r#"(?i)<meta[^>]+charset\s*=\s*["']?([A-Za-z0-9_\-]+)"#)
        .expect("meta charset pattern is valid")
});

fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|part| {
        let (key, value) = part.trim().split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches(['"', '\'']).to_string())
    })
}

/// Decodes a page body. The header charset wins, then a `<meta>` charset in
/// the first 2 KiB, then UTF-8. A byte-order mark overrides all of them.
pub(crate) fn decode_body(body: &[u8], header_charset: Option<&str>) -> String {
    let sniffed = || {
        let head = &body[..body.len().min(2048)];
        META_CHARSET
            .captures(head)
            .and_then(|c| c.get(1))
            .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
    };
    let label = header_charset.map(str::to_string).or_else(sniffed);
    let encoding = label
        .and_then(|l| Encoding::for_label(l.as_bytes()))
        .unwrap_or(UTF_8);
    let (text, _, _) = encoding.decode(body);
    text.into_owned()
}
