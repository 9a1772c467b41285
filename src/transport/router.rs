//! Per-request backend selection.
//!
//! The router is the only component steps talk to for network access. It
//! chooses a backend, executes the request, captures the session cookies and
//! turns every transport fault into a failure mark on the entry plus a
//! missing response. Nothing escapes it as an error.

use super::{
    is_challenge_page, DirectTransport, FlareSolverrTransport, RequestOptions, Response, Transport,
    TransportError, TransportKind, TransportPolicy,
};
use crate::config::CheckinConfig;
use crate::entry::{format_cookie_header, SignInEntry};
use crate::error::CheckinError;
use crate::stats::StatCollector;
use reqwest::Method;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Router {
    policy: TransportPolicy,
    browser_sites: HashSet<String>,
    proxy_sites: HashSet<String>,
    direct: Arc<dyn Transport>,
    proxy: Option<Arc<dyn Transport>>,
    browser: Option<Arc<dyn Transport>>,
    stats: Arc<StatCollector>,
}

impl Router {
    pub fn new(direct: Arc<dyn Transport>) -> Self {
        Self {
            policy: TransportPolicy::default(),
            browser_sites: HashSet::new(),
            proxy_sites: HashSet::new(),
            direct,
            proxy: None,
            browser: None,
            stats: Arc::new(StatCollector::new()),
        }
    }

    /// Builds the router and every backend the configuration enables.
    pub fn from_config(config: &CheckinConfig, stats: Arc<StatCollector>) -> Result<Self, CheckinError> {
        let direct = DirectTransport::new(config.user_agent.clone(), config.request_timeout());
        let mut router = Router::new(Arc::new(direct))
            .with_policy(config.transport)
            .with_browser_sites(config.browser_sites.iter().cloned())
            .with_proxy_sites(config.proxy_sites.iter().cloned())
            .with_stats(stats);

        if let Some(solver) = &config.flaresolverr {
            let proxy = FlareSolverrTransport::new(&solver.server_url, solver.timeout())
                .map_err(|e| CheckinError::BackendUnavailable(e.to_string()))?;
            info!("Challenge proxy enabled at {}", proxy.endpoint());
            router = router.with_proxy(Arc::new(proxy));
        }

        #[cfg(feature = "browser")]
        if config.browser.enabled {
            let browser = super::BrowserTransport::new(config.browser.clone());
            router = router.with_browser(Arc::new(browser));
        }

        Ok(router)
    }

    pub fn with_policy(mut self, policy: TransportPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_proxy(mut self, proxy: Arc<dyn Transport>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_browser(mut self, browser: Arc<dyn Transport>) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn with_browser_sites<I: IntoIterator<Item = String>>(mut self, sites: I) -> Self {
        self.browser_sites.extend(sites);
        self
    }

    pub fn with_proxy_sites<I: IntoIterator<Item = String>>(mut self, sites: I) -> Self {
        self.proxy_sites.extend(sites);
        self
    }

    pub fn with_stats(mut self, stats: Arc<StatCollector>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &Arc<StatCollector> {
        &self.stats
    }

    fn backend(&self, kind: TransportKind) -> Option<&Arc<dyn Transport>> {
        match kind {
            TransportKind::Direct => Some(&self.direct),
            TransportKind::Proxy => self.proxy.as_ref(),
            TransportKind::Browser => self.browser.as_ref(),
        }
    }

    /// Backend that will serve the next request of `entry`.
    pub fn select(&self, entry: &SignInEntry, options: &RequestOptions) -> TransportKind {
        if options.force_direct {
            return TransportKind::Direct;
        }
        if let Some(kind) = entry.transport {
            return kind;
        }
        match self.policy {
            TransportPolicy::Direct => TransportKind::Direct,
            TransportPolicy::Proxy => TransportKind::Proxy,
            TransportPolicy::Browser => TransportKind::Browser,
            TransportPolicy::Auto => {
                if self.browser.is_some() && self.browser_sites.contains(&entry.site_name) {
                    TransportKind::Browser
                } else if self.proxy.is_some() && self.proxy_sites.contains(&entry.site_name) {
                    TransportKind::Proxy
                } else {
                    TransportKind::Direct
                }
            }
        }
    }

    /// Backend to retry on when the direct client hits an anti-bot page.
    fn fallback(&self) -> Option<TransportKind> {
        if self.browser.is_some() {
            Some(TransportKind::Browser)
        } else if self.proxy.is_some() {
            Some(TransportKind::Proxy)
        } else {
            None
        }
    }

    async fn dispatch(
        &self,
        kind: TransportKind,
        entry: &SignInEntry,
        method: &Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<Response, TransportError> {
        let backend = self
            .backend(kind)
            .ok_or_else(|| TransportError::Unavailable(format!("{kind} backend is not configured")))?;
        debug!(site = %entry.site_name, "{} {} via {}", method, url, kind);
        let response = backend.execute(entry, method, url, options).await;
        self.stats.record_request(kind, response.is_ok());
        response
    }

    /// Executes one request for `entry`. On any failure the entry is marked
    /// with a reason and kind, and `None` is returned.
    pub async fn send(
        &self,
        entry: &mut SignInEntry,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Option<Response> {
        let mut kind = self.select(entry, &options);
        let mut result = self.dispatch(kind, entry, &method, url, &options).await;

        let auto_routed = self.policy == TransportPolicy::Auto
            && entry.transport.is_none()
            && !options.force_direct;
        let challenged = matches!(&result, Ok(response) if is_challenge_page(&response.text));
        if kind == TransportKind::Direct && auto_routed && challenged {
            if let Some(fallback) = self.fallback() {
                info!(site = %entry.site_name, "Challenge page at {}, retrying via {}", url, fallback);
                self.stats.record_fallback();
                kind = fallback;
                result = self.dispatch(kind, entry, &method, url, &options).await;
            }
        }

        let checked = result.and_then(|response| {
            if kind == TransportKind::Direct && !options.force_direct && is_challenge_page(&response.text) {
                return Err(TransportError::Challenge(url.to_string()));
            }
            if !options.any_status && response.status != 200 {
                return Err(TransportError::Status {
                    url: url.to_string(),
                    status: response.status,
                });
            }
            Ok(response)
        });

        match checked {
            Ok(response) => {
                if !response.cookies.is_empty() {
                    entry.session_cookie = Some(format_cookie_header(
                        response.cookies.iter().map(|(n, v)| (n.as_str(), v.as_str())),
                    ));
                }
                Some(response)
            }
            Err(e) => {
                warn!(site = %entry.site_name, "Request via {} failed: {}", kind, e);
                entry.fail_with_kind(e.kind(), e.to_string());
                None
            }
        }
    }

    /// Drops the session state every backend holds for `entry`.
    pub async fn release(&self, entry: &SignInEntry) {
        self.direct.release(entry).await;
        if let Some(proxy) = &self.proxy {
            proxy.release(entry).await;
        }
        if let Some(browser) = &self.browser {
            browser.release(entry).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::FailureKind;
    use std::time::Duration;

    fn direct() -> Arc<dyn Transport> {
        Arc::new(DirectTransport::new("test-agent", Duration::from_secs(5)))
    }

    fn unreachable_proxy() -> Arc<dyn Transport> {
        Arc::new(FlareSolverrTransport::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap())
    }

    #[test]
    fn selection_honours_force_direct_and_site_override() {
        let router = Router::new(direct())
            .with_proxy(unreachable_proxy())
            .with_policy(TransportPolicy::Proxy);
        let entry = SignInEntry::new("demo", "https://demo.example/");

        assert_eq!(router.select(&entry, &RequestOptions::default()), TransportKind::Proxy);
        assert_eq!(router.select(&entry, &RequestOptions::binary()), TransportKind::Direct);

        let pinned = entry.with_transport(TransportKind::Direct);
        assert_eq!(router.select(&pinned, &RequestOptions::default()), TransportKind::Direct);
    }

    #[test]
    fn auto_policy_uses_allowlists() {
        let router = Router::new(direct())
            .with_proxy(unreachable_proxy())
            .with_proxy_sites(["hdtime".to_string()]);
        let listed = SignInEntry::new("hdtime", "https://hdtime.example/");
        let other = SignInEntry::new("other", "https://other.example/");
        assert_eq!(router.select(&listed, &RequestOptions::default()), TransportKind::Proxy);
        assert_eq!(router.select(&other, &RequestOptions::default()), TransportKind::Direct);
    }

    #[tokio::test]
    async fn forced_direct_succeeds_while_proxy_is_down() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/captcha.png")
            .with_status(200)
            .with_body(vec![0x89, b'P', b'N', b'G'])
            .create_async()
            .await;

        let router = Router::new(direct())
            .with_proxy(unreachable_proxy())
            .with_policy(TransportPolicy::Proxy);
        let mut entry = SignInEntry::new("demo", server.url());
        let url = format!("{}/captcha.png", server.url());

        let image = router
            .send(&mut entry, Method::GET, &url, RequestOptions::binary())
            .await
            .expect("direct request succeeds");
        assert_eq!(&image.body[..], &[0x89, b'P', b'N', b'G']);
        assert!(!entry.is_failed());

        let page = router
            .send(&mut entry, Method::GET, &url, RequestOptions::default())
            .await;
        assert!(page.is_none());
        assert!(entry.is_failed());
        assert_eq!(entry.failure_kind(), Some(FailureKind::BackendUnavailable));
    }

    #[tokio::test]
    async fn non_200_marks_entry_failed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/attendance.php")
            .with_status(502)
            .create_async()
            .await;
        let router = Router::new(direct()).with_policy(TransportPolicy::Direct);
        let mut entry = SignInEntry::new("demo", server.url());
        let url = format!("{}/attendance.php", server.url());

        let response = router
            .send(&mut entry, Method::GET, &url, RequestOptions::default())
            .await;
        assert!(response.is_none());
        assert!(entry.reason().contains("response.status_code=502"));
        assert_eq!(entry.failure_kind(), Some(FailureKind::Transport));
        assert_eq!(router.stats().snapshot().requests_direct, 1);
    }

    #[tokio::test]
    async fn missing_backend_is_reported_unavailable() {
        let router = Router::new(direct()).with_policy(TransportPolicy::Browser);
        let mut entry = SignInEntry::new("demo", "https://demo.example/");
        let response = router
            .send(&mut entry, Method::GET, "https://demo.example/", RequestOptions::default())
            .await;
        assert!(response.is_none());
        assert_eq!(entry.failure_kind(), Some(FailureKind::BackendUnavailable));
    }

    #[tokio::test]
    async fn captures_session_cookie() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/")
            .with_status(200)
            .with_header("set-cookie", "c_secure_login=bm9wZQ; Path=/")
            .with_body("ok")
            .create_async()
            .await;
        let router = Router::new(direct()).with_policy(TransportPolicy::Direct);
        let mut entry = SignInEntry::new("demo", server.url());
        let url = format!("{}/", server.url());
        router
            .send(&mut entry, Method::GET, &url, RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(entry.session_cookie.as_deref(), Some("c_secure_login=bm9wZQ"));
    }

    const CHALLENGE: &str = "<html><title>Just a moment...</title></html>";

    #[tokio::test]
    async fn challenged_direct_request_is_retried_through_the_proxy() {
        let mut site = mockito::Server::new_async().await;
        site.mock("GET", "/attendance.php")
            .with_status(403)
            .with_body(CHALLENGE)
            .create_async()
            .await;
        let url = format!("{}/attendance.php", site.url());

        let mut solver = mockito::Server::new_async().await;
        let solved = solver
            .mock("POST", "/v1")
            .match_body(mockito::Matcher::PartialJson(
                serde_json::json!({"cmd": "request.get", "url": url}),
            ))
            .with_body(
                serde_json::json!({
                    "status": "ok",
                    "solution": {
                        "url": url,
                        "status": 200,
                        "response": "<p>签到成功</p>",
                        "cookies": [{"name": "cf_clearance", "value": "ok"}]
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;
        let proxy = FlareSolverrTransport::new(&solver.url(), Duration::from_secs(5)).unwrap();

        let router = Router::new(direct()).with_proxy(Arc::new(proxy));
        let mut entry = SignInEntry::new("demo", site.url());
        let response = router
            .send(&mut entry, Method::GET, &url, RequestOptions::default())
            .await
            .expect("proxy serves the page");

        solved.assert_async().await;
        assert_eq!(response.served_by, TransportKind::Proxy);
        assert!(response.text.contains("签到成功"));
        assert!(!entry.is_failed());
        assert_eq!(entry.session_cookie.as_deref(), Some("cf_clearance=ok"));

        let stats = router.stats().snapshot();
        assert_eq!(stats.requests_direct, 1);
        assert_eq!(stats.requests_proxy, 1);
        assert_eq!(stats.challenge_fallbacks, 1);
    }

    #[tokio::test]
    async fn challenge_without_fallback_is_a_site_outage() {
        let mut site = mockito::Server::new_async().await;
        site.mock("GET", "/attendance.php")
            .with_status(200)
            .with_body(CHALLENGE)
            .create_async()
            .await;
        let url = format!("{}/attendance.php", site.url());

        let router = Router::new(direct());
        let mut entry = SignInEntry::new("demo", site.url());
        let response = router
            .send(&mut entry, Method::GET, &url, RequestOptions::default())
            .await;

        assert!(response.is_none());
        assert_eq!(entry.failure_kind(), Some(FailureKind::SiteOutage));
        assert!(entry.reason().contains("detected CloudFlare DDoS-GUARD"));
        assert_eq!(router.stats().snapshot().challenge_fallbacks, 0);
    }
}
