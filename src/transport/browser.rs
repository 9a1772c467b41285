//! Browser-automation backend.
//!
//! One Chromium instance is launched lazily on first use. Each site gets its
//! own page, kept in a [`SessionPool`] so consecutive works of a site reuse the
//! same tab (and whatever anti-bot clearance it earned) while two sites never
//! drive the same tab concurrently.

use super::{is_challenge_page, RequestOptions, Response, Transport, TransportError, TransportKind};
use crate::concurrency::SessionPool;
use crate::config::BrowserSettings;
use crate::entry::{parse_cookie_header, SignInEntry};
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::Page;
use futures_util::StreamExt;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

const NAVIGATION_STATUS: &str = "(() => { const nav = performance.getEntriesByType('navigation')[0]; return nav && nav.responseStatus ? nav.responseStatus : null; })()";

#[derive(Debug, Deserialize)]
struct FetchResult {
    status: u16,
    url: String,
    text: String,
}

pub struct BrowserTransport {
    settings: BrowserSettings,
    browser: Mutex<Option<Arc<Browser>>>,
    pages: SessionPool<Page>,
}

impl BrowserTransport {
    pub fn new(settings: BrowserSettings) -> Self {
        Self {
            settings,
            browser: Mutex::new(None),
            pages: SessionPool::new(),
        }
    }

    async fn browser(&self) -> anyhow::Result<Arc<Browser>> {
        let mut slot = self.browser.lock().await;
        if let Some(browser) = slot.as_ref() {
            return Ok(browser.clone());
        }

        let mut builder = BrowserConfig::builder().args(self.settings.arguments.iter().cloned());
        if !self.settings.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &self.settings.executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(|e| anyhow!(e))?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch browser")?;
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });
        info!("Browser launched");

        let browser = Arc::new(browser);
        *slot = Some(browser.clone());
        Ok(browser)
    }

    async fn open_page(&self, browser: &Browser, entry: &SignInEntry) -> anyhow::Result<Page> {
        let page = browser.new_page("about:blank").await?;
        let user_agent = entry
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("user-agent"))
            .map(|(_, v)| v.as_str())
            .or(self.settings.user_agent.as_deref());
        if let Some(user_agent) = user_agent {
            page.set_user_agent(SetUserAgentOverrideParams::new(user_agent))
                .await?;
        }
        Ok(page)
    }

    async fn drive(
        &self,
        page: &Page,
        entry: &SignInEntry,
        method: &Method,
        url: &str,
        options: &RequestOptions,
        fresh: bool,
    ) -> anyhow::Result<Response> {
        let target = Url::parse(url).with_context(|| format!("invalid url {url}"))?;
        let origin = target.origin().ascii_serialization();

        if fresh {
            let cookies = entry
                .session_cookie
                .as_deref()
                .or(entry.cookie.as_deref())
                .map(parse_cookie_header)
                .unwrap_or_default()
                .into_iter()
                .map(|(name, value)| {
                    CookieParam::builder()
                        .name(name)
                        .value(value)
                        .url(origin.clone())
                        .build()
                        .map_err(|e| anyhow!(e))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            if !cookies.is_empty() {
                page.set_cookies(cookies).await?;
            }
        }

        let (status, final_url, html) = match *method {
            Method::GET => {
                page.goto(url).await?;
                self.wait_for_clearance(page, &entry.success_indicators).await?;
                let final_url = page.url().await?.unwrap_or_else(|| url.to_string());
                let status = page
                    .evaluate(NAVIGATION_STATUS)
                    .await?
                    .into_value::<Option<u16>>()
                    .ok()
                    .flatten();
                let status = status.unwrap_or_else(|| {
                    debug!(site = %entry.site_name, "No navigation status for {}, assuming 200", url);
                    200
                });
                (status, final_url, page.content().await?)
            }
            Method::POST => {
                if page.url().await?.map_or(true, |u| !u.starts_with(&origin)) {
                    page.goto(origin.as_str()).await?;
                    self.wait_for_clearance(page, &entry.success_indicators).await?;
                }
                let params = EvaluateParams::builder()
                    .expression(fetch_script(url, options)?)
                    .await_promise(true)
                    .return_by_value(true)
                    .build()
                    .map_err(|e| anyhow!(e))?;
                let result: FetchResult = page.evaluate(params).await?.into_value()?;
                (result.status, result.url, result.text)
            }
            _ => bail!("browser backend does not support {method}"),
        };

        let cookies = page
            .get_cookies()
            .await?
            .into_iter()
            .map(|c| (c.name, c.value))
            .collect();
        Ok(Response::html(status, final_url, html, TransportKind::Browser).with_cookies(cookies))
    }

    /// Polls the page until it is past the anti-bot gate or the challenge
    /// timeout elapses.
    async fn wait_for_clearance(&self, page: &Page, indicators: &[String]) -> anyhow::Result<()> {
        let deadline = Instant::now() + self.settings.challenge_timeout();
        loop {
            let html = page.content().await?;
            if challenge_cleared(&html, indicators) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!(
                    "challenge not cleared within {}s",
                    self.settings.challenge_timeout_secs
                );
            }
            tokio::time::sleep(self.settings.poll_interval()).await;
        }
    }
}

#[async_trait]
impl Transport for BrowserTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Browser
    }

    async fn execute(
        &self,
        entry: &SignInEntry,
        method: &Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<Response, TransportError> {
        check_options(method, options)?;
        let browser = self
            .browser()
            .await
            .map_err(|e| TransportError::Unavailable(format!("browser unavailable: {e:#}")))?;

        let mut lease = self.pages.checkout(&entry.site_name).await;
        let (page, fresh) = match lease.get() {
            Some(page) => (page.clone(), false),
            None => {
                let page = self
                    .open_page(&browser, entry)
                    .await
                    .map_err(|e| TransportError::Unavailable(format!("failed to open page: {e:#}")))?;
                lease.insert(page.clone());
                (page, true)
            }
        };

        debug!(site = %entry.site_name, "Browser {} {}", method, url);
        let driven = self.drive(&page, entry, method, url, options, fresh);
        let driven = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, driven)
                .await
                .unwrap_or_else(|_| Err(anyhow!("timed out after {}s", limit.as_secs()))),
            None => driven.await,
        };
        match driven {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(site = %entry.site_name, "Browser request failed: {:#}", e);
                if let Some(page) = lease.invalidate() {
                    let _ = page.close().await;
                }
                Err(TransportError::Backend(format!("Network error: url: {url}, error: {e:#}")))
            }
        }
    }

    async fn release(&self, entry: &SignInEntry) {
        let mut lease = self.pages.checkout(&entry.site_name).await;
        if let Some(page) = lease.invalidate() {
            if let Err(e) = page.close().await {
                debug!(site = %entry.site_name, "Failed to close page: {}", e);
            }
        }
    }
}

/// Navigation cannot carry a body or extra request headers.
fn check_options(method: &Method, options: &RequestOptions) -> Result<(), TransportError> {
    if *method == Method::GET
        && (options.form.is_some() || options.json.is_some() || !options.headers.is_empty())
    {
        return Err(TransportError::Backend(
            "browser navigation cannot send a body or request headers".into(),
        ));
    }
    Ok(())
}

/// In-page `fetch` performing a POST with the session's cookies.
fn fetch_script(url: &str, options: &RequestOptions) -> serde_json::Result<String> {
    let mut headers = Map::new();
    let body = match (&options.json, &options.form) {
        (Some(json), _) => {
            headers.insert("Content-Type".into(), Value::from("application/json"));
            json.to_string()
        }
        (None, form) => {
            headers.insert(
                "Content-Type".into(),
                Value::from("application/x-www-form-urlencoded"),
            );
            form.as_ref()
                .map(|form| {
                    url::form_urlencoded::Serializer::new(String::new())
                        .extend_pairs(form)
                        .finish()
                })
                .unwrap_or_default()
        }
    };
    for (name, value) in &options.headers {
        headers.insert(name.clone(), Value::from(value.as_str()));
    }
    Ok(format!(
        "(async () => {{ const r = await fetch({url}, {{ method: 'POST', credentials: 'include', headers: {headers}, body: {body} }}); return {{ status: r.status, url: r.url, text: await r.text() }}; }})()",
        url = serde_json::to_string(url)?,
        headers = Value::Object(headers),
        body = serde_json::to_string(&body)?,
    ))
}

/// Whether `html` shows the real site: any configured success indicator is
/// present, or, without indicators, no challenge marker is.
pub(crate) fn challenge_cleared(html: &str, indicators: &[String]) -> bool {
    if indicators.is_empty() {
        !is_challenge_page(html)
    } else {
        indicators.iter().any(|i| html.contains(i.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indicators_take_precedence_over_markers() {
        let indicators = vec!["欢迎回来".to_string()];
        assert!(!challenge_cleared("<title>Tracker</title>", &indicators));
        assert!(challenge_cleared("<p>欢迎回来, user</p>", &indicators));
    }

    #[test]
    fn post_script_carries_json_body_and_headers() {
        let options = RequestOptions::default()
            .json(serde_json::json!({"action": "sign"}))
            .header("X-Requested-With", "XMLHttpRequest");
        let script = fetch_script("https://pt.example/sign", &options).unwrap();
        assert!(script.contains(r#""Content-Type":"application/json""#));
        assert!(script.contains(r#""X-Requested-With":"XMLHttpRequest""#));
        assert!(script.contains(r#"body: "{\"action\":\"sign\"}""#));

        let form = RequestOptions::default().form([("answer", "3")]);
        let script = fetch_script("https://pt.example/sign", &form).unwrap();
        assert!(script.contains("application/x-www-form-urlencoded"));
        assert!(script.contains(r#"body: "answer=3""#));
    }

    #[test]
    fn navigation_refuses_bodies_and_headers() {
        let headed = RequestOptions::default().header("Referer", "https://pt.example/");
        assert!(check_options(&Method::GET, &headed).is_err());
        assert!(check_options(&Method::POST, &headed).is_ok());
        assert!(check_options(&Method::GET, &RequestOptions::default()).is_ok());
    }

    #[test]
    fn without_indicators_markers_decide() {
        assert!(!challenge_cleared("<title>Just a moment...</title>", &[]));
        assert!(challenge_cleared("<title>Tracker</title>", &[]));
    }
}
