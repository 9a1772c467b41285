//! Step specifications of a work chain.
//!
//! A [`Work`] couples one request step with the rules that classify its
//! response. Sites build ordered lists of works; the executor runs them. The
//! step itself is an opaque [`Step`] object so that site-specific request logic
//! (captcha forms, redirects, token scraping) never leaks into the engine.

use crate::capabilities::CaptchaSolver;
use crate::config::CheckinConfig;
use crate::entry::SignInEntry;
use crate::outcome::{FailureKind, SignState};
use crate::transport::{RequestOptions, Response, Router};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Method;
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use url::Url;

/// A pattern whose match proves the step reached a good state.
///
/// Matchers are tried in declared order and the first one that matches wins.
/// Which outcome a match signals is decided by whoever authors the matcher.
#[derive(Debug, Clone)]
pub enum SuccessMatcher {
    /// The whole match becomes the message.
    Plain { regex: Regex, signals: SignState },
    /// One capture group becomes the message.
    Capturing {
        regex: Regex,
        group: usize,
        signals: SignState,
    },
}

impl SuccessMatcher {
    pub fn plain(pattern: &str) -> Result<Self, regex::Error> {
        Ok(SuccessMatcher::Plain {
            regex: Regex::new(pattern)?,
            signals: SignState::Succeeded,
        })
    }

    pub fn capturing(pattern: &str, group: usize) -> Result<Self, regex::Error> {
        Ok(SuccessMatcher::Capturing {
            regex: Regex::new(pattern)?,
            group,
            signals: SignState::Succeeded,
        })
    }

    /// Makes a match mean "already checked in today".
    pub fn already_done(self) -> Self {
        self.signalling(SignState::AlreadyDone)
    }

    pub fn signalling(mut self, state: SignState) -> Self {
        match &mut self {
            SuccessMatcher::Plain { signals, .. } | SuccessMatcher::Capturing { signals, .. } => {
                *signals = state;
            }
        }
        self
    }

    pub fn signals(&self) -> SignState {
        match self {
            SuccessMatcher::Plain { signals, .. } | SuccessMatcher::Capturing { signals, .. } => *signals,
        }
    }

    /// Returns the extracted message when the pattern matches `text`.
    /// A capture group that did not participate yields an empty message.
    pub fn extract(&self, text: &str) -> Option<String> {
        match self {
            SuccessMatcher::Plain { regex, .. } => regex.find(text).map(|m| m.as_str().to_string()),
            SuccessMatcher::Capturing { regex, group, .. } => regex.captures(text).map(|caps| {
                caps.get(*group)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default()
            }),
        }
    }
}

/// A single pattern (usually an alternation) whose match means the site
/// rejected the attempt.
#[derive(Debug, Clone)]
pub struct FailMatcher {
    regex: Regex,
    signals: SignState,
}

impl FailMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
            signals: SignState::Failed,
        })
    }

    /// Makes a match mean the submitted answer was wrong.
    pub fn wrong_answer(mut self) -> Self {
        self.signals = SignState::WrongAnswer;
        self
    }

    pub fn signals(&self) -> SignState {
        self.signals
    }

    pub fn extract(&self, text: &str) -> Option<String> {
        self.regex.find(text).map(|m| m.as_str().to_string())
    }
}

/// Shared collaborators handed to every step.
#[derive(Clone)]
pub struct StepContext {
    pub router: Arc<Router>,
    pub config: Arc<CheckinConfig>,
    pub captcha: Option<Arc<dyn CaptchaSolver>>,
}

impl StepContext {
    pub fn new(router: Arc<Router>, config: Arc<CheckinConfig>) -> Self {
        Self {
            router,
            config,
            captcha: None,
        }
    }

    pub fn with_captcha(mut self, solver: Arc<dyn CaptchaSolver>) -> Self {
        self.captcha = Some(solver);
        self
    }

    /// Sends a request through the router on behalf of `entry`.
    pub async fn send(
        &self,
        entry: &mut SignInEntry,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Option<Response> {
        self.router.send(entry, method, url, options).await
    }

    /// Runs the configured captcha solver. Missing solver, solver errors and
    /// empty answers mark the entry failed and yield `None`.
    pub async fn solve_captcha(&self, entry: &mut SignInEntry, image: &[u8]) -> Option<String> {
        let Some(solver) = self.captcha.as_ref() else {
            entry.fail_with_kind(FailureKind::BackendUnavailable, "no captcha solver configured");
            return None;
        };
        match solver.solve(image).await {
            Ok(answer) if !answer.trim().is_empty() => Some(answer.trim().to_string()),
            Ok(_) => {
                entry.fail_with_kind(FailureKind::Rejected, "captcha solver returned an empty answer");
                None
            }
            Err(e) => {
                warn!(site = %entry.site_name, "captcha solver failed: {}", e);
                entry.fail_with_kind(FailureKind::BackendUnavailable, format!("captcha solver error: {e}"));
                None
            }
        }
    }
}

/// Site-supplied request logic of one work.
///
/// Returning `None` means the step failed; the step is expected to have marked
/// the entry with a reason (the router does so for transport faults).
#[async_trait]
pub trait Step: Send + Sync {
    async fn execute(
        &self,
        ctx: &StepContext,
        entry: &mut SignInEntry,
        work: &Work,
        last_content: Option<&str>,
    ) -> Option<Response>;
}

/// Requests the work url with the work's verb.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetStep;

#[async_trait]
impl Step for GetStep {
    async fn execute(
        &self,
        ctx: &StepContext,
        entry: &mut SignInEntry,
        work: &Work,
        _last_content: Option<&str>,
    ) -> Option<Response> {
        ctx.send(entry, work.method.clone(), &work.url, RequestOptions::default())
            .await
    }
}

/// Posts a fixed url-encoded form to the work url.
#[derive(Debug, Clone, Default)]
pub struct FormStep {
    pub form: Vec<(String, String)>,
}

impl FormStep {
    pub fn new<K, V, I>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            form: fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

#[async_trait]
impl Step for FormStep {
    async fn execute(
        &self,
        ctx: &StepContext,
        entry: &mut SignInEntry,
        work: &Work,
        _last_content: Option<&str>,
    ) -> Option<Response> {
        let options = RequestOptions::default().form(self.form.clone());
        ctx.send(entry, Method::POST, &work.url, options).await
    }
}

/// One request step plus its outcome-classification rules.
#[derive(Clone)]
pub struct Work {
    pub url: String,
    pub method: Method,
    pub step: Arc<dyn Step>,
    pub success_matchers: Vec<SuccessMatcher>,
    pub fail_matcher: Option<FailMatcher>,
    /// Outcome this work must classify to; anything else halts the chain.
    pub required: Option<SignState>,
    /// Whether the response text is handed to the next work.
    pub retain_content: bool,
    /// Final urls the response may land on; empty accepts any.
    pub response_urls: Vec<String>,
}

impl Work {
    pub fn new<S: Step + 'static>(url: impl Into<String>, step: S) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            step: Arc::new(step),
            success_matchers: Vec::new(),
            fail_matcher: None,
            required: None,
            retain_content: false,
            response_urls: Vec::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(url, GetStep)
    }

    pub fn post_form<K, V, I>(url: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(url, FormStep::new(fields)).method(Method::POST)
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn succeed_on(mut self, matcher: SuccessMatcher) -> Self {
        self.success_matchers.push(matcher);
        self
    }

    /// Appends plain success matchers built from `patterns`.
    pub fn succeed_regex<I, P>(mut self, patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        for pattern in patterns {
            self.success_matchers
                .push(SuccessMatcher::plain(pattern.as_ref())?);
        }
        Ok(self)
    }

    pub fn fail_on(mut self, matcher: FailMatcher) -> Self {
        self.fail_matcher = Some(matcher);
        self
    }

    pub fn fail_regex(self, pattern: &str) -> Result<Self, regex::Error> {
        Ok(self.fail_on(FailMatcher::new(pattern)?))
    }

    pub fn require(mut self, state: SignState) -> Self {
        self.required = Some(state);
        self
    }

    pub fn retain_content(mut self) -> Self {
        self.retain_content = true;
        self
    }

    pub fn response_urls<I, U>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = U>,
        U: Into<String>,
    {
        self.response_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Returns a copy whose url and response urls are absolute, resolved
    /// against `base`.
    pub(crate) fn resolve(&self, base: &str) -> Result<Work, url::ParseError> {
        let base = Url::parse(base)?;
        let mut resolved = self.clone();
        resolved.url = base.join(&self.url)?.to_string();
        resolved.response_urls = self
            .response_urls
            .iter()
            .map(|u| base.join(u).map(|u| u.to_string()))
            .collect::<Result<_, _>>()?;
        Ok(resolved)
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("success_matchers", &self.success_matchers)
            .field("fail_matcher", &self.fail_matcher)
            .field("required", &self.required)
            .field("retain_content", &self.retain_content)
            .field("response_urls", &self.response_urls)
            .finish_non_exhaustive()
    }
}
