//! Test doubles shared by the unit tests.

use crate::config::CheckinConfig;
use crate::entry::SignInEntry;
use crate::error::CheckinError;
use crate::site::Site;
use crate::transport::{DirectTransport, Response, Router, TransportKind};
use crate::work::{Step, StepContext, Work};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn context() -> StepContext {
    let router = Router::new(Arc::new(DirectTransport::new("test-agent", Duration::from_secs(1))));
    StepContext::new(Arc::new(router), Arc::new(CheckinConfig::default()))
}

/// Step replaying canned responses in order. Clones share their queue.
#[derive(Clone)]
pub(crate) struct CannedStep {
    /// Response text and optional final url; `None` means no response.
    replies: Arc<Mutex<VecDeque<Option<(String, Option<String>)>>>>,
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Option<String>>>>,
    fail_reason: Option<String>,
    delay: Option<Duration>,
}

impl CannedStep {
    pub(crate) fn new<'a, I>(replies: I) -> Self
    where
        I: IntoIterator<Item = Option<(&'a str, &'a str)>>,
    {
        let replies = replies
            .into_iter()
            .map(|r| r.map(|(text, url)| (text.to_string(), Some(url.to_string()))))
            .collect();
        Self {
            replies: Arc::new(Mutex::new(replies)),
            calls: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
            fail_reason: None,
            delay: None,
        }
    }

    /// Replies with `texts`, each served at the requested url.
    pub(crate) fn texts<'a, I: IntoIterator<Item = &'a str>>(texts: I) -> Self {
        let step = Self::new(std::iter::empty());
        step.replies
            .lock()
            .extend(texts.into_iter().map(|t| Some((t.to_string(), None))));
        step
    }

    /// Marks the entry failed while still returning the response.
    pub(crate) fn failing(mut self, reason: &str) -> Self {
        self.fail_reason = Some(reason.to_string());
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    pub(crate) fn seen_last_content(&self) -> Arc<Mutex<Vec<Option<String>>>> {
        self.seen.clone()
    }
}

#[async_trait]
impl Step for CannedStep {
    async fn execute(
        &self,
        _ctx: &StepContext,
        entry: &mut SignInEntry,
        work: &Work,
        last_content: Option<&str>,
    ) -> Option<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(last_content.map(str::to_string));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = &self.fail_reason {
            entry.fail_with_prefix(reason);
        }
        let reply = self.replies.lock().pop_front().flatten();
        match reply {
            Some((text, url)) => Some(Response::html(
                200,
                url.unwrap_or_else(|| work.url.clone()),
                text,
                TransportKind::Direct,
            )),
            None => {
                entry.fail_with_prefix(format!("Network error: url: {}, error: connection refused", work.url));
                None
            }
        }
    }
}

/// Step that panics, standing in for a buggy site implementation.
pub(crate) struct PanicStep;

#[async_trait]
impl Step for PanicStep {
    async fn execute(
        &self,
        _ctx: &StepContext,
        _entry: &mut SignInEntry,
        _work: &Work,
        _last_content: Option<&str>,
    ) -> Option<Response> {
        panic!("site step blew up");
    }
}

/// Site whose workflows are fixed lists of works.
#[derive(Clone, Default)]
pub(crate) struct FakeSite {
    pub name: String,
    pub url: String,
    pub login: Vec<Work>,
    pub sign_in: Vec<Work>,
    pub messages: Vec<Work>,
    pub details: Vec<Work>,
    pub broken: bool,
}

impl FakeSite {
    pub(crate) fn new(name: &str, sign_in: Vec<Work>) -> Self {
        Self {
            name: name.to_string(),
            url: format!("https://{name}.example/"),
            sign_in,
            ..Self::default()
        }
    }
}

impl Site for FakeSite {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_url(&self) -> &str {
        &self.url
    }

    fn build_login_workflow(&self, _entry: &SignInEntry) -> Result<Vec<Work>, CheckinError> {
        Ok(self.login.clone())
    }

    fn build_sign_in_workflow(&self, _entry: &SignInEntry) -> Result<Vec<Work>, CheckinError> {
        if self.broken {
            return Err(CheckinError::InvalidWorkflow {
                site: self.name.clone(),
                reason: "missing answer table".into(),
            });
        }
        Ok(self.sign_in.clone())
    }

    fn build_message_workflow(&self, _entry: &SignInEntry) -> Result<Vec<Work>, CheckinError> {
        Ok(self.messages.clone())
    }

    fn build_detail_workflow(&self, _entry: &SignInEntry) -> Result<Vec<Work>, CheckinError> {
        Ok(self.details.clone())
    }
}
