//! Runs every workflow of one site for one entry.

use super::WorkChain;
use crate::entry::{Phase, SignInEntry};
use crate::error::CheckinError;
use crate::outcome::{ChainOutcome, FailureKind};
use crate::site::Site;
use crate::work::{StepContext, Work};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// How an optional phase (messages, details) went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum PhaseStatus {
    Skipped,
    Succeeded,
    Failed(String),
}

/// Everything the scheduler needs to commit after a site ran.
#[derive(Debug, Clone)]
pub struct SiteOutcome {
    pub site: String,
    pub sign_in: ChainOutcome,
    pub messages: PhaseStatus,
    pub details: PhaseStatus,
    /// Messages and details collected by the optional phases.
    pub payload: Option<Value>,
    /// Cookie held by the transport at the end of the run.
    pub session_cookie: Option<String>,
}

impl SiteOutcome {
    pub(crate) fn from_chain(site: impl Into<String>, sign_in: ChainOutcome) -> Self {
        Self {
            site: site.into(),
            sign_in,
            messages: PhaseStatus::Skipped,
            details: PhaseStatus::Skipped,
            payload: None,
            session_cookie: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.sign_in.is_success()
    }
}

/// Runs login (when the entry has no cookie), sign-in, then the optional
/// message and detail phases. The optional phases never change the sign-in
/// outcome.
pub async fn run_site(ctx: &StepContext, site: &dyn Site, mut entry: SignInEntry) -> SiteOutcome {
    let sign_in = sign_in(ctx, site, &mut entry).await;
    let mut outcome = SiteOutcome::from_chain(site.name(), sign_in);

    if outcome.is_success() {
        info!(site = %entry.site_name, "{}: {}", outcome.sign_in.state, outcome.sign_in.message);
        if ctx.config.get_messages {
            outcome.messages = optional_phase(ctx, site, &mut entry, Phase::Messages).await;
        }
        if ctx.config.get_details {
            outcome.details = optional_phase(ctx, site, &mut entry, Phase::Details).await;
        }
        if entry.messages.is_some() || entry.details.is_some() {
            outcome.payload = Some(json!({
                "messages": entry.messages,
                "details": entry.details,
            }));
        }
    } else {
        warn!(site = %entry.site_name, "{}: {}", outcome.sign_in.state, outcome.sign_in.message);
    }

    outcome.session_cookie = entry.session_cookie.clone().or(entry.cookie.clone());
    ctx.router.release(&entry).await;
    outcome
}

async fn sign_in(ctx: &StepContext, site: &dyn Site, entry: &mut SignInEntry) -> ChainOutcome {
    if !entry.has_cookie() {
        entry.set_phase(Phase::Login);
        let login = match build(site, entry, Phase::Login) {
            Ok(works) => works,
            Err(outcome) => return outcome,
        };
        if !login.is_empty() {
            debug!(site = %entry.site_name, "No cookie, running login workflow");
            let outcome = WorkChain::run(ctx, entry, &login).await;
            if !outcome.is_success() {
                return outcome;
            }
            if let Some(cookie) = entry.session_cookie.clone() {
                entry.cookie = Some(cookie);
            }
        }
    }

    entry.set_phase(Phase::SignIn);
    let works = match build(site, entry, Phase::SignIn) {
        Ok(works) => works,
        Err(outcome) => return outcome,
    };
    if works.is_empty() {
        return ChainOutcome::unsupported("Sign in not supported");
    }
    WorkChain::run(ctx, entry, &works).await
}

async fn optional_phase(
    ctx: &StepContext,
    site: &dyn Site,
    entry: &mut SignInEntry,
    phase: Phase,
) -> PhaseStatus {
    let mark = entry.failure_mark();
    entry.set_phase(phase);

    let status = match build(site, entry, phase) {
        Err(outcome) => PhaseStatus::Failed(outcome.message),
        Ok(works) if works.is_empty() => PhaseStatus::Skipped,
        Ok(works) => {
            let outcome = WorkChain::run(ctx, entry, &works).await;
            if outcome.is_success() {
                let collected = match phase {
                    Phase::Messages => &mut entry.messages,
                    _ => &mut entry.details,
                };
                if collected.is_none() && !outcome.message.is_empty() {
                    *collected = Some(Value::String(outcome.message));
                }
                PhaseStatus::Succeeded
            } else {
                debug!(site = %entry.site_name, "{} phase failed: {}", phase, outcome.message);
                PhaseStatus::Failed(outcome.message)
            }
        }
    };

    entry.restore_failure_mark(mark);
    status
}

fn build(site: &dyn Site, entry: &mut SignInEntry, phase: Phase) -> Result<Vec<Work>, ChainOutcome> {
    let built: Result<Vec<Work>, CheckinError> = match phase {
        Phase::Login => site.build_login_workflow(entry),
        Phase::SignIn => site.build_sign_in_workflow(entry),
        Phase::Messages => site.build_message_workflow(entry),
        Phase::Details => site.build_detail_workflow(entry),
    };
    built.map_err(|e| {
        entry.fail_with_kind(FailureKind::InvalidWorkflow, e.to_string());
        ChainOutcome::failed(FailureKind::InvalidWorkflow, entry.reason())
    })
}
