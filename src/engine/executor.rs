//! Sequential execution of a work chain for one entry.

use crate::detector::{classify, detect_outage, Classification};
use crate::entry::SignInEntry;
use crate::outcome::{ChainOutcome, FailureKind, SignState};
use crate::work::{StepContext, Work};
use tracing::{debug, trace, warn};

/// Runs ordered works until one classifies to a terminal state.
pub struct WorkChain;

impl WorkChain {
    /// Runs `works` in order for `entry`.
    ///
    /// A last work declaring no success matchers succeeds on any response
    /// its fail matcher does not catch.
    ///
    /// The chain halts on the first terminal classification, on a missing
    /// response, on a redirect away from the accepted response urls and on a
    /// required-outcome mismatch. Running out of works without a terminal
    /// state is an ambiguous failure.
    pub async fn run(ctx: &StepContext, entry: &mut SignInEntry, works: &[Work]) -> ChainOutcome {
        let mut last_content: Option<String> = None;
        let total = works.len();

        for (index, work) in works.iter().enumerate() {
            let work = match work.resolve(&entry.url) {
                Ok(work) => work,
                Err(e) => {
                    entry.fail_with_kind(
                        FailureKind::InvalidWorkflow,
                        format!("invalid url '{}': {e}", work.url),
                    );
                    return Self::entry_failure(entry, FailureKind::InvalidWorkflow);
                }
            };
            debug!(site = %entry.site_name, "Work {}/{}: {} {}", index + 1, total, work.method, work.url);

            let response = work
                .step
                .execute(ctx, entry, &work, last_content.as_deref())
                .await;
            let response = match response {
                Some(response) if !entry.is_failed() => response,
                _ => {
                    if !entry.is_failed() {
                        entry.fail_with_kind(
                            FailureKind::Transport,
                            format!("Network error: url: {}, error: Response is None", work.url),
                        );
                    }
                    return Self::entry_failure(entry, FailureKind::Transport);
                }
            };

            if !work.response_urls.is_empty() && !work.response_urls.contains(&response.url) {
                entry.fail_with_kind(
                    FailureKind::StateMismatch,
                    format!("Url: {} redirect to {}", work.response_urls[0], response.url),
                );
                return Self::entry_failure(entry, FailureKind::StateMismatch);
            }

            let mut classification = classify(
                &response.text,
                &work.success_matchers,
                work.fail_matcher.as_ref(),
            );
            trace!(site = %entry.site_name, "Work {}/{} classified as {}", index + 1, total, classification.state);

            if classification.state == SignState::Unknown {
                if let Some(outage) = detect_outage(&response.text) {
                    entry.fail_with_kind(
                        FailureKind::SiteOutage,
                        format!("Network error: url: {}, error: {}", work.url, outage),
                    );
                    return Self::entry_failure(entry, FailureKind::SiteOutage);
                }
                // A final work without matchers only needs the request to land.
                if index + 1 == total && work.success_matchers.is_empty() {
                    classification.state = SignState::Succeeded;
                }
            }

            if work.retain_content {
                last_content = Some(response.text);
            }

            if let Some(required) = work.required {
                if classification.state != required {
                    return Self::assertion_mismatch(entry, &work, required, classification);
                }
            }

            if classification.state.is_terminal() {
                return Self::terminal(entry, classification);
            }
        }

        entry.fail_with_kind(FailureKind::Ambiguous, "Sign in failed, no match");
        Self::entry_failure(entry, FailureKind::Ambiguous)
    }

    fn entry_failure(entry: &SignInEntry, fallback: FailureKind) -> ChainOutcome {
        ChainOutcome::failed(entry.failure_kind().unwrap_or(fallback), entry.reason())
    }

    fn terminal(entry: &mut SignInEntry, classification: Classification) -> ChainOutcome {
        let Classification { state, message } = classification;
        if state.is_success() {
            entry.result = message.clone();
            return ChainOutcome::new(state, message);
        }
        entry.fail_with_kind(FailureKind::Rejected, &message);
        ChainOutcome::new(state, entry.reason()).with_failure(FailureKind::Rejected)
    }

    fn assertion_mismatch(
        entry: &mut SignInEntry,
        work: &Work,
        required: SignState,
        classification: Classification,
    ) -> ChainOutcome {
        warn!(
            site = %entry.site_name,
            "Work {} expected {}, got {}",
            work.url, required, classification.state
        );
        let Classification { state, message } = classification;
        match state {
            SignState::Unknown | SignState::Unsupported => {
                entry.fail_with_kind(FailureKind::Assertion, "Sign in failed, no sign in");
                Self::entry_failure(entry, FailureKind::Assertion)
            }
            s if s.is_success() => {
                entry.result = message.clone();
                ChainOutcome::new(s, message).with_mismatch(required)
            }
            s => {
                entry.fail_with_kind(FailureKind::Assertion, &message);
                ChainOutcome::new(s, entry.reason())
                    .with_failure(FailureKind::Assertion)
                    .with_mismatch(required)
            }
        }
    }
}
