//! Outcome vocabulary of a check-in attempt.
//!
//! `SignState` is what a response classifies to; `FailureKind` says *why* a
//! chain ended in failure, so the scheduler and the report can tell a dropped
//! connection from a site that rejected the answer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The classified result of a check-in attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignState {
    Succeeded,
    AlreadyDone,
    WrongAnswer,
    Failed,
    Unknown,
    Unsupported,
}

impl SignState {
    /// Terminal states stop a work chain.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SignState::Succeeded | SignState::AlreadyDone | SignState::WrongAnswer | SignState::Failed
        )
    }

    /// States after which the site counts as checked in for the day.
    pub fn is_success(self) -> bool {
        matches!(self, SignState::Succeeded | SignState::AlreadyDone)
    }

    /// States that feed the failure backoff counter.
    pub fn is_failure(self) -> bool {
        matches!(self, SignState::WrongAnswer | SignState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignState::Succeeded => "succeeded",
            SignState::AlreadyDone => "already_done",
            SignState::WrongAnswer => "wrong_answer",
            SignState::Failed => "failed",
            SignState::Unknown => "unknown",
            SignState::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for SignState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a chain failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout, refused connection, bad status.
    Transport,
    /// The proxy service or browser could not be reached or started.
    BackendUnavailable,
    /// The request went through but landed somewhere else (redirect).
    StateMismatch,
    /// The fail matcher fired.
    Rejected,
    /// No matcher fired before the chain ran out of steps.
    Ambiguous,
    /// The classified outcome differs from the outcome a work requires.
    Assertion,
    /// A well-known outage or anti-bot page was served.
    SiteOutage,
    /// The worker running the site panicked.
    Panicked,
    /// The site could not build its workflow.
    InvalidWorkflow,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Transport => "transport",
            FailureKind::BackendUnavailable => "backend_unavailable",
            FailureKind::StateMismatch => "state_mismatch",
            FailureKind::Rejected => "rejected",
            FailureKind::Ambiguous => "ambiguous",
            FailureKind::Assertion => "assertion",
            FailureKind::SiteOutage => "site_outage",
            FailureKind::Panicked => "panicked",
            FailureKind::InvalidWorkflow => "invalid_workflow",
        };
        f.write_str(name)
    }
}

/// Result of running one work chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainOutcome {
    pub state: SignState,
    pub message: String,
    pub failure: Option<FailureKind>,
    /// Outcome a work required when the chain halted on a different one.
    pub mismatch: Option<SignState>,
}

impl ChainOutcome {
    pub fn new(state: SignState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            failure: None,
            mismatch: None,
        }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            state: SignState::Failed,
            message: message.into(),
            failure: Some(kind),
            mismatch: None,
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(SignState::Unsupported, message)
    }

    pub fn with_failure(mut self, kind: FailureKind) -> Self {
        self.failure = Some(kind);
        self
    }

    pub fn with_mismatch(mut self, required: SignState) -> Self {
        self.mismatch = Some(required);
        self
    }

    pub fn is_success(&self) -> bool {
        self.state.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_match_chain_semantics() {
        assert!(SignState::Succeeded.is_terminal());
        assert!(SignState::AlreadyDone.is_terminal());
        assert!(SignState::WrongAnswer.is_terminal());
        assert!(SignState::Failed.is_terminal());
        assert!(!SignState::Unknown.is_terminal());
        assert!(!SignState::Unsupported.is_terminal());
    }

    #[test]
    fn serializes_in_snake_case() {
        let json = serde_json::to_string(&SignState::AlreadyDone).unwrap();
        assert_eq!(json, "\"already_done\"");
        let kind: FailureKind = serde_json::from_str("\"site_outage\"").unwrap();
        assert_eq!(kind, FailureKind::SiteOutage);
    }
}
