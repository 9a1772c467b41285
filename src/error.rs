//! Error type shared by the fallible, non-transport operations of the crate.
//!
//! Transport faults never surface as `CheckinError` to the work chain: the
//! router absorbs them and reports a missing response instead. This type covers
//! configuration, persistence, workflow construction and backend setup.
//! Site implementations return [`CheckinError::InvalidWorkflow`] when they
//! cannot build a workflow from the entry they were given.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckinError {
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("invalid workflow for site '{site}': {reason}")]
    InvalidWorkflow { site: String, reason: String },

    #[error("site '{0}' is not registered")]
    UnknownSite(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("{0}")]
    GeneralError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Regex(#[from] regex::Error),
}
