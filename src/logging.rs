//! Log subscriber setup for binaries embedding the engine.

use crate::error::CheckinError;
use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber. `RUST_LOG` overrides the level picked by
/// `verbose`. Fails when a global subscriber is already installed.
pub fn init(verbose: bool) -> Result<(), CheckinError> {
    let filter = if verbose {
        "checkin_core=debug"
    } else {
        "checkin_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .try_init()
        .map_err(|e| CheckinError::GeneralError(format!("failed to install log subscriber: {e}")))
}
