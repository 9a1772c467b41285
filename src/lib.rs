//! # checkin-core
//!
//! Workflow engine for daily check-ins across many independent tracker sites.
//!
//! Provides the main components: the `Site` trait and its work chains, the
//! transport `Router` with direct, challenge-proxy and browser backends, the
//! persisted `StatusStore` with failure backoff, and the batch `Scheduler`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use checkin_core::prelude::*;
//!
//! struct Pttime;
//!
//! impl Site for Pttime {
//!     fn name(&self) -> &str { "pttime" }
//!     fn base_url(&self) -> &str { "https://www.pttime.org/" }
//!     fn build_sign_in_workflow(&self, _entry: &SignInEntry) -> Result<Vec<Work>, CheckinError> {
//!         Ok(vec![Work::get("/attendance.php").succeed_regex(["签到成功", "今天已签到"])?])
//!     }
//! }
//!
//! async fn run() -> Result<(), CheckinError> {
//!     checkin_core::logging::init(false)?;
//!     let config = CheckinConfig::from_file("config.yml")?;
//!     let scheduler = SchedulerBuilder::new(config).add_site(Pttime).build()?;
//!     let report = scheduler.run_batch(&RunOptions::default()).await;
//!     println!("{report}");
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod capabilities;
pub mod concurrency;
pub mod config;
pub mod cookie_backup;
pub mod detector;
pub mod engine;
pub mod entry;
pub mod error;
pub mod logging;
pub mod outcome;
pub mod prelude;
pub mod scheduler;
pub mod site;
pub mod state;
pub mod stats;
pub mod status_store;
pub mod transport;
pub mod work;

#[cfg(test)]
mod testing;

pub use builder::SchedulerBuilder;
pub use capabilities::{CaptchaSolver, CookieProvider};
pub use config::{CheckinConfig, SiteSettings};
pub use engine::{run_site, PhaseStatus, SiteOutcome, WorkChain};
pub use entry::{Phase, SignInEntry};
pub use error::CheckinError;
pub use outcome::{ChainOutcome, FailureKind, SignState};
pub use scheduler::{BatchReport, RunOptions, Scheduler, SiteDisposition, SiteReport};
pub use site::Site;
pub use stats::{StatCollector, StatsSnapshot};
pub use status_store::StatusStore;
pub use transport::{RequestOptions, Response, Router, TransportKind, TransportPolicy};
pub use work::{FailMatcher, FormStep, GetStep, Step, StepContext, SuccessMatcher, Work};

pub use async_trait::async_trait;
pub use tokio;
