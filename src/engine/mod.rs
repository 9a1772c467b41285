//! # Engine Module
//!
//! Executes sites: the work-chain executor, the per-site runner that strings
//! the login, sign-in, message and detail phases together, and the bounded
//! worker pool the scheduler dispatches sites to.
//!
//! ## Architecture
//!
//! Sites run in separate Tokio tasks, at most `max_workers` at a time. Works
//! within a site run strictly in order. Finished sites travel over an async
//! channel to a single committer owned by the scheduler, so persistence is
//! never touched by more than one task.

mod executor;
mod site_runner;
mod worker;

pub use executor::WorkChain;
pub use site_runner::{run_site, PhaseStatus, SiteOutcome};
pub(crate) use worker::{spawn_site_workers, CompletedSite, SiteJob};
