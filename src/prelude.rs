//! A "prelude" for users of the `checkin-core` crate.
//!
//! Re-exports what a site implementation and a batch runner usually need.
//!
//! # Example
//!
//! ```
//! use checkin_core::prelude::*;
//! ```

pub use crate::{
    // Running batches
    BatchReport,
    CheckinConfig,
    RunOptions,
    Scheduler,
    SchedulerBuilder,
    // Writing sites
    FailMatcher,
    Site,
    SignInEntry,
    SignState,
    Step,
    StepContext,
    SuccessMatcher,
    Work,
    // Capabilities
    CaptchaSolver,
    CookieProvider,
    // Errors
    CheckinError,
    // Essential re-exports for trait implementation
    async_trait,
};

pub use crate::transport::{RequestOptions, Response};
