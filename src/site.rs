//! # Site Module
//!
//! Defines the `Site` trait, the strategy object describing how one tracker
//! is checked in.
//!
//! ## Overview
//!
//! A site knows its base url and builds up to four ordered work lists: a login
//! workflow (run only when no cookie is available), the sign-in workflow, and
//! optional message and detail workflows whose results are collected as side
//! payloads. The engine owns everything else: transport selection, outcome
//! classification, persistence and concurrency.
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
//!
//!     fn build_sign_in_workflow(&self, _entry: &SignInEntry) -> Result<Vec<Work>, CheckinError> {
//!         Ok(vec![
//!             Work::get("/attendance.php")
//!                 .succeed_on(SuccessMatcher::capturing(r"获得(\d+)魔力值", 1)?)
//!                 .succeed_on(SuccessMatcher::plain("今天已签到")?.already_done())
//!                 .fail_regex("验证码错误")?,
//!         ])
//!     }
//! }
//! ```

use crate::entry::SignInEntry;
use crate::error::CheckinError;
use crate::work::Work;

/// Defines the contract for a check-in site.
pub trait Site: Send + Sync + 'static {
    /// Unique key of the site; matches the key in the `sites` configuration.
    fn name(&self) -> &str;

    /// Url every relative work url is resolved against.
    fn base_url(&self) -> &str;

    /// Adjusts a freshly built entry, e.g. to add default headers or the
    /// fragments that prove a browser got past the anti-bot gate.
    fn prepare_entry(&self, _entry: &mut SignInEntry) {}

    /// Works that obtain a session cookie. Run only when the entry has no cookie.
    fn build_login_workflow(&self, _entry: &SignInEntry) -> Result<Vec<Work>, CheckinError> {
        Ok(Vec::new())
    }

    /// Works that perform the daily check-in. An empty list means the site
    /// does not support check-in.
    fn build_sign_in_workflow(&self, entry: &SignInEntry) -> Result<Vec<Work>, CheckinError>;

    /// Works that collect unread messages after a successful check-in.
    fn build_message_workflow(&self, _entry: &SignInEntry) -> Result<Vec<Work>, CheckinError> {
        Ok(Vec::new())
    }

    /// Works that collect account details after a successful check-in.
    fn build_detail_workflow(&self, _entry: &SignInEntry) -> Result<Vec<Work>, CheckinError> {
        Ok(Vec::new())
    }
}
