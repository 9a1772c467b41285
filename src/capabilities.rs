//! Narrow capability traits for services the engine does not implement itself.

use crate::error::CheckinError;
use async_trait::async_trait;

/// Turns a captcha image into its text.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    async fn solve(&self, image: &[u8]) -> Result<String, CheckinError>;
}

/// Supplies a cookie for a site that has none configured, e.g. from a
/// browser profile or a companion service.
#[async_trait]
pub trait CookieProvider: Send + Sync {
    async fn fetch_cookie(&self, site: &str) -> Result<String, CheckinError>;
}
