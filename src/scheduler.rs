//! # Scheduler Module
//!
//! Runs a batch of check-ins and commits every outcome to the status store.
//!
//! ## Overview
//!
//! The `Scheduler` owns the registered sites and the shared collaborators
//! (router, status store, cookie backup, statistics). A batch goes through
//! three stages:
//!
//! - **Pre-filtering**: sites outside `only_sites`, sites already checked in
//!   today and sites inside their failure backoff window are left out.
//! - **Dispatch**: the survivors run on the bounded worker pool, in
//!   registration order.
//! - **Commit**: a single committer receives finished sites over a channel
//!   and writes each outcome to the store as soon as it arrives. File writes
//!   run on the blocking pool.
//!
//! [`Scheduler::run_daily`] repeats the batch every day at `schedule_time`
//! until its shutdown future resolves.
//!
//! ## Example
//!
//! ```rust,ignore
//! use checkin_core::prelude::*;
//!
//! let config = CheckinConfig::from_file("config.yml")?;
//! let scheduler = SchedulerBuilder::new(config).add_site(Pttime).build()?;
//! let report = scheduler.run_batch(&RunOptions::default()).await;
//! println!("{}", report);
//! ```

use crate::capabilities::{CaptchaSolver, CookieProvider};
use crate::config::CheckinConfig;
use crate::cookie_backup::CookieBackup;
use crate::engine::{self, spawn_site_workers, CompletedSite, SiteJob, SiteOutcome};
use crate::entry::SignInEntry;
use crate::error::CheckinError;
use crate::outcome::SignState;
use crate::site::Site;
use crate::state::BatchState;
use crate::stats::{StatCollector, StatsSnapshot};
use crate::status_store::StatusStore;
use crate::transport::Router;
use crate::work::StepContext;
use chrono::{Local, NaiveDateTime, NaiveTime};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Per-batch switches.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Re-run sites already checked in today. Backoff still applies.
    pub force_all: bool,
    /// Sites that run regardless of today's record and of their backoff.
    pub force_sites: HashSet<String>,
    /// When non-empty, only these sites take part in the batch.
    pub only_sites: HashSet<String>,
}

impl RunOptions {
    pub fn force_all() -> Self {
        Self {
            force_all: true,
            ..Self::default()
        }
    }

    pub fn force_site(mut self, site: impl Into<String>) -> Self {
        self.force_sites.insert(site.into());
        self
    }

    pub fn only<I, S>(mut self, sites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only_sites.extend(sites.into_iter().map(Into::into));
        self
    }

    fn selects(&self, site: &str) -> bool {
        self.only_sites.is_empty() || self.only_sites.contains(site)
    }
}

/// What happened to one site in a batch.
#[derive(Debug, Clone)]
pub enum SiteDisposition {
    Ran(SiteOutcome),
    SkippedDone,
    SkippedBackoff(String),
    /// Configured but no implementation is registered.
    Unregistered,
}

#[derive(Debug, Clone)]
pub struct SiteReport {
    pub site: String,
    pub disposition: SiteDisposition,
}

impl SiteReport {
    pub fn outcome(&self) -> Option<&SiteOutcome> {
        match &self.disposition {
            SiteDisposition::Ran(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// State shown for the site: the sign-in state when it ran, `Unsupported`
    /// when it has no implementation, `None` when it was skipped.
    pub fn state(&self) -> Option<SignState> {
        match &self.disposition {
            SiteDisposition::Ran(outcome) => Some(outcome.sign_in.state),
            SiteDisposition::Unregistered => Some(SignState::Unsupported),
            _ => None,
        }
    }
}

/// Result of a batch, one report per site in registration order.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub sites: Vec<SiteReport>,
    pub stats: StatsSnapshot,
}

impl BatchReport {
    pub fn get(&self, site: &str) -> Option<&SiteReport> {
        self.sites.iter().find(|report| report.site == site)
    }

    pub fn executed(&self) -> impl Iterator<Item = &SiteOutcome> {
        self.sites.iter().filter_map(SiteReport::outcome)
    }

    pub fn succeeded(&self) -> usize {
        self.executed().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.executed().filter(|o| o.sign_in.state.is_failure()).count()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for report in &self.sites {
            match &report.disposition {
                SiteDisposition::Ran(outcome) => writeln!(
                    f,
                    "{}: {} {}",
                    report.site, outcome.sign_in.state, outcome.sign_in.message
                )?,
                SiteDisposition::SkippedDone => writeln!(f, "{}: skipped, already done today", report.site)?,
                SiteDisposition::SkippedBackoff(reason) => writeln!(f, "{}: skipped, {}", report.site, reason)?,
                SiteDisposition::Unregistered => writeln!(f, "{}: unsupported site", report.site)?,
            }
        }
        write!(f, "{}", self.stats_line())
    }
}

impl BatchReport {
    fn stats_line(&self) -> String {
        format!(
            "succeeded: {}, failed: {}, skipped: {}",
            self.succeeded(),
            self.failed(),
            self.stats.skipped_done + self.stats.skipped_backoff
        )
    }
}

pub struct Scheduler {
    sites: Vec<Arc<dyn Site>>,
    config: Arc<CheckinConfig>,
    store: Arc<StatusStore>,
    cookie_backup: Option<Arc<CookieBackup>>,
    cookie_provider: Option<Arc<dyn CookieProvider>>,
    ctx: StepContext,
    stats: Arc<StatCollector>,
    state: Arc<BatchState>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        sites: Vec<Arc<dyn Site>>,
        config: Arc<CheckinConfig>,
        store: Arc<StatusStore>,
        cookie_backup: Option<Arc<CookieBackup>>,
        router: Arc<Router>,
        captcha: Option<Arc<dyn CaptchaSolver>>,
        cookie_provider: Option<Arc<dyn CookieProvider>>,
    ) -> Self {
        let stats = router.stats().clone();
        let mut ctx = StepContext::new(router, config.clone());
        if let Some(solver) = captcha {
            ctx = ctx.with_captcha(solver);
        }
        Self {
            sites,
            config,
            store,
            cookie_backup,
            cookie_provider,
            ctx,
            stats,
            state: BatchState::new(),
        }
    }

    pub fn store(&self) -> &Arc<StatusStore> {
        &self.store
    }

    pub fn stats(&self) -> &Arc<StatCollector> {
        &self.stats
    }

    pub fn state(&self) -> &Arc<BatchState> {
        &self.state
    }

    pub fn sites(&self) -> impl Iterator<Item = &str> {
        self.sites.iter().map(|site| site.name())
    }

    fn find_site(&self, name: &str) -> Option<&Arc<dyn Site>> {
        self.sites.iter().find(|site| site.name() == name)
    }

    /// Builds the entry of a registered site from its configuration.
    pub async fn entry_for(&self, name: &str) -> Result<SignInEntry, CheckinError> {
        let site = self
            .find_site(name)
            .ok_or_else(|| CheckinError::UnknownSite(name.to_string()))?;
        Ok(self.build_entry(site.as_ref()).await)
    }

    async fn build_entry(&self, site: &dyn Site) -> SignInEntry {
        let name = site.name();
        let settings = self.config.site(name).cloned().unwrap_or_default();

        let mut entry = SignInEntry::new(name, site.base_url());
        if let Some(cookie) = settings.cookie {
            entry = entry.with_cookie(cookie);
        }
        if !entry.has_cookie() {
            if let Some(provider) = &self.cookie_provider {
                match provider.fetch_cookie(name).await {
                    Ok(cookie) => entry = entry.with_cookie(cookie),
                    Err(e) => warn!(site = %name, "Cookie provider failed: {}", e),
                }
            }
        }
        entry.headers = settings.headers;
        entry.transport = settings.transport;
        entry.site_config = settings.extra;
        entry.site_config.extend(settings.login);
        entry.last_date = self
            .cookie_backup
            .as_ref()
            .and_then(|backup| backup.last_date(name));

        site.prepare_entry(&mut entry);
        entry
    }

    /// Runs every workflow of `site` for `entry` without touching the status
    /// store.
    pub async fn run_site(&self, site: &dyn Site, entry: SignInEntry) -> SiteOutcome {
        engine::run_site(&self.ctx, site, entry).await
    }

    /// Runs one batch: pre-filters, dispatches the remaining sites to the
    /// worker pool and commits every outcome as it arrives.
    pub async fn run_batch(&self, options: &RunOptions) -> BatchReport {
        let baseline = self.stats.snapshot();
        let now = Local::now();
        let today = now.date_naive();
        let threshold = self.config.max_failed_attempts;
        let cooldown = self.config.failed_retry_interval();

        let mut slots: Vec<(String, Option<SiteDisposition>)> = Vec::new();
        let mut jobs = Vec::new();

        for site in &self.sites {
            let name = site.name().to_string();
            if !options.selects(&name) {
                continue;
            }
            let forced = options.force_sites.contains(&name);

            if !forced && !options.force_all && self.store.is_done(today, &name) {
                debug!(site = %name, "Already checked in today, skipping");
                self.stats.increment_skipped_done();
                slots.push((name, Some(SiteDisposition::SkippedDone)));
                continue;
            }
            if !forced {
                if let Some(reason) = self.store.backoff_reason(&name, threshold, cooldown, now) {
                    info!(site = %name, "Held back: {}", reason);
                    self.stats.increment_skipped_backoff();
                    slots.push((name, Some(SiteDisposition::SkippedBackoff(reason))));
                    continue;
                }
            }

            let entry = self.build_entry(site.as_ref()).await;
            jobs.push(SiteJob {
                index: slots.len(),
                site: site.clone(),
                entry,
            });
            slots.push((name, None));
        }

        for name in self.config.sites.keys() {
            if options.selects(name) && self.find_site(name).is_none() {
                warn!(site = %name, "Configured site has no implementation");
                slots.push((name.clone(), Some(SiteDisposition::Unregistered)));
            }
        }

        info!(
            "Starting batch: {} site(s) to run, max_workers={}",
            jobs.len(),
            self.config.max_workers
        );

        let (result_tx, result_rx) = kanal::unbounded_async::<CompletedSite>();
        let workers = spawn_site_workers(
            jobs,
            self.ctx.clone(),
            self.config.max_workers,
            self.state.clone(),
            result_tx,
        );

        while let Ok(CompletedSite { index, outcome }) = result_rx.recv().await {
            self.commit(&outcome).await;
            if let Some(slot) = slots.get_mut(index) {
                slot.1 = Some(SiteDisposition::Ran(outcome));
            }
        }
        if let Err(e) = workers.await {
            error!("Site worker pool failed: {}", e);
        }

        let store = self.store.clone();
        let keep_days = self.config.status_retention_days;
        if let Err(e) = blocking(move || store.prune(keep_days, today)).await {
            error!("Failed to prune status records: {}", e);
        }

        let stats = self.stats.snapshot().since(&baseline);
        info!("Batch finished. {}", stats);

        let sites = slots
            .into_iter()
            .filter_map(|(site, disposition)| match disposition {
                Some(disposition) => Some(SiteReport { site, disposition }),
                None => {
                    error!(site = %site, "Site never reported back");
                    None
                }
            })
            .collect();
        BatchReport { sites, stats }
    }

    /// Runs a batch every day at the configured `schedule_time` until
    /// `shutdown` resolves. Returns the number of batches run.
    pub async fn run_daily<F>(&self, options: &RunOptions, shutdown: F) -> Result<usize, CheckinError>
    where
        F: Future<Output = ()>,
    {
        let at = self.config.daily_at()?;
        tokio::pin!(shutdown);

        let mut next = next_run_after(Local::now().naive_local(), at);
        let mut batches = 0;
        loop {
            let wait = (next - Local::now().naive_local())
                .to_std()
                .unwrap_or(Duration::ZERO);
            info!("Next check-in batch at {} (in {}m)", next, wait.as_secs() / 60);

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping daily schedule");
                    break;
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::now() + wait) => {
                    let report = self.run_batch(options).await;
                    batches += 1;
                    info!("Daily batch {} done: {}", batches, report.stats_line());
                    next = next_run_after(next, at);
                }
            }
        }
        Ok(batches)
    }

    /// Applies one finished site to the store. Store errors are logged and do
    /// not stop the batch.
    async fn commit(&self, outcome: &SiteOutcome) {
        let now = Local::now();
        let sign_in = &outcome.sign_in;
        let site = outcome.site.clone();
        self.stats.record_site(sign_in.state);

        if sign_in.state == SignState::Unsupported {
            debug!(site = %site, "Unsupported, nothing to commit");
            self.state.site_committed();
            return;
        }

        let store = self.store.clone();
        let (state, message) = (sign_in.state, sign_in.message.clone());
        if sign_in.is_success() {
            let payload = outcome.payload.clone();
            let name = site.clone();
            if let Err(e) =
                blocking(move || store.record_success(&name, state, &message, payload, now)).await
            {
                error!(site = %site, "Failed to record success: {}", e);
            }
            if let (Some(backup), Some(cookie)) = (&self.cookie_backup, &outcome.session_cookie) {
                let (backup, cookie, name) = (backup.clone(), cookie.clone(), site.clone());
                if let Err(e) = blocking(move || backup.save(&name, &cookie, now.date_naive())).await {
                    warn!(site = %site, "Failed to back up cookie: {}", e);
                }
            }
        } else {
            let kind = sign_in.failure;
            let name = site.clone();
            match blocking(move || store.record_failure(&name, state, &message, kind, now)).await {
                Ok(failures) if self.config.max_failed_attempts > 0
                    && failures >= self.config.max_failed_attempts =>
                {
                    warn!(
                        site = %site,
                        "{} consecutive failures, holding back for {}h",
                        failures, self.config.failed_retry_interval_hours
                    );
                }
                Ok(_) => {}
                Err(e) => error!(site = %site, "Failed to record failure: {}", e),
            }
        }
        self.state.site_committed();
    }
}

/// Runs a file-touching closure on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, CheckinError>
where
    F: FnOnce() -> Result<T, CheckinError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CheckinError::GeneralError(format!("status write task failed: {e}")))?
}

/// First occurrence of `at` strictly after `after`.
fn next_run_after(after: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let candidate = after.date().and_time(at);
    if candidate > after {
        candidate
    } else {
        candidate + chrono::Duration::days(1)
    }
}
