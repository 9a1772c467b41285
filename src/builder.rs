//! # Builder Module
//!
//! Provides the `SchedulerBuilder`, a fluent API for assembling a
//! [`Scheduler`] from a configuration, the site implementations and the
//! optional capability services.
//!
//! ## Overview
//!
//! The builder validates the configuration, opens the persisted state (status
//! store and cookie backup) under the configured data directory and constructs
//! the transport router with every backend the configuration enables. Without
//! a data directory all state is kept in memory.
//!
//! ## Example
//!
//! ```rust,ignore
//! use checkin_core::prelude::*;
//!
//! let scheduler = SchedulerBuilder::new(CheckinConfig::from_file("config.yml")?)
//!     .add_site(Pttime)
//!     .add_site(Hdsky)
//!     .captcha_solver(MyOcr::default())
//!     .build()?;
//! ```

use crate::capabilities::{CaptchaSolver, CookieProvider};
use crate::config::CheckinConfig;
use crate::cookie_backup::CookieBackup;
use crate::error::CheckinError;
use crate::scheduler::Scheduler;
use crate::site::Site;
use crate::stats::StatCollector;
use crate::status_store::StatusStore;
use crate::transport::Router;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

pub struct SchedulerBuilder {
    config: CheckinConfig,
    sites: Vec<Arc<dyn Site>>,
    captcha: Option<Arc<dyn CaptchaSolver>>,
    cookie_provider: Option<Arc<dyn CookieProvider>>,
    router: Option<Router>,
    store: Option<StatusStore>,
}

impl SchedulerBuilder {
    pub fn new(config: CheckinConfig) -> Self {
        Self {
            config,
            sites: Vec::new(),
            captcha: None,
            cookie_provider: None,
            router: None,
            store: None,
        }
    }

    /// Registers a site. Sites run in registration order.
    pub fn add_site<S: Site>(mut self, site: S) -> Self {
        self.sites.push(Arc::new(site));
        self
    }

    pub fn add_sites<I>(mut self, sites: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Site>>,
    {
        self.sites.extend(sites);
        self
    }

    pub fn captcha_solver<C: CaptchaSolver + 'static>(mut self, solver: C) -> Self {
        self.captcha = Some(Arc::new(solver));
        self
    }

    pub fn cookie_provider<P: CookieProvider + 'static>(mut self, provider: P) -> Self {
        self.cookie_provider = Some(Arc::new(provider));
        self
    }

    /// Replaces the router built from the configuration.
    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    /// Replaces the status store opened from the configuration.
    pub fn status_store(mut self, store: StatusStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the maximum number of sites running at once.
    pub fn max_workers(mut self, limit: usize) -> Self {
        self.config.max_workers = limit;
        self
    }

    pub fn build(self) -> Result<Scheduler, CheckinError> {
        self.config.validate()?;

        let mut seen = HashSet::new();
        for site in &self.sites {
            if !seen.insert(site.name()) {
                return Err(CheckinError::ConfigurationError(format!(
                    "site '{}' is registered twice",
                    site.name()
                )));
            }
            Url::parse(site.base_url()).map_err(|e| CheckinError::InvalidWorkflow {
                site: site.name().to_string(),
                reason: format!("invalid base url '{}': {e}", site.base_url()),
            })?;
        }

        let store = match self.store {
            Some(store) => store,
            None => match self.config.status_path() {
                Some(path) => {
                    debug!("Opening status store at {:?}", path);
                    StatusStore::open(path)?
                }
                None => StatusStore::in_memory(),
            },
        };

        let cookie_backup = self
            .config
            .cookie_backup
            .then(|| self.config.cookie_backup_path())
            .flatten()
            .map(|path| Arc::new(CookieBackup::new(path)));

        let router = match self.router {
            Some(router) => router,
            None => Router::from_config(&self.config, Arc::new(StatCollector::new()))?,
        };

        info!(
            "Scheduler ready: {} site(s), max_workers={}, transport={:?}",
            self.sites.len(),
            self.config.max_workers,
            self.config.transport
        );

        Ok(Scheduler::new(
            self.sites,
            Arc::new(self.config),
            Arc::new(store),
            cookie_backup,
            Arc::new(router),
            self.captcha,
            self.cookie_provider,
        ))
    }
}
