//! Bounded worker pool running sites concurrently.
//!
//! Jobs are started in submission order, at most `max_workers` at a time. Each
//! finished site is sent to the committer over a channel; a worker that
//! panics is reported as a failed site instead of taking the batch down.

use super::{run_site, SiteOutcome};
use crate::entry::SignInEntry;
use crate::outcome::{ChainOutcome, FailureKind};
use crate::site::Site;
use crate::state::BatchState;
use crate::work::StepContext;
use kanal::AsyncSender;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{error, trace, warn};

pub(crate) struct SiteJob {
    pub index: usize,
    pub site: Arc<dyn Site>,
    pub entry: SignInEntry,
}

pub(crate) struct CompletedSite {
    pub index: usize,
    pub outcome: SiteOutcome,
}

/// Keeps the in-flight count honest even when the worker unwinds.
struct InFlight(Arc<BatchState>);

impl InFlight {
    fn enter(state: Arc<BatchState>) -> Self {
        state.site_started();
        Self(state)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.site_finished();
    }
}

pub(crate) fn spawn_site_workers(
    jobs: Vec<SiteJob>,
    ctx: StepContext,
    max_workers: usize,
    state: Arc<BatchState>,
    result_tx: AsyncSender<CompletedSite>,
) -> tokio::task::JoinHandle<()> {
    let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
    trace!("Starting site workers with max_workers: {}", max_workers);

    tokio::spawn(async move {
        let mut tasks = JoinSet::new();
        let mut running: HashMap<Id, (usize, String)> = HashMap::new();

        for job in jobs {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Semaphore closed, no more sites will start.");
                    break;
                }
            };

            let SiteJob { index, site, entry } = job;
            let name = site.name().to_string();
            let ctx = ctx.clone();
            let state = state.clone();
            let tx = result_tx.clone();

            let handle = tasks.spawn(async move {
                let in_flight = InFlight::enter(state);
                let outcome = run_site(&ctx, site.as_ref(), entry).await;
                drop(in_flight);
                drop(permit);
                if tx.send(CompletedSite { index, outcome }).await.is_err() {
                    error!("Result channel closed before site {} was committed", index);
                }
            });
            running.insert(handle.id(), (index, name));

            while let Some(joined) = tasks.try_join_next_with_id() {
                reap(joined, &mut running, &result_tx).await;
            }
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            reap(joined, &mut running, &result_tx).await;
        }
        trace!("Site workers finished");
    })
}

async fn reap(
    joined: Result<(Id, ()), JoinError>,
    running: &mut HashMap<Id, (usize, String)>,
    result_tx: &AsyncSender<CompletedSite>,
) {
    let failure = match joined {
        Ok((id, ())) => {
            running.remove(&id);
            return;
        }
        Err(e) => e,
    };
    let Some((index, site)) = running.remove(&failure.id()) else {
        error!("Unknown site task failed: {}", failure);
        return;
    };

    let reason = if failure.is_panic() {
        format!("Sign_in=> worker panicked: {}", panic_message(failure.into_panic()))
    } else {
        format!("Sign_in=> worker cancelled: {failure}")
    };
    error!(site = %site, "{}", reason);
    let outcome = SiteOutcome::from_chain(site, ChainOutcome::failed(FailureKind::Panicked, reason));
    if result_tx.send(CompletedSite { index, outcome }).await.is_err() {
        error!("Result channel closed before site {} was committed", index);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
