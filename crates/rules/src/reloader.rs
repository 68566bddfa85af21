//! Coalescing reloader.
//!
//! At most one fetch runs at a time, and at most one more is queued behind
//! it: every request that arrives while a fetch is running shares the result
//! of the single rerun that follows. A burst of change notifications therefore
//! costs the source two fetches, no matter how large the burst.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::FetchError;
use crate::rule::{RawRecord, Rule};
use crate::snapshot::RuleSnapshot;
use crate::source::RuleSource;
use crate::store::{Admission, ReloadStats, RuleStore, SharedOutcome};

/// Outcome of one reload cycle, shared by every caller coalesced onto it.
pub type ReloadResult = Result<Arc<RuleSnapshot>, FetchError>;

/// Cheap-to-clone handle to one ruleset instance and its source.
#[derive(Clone)]
pub struct Reloader {
    source: Arc<dyn RuleSource>,
    store: Arc<RuleStore>,
}

/// A registered reload request. Dropping it does not cancel anything.
#[must_use = "a ticket does nothing unless awaited; drop it to fire and forget"]
pub struct ReloadTicket {
    outcome: SharedOutcome,
    source_id: String,
}

impl ReloadTicket {
    /// Wait for the cycle this request was assigned to.
    pub async fn wait(self) -> ReloadResult {
        match self.outcome.await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Interrupted {
                source_id: self.source_id,
            }),
        }
    }
}

impl Reloader {
    pub fn new(source: Arc<dyn RuleSource>) -> Self {
        Self::with_store(source, Arc::new(RuleStore::new()))
    }

    pub fn with_store(source: Arc<dyn RuleSource>, store: Arc<RuleStore>) -> Self {
        Self { source, store }
    }

    pub fn source(&self) -> &Arc<dyn RuleSource> {
        &self.source
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    /// The active snapshot.
    pub fn current(&self) -> Arc<RuleSnapshot> {
        self.store.current()
    }

    pub fn stats(&self) -> ReloadStats {
        self.store.stats()
    }

    /// Reload and wait for the result.
    ///
    /// If a reload is already running, this waits for the one rerun queued
    /// behind it instead of starting another fetch.
    pub async fn reload(&self) -> ReloadResult {
        self.request().wait().await
    }

    /// Register a reload request without waiting for it.
    ///
    /// Admission happens synchronously, before this returns, so callers that
    /// fire requests in a loop are coalesced deterministically. The fetch runs
    /// on its own task; a dropped ticket never cancels it. Must be called from
    /// within a Tokio runtime.
    pub fn request(&self) -> ReloadTicket {
        let source_id = self.source.describe();
        let outcome = match self.store.admit() {
            Admission::Lead { tx, outcome } => {
                debug!(source = %source_id, "starting reload");
                tokio::spawn(self.clone().drive(tx));
                outcome
            }
            Admission::Join { outcome } => {
                debug!(source = %source_id, "reload in flight, request coalesced into rerun");
                outcome
            }
        };
        ReloadTicket { outcome, source_id }
    }

    /// Run cycles until no rerun is queued. Owns the in-progress slot for its
    /// whole lifetime.
    async fn drive(self, mut tx: oneshot::Sender<ReloadResult>) {
        loop {
            let outcome = self.fetch_and_publish().await;
            // Every waiter may have given up; the cycle still counts.
            let _ = tx.send(outcome);
            match self.store.finish_cycle() {
                Some(next) => {
                    debug!(source = %self.source.describe(), "running queued rerun");
                    tx = next;
                }
                None => break,
            }
        }
    }

    async fn fetch_and_publish(&self) -> ReloadResult {
        let source_id = self.source.describe();
        let started = Instant::now();

        let fetched = match AssertUnwindSafe(self.source.fetch_rules()).catch_unwind().await {
            Ok(fetched) => fetched,
            Err(_) => {
                error!(source = %source_id, "rule source panicked during fetch");
                Err(FetchError::Interrupted {
                    source_id: source_id.clone(),
                })
            }
        };
        let outcome = fetched
            .and_then(|records| map_records(&source_id, &records))
            .map(|rules| self.store.publish(rules));
        self.store.record_outcome(&outcome);

        match &outcome {
            Ok(snapshot) => {
                info!(
                    source = %source_id,
                    version = snapshot.version(),
                    rules = snapshot.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "reloaded rules"
                );
                self.store.deliver(snapshot);
            }
            Err(e) => {
                warn!(
                    source = %source_id,
                    error = %e,
                    version = self.store.current().version(),
                    "reload failed, keeping previous rules"
                );
            }
        }
        outcome
    }
}

fn map_records(source_id: &str, records: &[RawRecord]) -> Result<Vec<Rule>, FetchError> {
    records
        .iter()
        .enumerate()
        .map(|(index, raw)| {
            Rule::from_raw(raw).map_err(|reason| FetchError::Malformed {
                source_id: source_id.to_string(),
                index,
                identifier: raw.identifier.clone(),
                reason,
            })
        })
        .collect()
}
