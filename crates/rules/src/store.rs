//! [`RuleStore`]: the current snapshot, the reload state machine, and the
//! consumer callback slot.
//!
//! All locks here are `std::sync` and are never held across an `.await`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use futures::future::{FutureExt, Shared};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::reloader::ReloadResult;
use crate::rule::Rule;
use crate::snapshot::RuleSnapshot;

/// Receives each new snapshot while watch mode is enabled.
///
/// Runs synchronously on a runtime thread while the callback slot is locked,
/// and disabling watch mode waits for it. Keep it short; hand slow work
/// (network calls, large writes) to a task or channel.
pub type UpdateCallback = Arc<dyn Fn(Arc<RuleSnapshot>) + Send + Sync>;

/// Completion handle shared by every caller waiting on one reload cycle.
pub(crate) type SharedOutcome = Shared<oneshot::Receiver<ReloadResult>>;

/// Counters describing reload activity since the store was created.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadStats {
    /// Reload requests received, coalesced or not.
    pub requests: u64,
    /// Requests that attached to an already queued rerun.
    pub coalesced: u64,
    /// Fetches actually run against the source.
    pub fetches: u64,
    pub failures: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// The slot a request lands in.
pub(crate) enum Admission {
    /// No reload was running: the caller now owns the in-progress slot and
    /// must drive a cycle, reporting through `tx`.
    Lead {
        tx: oneshot::Sender<ReloadResult>,
        outcome: SharedOutcome,
    },
    /// A reload is running; wait for the rerun queued behind it.
    Join { outcome: SharedOutcome },
}

struct PendingRerun {
    tx: oneshot::Sender<ReloadResult>,
    outcome: SharedOutcome,
}

impl PendingRerun {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx,
            outcome: rx.shared(),
        }
    }
}

/// `pending` is only ever `Some` while `in_progress` is true.
#[derive(Default)]
struct ReloadState {
    in_progress: bool,
    pending: Option<PendingRerun>,
    stats: ReloadStats,
}

#[derive(Default)]
struct WatchSlot {
    generation: u64,
    callback: Option<UpdateCallback>,
}

/// Single point of truth for one ruleset instance.
pub struct RuleStore {
    current: RwLock<Arc<RuleSnapshot>>,
    reload: Mutex<ReloadState>,
    watch: Mutex<WatchSlot>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RuleStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(RuleSnapshot::empty())),
            reload: Mutex::new(ReloadState::default()),
            watch: Mutex::new(WatchSlot::default()),
        }
    }

    /// The active snapshot. Always fully formed.
    pub fn current(&self) -> Arc<RuleSnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn is_reloading(&self) -> bool {
        lock(&self.reload).in_progress
    }

    pub fn stats(&self) -> ReloadStats {
        lock(&self.reload).stats.clone()
    }

    // ── reload state machine ────────────────────────────────────────

    /// Claim the in-progress slot, or attach to the (single) queued rerun.
    pub(crate) fn admit(&self) -> Admission {
        let mut state = lock(&self.reload);
        state.stats.requests += 1;
        if !state.in_progress {
            state.in_progress = true;
            let PendingRerun { tx, outcome } = PendingRerun::new();
            return Admission::Lead { tx, outcome };
        }
        if state.pending.is_some() {
            state.stats.coalesced += 1;
        }
        let outcome = state
            .pending
            .get_or_insert_with(PendingRerun::new)
            .outcome
            .clone();
        Admission::Join { outcome }
    }

    /// End the current cycle. If a rerun was queued, the slot passes straight
    /// to it and its sender is returned; otherwise the slot is released.
    pub(crate) fn finish_cycle(&self) -> Option<oneshot::Sender<ReloadResult>> {
        let mut state = lock(&self.reload);
        match state.pending.take() {
            Some(rerun) => Some(rerun.tx),
            None => {
                state.in_progress = false;
                None
            }
        }
    }

    pub(crate) fn record_outcome(&self, outcome: &ReloadResult) {
        let mut state = lock(&self.reload);
        state.stats.fetches += 1;
        match outcome {
            Ok(_) => {
                state.stats.last_success_at = Some(Utc::now());
                state.stats.last_error = None;
            }
            Err(e) => {
                state.stats.failures += 1;
                state.stats.last_error = Some(e.to_string());
            }
        }
    }

    /// Swap in a new snapshot built from `rules`.
    pub(crate) fn publish(&self, rules: Vec<Rule>) -> Arc<RuleSnapshot> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let snapshot = Arc::new(RuleSnapshot::new(current.version() + 1, rules));
        *current = Arc::clone(&snapshot);
        snapshot
    }

    // ── watch callback slot ─────────────────────────────────────────

    /// Start a new watch generation; any callback from an older one is gone.
    pub(crate) fn begin_watch(&self) -> u64 {
        let mut slot = lock(&self.watch);
        slot.generation += 1;
        slot.callback = None;
        slot.generation
    }

    /// Install `callback` if `generation` is still current. Returns false when
    /// watch mode was disabled in the meantime.
    pub(crate) fn install_callback(&self, generation: u64, callback: UpdateCallback) -> bool {
        let mut slot = lock(&self.watch);
        if slot.generation != generation {
            return false;
        }
        slot.callback = Some(callback);
        true
    }

    /// Disable delivery immediately. Once this returns, no callback runs
    /// until a new generation installs one.
    pub(crate) fn end_watch(&self) -> u64 {
        let mut slot = lock(&self.watch);
        slot.generation += 1;
        slot.callback = None;
        slot.generation
    }

    /// Drop the callback of `generation` if it is still the current one.
    /// Used by a session whose connection is gone; a newer generation is left
    /// untouched.
    pub(crate) fn retire_watch(&self, generation: u64) -> bool {
        let mut slot = lock(&self.watch);
        if slot.generation != generation {
            return false;
        }
        slot.callback = None;
        true
    }

    pub fn watch_generation(&self) -> u64 {
        lock(&self.watch).generation
    }

    /// Whether a consumer callback is currently registered.
    pub fn has_callback(&self) -> bool {
        lock(&self.watch).callback.is_some()
    }

    /// Hand `snapshot` to the registered callback, if any.
    ///
    /// Runs under the slot lock so `end_watch` cannot return while a delivery
    /// is still executing. The lock is a blocking one: a slow callback also
    /// holds up `end_watch` callers on their runtime thread until it returns.
    pub(crate) fn deliver(&self, snapshot: &Arc<RuleSnapshot>) {
        let slot = lock(&self.watch);
        let Some(callback) = slot.callback.as_ref() else {
            debug!(version = snapshot.version(), "no watch callback registered, skipping delivery");
            return;
        };
        let snapshot = Arc::clone(snapshot);
        if catch_unwind(AssertUnwindSafe(|| callback(snapshot))).is_err() {
            error!("watch callback panicked; keeping it registered");
        }
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}
