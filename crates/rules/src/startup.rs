//! Startup: the initial load that must succeed before anything else runs.

use std::sync::Arc;

use tracing::{error, info};

use crate::error::FetchError;
use crate::lifecycle::WatchMode;
use crate::reloader::Reloader;
use crate::snapshot::RuleSnapshot;
use crate::source::RuleSource;

/// Everything a running instance needs, built from one source.
pub struct Ruleset {
    pub reloader: Reloader,
    /// Disabled until the caller enables it.
    pub watch: WatchMode,
    /// Result of the startup load.
    pub initial: Arc<RuleSnapshot>,
}

/// Load the ruleset once and wire up (but do not enable) watch mode.
///
/// A failed load is fatal: tags may restrict access, so an instance must not
/// come up on an empty or stale ruleset. On failure no watch mode exists and
/// no dedicated connection has been opened.
pub async fn initialize(
    source: Arc<dyn RuleSource>,
    channel: impl Into<String>,
) -> Result<Ruleset, FetchError> {
    let reloader = Reloader::new(source);
    let initial = match reloader.reload().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!(source = %e.source_id(), error = %e, "initial rules load failed");
            return Err(e);
        }
    };
    info!(
        source = %reloader.source().describe(),
        version = initial.version(),
        rules = initial.len(),
        "initial rules loaded"
    );

    let watch = WatchMode::new(reloader.clone(), channel);
    Ok(Ruleset {
        reloader,
        watch,
        initial,
    })
}
