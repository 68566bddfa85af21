//! tagwatch-worker: loads the smart-tags ruleset and keeps it fresh.
//!
//! - Startup: one reload; failure aborts the process.
//! - Watch mode (`--watch` / `TAGS_WATCH`): LISTENs on `postgraphile_watch`
//!   and reloads on every change notification, coalescing bursts.
//! - `SIGHUP` triggers a manual reload; `SIGINT`/`SIGTERM` shut down.
//!
//! Each new snapshot is written to `--output` when set. Without watch mode
//! and without an output path, the tags document is printed to stdout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use tagwatch_core::config::{load_dotenv, Config};
use tagwatch_rules::{
    initialize, write_tags_file, PgRuleSource, Reloader, RuleSnapshot, Ruleset, UpdateCallback,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Smart-tags worker: load rules from PostgreSQL and watch for changes.
#[derive(Parser, Debug)]
#[command(name = "tagwatch-worker", version, about)]
struct Cli {
    /// Config profile; env keys are looked up as {PROFILE}_{KEY} first.
    #[arg(long, env = "TAGWATCH_PROFILE", default_value = "")]
    profile: String,

    /// Table holding the rules (overrides TAGS_TABLE).
    #[arg(long)]
    table: Option<String>,

    /// Keep running and reload on change notifications.
    #[arg(long)]
    watch: bool,

    /// Write the tags document here after every reload (overrides TAGS_OUTPUT).
    #[arg(long)]
    output: Option<PathBuf>,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();

    let mut config = Config::for_profile(&cli.profile);
    if let Some(table) = cli.table {
        config.tags.table = table;
    }
    if cli.output.is_some() {
        config.tags.output = cli.output;
    }
    config.tags.watch |= cli.watch;
    config.validate()?;
    config.log_summary();

    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .connect(&config.postgres.database_url())
        .await
        .with_context(|| format!("failed to connect to {}", config.postgres.describe()))?;
    let source = PgRuleSource::new(pool, &config.tags.table, config.postgres.describe())?;

    let Ruleset { reloader, watch, initial } = initialize(Arc::new(source), config.tags.channel.clone())
        .await
        .context("initial smart tags load failed")?;

    match &config.tags.output {
        Some(path) => {
            write_tags_file(path, &initial)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        None if !config.tags.watch => {
            let document = serde_json::to_string_pretty(&initial.to_tags_document())?;
            println!("{}", document);
        }
        None => {}
    }

    if !config.tags.watch {
        return Ok(());
    }

    watch
        .set_watch_mode(Some(output_callback(config.tags.output.clone())))
        .await
        .context("failed to enable watch mode")?;

    wait_for_shutdown(&reloader).await?;

    watch.set_watch_mode(None).await?;
    let stats = reloader.stats();
    info!(
        fetches = stats.fetches,
        failures = stats.failures,
        coalesced = stats.coalesced,
        "tagwatch-worker exited cleanly"
    );
    Ok(())
}

/// Consumer for watch mode: persist each snapshot (when configured) and log it.
fn output_callback(output: Option<PathBuf>) -> UpdateCallback {
    Arc::new(move |snapshot: Arc<RuleSnapshot>| {
        info!(version = snapshot.version(), rules = snapshot.len(), "rules updated");
        if let Some(path) = &output {
            if let Err(e) = write_tags_file(path, &snapshot) {
                warn!(path = %path.display(), error = %e, "failed to write tags file, keeping previous file");
            }
        }
    })
}

/// Block until SIGINT/SIGTERM, reloading on SIGHUP (Unix) in the meantime.
async fn wait_for_shutdown(reloader: &Reloader) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
        let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
        let mut sighup = signal(SignalKind::hangup()).context("failed to register SIGHUP")?;
        loop {
            tokio::select! {
                _ = sigint.recv() => break,
                _ = sigterm.recv() => break,
                _ = sighup.recv() => {
                    info!("SIGHUP received, reloading rules");
                    let ticket = reloader.request();
                    tokio::spawn(async move {
                        if let Err(e) = ticket.wait().await {
                            warn!(error = %e, "manual reload failed");
                        }
                    });
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = reloader;
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl_c")?;
    }

    info!("shutdown signal received");
    Ok(())
}
