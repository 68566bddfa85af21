//! [`WatchMode`]: the single place watch sessions are created and destroyed.

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::ConnectionError;
use crate::reloader::Reloader;
use crate::store::UpdateCallback;
use crate::watch::WatchSession;

/// Enables and disables watch mode for one ruleset.
///
/// Lifecycle calls are serialized on an async mutex that is held across
/// connection acquisition, so a second enable issued while the first is still
/// connecting waits for it and then reuses its session. Disable bumps the
/// watch generation before taking that mutex: an enable still connecting when
/// disable arrives sees the bump, releases what it acquired and backs off.
pub struct WatchMode {
    reloader: Reloader,
    channel: String,
    session: Mutex<Option<WatchSession>>,
}

impl WatchMode {
    pub fn new(reloader: Reloader, channel: impl Into<String>) -> Self {
        Self {
            reloader,
            channel: channel.into(),
            session: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// `Some(callback)` enables watch mode (or swaps the callback if it is
    /// already enabled); `None` disables it.
    ///
    /// The callback runs inside the reload cycle and must not call back into
    /// `set_watch_mode`.
    pub async fn set_watch_mode(&self, callback: Option<UpdateCallback>) -> Result<(), ConnectionError> {
        match callback {
            Some(callback) => self.enable(callback).await,
            None => {
                self.disable().await;
                Ok(())
            }
        }
    }

    pub async fn enable(&self, callback: UpdateCallback) -> Result<(), ConnectionError> {
        let store = self.reloader.store();
        let mut session = self.session.lock().await;

        if let Some(active) = session.as_ref() {
            if active.is_alive() && store.install_callback(active.generation(), callback.clone()) {
                debug!(channel = %self.channel, "watch mode already enabled, callback replaced");
                return Ok(());
            }
        }
        // A session whose loop ended (lost connection) has already released
        // its connection; reap it before starting fresh.
        if let Some(dead) = session.take() {
            dead.stop().await;
        }

        let generation = store.begin_watch();
        let listener = self.reloader.source().listen(&self.channel).await?;
        if !store.install_callback(generation, callback) {
            info!(
                channel = %self.channel,
                "watch mode disabled while connecting, releasing connection"
            );
            listener.close().await;
            return Ok(());
        }

        *session = Some(WatchSession::spawn(
            listener,
            self.reloader.clone(),
            self.channel.clone(),
            generation,
        ));
        info!(
            source = %self.reloader.source().describe(),
            channel = %self.channel,
            generation,
            "watch mode enabled"
        );
        Ok(())
    }

    /// Disable watch mode. No-op (and no connection traffic) when already
    /// disabled. Returns once the dedicated connection has been released.
    pub async fn disable(&self) {
        // Takes effect immediately, before any in-flight enable finishes.
        let generation = self.reloader.store().end_watch();

        let mut session = self.session.lock().await;
        // Enables queued ahead of us on the lock may have started a newer
        // generation and installed a callback; retire that one too.
        let generation = match session.as_ref() {
            Some(active) if active.generation() > generation => self.reloader.store().end_watch(),
            _ => generation,
        };
        match session.take() {
            Some(active) => {
                active.stop().await;
                info!(channel = %self.channel, generation, "watch mode disabled");
            }
            None => debug!(channel = %self.channel, "watch mode already disabled"),
        }
    }

    /// Whether a session is running and listening.
    pub async fn is_enabled(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(WatchSession::is_alive)
    }
}
