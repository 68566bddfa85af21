//! Watch session: the task that owns the dedicated notification connection
//! and turns change notifications into reload requests.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::reloader::Reloader;
use crate::source::ChangeListener;

/// One enabled period of watch mode.
///
/// The connection lives inside the session task and is released by that
/// task, exactly once, when the receive loop ends.
pub struct WatchSession {
    generation: u64,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl WatchSession {
    pub(crate) fn spawn(
        listener: Box<dyn ChangeListener>,
        reloader: Reloader,
        channel: String,
        generation: u64,
    ) -> Self {
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(run(
            listener,
            reloader,
            channel,
            generation,
            Arc::clone(&shutdown),
        ));
        Self {
            generation,
            shutdown,
            task: Some(task),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// False once the receive loop has ended (connection lost or stopped).
    pub fn is_alive(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the loop and wait until the connection has been released.
    pub(crate) async fn stop(mut self) {
        // notify_one stores a permit, so this also works if the loop is not
        // parked in select! yet.
        self.shutdown.notify_one();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(generation = self.generation, error = %e, "watch session task ended abnormally");
            }
        }
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.shutdown.notify_one();
        }
    }
}

async fn run(
    mut listener: Box<dyn ChangeListener>,
    reloader: Reloader,
    channel: String,
    generation: u64,
    shutdown: Arc<Notify>,
) {
    let source_id = reloader.source().describe();
    info!(source = %source_id, channel = %channel, generation, "watch session listening");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => {
                debug!(generation, "watch session stop requested");
                break;
            }
            received = listener.recv() => match received {
                Ok(Some(notification)) if notification.channel == channel => {
                    if reloader.store().watch_generation() != generation {
                        debug!(generation, "watch generation superseded, ignoring notification");
                        break;
                    }
                    debug!(
                        channel = %notification.channel,
                        payload = %notification.payload,
                        "change notification received"
                    );
                    // Outcome is logged by the reload cycle; delivery goes
                    // through the store's callback slot.
                    let _ = reloader.request();
                }
                Ok(Some(notification)) => {
                    debug!(channel = %notification.channel, "ignoring notification on unrelated channel");
                }
                Ok(None) => {
                    retire(&reloader, generation);
                    warn!(
                        source = %source_id,
                        channel = %channel,
                        "notification connection closed; watch mode will not reconnect"
                    );
                    break;
                }
                Err(e) => {
                    retire(&reloader, generation);
                    warn!(
                        source = %source_id,
                        channel = %channel,
                        error = %e,
                        "notification connection failed; watch mode will not reconnect"
                    );
                    break;
                }
            }
        }
    }

    listener.close().await;
    info!(source = %source_id, channel = %channel, generation, "watch session closed its connection");
}

/// Without a connection nothing will trigger reloads for this session, so its
/// consumer stops receiving manual ones too.
fn retire(reloader: &Reloader, generation: u64) {
    if reloader.store().retire_watch(generation) {
        debug!(generation, "watch callback removed after connection loss");
    }
}
