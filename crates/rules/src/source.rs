use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ConnectionError, FetchError};
use crate::rule::RawRecord;

/// A change signal received on the dedicated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// Where rules come from.
///
/// Fetches are point-in-time queries and may run on any connection the
/// source likes. [`listen`](RuleSource::listen) opens the one dedicated
/// connection watch mode holds for as long as it is enabled.
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Identifier used in logs and error context (never contains credentials).
    fn describe(&self) -> String;

    /// Run the "current ruleset" query.
    async fn fetch_rules(&self) -> Result<Vec<RawRecord>, FetchError>;

    /// Acquire a dedicated connection and subscribe it to `channel`.
    async fn listen(&self, channel: &str) -> Result<Box<dyn ChangeListener>, ConnectionError>;
}

/// Blanket implementation so `Arc<dyn RuleSource>` can be used directly.
#[async_trait]
impl<T: RuleSource + ?Sized> RuleSource for Arc<T> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    async fn fetch_rules(&self) -> Result<Vec<RawRecord>, FetchError> {
        (**self).fetch_rules().await
    }

    async fn listen(&self, channel: &str) -> Result<Box<dyn ChangeListener>, ConnectionError> {
        (**self).listen(channel).await
    }
}

/// The subscribed side of a dedicated connection.
#[async_trait]
pub trait ChangeListener: Send {
    /// Wait for the next notification. `Ok(None)` means the connection closed.
    ///
    /// Must be cancel-safe: the watch loop races it against shutdown.
    async fn recv(&mut self) -> Result<Option<Notification>, ConnectionError>;

    /// Unsubscribe and release the connection. Consumes the listener so the
    /// connection is released exactly once.
    async fn close(self: Box<Self>);
}
