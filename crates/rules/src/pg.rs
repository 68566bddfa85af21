//! PostgreSQL-backed [`RuleSource`].
//!
//! Fetches run on a [`PgPool`]. Watch mode checks one connection out of the
//! same pool for its [`PgListener`] and holds it for the whole session, so the
//! pool needs room for at least one fetch besides it.

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool};
use tracing::debug;

use tagwatch_core::config::validate_table_name;
use tagwatch_core::ConfigError;

use crate::error::{ConnectionError, FetchError};
use crate::rule::RawRecord;
use crate::source::{ChangeListener, Notification, RuleSource};

#[derive(Debug, sqlx::FromRow)]
struct SmartTagRow {
    kind: String,
    identifier: String,
    description: Option<String>,
    tags: Option<serde_json::Value>,
}

impl From<SmartTagRow> for RawRecord {
    fn from(row: SmartTagRow) -> Self {
        Self {
            kind: row.kind,
            identifier: row.identifier,
            description: row.description,
            tags: row.tags.unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Reads rules from a `smart_tags`-shaped table:
/// `(kind text, identifier text, description text null, tags jsonb)`.
pub struct PgRuleSource {
    pool: PgPool,
    table: String,
    query: String,
    source_id: String,
}

impl PgRuleSource {
    /// `table` is interpolated into the query, so it must pass
    /// [`validate_table_name`]. `source_id` names the database in logs.
    pub fn new(pool: PgPool, table: &str, source_id: impl Into<String>) -> Result<Self, ConfigError> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            query: format!("SELECT kind, identifier, description, tags FROM {}", table),
            source_id: source_id.into(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn fetch_error(source_id: &str, operation: &'static str, err: sqlx::Error) -> FetchError {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            FetchError::Unreachable {
                source_id: source_id.to_string(),
                operation,
                message: err.to_string(),
            }
        }
        other => FetchError::Query {
            source_id: source_id.to_string(),
            operation,
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl RuleSource for PgRuleSource {
    fn describe(&self) -> String {
        format!("{} ({})", self.source_id, self.table)
    }

    async fn fetch_rules(&self) -> Result<Vec<RawRecord>, FetchError> {
        let rows = sqlx::query_as::<_, SmartTagRow>(&self.query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| fetch_error(&self.describe(), "fetch smart tags", e))?;

        debug!(source = %self.describe(), rows = rows.len(), "fetched smart tag rows");
        Ok(rows.into_iter().map(RawRecord::from).collect())
    }

    async fn listen(&self, channel: &str) -> Result<Box<dyn ChangeListener>, ConnectionError> {
        let source_id = self.describe();
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| ConnectionError::Acquire {
                source_id: source_id.clone(),
                message: e.to_string(),
            })?;
        // A lost connection ends the session instead of silently reconnecting.
        listener.eager_reconnect(false);
        listener
            .listen(channel)
            .await
            .map_err(|e| ConnectionError::Subscribe {
                source_id: source_id.clone(),
                channel: channel.to_string(),
                message: e.to_string(),
            })?;

        debug!(source = %source_id, channel = %channel, "listening for change notifications");
        Ok(Box::new(PgChangeListener {
            inner: listener,
            source_id,
        }))
    }
}

struct PgChangeListener {
    inner: PgListener,
    source_id: String,
}

#[async_trait]
impl ChangeListener for PgChangeListener {
    async fn recv(&mut self) -> Result<Option<Notification>, ConnectionError> {
        match self.inner.try_recv().await {
            Ok(Some(notification)) => Ok(Some(Notification {
                channel: notification.channel().to_string(),
                payload: notification.payload().to_string(),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(ConnectionError::Receive {
                source_id: self.source_id.clone(),
                message: e.to_string(),
            }),
        }
    }

    async fn close(mut self: Box<Self>) {
        if let Err(e) = self.inner.unlisten_all().await {
            debug!(source = %self.source_id, error = %e, "UNLISTEN failed while closing, dropping connection");
        }
    }
}
