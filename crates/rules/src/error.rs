//! Error types for fetching rules and holding the notification connection.

use thiserror::Error;

/// A reload could not produce a new snapshot.
///
/// Payloads are plain strings so one outcome can be cloned out to every
/// caller that was coalesced onto the same fetch.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The source could not be reached (network, TLS, pool exhaustion).
    #[error("{source_id}: source unreachable during {operation}: {message}")]
    Unreachable {
        source_id: String,
        operation: &'static str,
        message: String,
    },

    /// The source answered but the query failed.
    #[error("{source_id}: {operation} failed: {message}")]
    Query {
        source_id: String,
        operation: &'static str,
        message: String,
    },

    /// A fetched record could not be turned into a rule.
    #[error("{source_id}: malformed record #{index} ('{identifier}'): {reason}")]
    Malformed {
        source_id: String,
        index: usize,
        identifier: String,
        reason: String,
    },

    /// The task running the reload went away before reporting a result.
    #[error("{source_id}: reload interrupted before completing")]
    Interrupted { source_id: String },
}

impl FetchError {
    /// Identifier of the source the failed fetch ran against.
    pub fn source_id(&self) -> &str {
        match self {
            Self::Unreachable { source_id, .. }
            | Self::Query { source_id, .. }
            | Self::Malformed { source_id, .. }
            | Self::Interrupted { source_id } => source_id,
        }
    }
}

/// Failures on the dedicated notification connection.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("{source_id}: failed to open notification connection: {message}")]
    Acquire { source_id: String, message: String },

    #[error("{source_id}: failed to LISTEN on '{channel}': {message}")]
    Subscribe {
        source_id: String,
        channel: String,
        message: String,
    },

    #[error("{source_id}: notification receive failed: {message}")]
    Receive { source_id: String, message: String },
}
