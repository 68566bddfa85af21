//! Smart-tag ruleset kept in sync with a database table.
//!
//! This crate provides:
//! - Rule records and their mapping from raw source rows
//! - An atomically swapped [`RuleSnapshot`] store
//! - A coalescing [`Reloader`]: one fetch in flight, at most one queued
//! - Watch mode: a dedicated `LISTEN` connection that triggers reloads
//! - A PostgreSQL source built on `sqlx`

pub mod error;
pub mod lifecycle;
pub mod pg;
pub mod reloader;
pub mod rule;
pub mod snapshot;
pub mod source;
pub mod startup;
pub mod store;
pub mod watch;

pub use error::{ConnectionError, FetchError};
pub use lifecycle::WatchMode;
pub use pg::PgRuleSource;
pub use reloader::{ReloadResult, ReloadTicket, Reloader};
pub use rule::{RawRecord, Rule, RuleKind, TagValue};
pub use snapshot::{write_tags_file, RuleSnapshot};
pub use source::{ChangeListener, Notification, RuleSource};
pub use startup::{initialize, Ruleset};
pub use store::{ReloadStats, RuleStore, UpdateCallback};
