//! [`RuleSnapshot`]: one complete, immutable generation of the ruleset.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::rule::Rule;

/// The active ruleset as of one successful reload.
///
/// Snapshots are shared as `Arc<RuleSnapshot>` and never mutated; a reload
/// builds a new one and swaps it in.
#[derive(Debug, Clone)]
pub struct RuleSnapshot {
    version: u64,
    loaded_at: DateTime<Utc>,
    rules: Vec<Rule>,
}

impl RuleSnapshot {
    /// The snapshot held before the first reload completes.
    pub fn empty() -> Self {
        Self {
            version: 0,
            loaded_at: Utc::now(),
            rules: Vec::new(),
        }
    }

    pub fn new(version: u64, rules: Vec<Rule>) -> Self {
        Self {
            version,
            loaded_at: Utc::now(),
            rules,
        }
    }

    /// Monotonic counter, bumped by every successful reload. 0 = never loaded.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Render as a smart-tags JSON document:
    /// `{"version":1,"config":{"<kind>":{"<match>":{"tags":{..},"description":".."}}}}`.
    ///
    /// Rules sharing a kind and match are merged in order; later tags and
    /// descriptions override earlier ones.
    pub fn to_tags_document(&self) -> Value {
        let mut config: Map<String, Value> = Map::new();
        for rule in &self.rules {
            let by_match = config
                .entry(rule.kind.as_str())
                .or_insert_with(|| Value::Object(Map::new()));
            let Value::Object(by_match) = by_match else { continue };
            let entry = by_match
                .entry(rule.matches.clone())
                .or_insert_with(|| json!({ "tags": {} }));
            let Value::Object(entry) = entry else { continue };

            if let Some(Value::Object(tags)) = entry.get_mut("tags") {
                for (name, value) in &rule.tags {
                    tags.insert(name.clone(), value.to_json());
                }
            }
            if let Some(description) = &rule.description {
                entry.insert("description".to_string(), Value::String(description.clone()));
            }
        }
        let mut document = Map::new();
        document.insert("version".to_string(), Value::from(1));
        document.insert("config".to_string(), Value::Object(config));
        Value::Object(document)
    }
}

/// Atomically write the snapshot's tags document to `path`.
///
/// Writes to a dotted `.tmp` sibling first, then renames over the target so
/// readers never see a partial file.
pub fn write_tags_file(path: &Path, snapshot: &RuleSnapshot) -> io::Result<PathBuf> {
    let body = serde_json::to_string_pretty(&snapshot.to_tags_document())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "output path has no file name"))?;
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));

    fs::write(&tmp_path, body)?;
    fs::rename(&tmp_path, path)?;

    info!(
        path = %path.display(),
        version = snapshot.version(),
        rules = snapshot.len(),
        "wrote tags file"
    );
    Ok(path.to_path_buf())
}
