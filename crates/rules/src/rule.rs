//! Rule records: the raw row shape a source returns and the immutable
//! [`Rule`] it is mapped into.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize, Serializer};

/// What kind of database object a rule's `match` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Class,
    Attribute,
    Constraint,
    Procedure,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Attribute => "attribute",
            Self::Constraint => "constraint",
            Self::Procedure => "procedure",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "class" => Ok(Self::Class),
            "attribute" => Ok(Self::Attribute),
            "constraint" => Ok(Self::Constraint),
            "procedure" => Ok(Self::Procedure),
            other => Err(format!(
                "unknown kind '{}': must be one of class, attribute, constraint, procedure",
                other
            )),
        }
    }
}

/// Value of a single smart tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagValue {
    /// Bare tag, stored as JSON `true`.
    Flag,
    Text(String),
    List(Vec<String>),
}

impl TagValue {
    /// Accepts `true`, a string, or an array of strings.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        match value {
            serde_json::Value::Bool(true) => Ok(Self::Flag),
            serde_json::Value::String(s) => Ok(Self::Text(s.clone())),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    serde_json::Value::String(s) => Ok(s.clone()),
                    other => Err(format!("list entries must be strings, got {}", other)),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            other => Err(format!("expected true, a string or a list of strings, got {}", other)),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Flag => serde_json::Value::Bool(true),
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => serde_json::Value::Array(
                items.iter().cloned().map(serde_json::Value::String).collect(),
            ),
        }
    }
}

impl Serialize for TagValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Flag => serializer.serialize_bool(true),
            Self::Text(s) => serializer.serialize_str(s),
            Self::List(items) => items.serialize(serializer),
        }
    }
}

/// A row as returned by the data source, before any interpretation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub kind: String,
    pub identifier: String,
    pub description: Option<String>,
    pub tags: serde_json::Value,
}

/// One tag-application rule. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rule {
    pub kind: RuleKind,
    #[serde(rename = "match")]
    pub matches: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub tags: IndexMap<String, TagValue>,
}

impl Rule {
    /// Map a raw record into a rule. A `null` tags column counts as no tags.
    pub fn from_raw(raw: &RawRecord) -> Result<Self, String> {
        let kind = raw.kind.parse::<RuleKind>()?;
        let tags = match &raw.tags {
            serde_json::Value::Null => IndexMap::new(),
            serde_json::Value::Object(map) => map
                .iter()
                .map(|(name, value)| {
                    TagValue::from_json(value)
                        .map(|tag| (name.clone(), tag))
                        .map_err(|e| format!("tag '{}': {}", name, e))
                })
                .collect::<Result<IndexMap<_, _>, _>>()?,
            other => return Err(format!("tags must be a JSON object, got {}", other)),
        };
        Ok(Self {
            kind,
            matches: raw.identifier.clone(),
            description: raw.description.clone(),
            tags,
        })
    }
}
