use thiserror::Error;

/// Invalid configuration supplied at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid tags table name '{0}': expected `table` or `schema.table` made of plain identifiers")]
    InvalidTableName(String),

    #[error("no database configured: set PG_URL or PG_HOST/PG_DATABASE")]
    MissingDatabase,

    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
}
