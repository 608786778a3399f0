//! Error types shared by the engine and the warehouse stores

use thiserror::Error;

/// The batch's column set differs from the expected schema.
/// Fatal for the whole batch: nothing is partitioned, nothing is written.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Schema mismatch in batch{}", column_lists(.missing, .unexpected))]
pub struct SchemaMismatch {
    /// Expected columns absent from the batch
    pub missing: Vec<String>,
    /// Batch columns the schema does not know, repeats included
    pub unexpected: Vec<String>,
}

fn column_lists(missing: &[String], unexpected: &[String]) -> String {
    let mut out = String::new();
    if !missing.is_empty() {
        out.push_str(&format!("; missing columns: {}", missing.join(", ")));
    }
    if !unexpected.is_empty() {
        out.push_str(&format!("; unexpected columns: {}", unexpected.join(", ")));
    }
    out
}

/// Failure talking to a store
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite operation error (wraps rusqlite::Error)
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// CSV read error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// I/O operation error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored value could not be decoded into the record model
    #[error("Corrupt value in {table}.{column}: {value}")]
    Corrupt {
        table: &'static str,
        column: &'static str,
        value: String,
    },

    /// Serialization error for audit payloads
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration loading or validation error
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_mismatch_message_lists_columns() {
        let err = SchemaMismatch {
            missing: vec!["status".to_string()],
            unexpected: vec!["discount".to_string(), "channel".to_string()],
        };

        assert_eq!(
            err.to_string(),
            "Schema mismatch in batch; missing columns: status; unexpected columns: discount, channel"
        );
    }
}
