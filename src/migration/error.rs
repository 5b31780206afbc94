//! Migration-specific error types

use crate::executor::RowError;

/// Migration-specific errors
#[derive(Debug)]
pub enum MigrationError {
    /// Database execution error
    Database(RowError),
    /// Migration lock timeout
    LockTimeout(String),
    /// Two registered migrations share a version
    DuplicateVersion { version: i64, name: String },
    /// Migration failed during execution
    ExecutionFailed {
        version: i64,
        name: String,
        error: String,
    },
}

impl std::fmt::Display for MigrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationError::Database(e) => write!(f, "Database error: {e}"),
            MigrationError::LockTimeout(msg) => {
                write!(
                    f,
                    "Migration lock timeout: {msg}\n\
                     Another process may be running migrations. If this persists, check for a \
                     stale lock row (version = -1) in rowguard_migrations."
                )
            }
            MigrationError::DuplicateVersion { version, name } => {
                write!(
                    f,
                    "Migration '{name}' reuses version {version}, which is already registered"
                )
            }
            MigrationError::ExecutionFailed {
                version,
                name,
                error,
            } => {
                write!(
                    f,
                    "Migration '{name}' (version {version}) failed during execution: {error}"
                )
            }
        }
    }
}

impl std::error::Error for MigrationError {}

impl From<RowError> for MigrationError {
    fn from(error: RowError) -> Self {
        MigrationError::Database(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_migration() {
        let err = MigrationError::ExecutionFailed {
            version: 20260115093000,
            name: "create_mutation_pipeline_schema".to_string(),
            error: "relation exists".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("create_mutation_pipeline_schema"));
        assert!(msg.contains("20260115093000"));
    }
}
