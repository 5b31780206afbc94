//! Migration trait definition

use super::schema_manager::SchemaManager;
use crate::executor::RowError;

/// Trait that all migrations must implement
///
/// Coroutine runtime, so `up()`/`down()` are synchronous; the executor
/// handles scheduling.
pub trait Migration: Send + Sync {
    /// Human-readable identifier
    fn name(&self) -> &str;

    /// Migration version (timestamp: YYYYMMDDHHMMSS)
    fn version(&self) -> i64;

    /// Apply the migration
    fn up(&self, manager: &SchemaManager<'_>) -> Result<(), RowError>;

    /// Roll the migration back
    fn down(&self, manager: &SchemaManager<'_>) -> Result<(), RowError>;
}
