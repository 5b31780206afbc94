//! Migration execution

use super::error::MigrationError;
use super::lock::MigrationLockGuard;
use super::migration::Migration;
use super::schema_manager::SchemaManager;
use crate::executor::RowExecutor;
use chrono::Utc;
use sea_query::{ColumnDef, Table};
use std::collections::HashSet;
use std::time::{Duration, Instant};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Create the `rowguard_migrations` state table if missing.
fn ensure_state_table(executor: &dyn RowExecutor) -> Result<(), MigrationError> {
    let table = Table::create()
        .table("rowguard_migrations")
        .if_not_exists()
        .col(
            ColumnDef::new("version")
                .big_integer()
                .not_null()
                .primary_key(),
        )
        .col(ColumnDef::new("name").string().string_len(255).not_null())
        .col(
            ColumnDef::new("applied_at")
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(ColumnDef::new("execution_time_ms").big_integer().null())
        .col(ColumnDef::new("success").boolean().not_null().default(false))
        .to_owned();
    SchemaManager::new(executor).create_table(table)?;
    Ok(())
}

fn applied_versions(executor: &dyn RowExecutor) -> Result<HashSet<i64>, MigrationError> {
    let rows = executor.query_all(
        "SELECT version FROM rowguard_migrations WHERE success = true AND version > 0",
        &[],
    )?;
    Ok(rows.iter().map(|row| row.get::<_, i64>(0)).collect())
}

/// Apply every registered migration not yet recorded as applied.
///
/// Serialized across processes by the insert-based lock; within one run,
/// migrations apply in ascending version order. Returns the number applied.
///
/// # Errors
///
/// Stops at the first failing migration; already-applied migrations from this
/// run stay recorded.
pub fn run_pending(
    executor: &dyn RowExecutor,
    migrations: &[Box<dyn Migration>],
    lock_timeout: Duration,
) -> Result<usize, MigrationError> {
    ensure_state_table(executor)?;
    let lock = MigrationLockGuard::acquire(executor, lock_timeout)?;

    let mut ordered: Vec<&dyn Migration> = migrations.iter().map(Box::as_ref).collect();
    ordered.sort_by_key(|m| m.version());
    let mut seen = HashSet::new();
    for migration in &ordered {
        if !seen.insert(migration.version()) {
            return Err(MigrationError::DuplicateVersion {
                version: migration.version(),
                name: migration.name().to_string(),
            });
        }
    }

    let applied = applied_versions(lock.executor())?;
    let manager = SchemaManager::new(lock.executor());
    let mut count = 0;

    for migration in ordered {
        if applied.contains(&migration.version()) {
            continue;
        }
        let start = Instant::now();
        migration
            .up(&manager)
            .map_err(|e| MigrationError::ExecutionFailed {
                version: migration.version(),
                name: migration.name().to_string(),
                error: e.to_string(),
            })?;
        let elapsed_ms = start.elapsed().as_millis() as i64;

        lock.executor().execute(
            "INSERT INTO rowguard_migrations (version, name, applied_at, execution_time_ms, success) \
             VALUES ($1, $2, $3, $4, true)",
            &[
                &migration.version(),
                &migration.name(),
                &Utc::now(),
                &elapsed_ms,
            ],
        )?;
        log::info!(
            "applied migration {} ({}) in {}ms",
            migration.version(),
            migration.name(),
            elapsed_ms
        );
        count += 1;
    }

    Ok(count)
}

/// Run pending migrations during application startup, failing fast.
///
/// First process in wins the lock and applies; the rest wait and find
/// nothing left to do.
pub fn startup_migrations(
    executor: &dyn RowExecutor,
    migrations: &[Box<dyn Migration>],
) -> Result<(), MigrationError> {
    let applied = run_pending(executor, migrations, DEFAULT_LOCK_TIMEOUT)?;
    if applied > 0 {
        log::info!("applied {applied} migration(s) on startup");
    } else {
        log::debug!("no pending migrations to apply");
    }
    Ok(())
}
