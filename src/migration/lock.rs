//! Insert-based migration locking
//!
//! The migration table doubles as the lock: version `-1` is reserved, and the
//! process that gets that row inserted holds the lock. Waiters poll until the
//! row frees up or the timeout passes. The guard releases on drop, so an
//! aborted run cannot wedge future deployments short of a crashed process
//! (whose row an operator removes by hand).

use super::error::MigrationError;
use crate::executor::RowExecutor;
use chrono::Utc;
use std::time::{Duration, Instant};

/// Reserved version number for the lock record; real migrations use positive
/// timestamps.
const LOCK_VERSION: i64 = -1;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Lock guard that releases the lock when dropped.
pub struct MigrationLockGuard<'a> {
    executor: &'a dyn RowExecutor,
}

impl<'a> MigrationLockGuard<'a> {
    /// Acquire the migration lock, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::LockTimeout` if the lock is not acquired in
    /// time.
    pub fn acquire(
        executor: &'a dyn RowExecutor,
        timeout: Duration,
    ) -> Result<Self, MigrationError> {
        let deadline = Instant::now() + timeout;
        loop {
            let inserted = executor.execute(
                "INSERT INTO rowguard_migrations (version, name, applied_at, success) \
                 VALUES ($1, 'lock', $2, true) ON CONFLICT (version) DO NOTHING",
                &[&LOCK_VERSION, &Utc::now()],
            )?;
            if inserted == 1 {
                return Ok(Self { executor });
            }
            if Instant::now() >= deadline {
                return Err(MigrationError::LockTimeout(format!(
                    "could not acquire migration lock within {}s",
                    timeout.as_secs()
                )));
            }
            may::coroutine::sleep(POLL_INTERVAL);
        }
    }

    /// Get a reference to the underlying executor
    pub fn executor(&self) -> &'a dyn RowExecutor {
        self.executor
    }
}

impl Drop for MigrationLockGuard<'_> {
    fn drop(&mut self) {
        let released = self.executor.execute(
            "DELETE FROM rowguard_migrations WHERE version = $1",
            &[&LOCK_VERSION],
        );
        if released.is_err() {
            log::warn!("failed to release migration lock row; remove version = -1 manually");
        }
    }
}
