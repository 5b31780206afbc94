//! Idempotency lock manager
//!
//! Per-key state machine: `absent -> pending -> {finalized | absent}`.
//!
//! A key is claimed by inserting a sentinel row; the primary-key constraint
//! makes the claim atomic across concurrent requests, so the database - not
//! application locks - is the cross-request mutual-exclusion primitive. A
//! pending row marks an in-flight handler, a finalized row caches the
//! handler's JSON response for replay, and releasing deletes the row so the
//! key becomes claimable again after a failure.
//!
//! The insert-wins claim follows the same shape as the migration lock
//! (`migration::lock`): whoever gets the row in owns the critical section.
//!
//! Records expire after a retention window (default 24h) but only the
//! separate [`IdempotencyStore::purge_expired`] sweep removes them; the claim
//! path never consults `expires_at`.

use crate::executor::{RowError, RowExecutor};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Status value stored in a pending record's payload.
pub const PENDING_SENTINEL: &str = "PENDING";

/// Default retention window for finalized records.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Result of attempting to claim an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// Key was absent; this request now owns it and must run the handler.
    Claimed,
    /// A pending record exists: another request with this key is in flight.
    InFlight,
    /// A finalized record exists; respond with the stored payload verbatim.
    Replayed(JsonValue),
}

/// Storage backend for the idempotency state machine.
///
/// Implemented for PostgreSQL ([`PgIdempotencyStore`]) and in memory
/// ([`MemoryIdempotencyStore`]); the API wrapper drives either through this
/// trait.
pub trait IdempotencyStore: Send + Sync {
    /// Attempt the `absent -> pending` transition.
    ///
    /// # Errors
    ///
    /// A claim whose losing lookup finds no row (the row vanished between the
    /// failed insert and the lookup) is reported as an error, never as a
    /// fresh claim: the wrapper must fail closed rather than risk a duplicate
    /// side effect.
    fn try_claim(&self, key: &str) -> Result<ClaimOutcome, RowError>;

    /// `pending -> finalized`: store the handler's response in place.
    fn finalize(&self, key: &str, response: &JsonValue) -> Result<(), RowError>;

    /// `pending -> absent`: delete the record so the key is retryable.
    fn release(&self, key: &str) -> Result<(), RowError>;

    /// Remove records past their retention window. Returns rows removed.
    fn purge_expired(&self) -> Result<u64, RowError>;
}

fn pending_payload(now: DateTime<Utc>) -> JsonValue {
    json!({ "status": PENDING_SENTINEL, "claimed_at": now.to_rfc3339() })
}

/// True if a stored payload is the pending sentinel, not a cached response.
pub fn is_pending(payload: &JsonValue) -> bool {
    payload.get("status").and_then(JsonValue::as_str) == Some(PENDING_SENTINEL)
}

/// PostgreSQL-backed idempotency store.
///
/// Claims ride on the `idempotency_records` primary key:
/// `INSERT ... ON CONFLICT DO NOTHING` either takes the key atomically or
/// affects zero rows, in which case the existing record decides the outcome.
pub struct PgIdempotencyStore<E> {
    db: E,
    retention: ChronoDuration,
}

impl<E: RowExecutor> PgIdempotencyStore<E> {
    /// Create a store with the default 24h retention window
    pub fn new(db: E) -> Self {
        Self::with_retention(db, DEFAULT_RETENTION)
    }

    /// Create a store with a custom retention window
    pub fn with_retention(db: E, retention: Duration) -> Self {
        Self {
            db,
            retention: ChronoDuration::from_std(retention)
                .unwrap_or_else(|_| ChronoDuration::hours(24)),
        }
    }
}

impl<E: RowExecutor + Send + Sync> IdempotencyStore for PgIdempotencyStore<E> {
    fn try_claim(&self, key: &str) -> Result<ClaimOutcome, RowError> {
        #[cfg(feature = "tracing")]
        let _span = crate::metrics::tracing_helpers::idempotency_claim_span(key).entered();

        let now = Utc::now();
        let expires_at = now + self.retention;
        let inserted = self.db.execute(
            "INSERT INTO idempotency_records (key, response_payload, created_at, expires_at) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (key) DO NOTHING",
            &[&key, &pending_payload(now), &now, &expires_at],
        )?;
        if inserted == 1 {
            return Ok(ClaimOutcome::Claimed);
        }

        let row = self.db.query_opt(
            "SELECT response_payload FROM idempotency_records WHERE key = $1",
            &[&key],
        )?;
        match row {
            Some(row) => {
                let payload: JsonValue = row.get(0);
                if is_pending(&payload) {
                    Ok(ClaimOutcome::InFlight)
                } else {
                    Ok(ClaimOutcome::Replayed(payload))
                }
            }
            // Lost the insert race, then lost the row before the lookup.
            // Fail closed: a retry here could execute the handler twice.
            None => Err(RowError::Other(format!(
                "idempotency record for key {key:?} vanished between claim and lookup"
            ))),
        }
    }

    fn finalize(&self, key: &str, response: &JsonValue) -> Result<(), RowError> {
        let updated = self.db.execute(
            "UPDATE idempotency_records SET response_payload = $2 WHERE key = $1",
            &[&key, response],
        )?;
        if updated == 0 {
            log::warn!("finalize found no idempotency record for key {key:?}");
        }
        Ok(())
    }

    fn release(&self, key: &str) -> Result<(), RowError> {
        self.db
            .execute("DELETE FROM idempotency_records WHERE key = $1", &[&key])?;
        Ok(())
    }

    fn purge_expired(&self) -> Result<u64, RowError> {
        let now = Utc::now();
        self.db.execute(
            "DELETE FROM idempotency_records WHERE expires_at <= $1",
            &[&now],
        )
    }
}

/// In-memory idempotency store with the same state machine.
///
/// Used by the unit/scenario tests and embedded deployments without a
/// database-backed store.
#[derive(Default)]
pub struct MemoryIdempotencyStore {
    retention: Option<ChronoDuration>,
    records: Mutex<HashMap<String, (JsonValue, DateTime<Utc>)>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self {
            retention: Some(ChronoDuration::hours(24)),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            retention: ChronoDuration::from_std(retention).ok(),
            records: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (JsonValue, DateTime<Utc>)>>, RowError> {
        self.records
            .lock()
            .map_err(|_| RowError::Other("idempotency store mutex poisoned".to_string()))
    }
}

impl IdempotencyStore for MemoryIdempotencyStore {
    fn try_claim(&self, key: &str) -> Result<ClaimOutcome, RowError> {
        let now = Utc::now();
        let expires_at = now + self.retention.unwrap_or_else(|| ChronoDuration::hours(24));
        let mut records = self.lock()?;
        match records.get(key) {
            Some((payload, _)) if is_pending(payload) => Ok(ClaimOutcome::InFlight),
            Some((payload, _)) => Ok(ClaimOutcome::Replayed(payload.clone())),
            None => {
                records.insert(key.to_string(), (pending_payload(now), expires_at));
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    fn finalize(&self, key: &str, response: &JsonValue) -> Result<(), RowError> {
        let mut records = self.lock()?;
        if let Some(entry) = records.get_mut(key) {
            entry.0 = response.clone();
        } else {
            log::warn!("finalize found no idempotency record for key {key:?}");
        }
        Ok(())
    }

    fn release(&self, key: &str) -> Result<(), RowError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn purge_expired(&self) -> Result<u64, RowError> {
        let now = Utc::now();
        let mut records = self.lock()?;
        let before = records.len();
        records.retain(|_, (_, expires_at)| *expires_at > now);
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_sentinel_detection() {
        assert!(is_pending(&pending_payload(Utc::now())));
        assert!(!is_pending(&json!({ "message": "Success" })));
        assert!(!is_pending(&json!(null)));
    }

    #[test]
    fn test_claim_then_inflight() {
        let store = MemoryIdempotencyStore::new();
        assert_eq!(store.try_claim("k1").unwrap(), ClaimOutcome::Claimed);
        assert_eq!(store.try_claim("k1").unwrap(), ClaimOutcome::InFlight);
    }

    #[test]
    fn test_finalize_then_replay() {
        let store = MemoryIdempotencyStore::new();
        assert_eq!(store.try_claim("k1").unwrap(), ClaimOutcome::Claimed);
        store.finalize("k1", &json!({ "message": "Success" })).unwrap();
        assert_eq!(
            store.try_claim("k1").unwrap(),
            ClaimOutcome::Replayed(json!({ "message": "Success" }))
        );
    }

    #[test]
    fn test_release_makes_key_claimable_again() {
        let store = MemoryIdempotencyStore::new();
        assert_eq!(store.try_claim("k1").unwrap(), ClaimOutcome::Claimed);
        store.release("k1").unwrap();
        assert_eq!(store.try_claim("k1").unwrap(), ClaimOutcome::Claimed);
    }

    #[test]
    fn test_keys_are_independent() {
        let store = MemoryIdempotencyStore::new();
        assert_eq!(store.try_claim("k1").unwrap(), ClaimOutcome::Claimed);
        assert_eq!(store.try_claim("k2").unwrap(), ClaimOutcome::Claimed);
    }

    #[test]
    fn test_purge_removes_expired_records_only() {
        let expired = MemoryIdempotencyStore::with_retention(Duration::from_secs(0));
        assert_eq!(expired.try_claim("old").unwrap(), ClaimOutcome::Claimed);
        assert_eq!(expired.purge_expired().unwrap(), 1);
        assert_eq!(expired.try_claim("old").unwrap(), ClaimOutcome::Claimed);

        let fresh = MemoryIdempotencyStore::new();
        assert_eq!(fresh.try_claim("new").unwrap(), ClaimOutcome::Claimed);
        assert_eq!(fresh.purge_expired().unwrap(), 0);
        assert_eq!(fresh.try_claim("new").unwrap(), ClaimOutcome::InFlight);
    }
}
