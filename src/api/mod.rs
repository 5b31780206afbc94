//! API wrapper for mutation handlers
//!
//! The order every mutating endpoint goes through:
//!
//! 1. authentication: no verified actor means 401, a malformed actor id 400
//! 2. the actor is bound into the execution context for the handler's whole
//!    call chain
//! 3. with an `idempotency-key` header, the idempotency state machine decides
//!    whether the handler runs, the stored response is replayed, or the
//!    request conflicts with one in flight
//! 4. the handler's outcome finalizes or releases the claim
//!
//! A claim lookup failure is answered 500 without running the handler:
//! failing open could execute a side effect twice, failing closed only costs
//! a retry.

pub mod http;

use crate::context::{self, ActorId};
use crate::error::{ServiceError, ServiceResult};
use crate::idempotency::{ClaimOutcome, IdempotencyStore};
use serde_json::Value as JsonValue;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// Framework-agnostic response the wrapper and handlers trade in.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Option<JsonValue>,
}

impl ApiResponse {
    pub fn ok(body: JsonValue) -> Self {
        Self {
            status: 200,
            body: Some(body),
        }
    }

    pub fn created(body: JsonValue) -> Self {
        Self {
            status: 201,
            body: Some(body),
        }
    }

    pub fn no_content() -> Self {
        Self {
            status: 204,
            body: None,
        }
    }

    pub fn from_error(err: &ServiceError) -> Self {
        if let ServiceError::Internal(detail) = err {
            log::error!("internal error: {detail}");
        }
        Self {
            status: err.http_status(),
            body: Some(err.to_body()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Releases a pending claim if the handler unwinds instead of returning.
struct ClaimGuard<'a> {
    store: &'a dyn IdempotencyStore,
    key: &'a str,
    armed: bool,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.store.release(self.key) {
                log::error!(
                    "failed to release idempotency key {:?} during unwind: {err}",
                    self.key
                );
            }
        }
    }
}

/// Run a mutation handler under the full wrapper.
///
/// `actor_header` is the verified id supplied by the identity provider
/// (absent on unauthenticated requests); `idempotency_key` is the optional
/// client-supplied deduplication token. The handler only ever runs with the
/// actor bound in the execution context.
pub fn run_mutation<H>(
    store: &dyn IdempotencyStore,
    actor_header: Option<&str>,
    idempotency_key: Option<&str>,
    handler: H,
) -> ApiResponse
where
    H: FnOnce() -> ServiceResult<ApiResponse>,
{
    let raw_actor = match actor_header {
        Some(raw) => raw,
        None => return ApiResponse::from_error(&ServiceError::Unauthorized),
    };
    let actor = match ActorId::parse(raw_actor) {
        Ok(actor) => actor,
        Err(err) => return ApiResponse::from_error(&ServiceError::from(err)),
    };

    context::run_with_actor(actor, || match idempotency_key {
        None => settle(handler()),
        Some(key) => run_with_key(store, key, handler),
    })
}

fn settle(result: ServiceResult<ApiResponse>) -> ApiResponse {
    match result {
        Ok(response) => response,
        Err(err) => {
            #[cfg(feature = "metrics")]
            if matches!(err.http_status(), 403 | 409) {
                METRICS.record_guard_rejection();
            }
            ApiResponse::from_error(&err)
        }
    }
}

fn run_with_key<H>(store: &dyn IdempotencyStore, key: &str, handler: H) -> ApiResponse
where
    H: FnOnce() -> ServiceResult<ApiResponse>,
{
    match store.try_claim(key) {
        Err(err) => {
            log::error!("idempotency claim for key {key:?} failed: {err}");
            ApiResponse::from_error(&ServiceError::Internal(err.to_string()))
        }
        Ok(ClaimOutcome::InFlight) => {
            #[cfg(feature = "metrics")]
            METRICS.record_idempotency_conflict();
            ApiResponse::from_error(&ServiceError::IdempotencyConflict)
        }
        Ok(ClaimOutcome::Replayed(payload)) => {
            #[cfg(feature = "metrics")]
            METRICS.record_idempotency_replay();
            ApiResponse::ok(payload)
        }
        Ok(ClaimOutcome::Claimed) => {
            #[cfg(feature = "metrics")]
            METRICS.record_idempotency_claim();

            let mut guard = ClaimGuard {
                store,
                key,
                armed: true,
            };
            let response = settle(handler());
            guard.armed = false;
            drop(guard);

            match (&response.body, response.is_success()) {
                (Some(body), true) => {
                    // Handler side effects are committed; a finalize failure
                    // must not turn the success into an error. Release so the
                    // key cannot stay pending forever.
                    if let Err(err) = store.finalize(key, body) {
                        log::error!("failed to finalize idempotency key {key:?}: {err}");
                        if let Err(release_err) = store.release(key) {
                            log::error!(
                                "failed to release key {key:?} after finalize failure: {release_err}"
                            );
                        }
                    }
                }
                _ => {
                    // Failure, or a success whose body cannot be captured:
                    // the key becomes claimable again.
                    if let Err(err) = store.release(key) {
                        log::error!("failed to release idempotency key {key:?}: {err}");
                    }
                }
            }
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RowError;
    use crate::idempotency::MemoryIdempotencyStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted_ok(counter: &AtomicUsize) -> impl FnOnce() -> ServiceResult<ApiResponse> + '_ {
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ApiResponse::ok(json!({ "message": "Success" })))
        }
    }

    #[test]
    fn test_missing_actor_is_401() {
        let store = MemoryIdempotencyStore::new();
        let response = run_mutation(&store, None, None, || Ok(ApiResponse::no_content()));
        assert_eq!(response.status, 401);
        assert_eq!(response.body.unwrap()["code"], "UNAUTHORIZED");
    }

    #[test]
    fn test_malformed_actor_is_400() {
        let store = MemoryIdempotencyStore::new();
        let response = run_mutation(&store, Some("not a token!"), None, || {
            Ok(ApiResponse::no_content())
        });
        assert_eq!(response.status, 400);
        assert_eq!(response.body.unwrap()["code"], "VALIDATION_ERROR");
    }

    #[test]
    fn test_handler_sees_bound_actor() {
        let store = MemoryIdempotencyStore::new();
        let response = run_mutation(&store, Some("alice"), None, || {
            let actor = context::current_actor().expect("actor must be bound");
            Ok(ApiResponse::ok(json!({ "actor": actor.as_str() })))
        });
        assert_eq!(response.body.unwrap()["actor"], "alice");
        assert_eq!(context::current_actor(), None);
    }

    #[test]
    fn test_no_key_runs_every_time() {
        let store = MemoryIdempotencyStore::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            let response = run_mutation(&store, Some("alice"), None, counted_ok(&calls));
            assert_eq!(response.status, 200);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_claim_and_replay() {
        let store = MemoryIdempotencyStore::new();
        let calls = AtomicUsize::new(0);

        let first = run_mutation(&store, Some("alice"), Some("k1"), counted_ok(&calls));
        assert_eq!(first.status, 200);
        assert_eq!(first.body.unwrap()["message"], "Success");

        let second = run_mutation(&store, Some("alice"), Some("k1"), counted_ok(&calls));
        assert_eq!(second.status, 200);
        assert_eq!(second.body.unwrap()["message"], "Success");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_handler_releases_key() {
        let store = MemoryIdempotencyStore::new();

        let first = run_mutation(&store, Some("alice"), Some("k1"), || {
            Err(ServiceError::Validation("bad input".to_string()))
        });
        assert_eq!(first.status, 400);

        // Key is retryable; the retry runs the handler.
        let calls = AtomicUsize::new(0);
        let second = run_mutation(&store, Some("alice"), Some("k1"), counted_ok(&calls));
        assert_eq!(second.status, 200);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bodyless_success_is_not_cached() {
        let store = MemoryIdempotencyStore::new();

        let first = run_mutation(&store, Some("alice"), Some("k1"), || {
            Ok(ApiResponse::no_content())
        });
        assert_eq!(first.status, 204);

        let calls = AtomicUsize::new(0);
        let second = run_mutation(&store, Some("alice"), Some("k1"), counted_ok(&calls));
        assert_eq!(second.status, 200);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_handler_releases_key() {
        let store = MemoryIdempotencyStore::new();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            run_mutation(&store, Some("alice"), Some("k1"), || {
                panic!("handler exploded")
            })
        }));
        assert!(result.is_err());

        let calls = AtomicUsize::new(0);
        let retry = run_mutation(&store, Some("alice"), Some("k1"), counted_ok(&calls));
        assert_eq!(retry.status, 200);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct FailingStore;

    impl IdempotencyStore for FailingStore {
        fn try_claim(&self, _key: &str) -> Result<ClaimOutcome, RowError> {
            Err(RowError::Other("record vanished".to_string()))
        }
        fn finalize(&self, _key: &str, _response: &JsonValue) -> Result<(), RowError> {
            Ok(())
        }
        fn release(&self, _key: &str) -> Result<(), RowError> {
            Ok(())
        }
        fn purge_expired(&self) -> Result<u64, RowError> {
            Ok(0)
        }
    }

    #[test]
    fn test_claim_failure_fails_closed() {
        let calls = AtomicUsize::new(0);
        let response = run_mutation(&FailingStore, Some("alice"), Some("k1"), counted_ok(&calls));
        assert_eq!(response.status, 500);
        assert_eq!(response.body.unwrap()["code"], "INTERNAL_ERROR");
        // The handler never ran.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
