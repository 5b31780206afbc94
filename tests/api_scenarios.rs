//! Scenario tests for the API wrapper, the idempotency state machine and the
//! execution context, driven through the in-memory store - no database
//! required. Full-stack behavior against PostgreSQL lives in
//! `pipeline_integration.rs`.

use rowguard::api::{run_mutation, ApiResponse};
use rowguard::context::{self, ActorId};
use rowguard::idempotency::{ClaimOutcome, IdempotencyStore, MemoryIdempotencyStore};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn replay_returns_stored_response_without_rerunning_handler() {
    let store = MemoryIdempotencyStore::new();
    let calls = AtomicUsize::new(0);
    let handler = || {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(ApiResponse::ok(json!({ "message": "Success" })))
    };

    let first = run_mutation(&store, Some("alice"), Some("k1"), handler);
    assert_eq!(first.status, 200);
    assert_eq!(first.body.unwrap(), json!({ "message": "Success" }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let second = run_mutation(&store, Some("alice"), Some("k1"), || {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(ApiResponse::ok(json!({ "message": "Should never be seen" })))
    });
    assert_eq!(second.status, 200);
    assert_eq!(second.body.unwrap(), json!({ "message": "Success" }));
    // Handler ran exactly once across both requests.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_request_with_same_key_gets_conflict_while_first_is_pending() {
    let store = Arc::new(MemoryIdempotencyStore::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let (claimed_tx, claimed_rx) = crossbeam_channel::bounded::<()>(1);
    let (finish_tx, finish_rx) = crossbeam_channel::bounded::<()>(1);

    let first = {
        let store = Arc::clone(&store);
        let calls = Arc::clone(&calls);
        may::go!(move || {
            run_mutation(store.as_ref(), Some("alice"), Some("k2"), move || {
                calls.fetch_add(1, Ordering::SeqCst);
                claimed_tx.send(()).expect("signal claim");
                finish_rx.recv().expect("wait for go-ahead");
                Ok(ApiResponse::ok(json!({ "message": "Success" })))
            })
        })
    };

    // The first request holds the claim; a duplicate arrives now.
    claimed_rx.recv().expect("first request claimed");
    let duplicate = run_mutation(store.as_ref(), Some("bob"), Some("k2"), || {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(ApiResponse::ok(json!({ "message": "Duplicate" })))
    });
    assert_eq!(duplicate.status, 409);
    assert_eq!(duplicate.body.unwrap()["code"], "IDEMPOTENCY_CONFLICT");

    finish_tx.send(()).expect("release first request");
    let first_response = first.join().unwrap();
    assert_eq!(first_response.status, 200);

    // Only the claim winner ever executed.
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // After finalization the duplicate's retry replays instead of conflicting.
    let retry = run_mutation(store.as_ref(), Some("bob"), Some("k2"), || {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(ApiResponse::ok(json!({ "message": "Duplicate" })))
    });
    assert_eq!(retry.status, 200);
    assert_eq!(retry.body.unwrap(), json!({ "message": "Success" }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_handler_makes_key_retryable() {
    let store = MemoryIdempotencyStore::new();

    let failed = run_mutation(&store, Some("alice"), Some("k3"), || {
        Err(rowguard::ServiceError::Conflict {
            invariant: "PERIOD_OVERLAP",
            message: "overlaps existing period".to_string(),
        })
    });
    assert_eq!(failed.status, 409);

    // The key transitioned back to absent; the retry claims and runs.
    assert_eq!(store.try_claim("k3").unwrap(), ClaimOutcome::Claimed);
}

#[test]
fn context_isolated_across_interleaved_coroutines() {
    let spawn = |name: &'static str| {
        may::go!(move || {
            let me = ActorId::parse(name).unwrap();
            context::run_with_actor(me.clone(), || {
                for _ in 0..32 {
                    // Deep in the call chain, across suspension points, each
                    // coroutine only ever sees its own binding.
                    assert_eq!(context::current_actor(), Some(me.clone()));
                    may::coroutine::yield_now();
                }
            });
            assert_eq!(context::current_actor(), None);
        })
    };

    let handles: Vec<_> = ["ctx-actor-a", "ctx-actor-b", "ctx-actor-c", "ctx-actor-d"]
        .into_iter()
        .map(spawn)
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn nested_bindings_innermost_wins_and_unwinds() {
    let outer = ActorId::parse("outer").unwrap();
    let inner = ActorId::parse("inner").unwrap();

    context::run_with_actor(outer.clone(), || {
        context::run_with_actor(inner.clone(), || {
            assert_eq!(context::current_actor(), Some(inner.clone()));
        });
        assert_eq!(context::current_actor(), Some(outer.clone()));
    });
    assert_eq!(context::current_actor(), None);
}

#[test]
fn wrapper_rejects_unauthenticated_and_malformed_actors() {
    let store = MemoryIdempotencyStore::new();

    let anonymous = run_mutation(&store, None, Some("k4"), || {
        panic!("handler must not run without an actor")
    });
    assert_eq!(anonymous.status, 401);

    let malformed = run_mutation(&store, Some("spaces are not allowed"), Some("k4"), || {
        panic!("handler must not run for a malformed actor")
    });
    assert_eq!(malformed.status, 400);

    // Neither attempt consumed the key.
    assert_eq!(store.try_claim("k4").unwrap(), ClaimOutcome::Claimed);
}

#[test]
fn distinct_keys_do_not_interfere() {
    let store = MemoryIdempotencyStore::new();
    let calls = AtomicUsize::new(0);

    for key in ["ka", "kb", "kc"] {
        let response = run_mutation(&store, Some("alice"), Some(key), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(ApiResponse::ok(json!({ "key": key })))
        });
        assert_eq!(response.status, 200);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
