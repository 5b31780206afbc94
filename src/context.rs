//! Execution context - ambient per-request actor identity
//!
//! One coroutine serves one request, so the actor established at the
//! authentication boundary is carried in coroutine-local storage: visible to
//! everything the request calls, across suspension points, without parameter
//! threading, and invisible to every other coroutine. Outside a coroutine the
//! storage degrades to thread-local, which keeps the same isolation guarantee
//! for plain-thread callers (tests, startup code).
//!
//! Bindings nest; the innermost wins. A binding is removed when its scope
//! unwinds, panic included, so a poisoned request can never leak its actor
//! into the next request scheduled on the same worker.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;

/// Shape accepted for externally supplied actor ids.
///
/// The identity provider is opaque to this subsystem; the only contract is
/// that the id is a short printable token. Anything else is rejected at the
/// boundary before it can reach a session variable.
static ACTOR_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_@.:-]{0,127}$").expect("static regex"));

/// A verified actor identity.
///
/// Constructed only through [`ActorId::parse`], so every `ActorId` in the
/// process is known to satisfy the boundary shape check.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

/// Rejected actor id (empty, too long, or containing non-token characters).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidActorId(pub String);

impl fmt::Display for InvalidActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid actor id: {:?}", self.0)
    }
}

impl std::error::Error for InvalidActorId {}

impl ActorId {
    /// Validate and wrap an externally supplied actor id.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidActorId`] if the id does not match the accepted shape.
    pub fn parse(raw: &str) -> Result<Self, InvalidActorId> {
        if ACTOR_ID_RE.is_match(raw) {
            Ok(ActorId(raw.to_string()))
        } else {
            Err(InvalidActorId(raw.to_string()))
        }
    }

    /// The actor id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

may::coroutine_local!(static ACTOR_STACK: RefCell<Vec<ActorId>> = RefCell::new(Vec::new()));

/// Pops the binding pushed by `run_with_actor`, on normal exit and on unwind.
struct ScopeGuard;

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        ACTOR_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Run `f` with `actor` established as the ambient identity.
///
/// Everything `f` calls, transitively and across coroutine suspension points,
/// observes `actor` via [`current_actor`]. Scopes nest; the innermost binding
/// wins and is restored when `f` returns or unwinds.
///
/// # Examples
///
/// ```
/// use rowguard::context::{self, ActorId};
///
/// let actor = ActorId::parse("user-42").unwrap();
/// let seen = context::run_with_actor(actor.clone(), || context::current_actor());
/// assert_eq!(seen, Some(actor));
/// assert_eq!(context::current_actor(), None);
/// ```
pub fn run_with_actor<F, R>(actor: ActorId, f: F) -> R
where
    F: FnOnce() -> R,
{
    ACTOR_STACK.with(|stack| stack.borrow_mut().push(actor));
    let _guard = ScopeGuard;
    f()
}

/// Read the innermost ambient actor binding, if any.
///
/// Returns `None` when called outside every [`run_with_actor`] scope - the
/// anonymous/background path, which the scoping proxy passes through
/// unmodified.
pub fn current_actor() -> Option<ActorId> {
    ACTOR_STACK.with(|stack| stack.borrow().last().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(s: &str) -> ActorId {
        ActorId::parse(s).unwrap()
    }

    #[test]
    fn test_actor_id_accepts_token_shapes() {
        for ok in ["u1", "user-42", "auth0:abc123", "a.b@example.org"] {
            assert!(ActorId::parse(ok).is_ok(), "should accept {ok}");
        }
    }

    #[test]
    fn test_actor_id_rejects_malformed() {
        let too_long = "x".repeat(200);
        for bad in ["", " ", "a b", "evil'; --", "-leading", too_long.as_str()] {
            assert!(ActorId::parse(bad).is_err(), "should reject {bad:?}");
        }
    }

    #[test]
    fn test_no_binding_outside_scope() {
        assert_eq!(current_actor(), None);
    }

    #[test]
    fn test_innermost_binding_wins() {
        let outer = actor("outer");
        let inner = actor("inner");
        run_with_actor(outer.clone(), || {
            assert_eq!(current_actor(), Some(outer.clone()));
            run_with_actor(inner.clone(), || {
                assert_eq!(current_actor(), Some(inner.clone()));
            });
            assert_eq!(current_actor(), Some(outer.clone()));
        });
        assert_eq!(current_actor(), None);
    }

    #[test]
    fn test_binding_removed_on_unwind() {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            run_with_actor(actor("doomed"), || panic!("handler blew up"));
        }));
        assert!(result.is_err());
        assert_eq!(current_actor(), None);
    }

    #[test]
    fn test_concurrent_coroutines_are_isolated() {
        let spawn = |name: &'static str| {
            may::go!(move || {
                let me = ActorId::parse(name).unwrap();
                run_with_actor(me.clone(), || {
                    for _ in 0..16 {
                        assert_eq!(current_actor(), Some(me.clone()));
                        may::coroutine::yield_now();
                    }
                });
                assert_eq!(current_actor(), None);
            })
        };

        let a = spawn("actor-a");
        let b = spawn("actor-b");
        a.join().unwrap();
        b.join().unwrap();
    }
}
