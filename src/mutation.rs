//! Mutation transaction pattern
//!
//! Every state-changing service operation runs through [`MutationTx`], which
//! centralizes the sequence the original sites would otherwise each repeat:
//! open the transaction, apply the mutation statement timeout, re-assert the
//! actor's session variable (the proxy's per-call wrapping does not cover
//! manually-managed transactions), and resolve the actor's directory role for
//! the guards. The service then loads its "before" snapshot, runs guards,
//! writes, appends the audit row and commits; dropping the `MutationTx`
//! without committing rolls everything back.
//!
//! Post-commit side effects (notifications, integrity checks) happen outside,
//! after `commit()` returns.

use crate::audit::{self, AuditEntry};
use crate::context::{self, ActorId};
use crate::error::{ServiceError, ServiceResult};
use crate::executor::{MayPostgresExecutor, RowExecutor};
use crate::guards::Role;
use crate::transaction::Transaction;
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// Default statement timeout for mutation transactions.
pub const DEFAULT_MUTATION_TIMEOUT: Duration = Duration::from_secs(15);

/// An open, actor-bound mutation transaction.
pub struct MutationTx {
    tx: Transaction,
    actor: ActorId,
    role: Role,
    action: &'static str,
    started: Instant,
}

impl MutationTx {
    /// Begin a mutation transaction for the ambient actor.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::Unauthorized`] if no actor is bound in the execution
    ///   context
    /// - [`ServiceError::Forbidden`] if the actor is not present in the
    ///   `actors` directory
    /// - [`ServiceError::Internal`] if the transaction cannot be opened or
    ///   configured
    pub fn begin(
        db: &MayPostgresExecutor,
        action: &'static str,
        timeout: Duration,
    ) -> ServiceResult<Self> {
        let actor = context::current_actor().ok_or(ServiceError::Unauthorized)?;

        #[cfg(feature = "tracing")]
        let _span = crate::metrics::tracing_helpers::mutation_span(action).entered();

        let tx = Transaction::begin_for_actor(db.client().clone(), &actor, timeout)?;

        let row = tx.query_opt("SELECT role FROM actors WHERE id = $1", &[&actor.as_str()])?;
        let role = match row {
            Some(row) => {
                let role_text: String = row.get(0);
                Role::from_db(&role_text)?
            }
            None => {
                return Err(ServiceError::Forbidden(format!(
                    "actor {actor} is not registered"
                )))
            }
        };

        Ok(Self {
            tx,
            actor,
            role,
            action,
            started: Instant::now(),
        })
    }

    /// Begin with the default 15s timeout.
    pub fn begin_default(db: &MayPostgresExecutor, action: &'static str) -> ServiceResult<Self> {
        Self::begin(db, action, DEFAULT_MUTATION_TIMEOUT)
    }

    /// The transaction, for queries and writes.
    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    /// The actor this mutation runs as.
    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    /// The actor's directory role, resolved inside this transaction.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The action name, used for audit rows and period-guard messages.
    pub fn action(&self) -> &'static str {
        self.action
    }

    /// Append an audit row in this transaction.
    pub fn audit(&self, entry: &AuditEntry) -> ServiceResult<()> {
        audit::record(&self.tx, &self.actor, entry)?;
        Ok(())
    }

    /// Commit the mutation.
    pub fn commit(self) -> ServiceResult<()> {
        let elapsed = self.started.elapsed();
        self.tx.commit()?;
        #[cfg(feature = "metrics")]
        METRICS.record_mutation(elapsed);
        #[cfg(not(feature = "metrics"))]
        let _ = elapsed;
        Ok(())
    }

    /// Roll the mutation back explicitly.
    ///
    /// Dropping an uncommitted `MutationTx` has the same effect; this exists
    /// for sites that want the rollback error surfaced.
    pub fn rollback(self) -> ServiceResult<()> {
        self.tx.rollback()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mutation_timeout() {
        assert_eq!(DEFAULT_MUTATION_TIMEOUT, Duration::from_secs(15));
    }
}
