//! Business guards for the mutation pipeline
//!
//! Each guard either passes or returns the tagged `ServiceError` that aborts
//! the owning transaction. Guards run inside the mutation transaction, after
//! the "before" snapshot is loaded and before the write.

use crate::context::ActorId;
use crate::error::{ServiceError, ServiceResult};
use crate::executor::RowExecutor;
use chrono::NaiveDate;
use uuid::Uuid;

/// Directory role of an actor. `Admin` is the elevated role that bypasses
/// ownership and workflow-state guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Member,
    Admin,
}

impl Role {
    pub fn is_elevated(self) -> bool {
        matches!(self, Role::Admin)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Admin => "admin",
        }
    }

    /// Parse the directory's `role` column.
    pub fn from_db(value: &str) -> ServiceResult<Self> {
        match value {
            "member" => Ok(Role::Member),
            "admin" => Ok(Role::Admin),
            other => Err(ServiceError::Internal(format!(
                "unknown role {other:?} in actors directory"
            ))),
        }
    }
}

/// Ownership guard: only the creator or an elevated role may mutate.
pub fn ensure_owner_or_elevated(
    actor: &ActorId,
    owner: &str,
    role: Role,
    what: &str,
) -> ServiceResult<()> {
    if role.is_elevated() || actor.as_str() == owner {
        Ok(())
    } else {
        Err(ServiceError::Forbidden(format!(
            "only the creator or an administrator may {what}"
        )))
    }
}

/// Workflow-state guard: the entity must be in one of `allowed` states unless
/// the actor holds an elevated role.
pub fn ensure_workflow_state<S>(current: &S, allowed: &[S], role: Role, what: &str) -> ServiceResult<()>
where
    S: PartialEq + std::fmt::Debug,
{
    if role.is_elevated() || allowed.contains(current) {
        Ok(())
    } else {
        Err(ServiceError::Forbidden(format!(
            "cannot {what} while in state {current:?}"
        )))
    }
}

/// Immutability guard: system-generated records may never be mutated directly.
pub fn ensure_mutable(system_generated: bool, entity_id: Uuid) -> ServiceResult<()> {
    if system_generated {
        Err(ServiceError::TransactionImmutable { entity_id })
    } else {
        Ok(())
    }
}

/// Accounting-period guard: reject if `effective_date` falls inside a closed
/// period. Must run on the mutation's own transaction so the decision is
/// consistent with the write it protects.
pub fn ensure_period_open(
    tx: &dyn RowExecutor,
    effective_date: NaiveDate,
    action: &'static str,
) -> ServiceResult<()> {
    let row = tx.query_opt(
        "SELECT id, period_type, start_date, end_date FROM accounting_periods \
         WHERE status = 'closed' AND start_date <= $1 AND end_date >= $1 LIMIT 1",
        &[&effective_date],
    )?;
    match row {
        None => Ok(()),
        Some(row) => {
            let period_id: Uuid = row.get(0);
            let period_type: String = row.get(1);
            let start: NaiveDate = row.get(2);
            let end: NaiveDate = row.get(3);
            Err(ServiceError::PeriodClosed {
                period_id,
                period_label: format!("{start}..{end} ({period_type})"),
                action,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(s: &str) -> ActorId {
        ActorId::parse(s).unwrap()
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!(Role::from_db("member").unwrap(), Role::Member);
        assert_eq!(Role::from_db("admin").unwrap(), Role::Admin);
        assert!(Role::from_db("superuser").is_err());
    }

    #[test]
    fn test_ownership_guard() {
        let creator = actor("alice");
        let other = actor("bob");

        assert!(ensure_owner_or_elevated(&creator, "alice", Role::Member, "edit").is_ok());
        assert!(ensure_owner_or_elevated(&other, "alice", Role::Admin, "edit").is_ok());

        let err = ensure_owner_or_elevated(&other, "alice", Role::Member, "edit").unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }

    #[test]
    fn test_workflow_state_guard() {
        #[derive(Debug, PartialEq)]
        enum S {
            Draft,
            Approved,
        }

        assert!(ensure_workflow_state(&S::Draft, &[S::Draft], Role::Member, "edit").is_ok());
        assert!(ensure_workflow_state(&S::Approved, &[S::Draft], Role::Admin, "edit").is_ok());

        let err = ensure_workflow_state(&S::Approved, &[S::Draft], Role::Member, "edit").unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }

    #[test]
    fn test_immutability_guard() {
        assert!(ensure_mutable(false, Uuid::nil()).is_ok());
        let err = ensure_mutable(true, Uuid::nil()).unwrap_err();
        assert_eq!(err.code(), "TRANSACTION_IMMUTABLE");
    }
}
