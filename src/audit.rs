//! Append-only audit log
//!
//! One row per committed mutation, written inside the owning transaction so
//! the audit trail and the mutation share one commit: no audit entry without
//! a committed change, no committed change without its entry. `created_at`
//! defaults to the transaction clock, so all rows of one mutation carry the
//! same timestamp.

use crate::context::ActorId;
use crate::executor::{RowError, RowExecutor};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

/// A single audit entry, built by the mutating service before the write.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub action: &'static str,
    pub entity_type: &'static str,
    pub entity_id: Uuid,
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
    pub reason: Option<String>,
    pub comment: Option<String>,
}

impl AuditEntry {
    pub fn new(action: &'static str, entity_type: &'static str, entity_id: Uuid) -> Self {
        Self {
            action,
            entity_type,
            entity_id,
            before: None,
            after: None,
            reason: None,
            comment: None,
        }
    }

    pub fn before(mut self, snapshot: JsonValue) -> Self {
        self.before = Some(snapshot);
        self
    }

    pub fn after(mut self, snapshot: JsonValue) -> Self {
        self.after = Some(snapshot);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Metadata document stored in the `metadata` JSONB column.
    ///
    /// Absent parts are omitted rather than stored as nulls.
    pub fn metadata(&self) -> JsonValue {
        let mut map = Map::new();
        if let Some(before) = &self.before {
            map.insert("before".to_string(), before.clone());
        }
        if let Some(after) = &self.after {
            map.insert("after".to_string(), after.clone());
        }
        if let Some(reason) = &self.reason {
            map.insert("reason".to_string(), JsonValue::String(reason.clone()));
        }
        if let Some(comment) = &self.comment {
            map.insert("comment".to_string(), JsonValue::String(comment.clone()));
        }
        JsonValue::Object(map)
    }
}

/// Insert the audit row on the given executor.
///
/// Callers pass the mutation's own transaction; passing anything else breaks
/// the shared-commit guarantee.
pub fn record(tx: &dyn RowExecutor, actor: &ActorId, entry: &AuditEntry) -> Result<(), RowError> {
    tx.execute(
        "INSERT INTO audit_log (id, actor_id, action, entity_type, entity_id, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6)",
        &[
            &Uuid::new_v4(),
            &actor.as_str(),
            &entry.action,
            &entry.entity_type,
            &entry.entity_id,
            &entry.metadata(),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metadata_includes_only_present_parts() {
        let entry = AuditEntry::new("transaction.update", "financial_transaction", Uuid::nil())
            .before(json!({ "amount": "10.00" }))
            .after(json!({ "amount": "12.50" }))
            .comment("amount corrected");

        let metadata = entry.metadata();
        assert_eq!(metadata["before"]["amount"], "10.00");
        assert_eq!(metadata["after"]["amount"], "12.50");
        assert_eq!(metadata["comment"], "amount corrected");
        assert!(metadata.get("reason").is_none());
    }

    #[test]
    fn test_metadata_empty_when_nothing_set() {
        let entry = AuditEntry::new("period.close", "accounting_period", Uuid::nil());
        assert_eq!(entry.metadata(), json!({}));
    }
}
