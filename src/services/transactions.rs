//! Financial transactions
//!
//! The financial entity the pipeline exists for. All three mutations follow
//! the pattern: actor-bound transaction, snapshot, guards (immutability,
//! ownership, accounting period), write, audit, commit, then best-effort
//! post-commit work. A create that stored an upload before failing deletes
//! that upload again as a compensating action.

use crate::audit::AuditEntry;
use crate::error::{ServiceError, ServiceResult};
use crate::executor::{MayPostgresExecutor, RowError, RowExecutor};
use crate::guards;
use crate::mutation::MutationTx;
use crate::notify::Notification;
use crate::services::ServiceContext;
use crate::storage::FileStore;
use chrono::{DateTime, NaiveDate, Utc};
use may_postgres::Row;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Income,
    Expense,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Income => "income",
            TransactionKind::Expense => "expense",
        }
    }

    fn from_db(value: &str) -> Result<Self, RowError> {
        match value {
            "income" => Ok(TransactionKind::Income),
            "expense" => Ok(TransactionKind::Expense),
            other => Err(RowError::Parse(format!("unknown transaction kind {other:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FinancialTransaction {
    pub id: Uuid,
    pub kind: TransactionKind,
    pub description: String,
    pub amount: Decimal,
    pub effective_date: NaiveDate,
    pub activity_id: Option<Uuid>,
    pub attachment_path: Option<String>,
    pub system_generated: bool,
    pub source_report_id: Option<Uuid>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FinancialTransaction {
    const COLUMNS: &'static str = "id, kind, description, amount, effective_date, activity_id, \
         attachment_path, system_generated, source_report_id, created_by, created_at, updated_at";

    fn from_row(row: &Row) -> Result<Self, RowError> {
        let kind: String = row.get(1);
        Ok(Self {
            id: row.get(0),
            kind: TransactionKind::from_db(&kind)?,
            description: row.get(2),
            amount: row.get(3),
            effective_date: row.get(4),
            activity_id: row.get(5),
            attachment_path: row.get(6),
            system_generated: row.get(7),
            source_report_id: row.get(8),
            created_by: row.get(9),
            created_at: row.get(10),
            updated_at: row.get(11),
        })
    }

    pub fn to_json(&self) -> JsonValue {
        json!({
            "id": self.id,
            "kind": self.kind.as_str(),
            "description": self.description,
            "amount": self.amount,
            "effective_date": self.effective_date,
            "activity_id": self.activity_id,
            "attachment_path": self.attachment_path,
            "system_generated": self.system_generated,
            "source_report_id": self.source_report_id,
            "created_by": self.created_by,
        })
    }
}

fn load_for_update(tx: &dyn RowExecutor, id: Uuid) -> ServiceResult<FinancialTransaction> {
    let row = tx.query_opt(
        &format!(
            "SELECT {} FROM financial_transactions WHERE id = $1 FOR UPDATE",
            FinancialTransaction::COLUMNS
        ),
        &[&id],
    )?;
    match row {
        Some(row) => Ok(FinancialTransaction::from_row(&row)?),
        None => Err(ServiceError::NotFound {
            entity: "financial_transaction",
            id: id.to_string(),
        }),
    }
}

fn load(tx: &dyn RowExecutor, id: Uuid) -> ServiceResult<FinancialTransaction> {
    let row = tx.query_one(
        &format!(
            "SELECT {} FROM financial_transactions WHERE id = $1",
            FinancialTransaction::COLUMNS
        ),
        &[&id],
    )?;
    Ok(FinancialTransaction::from_row(&row)?)
}

fn validate_amount(amount: Decimal) -> ServiceResult<()> {
    if amount <= Decimal::ZERO {
        return Err(ServiceError::Validation(
            "amount must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct CreateTransactionInput {
    pub kind: TransactionKind,
    pub description: String,
    pub amount: Decimal,
    pub effective_date: NaiveDate,
    #[serde(default)]
    pub activity_id: Option<Uuid>,
    /// Set when an upload was stored before this mutation ran; deleted again
    /// if the mutation fails.
    #[serde(default)]
    pub attachment_path: Option<String>,
}

/// Create a financial transaction.
pub fn create_transaction(
    ctx: &ServiceContext<'_>,
    input: &CreateTransactionInput,
) -> ServiceResult<FinancialTransaction> {
    let result = create_transaction_inner(ctx, input);
    if result.is_err() {
        if let Some(path) = &input.attachment_path {
            cleanup_attachment(ctx.files, path);
        }
    }
    result
}

fn create_transaction_inner(
    ctx: &ServiceContext<'_>,
    input: &CreateTransactionInput,
) -> ServiceResult<FinancialTransaction> {
    validate_amount(input.amount)?;
    if input.description.trim().is_empty() {
        return Err(ServiceError::Validation(
            "description must not be empty".to_string(),
        ));
    }

    let mtx = MutationTx::begin(ctx.db, "transaction.create", ctx.mutation_timeout)?;

    guards::ensure_period_open(mtx.tx(), input.effective_date, "create_transaction")?;

    let id = Uuid::new_v4();
    mtx.tx().execute(
        "INSERT INTO financial_transactions \
         (id, kind, description, amount, effective_date, activity_id, attachment_path, \
          system_generated, source_report_id, created_by) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, false, NULL, $8)",
        &[
            &id,
            &input.kind.as_str(),
            &input.description,
            &input.amount,
            &input.effective_date,
            &input.activity_id,
            &input.attachment_path,
            &mtx.actor().as_str(),
        ],
    )?;

    let created = load(mtx.tx(), id)?;
    mtx.audit(
        &AuditEntry::new("transaction.create", "financial_transaction", id)
            .after(created.to_json())
            .comment(format!(
                "created {} of {}",
                created.kind.as_str(),
                created.amount
            )),
    )?;

    let actor = mtx.actor().clone();
    mtx.commit()?;

    ctx.notifier.notify(Notification {
        recipient: actor.into_string(),
        event: "transaction.created".to_string(),
        payload: json!({ "transaction_id": id }),
    });
    if let Some(activity_id) = created.activity_id {
        check_activity_balance(ctx.db, activity_id);
    }

    Ok(created)
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateTransactionInput {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub effective_date: Option<NaiveDate>,
}

/// Update a financial transaction.
///
/// The period guard covers both the stored effective date and the requested
/// one: a row cannot be edited out of a closed period any more than into one.
pub fn update_transaction(
    ctx: &ServiceContext<'_>,
    id: Uuid,
    input: &UpdateTransactionInput,
) -> ServiceResult<FinancialTransaction> {
    let mtx = MutationTx::begin(ctx.db, "transaction.update", ctx.mutation_timeout)?;

    let before = load_for_update(mtx.tx(), id)?;
    guards::ensure_mutable(before.system_generated, id)?;
    guards::ensure_owner_or_elevated(
        mtx.actor(),
        &before.created_by,
        mtx.role(),
        "update this transaction",
    )?;
    guards::ensure_period_open(mtx.tx(), before.effective_date, "update_transaction")?;

    let description = input
        .description
        .clone()
        .unwrap_or_else(|| before.description.clone());
    let amount = input.amount.unwrap_or(before.amount);
    let effective_date = input.effective_date.unwrap_or(before.effective_date);
    validate_amount(amount)?;
    if description.trim().is_empty() {
        return Err(ServiceError::Validation(
            "description must not be empty".to_string(),
        ));
    }
    if effective_date != before.effective_date {
        guards::ensure_period_open(mtx.tx(), effective_date, "update_transaction")?;
    }

    mtx.tx().execute(
        "UPDATE financial_transactions \
         SET description = $2, amount = $3, effective_date = $4, updated_at = now() \
         WHERE id = $1",
        &[&id, &description, &amount, &effective_date],
    )?;

    let after = load(mtx.tx(), id)?;
    mtx.audit(
        &AuditEntry::new("transaction.update", "financial_transaction", id)
            .before(before.to_json())
            .after(after.to_json())
            .comment("transaction updated"),
    )?;
    mtx.commit()?;

    if let Some(activity_id) = after.activity_id {
        check_activity_balance(ctx.db, activity_id);
    }

    Ok(after)
}

/// Delete a financial transaction.
pub fn delete_transaction(ctx: &ServiceContext<'_>, id: Uuid) -> ServiceResult<()> {
    let mtx = MutationTx::begin(ctx.db, "transaction.delete", ctx.mutation_timeout)?;

    let before = load_for_update(mtx.tx(), id)?;
    guards::ensure_mutable(before.system_generated, id)?;
    guards::ensure_owner_or_elevated(
        mtx.actor(),
        &before.created_by,
        mtx.role(),
        "delete this transaction",
    )?;
    guards::ensure_period_open(mtx.tx(), before.effective_date, "delete_transaction")?;

    mtx.tx()
        .execute("DELETE FROM financial_transactions WHERE id = $1", &[&id])?;

    mtx.audit(
        &AuditEntry::new("transaction.delete", "financial_transaction", id)
            .before(before.to_json())
            .comment(format!(
                "deleted {} of {}",
                before.kind.as_str(),
                before.amount
            )),
    )?;
    mtx.commit()?;

    // The row is gone; its attachment follows, best-effort.
    if let Some(path) = &before.attachment_path {
        if let Err(err) = ctx.files.delete_file(path, false) {
            log::warn!("failed to delete attachment {path:?} of removed transaction {id}: {err}");
        }
    }
    if let Some(activity_id) = before.activity_id {
        check_activity_balance(ctx.db, activity_id);
    }

    Ok(())
}

/// Compensating cleanup for an upload referenced by a failed mutation.
/// Failures are logged, never propagated over the mutation's own error.
pub(crate) fn cleanup_attachment(files: &dyn FileStore, path: &str) {
    if let Err(err) = files.delete_file(path, true) {
        log::warn!("rollback cleanup of {path:?} failed: {err}");
    }
}

/// Post-commit integrity check: recompute the activity's net balance and
/// compare it against its approved report. Mismatches are logged for the
/// operators; nothing here can fail the committed mutation.
fn check_activity_balance(db: &MayPostgresExecutor, activity_id: Uuid) {
    let result: Result<(), RowError> = (|| {
        let row = db.query_one(
            "SELECT COALESCE(SUM(CASE WHEN kind = 'income' THEN amount ELSE -amount END), 0) \
             FROM financial_transactions WHERE activity_id = $1",
            &[&activity_id],
        )?;
        let net: Decimal = row.get(0);

        let report = db.query_opt(
            "SELECT total_amount FROM activity_reports \
             WHERE activity_id = $1 AND status = 'approved'",
            &[&activity_id],
        )?;
        if let Some(report) = report {
            let reported: Decimal = report.get(0);
            if reported != -net && reported != net {
                log::warn!(
                    "activity {activity_id}: net transaction balance {net} does not match approved report total {reported}"
                );
            }
        }
        Ok(())
    })();
    if let Err(err) = result {
        log::warn!("balance integrity check for activity {activity_id} failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RecordingFileStore;

    #[test]
    fn test_transaction_kind_round_trip() {
        for kind in [TransactionKind::Income, TransactionKind::Expense] {
            assert_eq!(TransactionKind::from_db(kind.as_str()).unwrap(), kind);
        }
        assert!(TransactionKind::from_db("transfer").is_err());
    }

    #[test]
    fn test_validate_amount() {
        assert!(validate_amount(Decimal::new(1, 2)).is_ok());
        assert!(validate_amount(Decimal::ZERO).is_err());
        assert!(validate_amount(Decimal::new(-100, 2)).is_err());
    }

    #[test]
    fn test_cleanup_attachment_marks_rollback() {
        let files = RecordingFileStore::new();
        cleanup_attachment(&files, "receipts/r1.pdf");
        assert_eq!(files.deletions(), vec![("receipts/r1.pdf".to_string(), true)]);
    }

    #[test]
    fn test_create_input_deserializes_with_optional_fields() {
        let input: CreateTransactionInput = serde_json::from_value(serde_json::json!({
            "kind": "expense",
            "description": "venue rental",
            "amount": "125.00",
            "effective_date": "2026-05-10",
        }))
        .unwrap();
        assert_eq!(input.kind, TransactionKind::Expense);
        assert_eq!(input.activity_id, None);
        assert_eq!(input.attachment_path, None);
    }
}
