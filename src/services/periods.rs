//! Accounting periods
//!
//! A period is a fixed date range that, once closed, freezes every financial
//! mutation whose effective date falls inside it. Ranges never overlap;
//! closure records a snapshot of the totals it froze, stamped with a SHA-256
//! checksum so later exports can prove the snapshot untouched.

use crate::audit::AuditEntry;
use crate::error::{ServiceError, ServiceResult};
use crate::executor::{RowError, RowExecutor};
use crate::mutation::MutationTx;
use crate::notify::Notification;
use crate::services::ServiceContext;
use chrono::{DateTime, NaiveDate, Utc};
use may_postgres::Row;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Month,
    Quarter,
    Year,
}

impl PeriodType {
    pub fn as_str(self) -> &'static str {
        match self {
            PeriodType::Month => "month",
            PeriodType::Quarter => "quarter",
            PeriodType::Year => "year",
        }
    }

    fn from_db(value: &str) -> Result<Self, RowError> {
        match value {
            "month" => Ok(PeriodType::Month),
            "quarter" => Ok(PeriodType::Quarter),
            "year" => Ok(PeriodType::Year),
            other => Err(RowError::Parse(format!("unknown period type {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodStatus {
    Open,
    Closed,
}

impl PeriodStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PeriodStatus::Open => "open",
            PeriodStatus::Closed => "closed",
        }
    }

    fn from_db(value: &str) -> Result<Self, RowError> {
        match value {
            "open" => Ok(PeriodStatus::Open),
            "closed" => Ok(PeriodStatus::Closed),
            other => Err(RowError::Parse(format!("unknown period status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccountingPeriod {
    pub id: Uuid,
    pub period_type: PeriodType,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: PeriodStatus,
    pub closed_at: Option<DateTime<Utc>>,
    pub closed_by: Option<String>,
    pub snapshot: Option<JsonValue>,
}

impl AccountingPeriod {
    const COLUMNS: &'static str =
        "id, period_type, start_date, end_date, status, closed_at, closed_by, snapshot";

    fn from_row(row: &Row) -> Result<Self, RowError> {
        let period_type: String = row.get(1);
        let status: String = row.get(4);
        Ok(Self {
            id: row.get(0),
            period_type: PeriodType::from_db(&period_type)?,
            start_date: row.get(2),
            end_date: row.get(3),
            status: PeriodStatus::from_db(&status)?,
            closed_at: row.get(5),
            closed_by: row.get(6),
            snapshot: row.get(7),
        })
    }

    pub fn label(&self) -> String {
        format!(
            "{}..{} ({})",
            self.start_date,
            self.end_date,
            self.period_type.as_str()
        )
    }

    pub fn to_json(&self) -> JsonValue {
        json!({
            "id": self.id,
            "period_type": self.period_type.as_str(),
            "start_date": self.start_date,
            "end_date": self.end_date,
            "status": self.status.as_str(),
            "closed_at": self.closed_at,
            "closed_by": self.closed_by,
            "snapshot": self.snapshot,
        })
    }
}

/// Inclusive date-range overlap.
pub fn ranges_overlap(
    a_start: NaiveDate,
    a_end: NaiveDate,
    b_start: NaiveDate,
    b_end: NaiveDate,
) -> bool {
    a_start <= b_end && b_start <= a_end
}

#[derive(Debug, Deserialize)]
pub struct CreatePeriodInput {
    pub period_type: PeriodType,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Create an accounting period.
///
/// Rejects ranges that overlap any existing period, open or closed; the check
/// runs inside the mutation transaction so two concurrent creates cannot both
/// pass it against the same committed state.
pub fn create_period(
    ctx: &ServiceContext<'_>,
    input: &CreatePeriodInput,
) -> ServiceResult<AccountingPeriod> {
    if input.start_date > input.end_date {
        return Err(ServiceError::Validation(
            "period start_date must not be after end_date".to_string(),
        ));
    }

    let mtx = MutationTx::begin(ctx.db, "period.create", ctx.mutation_timeout)?;

    let overlapping = mtx.tx().query_opt(
        "SELECT id, period_type, start_date, end_date FROM accounting_periods \
         WHERE start_date <= $2 AND end_date >= $1 LIMIT 1",
        &[&input.start_date, &input.end_date],
    )?;
    if let Some(row) = overlapping {
        let start: NaiveDate = row.get(2);
        let end: NaiveDate = row.get(3);
        return Err(ServiceError::Conflict {
            invariant: "PERIOD_OVERLAP",
            message: format!("requested range overlaps existing period {start}..{end}"),
        });
    }

    let id = Uuid::new_v4();
    mtx.tx().execute(
        "INSERT INTO accounting_periods (id, period_type, start_date, end_date, status) \
         VALUES ($1, $2, $3, $4, 'open')",
        &[
            &id,
            &input.period_type.as_str(),
            &input.start_date,
            &input.end_date,
        ],
    )?;

    let row = mtx.tx().query_one(
        &format!(
            "SELECT {} FROM accounting_periods WHERE id = $1",
            AccountingPeriod::COLUMNS
        ),
        &[&id],
    )?;
    let period = AccountingPeriod::from_row(&row)?;

    mtx.audit(
        &AuditEntry::new("period.create", "accounting_period", id)
            .after(period.to_json())
            .comment(format!("created period {}", period.label())),
    )?;
    mtx.commit()?;

    Ok(period)
}

/// Close an accounting period. Elevated role only.
///
/// The snapshot freezes the totals inside the range at closure time; its
/// checksum covers the canonical rendering of those totals.
pub fn close_period(ctx: &ServiceContext<'_>, period_id: Uuid) -> ServiceResult<AccountingPeriod> {
    let mtx = MutationTx::begin(ctx.db, "period.close", ctx.mutation_timeout)?;

    if !mtx.role().is_elevated() {
        return Err(ServiceError::Forbidden(
            "only an administrator may close an accounting period".to_string(),
        ));
    }

    let row = mtx.tx().query_opt(
        &format!(
            "SELECT {} FROM accounting_periods WHERE id = $1 FOR UPDATE",
            AccountingPeriod::COLUMNS
        ),
        &[&period_id],
    )?;
    let before = match row {
        Some(row) => AccountingPeriod::from_row(&row)?,
        None => {
            return Err(ServiceError::NotFound {
                entity: "accounting_period",
                id: period_id.to_string(),
            })
        }
    };

    if before.status == PeriodStatus::Closed {
        return Err(ServiceError::Conflict {
            invariant: "PERIOD_ALREADY_CLOSED",
            message: format!("period {} is already closed", before.label()),
        });
    }

    let snapshot = build_snapshot(mtx.tx(), &before)?;
    mtx.tx().execute(
        "UPDATE accounting_periods \
         SET status = 'closed', closed_at = now(), closed_by = $2, snapshot = $3 \
         WHERE id = $1",
        &[&period_id, &mtx.actor().as_str(), &snapshot],
    )?;

    let row = mtx.tx().query_one(
        &format!(
            "SELECT {} FROM accounting_periods WHERE id = $1",
            AccountingPeriod::COLUMNS
        ),
        &[&period_id],
    )?;
    let after = AccountingPeriod::from_row(&row)?;

    mtx.audit(
        &AuditEntry::new("period.close", "accounting_period", period_id)
            .before(before.to_json())
            .after(after.to_json())
            .comment(format!("closed period {}", after.label())),
    )?;

    let actor = mtx.actor().clone();
    mtx.commit()?;

    ctx.notifier.notify(Notification {
        recipient: actor.into_string(),
        event: "period.closed".to_string(),
        payload: json!({ "period_id": period_id, "label": after.label() }),
    });

    Ok(after)
}

/// Totals frozen by a closing period, with an integrity checksum.
fn build_snapshot(tx: &dyn RowExecutor, period: &AccountingPeriod) -> Result<JsonValue, RowError> {
    let row = tx.query_one(
        "SELECT COUNT(*), \
                COALESCE(SUM(CASE WHEN kind = 'income' THEN amount ELSE 0 END), 0), \
                COALESCE(SUM(CASE WHEN kind = 'expense' THEN amount ELSE 0 END), 0) \
         FROM financial_transactions \
         WHERE effective_date >= $1 AND effective_date <= $2",
        &[&period.start_date, &period.end_date],
    )?;
    let count: i64 = row.get(0);
    let income: Decimal = row.get(1);
    let expense: Decimal = row.get(2);

    let canonical = format!(
        "{}|{}|{}|{}|{}",
        period.start_date, period.end_date, count, income, expense
    );
    let digest = Sha256::digest(canonical.as_bytes());
    let checksum: String = digest.iter().map(|b| format!("{b:02x}")).collect();

    Ok(json!({
        "transaction_count": count,
        "income_total": income,
        "expense_total": expense,
        "checksum": checksum,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_ranges_overlap() {
        // Partial overlap
        assert!(ranges_overlap(
            date("2026-05-01"),
            date("2026-05-31"),
            date("2026-05-15"),
            date("2026-06-15"),
        ));
        // Containment
        assert!(ranges_overlap(
            date("2026-01-01"),
            date("2026-12-31"),
            date("2026-05-01"),
            date("2026-05-31"),
        ));
        // Shared boundary day counts as overlap
        assert!(ranges_overlap(
            date("2026-05-01"),
            date("2026-05-31"),
            date("2026-05-31"),
            date("2026-06-30"),
        ));
        // Disjoint
        assert!(!ranges_overlap(
            date("2026-05-01"),
            date("2026-05-31"),
            date("2026-06-01"),
            date("2026-06-30"),
        ));
    }

    #[test]
    fn test_period_type_round_trip() {
        for t in [PeriodType::Month, PeriodType::Quarter, PeriodType::Year] {
            assert_eq!(PeriodType::from_db(t.as_str()).unwrap(), t);
        }
        assert!(PeriodType::from_db("week").is_err());
    }

    #[test]
    fn test_period_label() {
        let period = AccountingPeriod {
            id: Uuid::nil(),
            period_type: PeriodType::Month,
            start_date: date("2026-05-01"),
            end_date: date("2026-05-31"),
            status: PeriodStatus::Closed,
            closed_at: None,
            closed_by: None,
            snapshot: None,
        };
        assert_eq!(period.label(), "2026-05-01..2026-05-31 (month)");
    }
}
