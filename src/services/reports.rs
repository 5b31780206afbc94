//! Activity reports
//!
//! Workflow: draft -> submitted -> approved | rejected. At most one report
//! exists per activity. Approval spawns the activity's settlement transaction
//! as a system-generated record in the same database transaction, which makes
//! the spawned row immutable from then on.

use crate::audit::AuditEntry;
use crate::error::{ServiceError, ServiceResult};
use crate::executor::{RowError, RowExecutor};
use crate::guards;
use crate::mutation::MutationTx;
use crate::notify::Notification;
use crate::services::ServiceContext;
use chrono::{DateTime, NaiveDate, Utc};
use may_postgres::Row;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Draft,
    Submitted,
    Approved,
    Rejected,
}

impl ReportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportStatus::Draft => "draft",
            ReportStatus::Submitted => "submitted",
            ReportStatus::Approved => "approved",
            ReportStatus::Rejected => "rejected",
        }
    }

    fn from_db(value: &str) -> Result<Self, RowError> {
        match value {
            "draft" => Ok(ReportStatus::Draft),
            "submitted" => Ok(ReportStatus::Submitted),
            "approved" => Ok(ReportStatus::Approved),
            "rejected" => Ok(ReportStatus::Rejected),
            other => Err(RowError::Parse(format!("unknown report status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActivityReport {
    pub id: Uuid,
    pub activity_id: Uuid,
    pub title: String,
    pub total_amount: Decimal,
    pub report_date: NaiveDate,
    pub status: ReportStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActivityReport {
    const COLUMNS: &'static str =
        "id, activity_id, title, total_amount, report_date, status, created_by, created_at, updated_at";

    fn from_row(row: &Row) -> Result<Self, RowError> {
        let status: String = row.get(5);
        Ok(Self {
            id: row.get(0),
            activity_id: row.get(1),
            title: row.get(2),
            total_amount: row.get(3),
            report_date: row.get(4),
            status: ReportStatus::from_db(&status)?,
            created_by: row.get(6),
            created_at: row.get(7),
            updated_at: row.get(8),
        })
    }

    pub fn to_json(&self) -> JsonValue {
        json!({
            "id": self.id,
            "activity_id": self.activity_id,
            "title": self.title,
            "total_amount": self.total_amount,
            "report_date": self.report_date,
            "status": self.status.as_str(),
            "created_by": self.created_by,
        })
    }
}

fn load_for_update(tx: &dyn RowExecutor, id: Uuid) -> ServiceResult<ActivityReport> {
    let row = tx.query_opt(
        &format!(
            "SELECT {} FROM activity_reports WHERE id = $1 FOR UPDATE",
            ActivityReport::COLUMNS
        ),
        &[&id],
    )?;
    match row {
        Some(row) => Ok(ActivityReport::from_row(&row)?),
        None => Err(ServiceError::NotFound {
            entity: "activity_report",
            id: id.to_string(),
        }),
    }
}

fn load(tx: &dyn RowExecutor, id: Uuid) -> ServiceResult<ActivityReport> {
    let row = tx.query_one(
        &format!(
            "SELECT {} FROM activity_reports WHERE id = $1",
            ActivityReport::COLUMNS
        ),
        &[&id],
    )?;
    Ok(ActivityReport::from_row(&row)?)
}

#[derive(Debug, Deserialize)]
pub struct CreateReportInput {
    pub activity_id: Uuid,
    pub title: String,
    pub total_amount: Decimal,
    pub report_date: NaiveDate,
}

/// Create a report for an activity. At most one report per activity.
pub fn create_report(
    ctx: &ServiceContext<'_>,
    input: &CreateReportInput,
) -> ServiceResult<ActivityReport> {
    if input.title.trim().is_empty() {
        return Err(ServiceError::Validation("title must not be empty".to_string()));
    }
    if input.total_amount < Decimal::ZERO {
        return Err(ServiceError::Validation(
            "total_amount must not be negative".to_string(),
        ));
    }

    let mtx = MutationTx::begin(ctx.db, "report.create", ctx.mutation_timeout)?;

    let existing = mtx.tx().query_opt(
        "SELECT id FROM activity_reports WHERE activity_id = $1",
        &[&input.activity_id],
    )?;
    if existing.is_some() {
        return Err(ServiceError::Conflict {
            invariant: "ACTIVITY_ALREADY_REPORTED",
            message: format!("activity {} already has a report", input.activity_id),
        });
    }

    let id = Uuid::new_v4();
    mtx.tx().execute(
        "INSERT INTO activity_reports \
         (id, activity_id, title, total_amount, report_date, status, created_by) \
         VALUES ($1, $2, $3, $4, $5, 'draft', $6)",
        &[
            &id,
            &input.activity_id,
            &input.title,
            &input.total_amount,
            &input.report_date,
            &mtx.actor().as_str(),
        ],
    )?;

    let created = load(mtx.tx(), id)?;
    mtx.audit(
        &AuditEntry::new("report.create", "activity_report", id)
            .after(created.to_json())
            .comment(format!("created report for activity {}", input.activity_id)),
    )?;
    mtx.commit()?;

    Ok(created)
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateReportInput {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub total_amount: Option<Decimal>,
    #[serde(default)]
    pub report_date: Option<NaiveDate>,
}

/// Update a report. Only the creator (or an administrator) may edit, and only
/// while the report is still a draft or was sent back as rejected.
pub fn update_report(
    ctx: &ServiceContext<'_>,
    id: Uuid,
    input: &UpdateReportInput,
) -> ServiceResult<ActivityReport> {
    let mtx = MutationTx::begin(ctx.db, "report.update", ctx.mutation_timeout)?;

    let before = load_for_update(mtx.tx(), id)?;
    guards::ensure_owner_or_elevated(mtx.actor(), &before.created_by, mtx.role(), "update this report")?;
    guards::ensure_workflow_state(
        &before.status,
        &[ReportStatus::Draft, ReportStatus::Rejected],
        mtx.role(),
        "update this report",
    )?;

    let title = input.title.clone().unwrap_or_else(|| before.title.clone());
    let total_amount = input.total_amount.unwrap_or(before.total_amount);
    let report_date = input.report_date.unwrap_or(before.report_date);
    if title.trim().is_empty() {
        return Err(ServiceError::Validation("title must not be empty".to_string()));
    }
    if total_amount < Decimal::ZERO {
        return Err(ServiceError::Validation(
            "total_amount must not be negative".to_string(),
        ));
    }

    mtx.tx().execute(
        "UPDATE activity_reports \
         SET title = $2, total_amount = $3, report_date = $4, updated_at = now() \
         WHERE id = $1",
        &[&id, &title, &total_amount, &report_date],
    )?;

    let after = load(mtx.tx(), id)?;
    mtx.audit(
        &AuditEntry::new("report.update", "activity_report", id)
            .before(before.to_json())
            .after(after.to_json())
            .comment("report updated"),
    )?;
    mtx.commit()?;

    Ok(after)
}

/// Submit a draft (or rejected) report for approval.
pub fn submit_report(ctx: &ServiceContext<'_>, id: Uuid) -> ServiceResult<ActivityReport> {
    let mtx = MutationTx::begin(ctx.db, "report.submit", ctx.mutation_timeout)?;

    let before = load_for_update(mtx.tx(), id)?;
    guards::ensure_owner_or_elevated(mtx.actor(), &before.created_by, mtx.role(), "submit this report")?;
    guards::ensure_workflow_state(
        &before.status,
        &[ReportStatus::Draft, ReportStatus::Rejected],
        mtx.role(),
        "submit this report",
    )?;

    mtx.tx().execute(
        "UPDATE activity_reports SET status = 'submitted', updated_at = now() WHERE id = $1",
        &[&id],
    )?;

    let after = load(mtx.tx(), id)?;
    mtx.audit(
        &AuditEntry::new("report.submit", "activity_report", id)
            .before(before.to_json())
            .after(after.to_json())
            .comment("report submitted for approval"),
    )?;
    mtx.commit()?;

    Ok(after)
}

/// Approve a submitted report. Elevated role only.
///
/// Approval settles the activity: a system-generated expense transaction for
/// the report total is written in the same database transaction, so the
/// report can never be approved without its settlement row or vice versa.
pub fn approve_report(ctx: &ServiceContext<'_>, id: Uuid) -> ServiceResult<ActivityReport> {
    let mtx = MutationTx::begin(ctx.db, "report.approve", ctx.mutation_timeout)?;

    if !mtx.role().is_elevated() {
        return Err(ServiceError::Forbidden(
            "only an administrator may approve reports".to_string(),
        ));
    }

    let before = load_for_update(mtx.tx(), id)?;
    if before.status != ReportStatus::Submitted {
        return Err(ServiceError::Validation(format!(
            "report must be submitted before approval, found {}",
            before.status.as_str()
        )));
    }
    guards::ensure_period_open(mtx.tx(), before.report_date, "approve_report")?;

    mtx.tx().execute(
        "UPDATE activity_reports SET status = 'approved', updated_at = now() WHERE id = $1",
        &[&id],
    )?;

    let settlement_id = Uuid::new_v4();
    mtx.tx().execute(
        "INSERT INTO financial_transactions \
         (id, kind, description, amount, effective_date, activity_id, attachment_path, \
          system_generated, source_report_id, created_by) \
         VALUES ($1, 'expense', $2, $3, $4, $5, NULL, true, $6, $7)",
        &[
            &settlement_id,
            &format!("Settlement for report: {}", before.title),
            &before.total_amount,
            &before.report_date,
            &before.activity_id,
            &id,
            &mtx.actor().as_str(),
        ],
    )?;

    let after = load(mtx.tx(), id)?;
    mtx.audit(
        &AuditEntry::new("report.approve", "activity_report", id)
            .before(before.to_json())
            .after(after.to_json())
            .comment(format!("approved; settlement transaction {settlement_id}")),
    )?;
    mtx.audit(
        &AuditEntry::new("transaction.system_create", "financial_transaction", settlement_id)
            .reason(format!("spawned by approval of report {id}"))
            .comment(format!("settlement of {}", before.total_amount)),
    )?;
    mtx.commit()?;

    ctx.notifier.notify(Notification {
        recipient: before.created_by.clone(),
        event: "report.approved".to_string(),
        payload: json!({ "report_id": id, "settlement_transaction_id": settlement_id }),
    });

    Ok(after)
}

/// Send a submitted report back to its creator. Elevated role only.
pub fn reject_report(
    ctx: &ServiceContext<'_>,
    id: Uuid,
    reason: &str,
) -> ServiceResult<ActivityReport> {
    let mtx = MutationTx::begin(ctx.db, "report.reject", ctx.mutation_timeout)?;

    if !mtx.role().is_elevated() {
        return Err(ServiceError::Forbidden(
            "only an administrator may reject reports".to_string(),
        ));
    }

    let before = load_for_update(mtx.tx(), id)?;
    if before.status != ReportStatus::Submitted {
        return Err(ServiceError::Validation(format!(
            "report must be submitted before rejection, found {}",
            before.status.as_str()
        )));
    }

    mtx.tx().execute(
        "UPDATE activity_reports SET status = 'rejected', updated_at = now() WHERE id = $1",
        &[&id],
    )?;

    let after = load(mtx.tx(), id)?;
    mtx.audit(
        &AuditEntry::new("report.reject", "activity_report", id)
            .before(before.to_json())
            .after(after.to_json())
            .reason(reason)
            .comment("report rejected"),
    )?;
    mtx.commit()?;

    ctx.notifier.notify(Notification {
        recipient: before.created_by.clone(),
        event: "report.rejected".to_string(),
        payload: json!({ "report_id": id, "reason": reason }),
    });

    Ok(after)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_status_round_trip() {
        for status in [
            ReportStatus::Draft,
            ReportStatus::Submitted,
            ReportStatus::Approved,
            ReportStatus::Rejected,
        ] {
            assert_eq!(ReportStatus::from_db(status.as_str()).unwrap(), status);
        }
        assert!(ReportStatus::from_db("archived").is_err());
    }

    #[test]
    fn test_report_to_json_carries_status_text() {
        let report = ActivityReport {
            id: Uuid::nil(),
            activity_id: Uuid::nil(),
            title: "Spring fundraiser".to_string(),
            total_amount: Decimal::new(125_00, 2),
            report_date: "2026-05-10".parse().unwrap(),
            status: ReportStatus::Submitted,
            created_by: "alice".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let body = report.to_json();
        assert_eq!(body["status"], "submitted");
        assert_eq!(body["title"], "Spring fundraiser");
    }
}
