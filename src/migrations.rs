//! Registered migrations
//!
//! The pipeline's whole schema: actor directory, accounting periods,
//! financial transactions, activity reports, the append-only audit log, the
//! notification feed, and the idempotency record table whose primary key is
//! the cross-request claim primitive.

use crate::executor::RowError;
use crate::migration::{Migration, SchemaManager};

/// All migrations, in no particular order; the migrator sorts by version.
pub fn all() -> Vec<Box<dyn Migration>> {
    vec![
        Box::new(CreateMutationPipelineSchema),
        Box::new(CreateIdempotencyRecords),
    ]
}

/// Core schema for the mutation pipeline.
pub struct CreateMutationPipelineSchema;

impl Migration for CreateMutationPipelineSchema {
    fn name(&self) -> &str {
        "create_mutation_pipeline_schema"
    }

    fn version(&self) -> i64 {
        20260115093000
    }

    fn up(&self, manager: &SchemaManager<'_>) -> Result<(), RowError> {
        // Actor directory: roles for the ownership/workflow guards. Identity
        // itself comes from the external provider; only the role lives here.
        manager.execute(
            r#"
            CREATE TABLE IF NOT EXISTS actors (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL DEFAULT '',
                role TEXT NOT NULL DEFAULT 'member' CHECK (role IN ('member', 'admin')),
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            &[],
        )?;

        manager.execute(
            r#"
            CREATE TABLE IF NOT EXISTS accounting_periods (
                id UUID PRIMARY KEY,
                period_type TEXT NOT NULL CHECK (period_type IN ('month', 'quarter', 'year')),
                start_date DATE NOT NULL,
                end_date DATE NOT NULL,
                status TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'closed')),
                closed_at TIMESTAMPTZ,
                closed_by TEXT REFERENCES actors(id),
                snapshot JSONB,
                CONSTRAINT check_period_range CHECK (start_date <= end_date)
            )
            "#,
            &[],
        )?;
        manager.execute(
            "CREATE INDEX IF NOT EXISTS idx_accounting_periods_range \
             ON accounting_periods(start_date, end_date)",
            &[],
        )?;
        manager.execute(
            "CREATE INDEX IF NOT EXISTS idx_accounting_periods_status \
             ON accounting_periods(status)",
            &[],
        )?;

        manager.execute(
            r#"
            CREATE TABLE IF NOT EXISTS financial_transactions (
                id UUID PRIMARY KEY,
                kind TEXT NOT NULL CHECK (kind IN ('income', 'expense')),
                description TEXT NOT NULL,
                amount NUMERIC(19, 4) NOT NULL CHECK (amount > 0),
                effective_date DATE NOT NULL,
                activity_id UUID,
                attachment_path TEXT,
                system_generated BOOLEAN NOT NULL DEFAULT false,
                source_report_id UUID,
                created_by TEXT NOT NULL REFERENCES actors(id),
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            &[],
        )?;
        manager.execute(
            "CREATE INDEX IF NOT EXISTS idx_financial_transactions_effective_date \
             ON financial_transactions(effective_date)",
            &[],
        )?;
        manager.execute(
            "CREATE INDEX IF NOT EXISTS idx_financial_transactions_activity_id \
             ON financial_transactions(activity_id)",
            &[],
        )?;
        manager.execute(
            "CREATE INDEX IF NOT EXISTS idx_financial_transactions_created_by \
             ON financial_transactions(created_by)",
            &[],
        )?;

        manager.execute(
            r#"
            CREATE TABLE IF NOT EXISTS activity_reports (
                id UUID PRIMARY KEY,
                activity_id UUID NOT NULL UNIQUE,
                title TEXT NOT NULL,
                total_amount NUMERIC(19, 4) NOT NULL CHECK (total_amount >= 0),
                report_date DATE NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft'
                    CHECK (status IN ('draft', 'submitted', 'approved', 'rejected')),
                created_by TEXT NOT NULL REFERENCES actors(id),
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            &[],
        )?;
        manager.execute(
            "CREATE INDEX IF NOT EXISTS idx_activity_reports_status ON activity_reports(status)",
            &[],
        )?;

        // Audit rows default created_at to the transaction clock, so every
        // row of one mutation shares its commit-consistent timestamp.
        manager.execute(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id UUID PRIMARY KEY,
                actor_id TEXT NOT NULL,
                action TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id UUID NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            &[],
        )?;
        manager.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_log_entity \
             ON audit_log(entity_type, entity_id)",
            &[],
        )?;
        manager.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_log_actor_id ON audit_log(actor_id)",
            &[],
        )?;

        manager.execute(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id UUID PRIMARY KEY,
                recipient TEXT NOT NULL,
                event TEXT NOT NULL,
                payload JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            &[],
        )?;
        manager.execute(
            "CREATE INDEX IF NOT EXISTS idx_notifications_recipient \
             ON notifications(recipient, created_at)",
            &[],
        )?;

        // Row-security policies keyed on the session variable the proxy and
        // mutation transactions bind. Members see their own rows; the admin
        // role sees everything.
        manager.execute(
            "ALTER TABLE financial_transactions ENABLE ROW LEVEL SECURITY",
            &[],
        )?;
        manager.execute(
            r#"
            CREATE POLICY financial_transactions_actor_scope ON financial_transactions
            USING (
                created_by = current_setting('app.current_actor', true)
                OR EXISTS (
                    SELECT 1 FROM actors a
                    WHERE a.id = current_setting('app.current_actor', true)
                      AND a.role = 'admin'
                )
            )
            "#,
            &[],
        )?;
        manager.execute("ALTER TABLE activity_reports ENABLE ROW LEVEL SECURITY", &[])?;
        manager.execute(
            r#"
            CREATE POLICY activity_reports_actor_scope ON activity_reports
            USING (
                created_by = current_setting('app.current_actor', true)
                OR EXISTS (
                    SELECT 1 FROM actors a
                    WHERE a.id = current_setting('app.current_actor', true)
                      AND a.role = 'admin'
                )
            )
            "#,
            &[],
        )?;

        Ok(())
    }

    fn down(&self, manager: &SchemaManager<'_>) -> Result<(), RowError> {
        manager.execute("DROP TABLE IF EXISTS notifications", &[])?;
        manager.execute("DROP TABLE IF EXISTS audit_log", &[])?;
        manager.execute("DROP TABLE IF EXISTS activity_reports", &[])?;
        manager.execute("DROP TABLE IF EXISTS financial_transactions", &[])?;
        manager.execute("DROP TABLE IF EXISTS accounting_periods", &[])?;
        manager.execute("DROP TABLE IF EXISTS actors", &[])?;
        Ok(())
    }
}

/// Idempotency records: the primary key on `key` is the atomic claim
/// primitive the lock manager rides on.
pub struct CreateIdempotencyRecords;

impl Migration for CreateIdempotencyRecords {
    fn name(&self) -> &str {
        "create_idempotency_records"
    }

    fn version(&self) -> i64 {
        20260116101500
    }

    fn up(&self, manager: &SchemaManager<'_>) -> Result<(), RowError> {
        manager.execute(
            r#"
            CREATE TABLE IF NOT EXISTS idempotency_records (
                key TEXT PRIMARY KEY,
                response_payload JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
            &[],
        )?;
        manager.execute(
            "CREATE INDEX IF NOT EXISTS idx_idempotency_records_expires_at \
             ON idempotency_records(expires_at)",
            &[],
        )?;
        Ok(())
    }

    fn down(&self, manager: &SchemaManager<'_>) -> Result<(), RowError> {
        manager.execute("DROP TABLE IF EXISTS idempotency_records", &[])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_are_unique_and_ordered() {
        let migrations = all();
        let mut versions: Vec<i64> = migrations.iter().map(|m| m.version()).collect();
        let count = versions.len();
        versions.sort_unstable();
        versions.dedup();
        assert_eq!(versions.len(), count);
        assert!(versions.iter().all(|v| *v > 0));
    }
}
