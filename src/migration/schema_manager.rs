//! SchemaManager - schema operations available to migrations

use crate::executor::{RowError, RowExecutor};
use sea_query::{IndexCreateStatement, IndexDropStatement, TableCreateStatement, TableDropStatement};

/// Wraps an executor with convenience methods for DDL.
///
/// Migrations receive a borrowed manager; they never own the connection.
pub struct SchemaManager<'a> {
    executor: &'a dyn RowExecutor,
}

impl<'a> SchemaManager<'a> {
    pub fn new(executor: &'a dyn RowExecutor) -> Self {
        Self { executor }
    }

    /// Create a table from a sea-query statement
    pub fn create_table(&self, table: TableCreateStatement) -> Result<(), RowError> {
        let sql = table.build(sea_query::PostgresQueryBuilder);
        self.executor.execute(&sql, &[]).map(|_| ())
    }

    /// Drop a table
    pub fn drop_table(&self, table: TableDropStatement) -> Result<(), RowError> {
        let sql = table.build(sea_query::PostgresQueryBuilder);
        self.executor.execute(&sql, &[]).map(|_| ())
    }

    /// Create an index
    pub fn create_index(&self, index: IndexCreateStatement) -> Result<(), RowError> {
        let sql = index.build(sea_query::PostgresQueryBuilder);
        self.executor.execute(&sql, &[]).map(|_| ())
    }

    /// Drop an index
    pub fn drop_index(&self, index: IndexDropStatement) -> Result<(), RowError> {
        let sql = index.build(sea_query::PostgresQueryBuilder);
        self.executor.execute(&sql, &[]).map(|_| ())
    }

    /// Execute raw SQL
    ///
    /// Used for everything sea-query does not model: row-security policies,
    /// CHECK constraints, extensions.
    pub fn execute(
        &self,
        sql: &str,
        params: &[&dyn may_postgres::types::ToSql],
    ) -> Result<(), RowError> {
        self.executor.execute(sql, params).map(|_| ())
    }

    /// Get a reference to the underlying executor
    pub fn executor(&self) -> &dyn RowExecutor {
        self.executor
    }
}
