use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::maintenance::restore::RestorePlan;
use crate::maintenance::table::TableRef;

/// Failure reported by the database or remote channel, carrying the engine
/// message verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => Self::new(db_err.message()),
            _ => Self::new(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VacuumMode {
    /// `VACUUM ANALYZE`
    Analyze,
    /// `VACUUM FULL ANALYZE`, takes an exclusive lock.
    Full,
}

/// Administrative access to the monitored database.
#[async_trait]
pub trait MaintenanceBackend: Send + Sync {
    /// Runs outside any transaction block.
    async fn vacuum(&self, table: &TableRef, mode: VacuumMode) -> Result<(), BackendError>;
    async fn total_size(&self, table: &TableRef) -> Result<Option<i64>, BackendError>;
    /// Plan persisted by the latest committed archive of `table`.
    async fn restore_plan(&self, table: &TableRef) -> Result<Option<RestorePlan>, BackendError>;
    async fn begin(&self) -> Result<Box<dyn MaintenanceTx>, BackendError>;
}

/// One open database transaction. Dropping it without `commit` rolls back.
#[async_trait]
pub trait MaintenanceTx: Send {
    /// Transaction-scoped advisory lock; `false` when another session holds it.
    async fn try_lock_target(&mut self, key: &str) -> Result<bool, BackendError>;
    /// Create `archive` mirroring `source` plus an `archive_timestamp` column,
    /// if it does not exist yet.
    async fn create_archive(&mut self, source: &TableRef, archive: &TableRef)
    -> Result<(), BackendError>;
    /// Copy every source row, stamped with the transaction time. Returns the row count.
    async fn copy_into_archive(
        &mut self,
        source: &TableRef,
        archive: &TableRef,
    ) -> Result<u64, BackendError>;
    async fn truncate(&mut self, table: &TableRef) -> Result<(), BackendError>;
    /// Persist `plan`, replacing any earlier plan for the same source table.
    async fn record_restore_plan(&mut self, plan: &RestorePlan) -> Result<(), BackendError>;
    /// Copy archive rows stamped before `current_date - retention_days` back into `source`.
    async fn restore_from_archive(
        &mut self,
        archive: &TableRef,
        source: &TableRef,
        retention_days: u32,
    ) -> Result<u64, BackendError>;
    /// Delete the rows `restore_from_archive` selected.
    async fn purge_archive(
        &mut self,
        archive: &TableRef,
        retention_days: u32,
    ) -> Result<u64, BackendError>;
    async fn commit(self: Box<Self>) -> Result<(), BackendError>;
    async fn rollback(self: Box<Self>) -> Result<(), BackendError>;
}

/// Captured result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }
}

/// Fixed-command remote execution channel.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Restart the database service on `host`. `Err` means the command could
    /// not be started at all.
    async fn restart_service(&self, host: &str) -> Result<RemoteOutput, BackendError>;
}
