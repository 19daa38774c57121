use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use tracing::{debug, instrument};

use crate::db::DbPool;
use crate::maintenance::backend::{BackendError, MaintenanceBackend, MaintenanceTx, VacuumMode};
use crate::maintenance::restore::RestorePlan;
use crate::maintenance::table::TableRef;

const ADVISORY_PREFIX: &str = "pgdash:";

const COLUMN_LIST_SQL: &str = r#"
SELECT string_agg(quote_ident(column_name), ', ' ORDER BY ordinal_position)
FROM information_schema.columns
WHERE table_schema = $1
  AND table_name = $2
  AND is_generated = 'NEVER'
  AND column_name <> 'archive_timestamp'
"#;

const UNDEFINED_TABLE: &str = "42P01";

const CREATE_PLANS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS pgdash_restore_plans (
    schema_name text NOT NULL,
    table_name text NOT NULL,
    archive_table text NOT NULL,
    retention_days integer NOT NULL,
    registered_at timestamptz NOT NULL,
    PRIMARY KEY (schema_name, table_name)
)
"#;

const UPSERT_PLAN_SQL: &str = r#"
INSERT INTO pgdash_restore_plans
    (schema_name, table_name, archive_table, retention_days, registered_at)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (schema_name, table_name) DO UPDATE
SET archive_table = EXCLUDED.archive_table,
    retention_days = EXCLUDED.retention_days,
    registered_at = EXCLUDED.registered_at
"#;

const SELECT_PLAN_SQL: &str = r#"
SELECT archive_table, retention_days, registered_at
FROM pgdash_restore_plans
WHERE schema_name = $1
  AND table_name = $2
"#;

/// Administrative statements against the writable pool. Identifiers come from
/// validated `TableRef`s or `quote_ident`; every value is bound.
#[derive(Clone)]
pub struct PgMaintenanceBackend {
    pool: DbPool,
}

impl PgMaintenanceBackend {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MaintenanceBackend for PgMaintenanceBackend {
    #[instrument(skip(self), fields(table = %table))]
    async fn vacuum(&self, table: &TableRef, mode: VacuumMode) -> Result<(), BackendError> {
        let statement = match mode {
            VacuumMode::Analyze => format!("VACUUM ANALYZE {}", table.quoted()),
            VacuumMode::Full => format!("VACUUM FULL ANALYZE {}", table.quoted()),
        };
        // simple query protocol: VACUUM refuses to run inside a transaction block
        sqlx::raw_sql(&statement).execute(&self.pool).await?;
        Ok(())
    }

    async fn total_size(&self, table: &TableRef) -> Result<Option<i64>, BackendError> {
        let size: Option<i64> =
            sqlx::query_scalar("SELECT pg_total_relation_size(to_regclass($1))::bigint")
                .bind(table.quoted())
                .fetch_one(&self.pool)
                .await?;
        Ok(size)
    }

    async fn restore_plan(&self, table: &TableRef) -> Result<Option<RestorePlan>, BackendError> {
        let row: Option<(String, i32, DateTime<Utc>)> = match sqlx::query_as(SELECT_PLAN_SQL)
            .bind(table.schema())
            .bind(table.name())
            .fetch_optional(&self.pool)
            .await
        {
            Ok(row) => row,
            // nothing was ever archived on this database
            Err(sqlx::Error::Database(err)) if err.code().as_deref() == Some(UNDEFINED_TABLE) => None,
            Err(err) => return Err(err.into()),
        };
        let Some((archive_name, retention_days, registered_at)) = row else {
            return Ok(None);
        };
        let archive_table = TableRef::new(table.schema(), &archive_name)
            .map_err(|err| BackendError::new(format!("stored restore plan is invalid: {err}")))?;
        let retention_days = u32::try_from(retention_days).map_err(|_| {
            BackendError::new(format!("stored retention of {retention_days} days is invalid"))
        })?;
        Ok(Some(RestorePlan {
            table: table.clone(),
            archive_table,
            retention_days,
            registered_at,
        }))
    }

    async fn begin(&self) -> Result<Box<dyn MaintenanceTx>, BackendError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgMaintenanceTx { tx }))
    }
}

struct PgMaintenanceTx {
    tx: Transaction<'static, Postgres>,
}

impl PgMaintenanceTx {
    async fn column_list(&mut self, table: &TableRef) -> Result<String, BackendError> {
        let columns: Option<String> = sqlx::query_scalar(COLUMN_LIST_SQL)
            .bind(table.schema())
            .bind(table.name())
            .fetch_one(&mut *self.tx)
            .await?;
        columns.ok_or_else(|| {
            BackendError::new(format!("relation {} does not exist or has no columns", table))
        })
    }
}

fn days_param(retention_days: u32) -> Result<i32, BackendError> {
    i32::try_from(retention_days)
        .map_err(|_| BackendError::new(format!("retention of {retention_days} days is out of range")))
}

#[async_trait]
impl MaintenanceTx for PgMaintenanceTx {
    async fn try_lock_target(&mut self, key: &str) -> Result<bool, BackendError> {
        let locked: bool =
            sqlx::query_scalar("SELECT pg_try_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(format!("{ADVISORY_PREFIX}{key}"))
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(locked)
    }

    async fn create_archive(
        &mut self,
        source: &TableRef,
        archive: &TableRef,
    ) -> Result<(), BackendError> {
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {} (LIKE {} INCLUDING ALL)",
            archive.quoted(),
            source.quoted()
        );
        sqlx::query(&create).execute(&mut *self.tx).await?;

        let stamp = format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS archive_timestamp timestamptz NOT NULL DEFAULT now()",
            archive.quoted()
        );
        sqlx::query(&stamp).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn copy_into_archive(
        &mut self,
        source: &TableRef,
        archive: &TableRef,
    ) -> Result<u64, BackendError> {
        let columns = self.column_list(source).await?;
        let insert = format!(
            "INSERT INTO {archive} ({columns}, archive_timestamp) OVERRIDING SYSTEM VALUE \
             SELECT {columns}, now() FROM {source}",
            archive = archive.quoted(),
            source = source.quoted(),
        );
        let result = sqlx::query(&insert).execute(&mut *self.tx).await?;
        debug!(rows = result.rows_affected(), "rows copied into archive");
        Ok(result.rows_affected())
    }

    async fn truncate(&mut self, table: &TableRef) -> Result<(), BackendError> {
        let statement = format!("TRUNCATE TABLE {}", table.quoted());
        sqlx::query(&statement).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn record_restore_plan(&mut self, plan: &RestorePlan) -> Result<(), BackendError> {
        sqlx::query(CREATE_PLANS_SQL).execute(&mut *self.tx).await?;
        sqlx::query(UPSERT_PLAN_SQL)
            .bind(plan.table.schema())
            .bind(plan.table.name())
            .bind(plan.archive_table.name())
            .bind(days_param(plan.retention_days)?)
            .bind(plan.registered_at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn restore_from_archive(
        &mut self,
        archive: &TableRef,
        source: &TableRef,
        retention_days: u32,
    ) -> Result<u64, BackendError> {
        let columns = self.column_list(source).await?;
        let insert = format!(
            "INSERT INTO {source} ({columns}) OVERRIDING SYSTEM VALUE \
             SELECT {columns} FROM {archive} \
             WHERE archive_timestamp < current_date - make_interval(days => $1)",
            archive = archive.quoted(),
            source = source.quoted(),
        );
        let result = sqlx::query(&insert)
            .bind(days_param(retention_days)?)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_archive(
        &mut self,
        archive: &TableRef,
        retention_days: u32,
    ) -> Result<u64, BackendError> {
        let delete = format!(
            "DELETE FROM {} WHERE archive_timestamp < current_date - make_interval(days => $1)",
            archive.quoted()
        );
        let result = sqlx::query(&delete)
            .bind(days_param(retention_days)?)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), BackendError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), BackendError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
