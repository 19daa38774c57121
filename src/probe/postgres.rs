use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column as _, Postgres, Row, TypeInfo};
use tracing::{debug, instrument};

use crate::db::DbPool;
use crate::error::{ProbeError, ProbeErrorKind};
use crate::probe::util::classify;
use crate::probe::{
    ActivityFilter, Column, ColumnKind, HighCpuFilter, ProbeClient, ProbeId, ProbeResult, RowSet,
    TableScope, Value,
};

const CONNECTION_STATS_SQL: &str = r#"
SELECT
    (SELECT COUNT(*)::bigint FROM pg_stat_activity) AS active_connections,
    current_setting('max_connections')::bigint AS max_connections,
    (SELECT COUNT(*)::bigint FROM pg_stat_activity WHERE client_addr IS NOT NULL) AS remote_clients
"#;

const CACHE_STATS_SQL: &str = r#"
SELECT
    COALESCE(SUM(blks_hit), 0)::float8 AS blks_hit,
    COALESCE(SUM(blks_read), 0)::float8 AS blks_read
FROM pg_stat_database
"#;

const SERVER_INFO_SQL: &str = r#"
SELECT
    version() AS version,
    pg_postmaster_start_time() AS started_at,
    EXTRACT(EPOCH FROM now() - pg_postmaster_start_time())::float8 AS uptime_seconds,
    (xact_commit + xact_rollback)::float8 AS xact_total,
    EXTRACT(EPOCH FROM now() - stats_reset)::float8 AS seconds_since_reset,
    (SELECT COUNT(*)::bigint FROM pg_stat_activity) AS total_sessions
FROM pg_stat_database
WHERE datname = current_database()
"#;

const SLOW_QUERIES_SQL: &str = r#"
SELECT
    pid::bigint AS pid,
    application_name::text AS application_name,
    query::text AS query,
    state::text AS state,
    query_start AS started_at,
    EXTRACT(EPOCH FROM now() - query_start)::float8 AS elapsed_seconds
FROM pg_stat_activity
WHERE query_start IS NOT NULL
  AND pid <> pg_backend_pid()
  AND now() - query_start > make_interval(secs => $1)
ORDER BY elapsed_seconds DESC
LIMIT $2
"#;

const IDLE_SESSIONS_SQL: &str = r#"
SELECT
    pid::bigint AS pid,
    application_name::text AS application_name,
    query::text AS query,
    state::text AS state,
    query_start AS started_at,
    EXTRACT(EPOCH FROM now() - query_start)::float8 AS elapsed_seconds
FROM pg_stat_activity
WHERE state = 'idle'
  AND query_start IS NOT NULL
  AND now() - query_start > make_interval(secs => $1)
ORDER BY elapsed_seconds DESC
LIMIT $2
"#;

const LOCK_WAITS_SQL: &str = r#"
SELECT
    a.pid::bigint AS pid,
    a.application_name::text AS application_name,
    a.query::text AS query,
    a.state::text AS state,
    a.query_start AS started_at,
    EXTRACT(EPOCH FROM now() - a.query_start)::float8 AS elapsed_seconds,
    l.mode::text AS lock_mode,
    l.locktype::text AS lock_type,
    c.relname::text AS relation
FROM pg_locks l
JOIN pg_class c ON l.relation = c.oid
JOIN pg_stat_activity a ON l.pid = a.pid
WHERE NOT l.granted
ORDER BY a.query_start ASC NULLS LAST
LIMIT $1
"#;

const TABLE_BLOAT_SQL: &str = r#"
SELECT
    n.nspname::text AS schema_name,
    c.relname::text AS table_name,
    pg_total_relation_size(c.oid)::bigint AS total_bytes,
    pg_relation_size(c.oid)::bigint AS table_bytes,
    s.n_live_tup::bigint AS live_tuples,
    s.n_dead_tup::bigint AS dead_tuples,
    GREATEST(s.last_vacuum, s.last_autovacuum) AS last_vacuum
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN pg_stat_user_tables s ON s.relid = c.oid
WHERE c.relkind IN ('r', 'm')
  AND n.nspname NOT IN ('pg_catalog', 'information_schema')
  AND n.nspname NOT LIKE 'pg_toast%'
  AND ($1::text IS NULL OR n.nspname = $1)
ORDER BY pg_relation_size(c.oid)
    * COALESCE(s.n_dead_tup::float8 / NULLIF(s.n_live_tup + s.n_dead_tup, 0), 0) DESC
LIMIT $2
"#;

const TABLE_SIZES_SQL: &str = r#"
SELECT
    n.nspname::text AS schema_name,
    c.relname::text AS table_name,
    pg_total_relation_size(c.oid)::bigint AS total_bytes,
    pg_relation_size(c.oid)::bigint AS table_bytes,
    s.n_live_tup::bigint AS live_tuples,
    s.n_dead_tup::bigint AS dead_tuples,
    GREATEST(s.last_vacuum, s.last_autovacuum) AS last_vacuum
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN pg_stat_user_tables s ON s.relid = c.oid
WHERE c.relkind IN ('r', 'm')
  AND n.nspname NOT IN ('pg_catalog', 'information_schema')
  AND n.nspname NOT LIKE 'pg_toast%'
  AND ($1::text IS NULL OR n.nspname = $1)
ORDER BY pg_relation_size(c.oid) DESC
LIMIT $2
"#;

const TOP_STATEMENTS_SQL: &str = r#"
SELECT
    query::text AS query,
    calls::bigint AS calls,
    (total_exec_time / 1000.0)::float8 AS total_time_seconds,
    (mean_exec_time / 1000.0)::float8 AS mean_time_seconds,
    rows::bigint AS total_rows,
    (shared_blks_hit * current_setting('block_size')::float8 / 1024.0) / NULLIF(calls, 0) AS avg_shared_hit_kb,
    (shared_blks_read * current_setting('block_size')::float8 / 1024.0) / NULLIF(calls, 0) AS avg_shared_read_kb
FROM pg_stat_statements
ORDER BY total_exec_time DESC
LIMIT $1
"#;

const SYSTEM_METRICS_SQL: &str = r#"
SELECT
    cpu_usage::float8 AS cpu_usage,
    ram_usage::float8 AS ram_usage,
    cache_usage::float8 AS cache_usage,
    disk_usage::float8 AS disk_usage,
    cpu_load1::float8 AS cpu_load1,
    cpu_load5::float8 AS cpu_load5,
    created_at::timestamptz AS recorded_at
FROM admin.system_metrics
ORDER BY created_at DESC, id DESC
LIMIT $1
"#;

const BACKUP_HISTORY_SQL: &str = r#"
SELECT
    start_time::timestamptz AS start_time,
    end_time::timestamptz AS end_time,
    duration::bigint AS duration_seconds,
    size::float8 AS size_bytes,
    status::text AS status,
    db_start_no::bigint AS server_start_count
FROM admin.backup_log
ORDER BY start_time DESC
LIMIT $1
"#;

const FILESYSTEM_USAGE_SQL: &str = r#"
SELECT
    mount_point::text AS mount_point,
    size::bigint AS size_bytes,
    used::bigint AS used_bytes,
    created_at::timestamptz AS recorded_at,
    os_version::text AS os_version
FROM admin.filesystem_usage
WHERE created_at = (SELECT MAX(created_at) FROM admin.filesystem_usage)
ORDER BY mount_point
"#;

const SOFTWARE_VERSIONS_SQL: &str = r#"
SELECT
    soft_version::text AS version,
    release_date::timestamptz AS release_date,
    soft_type::text AS kind
FROM admin.software_version
WHERE soft_type IN ('O', 'D')
ORDER BY soft_type, release_date DESC
"#;

const HIGH_CPU_PROCESSES_SQL: &str = r#"
SELECT DISTINCT
    pid::bigint AS pid,
    cpu_usage::float8 AS system_cpu_usage,
    process_cpu_usage::float8 AS process_cpu_usage,
    user_name::text AS user_name,
    mem_usage::float8 AS mem_usage,
    NULL::text AS database,
    state::text AS state,
    query::text AS query,
    query_start::timestamptz AS query_start,
    EXTRACT(EPOCH FROM duration)::float8 AS duration_seconds,
    created_at::timestamptz AS recorded_at
FROM admin.high_cpu_process_metrics
WHERE ($1::timestamp IS NULL OR date_trunc('minute', created_at) = date_trunc('minute', $1::timestamp))
  AND ($2::float8 IS NULL OR cpu_usage >= $2)
ORDER BY recorded_at DESC, process_cpu_usage DESC NULLS LAST
LIMIT $3
"#;

const LIVE_HIGH_CPU_SQL: &str = r#"
SELECT DISTINCT
    b.pid::bigint AS pid,
    a.cpu_usage::float8 AS system_cpu_usage,
    b.cpu_usage::float8 AS process_cpu_usage,
    b.user_name::text AS user_name,
    b.mem_usage::float8 AS mem_usage,
    b.datname::text AS database,
    c.state::text AS state,
    c.query::text AS query,
    c.query_start AS query_start,
    EXTRACT(EPOCH FROM now() - c.query_start)::float8 AS duration_seconds,
    b.recorded_at::timestamptz AS recorded_at
FROM admin.system_metrics a
JOIN admin.high_cpu_processes b
    ON date_trunc('minute', a.created_at) = date_trunc('minute', b.recorded_at)
JOIN pg_stat_activity c ON c.pid = b.pid
ORDER BY process_cpu_usage DESC NULLS LAST
LIMIT $1
"#;

const OPTIMIZATION_SETTINGS_SQL: &str = r#"
SELECT
    metric_name::text AS metric_name,
    metric_value::float8 AS metric_value,
    unit::text AS unit,
    min_value::float8 AS min_value,
    max_value::float8 AS max_value
FROM admin.system_optimization
ORDER BY metric_name
"#;

/// Probe client backed by the read-only monitoring pool.
#[derive(Clone)]
pub struct PgProbeClient {
    pool: DbPool,
}

impl PgProbeClient {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, query), fields(probe = probe.as_str()))]
    async fn run(&self, probe: ProbeId, query: Query<'_, Postgres, PgArguments>) -> ProbeResult {
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|err| classify(probe, err))?;
        debug!(rows = rows.len(), "probe returned");
        decode_rows(probe, &rows)
    }
}

#[async_trait]
impl ProbeClient for PgProbeClient {
    async fn connection_stats(&self) -> ProbeResult {
        self.run(ProbeId::ConnectionStats, sqlx::query(CONNECTION_STATS_SQL))
            .await
    }

    async fn cache_stats(&self) -> ProbeResult {
        self.run(ProbeId::CacheStats, sqlx::query(CACHE_STATS_SQL))
            .await
    }

    async fn server_info(&self) -> ProbeResult {
        self.run(ProbeId::ServerInfo, sqlx::query(SERVER_INFO_SQL))
            .await
    }

    async fn slow_queries(&self, filter: ActivityFilter) -> ProbeResult {
        let query = sqlx::query(SLOW_QUERIES_SQL)
            .bind(filter.min_age.as_secs_f64())
            .bind(i64::from(filter.limit));
        self.run(ProbeId::SlowQueries, query).await
    }

    async fn idle_sessions(&self, filter: ActivityFilter) -> ProbeResult {
        let query = sqlx::query(IDLE_SESSIONS_SQL)
            .bind(filter.min_age.as_secs_f64())
            .bind(i64::from(filter.limit));
        self.run(ProbeId::IdleSessions, query).await
    }

    async fn lock_waits(&self, limit: u32) -> ProbeResult {
        let query = sqlx::query(LOCK_WAITS_SQL).bind(i64::from(limit));
        self.run(ProbeId::LockWaits, query).await
    }

    async fn table_bloat(&self, scope: &TableScope) -> ProbeResult {
        let query = sqlx::query(TABLE_BLOAT_SQL)
            .bind(scope.schema.clone())
            .bind(i64::from(scope.limit));
        self.run(ProbeId::TableBloat, query).await
    }

    async fn table_sizes(&self, scope: &TableScope) -> ProbeResult {
        let query = sqlx::query(TABLE_SIZES_SQL)
            .bind(scope.schema.clone())
            .bind(i64::from(scope.limit));
        self.run(ProbeId::TableSizes, query).await
    }

    async fn top_statements(&self, limit: u32) -> ProbeResult {
        let query = sqlx::query(TOP_STATEMENTS_SQL).bind(i64::from(limit));
        self.run(ProbeId::TopStatements, query).await
    }

    async fn system_metrics(&self, limit: u32) -> ProbeResult {
        let query = sqlx::query(SYSTEM_METRICS_SQL).bind(i64::from(limit));
        self.run(ProbeId::SystemMetrics, query).await
    }

    async fn backup_history(&self, limit: u32) -> ProbeResult {
        let query = sqlx::query(BACKUP_HISTORY_SQL).bind(i64::from(limit));
        self.run(ProbeId::BackupHistory, query).await
    }

    async fn filesystem_usage(&self) -> ProbeResult {
        self.run(ProbeId::FilesystemUsage, sqlx::query(FILESYSTEM_USAGE_SQL))
            .await
    }

    async fn software_versions(&self) -> ProbeResult {
        self.run(ProbeId::SoftwareVersions, sqlx::query(SOFTWARE_VERSIONS_SQL))
            .await
    }

    async fn high_cpu_processes(&self, filter: &HighCpuFilter) -> ProbeResult {
        let query = sqlx::query(HIGH_CPU_PROCESSES_SQL)
            .bind(filter.recorded_minute)
            .bind(filter.min_cpu)
            .bind(i64::from(filter.limit));
        self.run(ProbeId::HighCpuProcesses, query).await
    }

    async fn live_high_cpu_sessions(&self, limit: u32) -> ProbeResult {
        let query = sqlx::query(LIVE_HIGH_CPU_SQL).bind(i64::from(limit));
        self.run(ProbeId::LiveHighCpuSessions, query).await
    }

    async fn optimization_settings(&self) -> ProbeResult {
        self.run(
            ProbeId::OptimizationSettings,
            sqlx::query(OPTIMIZATION_SETTINGS_SQL),
        )
        .await
    }
}

/// Decode driver rows into a `RowSet`. Column metadata is taken from the first
/// row, so an empty result carries no columns.
fn decode_rows(probe: ProbeId, rows: &[PgRow]) -> ProbeResult {
    let Some(first) = rows.first() else {
        return Ok(RowSet::default());
    };

    let mut type_names = Vec::with_capacity(first.columns().len());
    let mut columns = Vec::with_capacity(first.columns().len());
    for column in first.columns() {
        let type_name = column.type_info().name().to_string();
        let kind = column_kind(&type_name).ok_or_else(|| {
            ProbeError::new(
                probe,
                ProbeErrorKind::MalformedResult,
                format!(
                    "column {} has unsupported type {}",
                    column.name(),
                    type_name
                ),
            )
        })?;
        columns.push(Column {
            name: column.name().to_string(),
            kind,
        });
        type_names.push(type_name);
    }

    let mut set = RowSet::new(columns);
    for row in rows {
        let mut values = Vec::with_capacity(type_names.len());
        for (idx, type_name) in type_names.iter().enumerate() {
            let value = decode_value(row, idx, type_name).map_err(|err| classify(probe, err))?;
            values.push(value);
        }
        set.push_row(values);
    }
    Ok(set)
}

fn column_kind(type_name: &str) -> Option<ColumnKind> {
    match type_name {
        "BOOL" => Some(ColumnKind::Bool),
        "INT2" | "INT4" | "INT8" => Some(ColumnKind::Int),
        "FLOAT4" | "FLOAT8" => Some(ColumnKind::Float),
        "TEXT" | "VARCHAR" | "NAME" | "BPCHAR" => Some(ColumnKind::Text),
        "TIMESTAMPTZ" | "TIMESTAMP" | "DATE" => Some(ColumnKind::Timestamp),
        _ => None,
    }
}

fn decode_value(row: &PgRow, idx: usize, type_name: &str) -> Result<Value, sqlx::Error> {
    let value = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(idx)?.map(Value::Bool),
        "INT2" => row
            .try_get::<Option<i16>, _>(idx)?
            .map(|v| Value::Int(v.into())),
        "INT4" => row
            .try_get::<Option<i32>, _>(idx)?
            .map(|v| Value::Int(v.into())),
        "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(Value::Int),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)?
            .map(|v| Value::Float(v.into())),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.map(Value::Float),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(Value::Timestamp),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map(|v| Value::Timestamp(v.and_utc())),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(idx)?
            .map(|v| Value::Timestamp(v.and_time(NaiveTime::MIN).and_utc())),
        _ => row.try_get::<Option<String>, _>(idx)?.map(Value::Text),
    };
    Ok(value.unwrap_or(Value::Null))
}
