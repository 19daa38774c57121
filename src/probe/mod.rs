use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

use crate::error::{ProbeError, ProbeErrorKind};

mod postgres;
mod util;

pub use postgres::PgProbeClient;

/// Every diagnostic statement the probe client knows how to issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeId {
    ConnectionStats,
    CacheStats,
    ServerInfo,
    SlowQueries,
    IdleSessions,
    LockWaits,
    TableBloat,
    TableSizes,
    TopStatements,
    SystemMetrics,
    BackupHistory,
    FilesystemUsage,
    SoftwareVersions,
    HighCpuProcesses,
    LiveHighCpuSessions,
    OptimizationSettings,
}

impl ProbeId {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeId::ConnectionStats => "connection_stats",
            ProbeId::CacheStats => "cache_stats",
            ProbeId::ServerInfo => "server_info",
            ProbeId::SlowQueries => "slow_queries",
            ProbeId::IdleSessions => "idle_sessions",
            ProbeId::LockWaits => "lock_waits",
            ProbeId::TableBloat => "table_bloat",
            ProbeId::TableSizes => "table_sizes",
            ProbeId::TopStatements => "top_statements",
            ProbeId::SystemMetrics => "system_metrics",
            ProbeId::BackupHistory => "backup_history",
            ProbeId::FilesystemUsage => "filesystem_usage",
            ProbeId::SoftwareVersions => "software_versions",
            ProbeId::HighCpuProcesses => "high_cpu_processes",
            ProbeId::LiveHighCpuSessions => "live_high_cpu_sessions",
            ProbeId::OptimizationSettings => "optimization_settings",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Bool,
    Int,
    Float,
    Text,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

/// A single decoded cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Raw tabular probe output: column metadata plus positional rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

impl RowSet {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Convenience constructor used by fakes and tests.
    pub fn with_columns(columns: &[(&str, ColumnKind)]) -> Self {
        Self::new(
            columns
                .iter()
                .map(|(name, kind)| Column {
                    name: (*name).to_string(),
                    kind: *kind,
                })
                .collect(),
        )
    }

    pub fn with_row(mut self, values: Vec<Value>) -> Self {
        self.push_row(values);
        self
    }

    pub fn push_row(&mut self, values: Vec<Value>) {
        debug_assert_eq!(values.len(), self.columns.len(), "row width mismatch");
        self.rows.push(values);
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = RowRef<'_>> {
        self.rows.iter().map(|values| RowRef {
            columns: &self.columns,
            values,
        })
    }

    pub fn first(&self) -> Option<RowRef<'_>> {
        self.rows().next()
    }
}

/// Borrowed view of one row with lenient typed accessors.
///
/// Every accessor returns `None` when the column is absent, NULL, or holds a
/// value that cannot be read as the requested type.
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    columns: &'a [Column],
    values: &'a [Value],
}

impl<'a> RowRef<'a> {
    pub fn get(&self, name: &str) -> Option<&'a Value> {
        self.columns
            .iter()
            .position(|column| column.name == name)
            .and_then(|idx| self.values.get(idx))
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        let value = match self.get(name)? {
            Value::Int(v) => *v as f64,
            Value::Float(v) => *v,
            Value::Text(text) => text.trim().parse().ok()?,
            _ => return None,
        };
        value.is_finite().then_some(value)
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.is_finite() && v.fract() == 0.0 => Some(*v as i64),
            Value::Text(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn text(&self, name: &str) -> Option<&'a str> {
        match self.get(name)? {
            Value::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        match self.get(name)? {
            Value::Timestamp(ts) => Some(*ts),
            Value::Text(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|ts| ts.with_timezone(&Utc)),
            _ => None,
        }
    }
}

/// Filter for session-activity probes.
#[derive(Debug, Clone, Copy)]
pub struct ActivityFilter {
    pub min_age: Duration,
    pub limit: u32,
}

/// Filter for table size and bloat probes.
#[derive(Debug, Clone, Default)]
pub struct TableScope {
    pub schema: Option<String>,
    pub limit: u32,
}

/// Drill-down filter for recorded high-CPU processes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HighCpuFilter {
    /// Restrict to rows recorded within this minute.
    pub recorded_minute: Option<NaiveDateTime>,
    pub min_cpu: Option<f64>,
    pub limit: u32,
}

pub type ProbeResult = Result<RowSet, ProbeError>;

/// Read-only diagnostic capability against the monitored database and the
/// host-metric tables maintained by external collectors.
#[async_trait]
pub trait ProbeClient: Send + Sync {
    async fn connection_stats(&self) -> ProbeResult;
    async fn cache_stats(&self) -> ProbeResult;
    async fn server_info(&self) -> ProbeResult;
    async fn slow_queries(&self, filter: ActivityFilter) -> ProbeResult;
    async fn idle_sessions(&self, filter: ActivityFilter) -> ProbeResult;
    async fn lock_waits(&self, limit: u32) -> ProbeResult;
    async fn table_bloat(&self, scope: &TableScope) -> ProbeResult;
    async fn table_sizes(&self, scope: &TableScope) -> ProbeResult;
    async fn top_statements(&self, limit: u32) -> ProbeResult;
    async fn system_metrics(&self, limit: u32) -> ProbeResult;
    async fn backup_history(&self, limit: u32) -> ProbeResult;
    async fn filesystem_usage(&self) -> ProbeResult;
    async fn software_versions(&self) -> ProbeResult;
    async fn high_cpu_processes(&self, filter: &HighCpuFilter) -> ProbeResult;
    async fn live_high_cpu_sessions(&self, limit: u32) -> ProbeResult;
    async fn optimization_settings(&self) -> ProbeResult;
}

/// Bound a probe future by `limit`, reporting an elapsed deadline as `Timeout`.
pub async fn with_timeout<F>(probe: ProbeId, limit: Duration, fut: F) -> ProbeResult
where
    F: Future<Output = ProbeResult>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::new(
            probe,
            ProbeErrorKind::Timeout,
            format!("no result within {limit:?}"),
        )),
    }
}
