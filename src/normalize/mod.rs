use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Thresholds;
use crate::probe::{RowRef, RowSet};

pub mod derive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricCategory {
    CpuUsage,
    RamUsage,
    CacheUsage,
    DiskUsage,
    CpuLoad1,
    CpuLoad5,
    ConnectionLoad,
    CacheHitRatio,
    TransactionsPerSecond,
    BackupSizeDelta,
}

impl MetricCategory {
    /// Categories sampled from the host metrics table, in column order.
    pub const HOST: [MetricCategory; 6] = [
        MetricCategory::CpuUsage,
        MetricCategory::RamUsage,
        MetricCategory::CacheUsage,
        MetricCategory::DiskUsage,
        MetricCategory::CpuLoad1,
        MetricCategory::CpuLoad5,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricCategory::CpuUsage => "cpu_usage",
            MetricCategory::RamUsage => "ram_usage",
            MetricCategory::CacheUsage => "cache_usage",
            MetricCategory::DiskUsage => "disk_usage",
            MetricCategory::CpuLoad1 => "cpu_load1",
            MetricCategory::CpuLoad5 => "cpu_load5",
            MetricCategory::ConnectionLoad => "connection_load",
            MetricCategory::CacheHitRatio => "cache_hit_ratio",
            MetricCategory::TransactionsPerSecond => "transactions_per_second",
            MetricCategory::BackupSizeDelta => "backup_size_delta",
        }
    }

    pub fn unit(self) -> Unit {
        match self {
            MetricCategory::CpuLoad1 | MetricCategory::CpuLoad5 => Unit::Load,
            MetricCategory::TransactionsPerSecond => Unit::PerSecond,
            MetricCategory::BackupSizeDelta => Unit::Bytes,
            _ => Unit::Percent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Percent,
    Load,
    PerSecond,
    Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Warn,
    Unknown,
}

/// One measurement at a point in time. `value == None` always carries
/// `Status::Unknown`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub category: MetricCategory,
    pub value: Option<f64>,
    pub unit: Unit,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub captured_at: DateTime<Utc>,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostMetrics {
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub recorded_at: Option<DateTime<Utc>>,
    pub samples: Vec<MetricSample>,
}

impl HostMetrics {
    pub fn sample(&self, category: MetricCategory) -> Option<&MetricSample> {
        self.samples.iter().find(|sample| sample.category == category)
    }

    /// A row without a timestamp cannot be dated and is never fresh.
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return true;
        };
        self.recorded_at
            .is_some_and(|at| now.signed_duration_since(at) <= max_age)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendSeries {
    pub category: MetricCategory,
    pub values: Vec<Option<f64>>,
    pub rolling_average: Vec<Option<f64>>,
    pub statuses: Vec<Status>,
}

/// Host metric history in chronological order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostTrend {
    pub window: usize,
    pub recorded_at: Vec<Option<DateTime<Utc>>>,
    pub series: Vec<TrendSeries>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionSummary {
    pub active: Option<i64>,
    pub max: Option<i64>,
    pub remote_clients: Option<i64>,
    pub load: MetricSample,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSummary {
    pub hits: Option<f64>,
    pub reads: Option<f64>,
    pub ratio: MetricSample,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerSummary {
    pub version: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: Option<f64>,
    pub total_sessions: Option<i64>,
    pub transactions_per_second: MetricSample,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupRecord {
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub size_bytes: Option<f64>,
    pub status: Option<String>,
    pub server_start_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupSummary {
    pub latest: Option<BackupRecord>,
    pub size_delta: MetricSample,
    pub history: Vec<BackupRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilesystemUsage {
    pub mount_point: String,
    pub size_bytes: Option<i64>,
    pub used_bytes: Option<i64>,
    pub usage: MetricSample,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub recorded_at: Option<DateTime<Utc>>,
    pub os_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SoftwareVersion {
    pub version: String,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub release_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SoftwareVersions {
    pub os: Option<SoftwareVersion>,
    pub database: Option<SoftwareVersion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    SlowQuery,
    IdleSession,
    LockWait,
}

/// One database session (or blocked lock request) at capture time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityRecord {
    pub kind: ActivityKind,
    pub pid: i64,
    pub application: Option<String>,
    pub query: Option<String>,
    pub state: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: Option<f64>,
    pub relation: Option<String>,
    pub lock_mode: Option<String>,
    pub lock_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableStat {
    pub schema: String,
    pub table: String,
    pub total_bytes: Option<i64>,
    pub table_bytes: Option<i64>,
    /// Index and TOAST bytes on top of the heap.
    pub overhead_bytes: Option<i64>,
    pub estimated_bloat_bytes: Option<f64>,
    pub live_tuples: Option<i64>,
    pub dead_tuples: Option<i64>,
    pub dead_tuple_percent: Option<f64>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub last_vacuum: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatementStat {
    pub query: String,
    pub calls: Option<i64>,
    pub total_time_seconds: Option<f64>,
    pub mean_time_seconds: Option<f64>,
    pub rows: Option<i64>,
    pub avg_shared_hit_kb: Option<f64>,
    pub avg_shared_read_kb: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HighCpuProcess {
    pub pid: i64,
    pub system_cpu_usage: Option<f64>,
    pub process_cpu_usage: Option<f64>,
    pub user_name: Option<String>,
    pub mem_usage: Option<f64>,
    pub database: Option<String>,
    pub state: Option<String>,
    pub query: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub query_start: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub recorded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationSetting {
    pub metric_name: String,
    pub metric_value: Option<f64>,
    pub unit: Option<String>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    /// Whether the value lies inside `[min_value, max_value]` when all three are known.
    pub within_range: Option<bool>,
}

/// Parsed rows plus bookkeeping for rows that could not be identified.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundedList<T> {
    pub items: Vec<T>,
    /// Parsed rows before truncation.
    pub total: usize,
    pub truncated: bool,
    pub skipped_rows: usize,
}

impl<T> BoundedList<T> {
    fn parsed(items: Vec<T>, skipped_rows: usize) -> Self {
        Self {
            total: items.len(),
            items,
            truncated: false,
            skipped_rows,
        }
    }

    /// Sort by `compare` and keep at most `limit` entries.
    pub fn ranked<F>(mut self, limit: usize, compare: F) -> Self
    where
        F: FnMut(&T, &T) -> Ordering,
    {
        self.items.sort_by(compare);
        if self.items.len() > limit {
            self.items.truncate(limit);
            self.truncated = true;
        }
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Converts probe rows into typed records and derived samples.
#[derive(Debug, Clone)]
pub struct Normalizer {
    thresholds: Thresholds,
    redact_sql: bool,
    rolling_window: usize,
}

impl Normalizer {
    pub fn new(thresholds: Thresholds, redact_sql: bool, rolling_window: usize) -> Self {
        Self {
            thresholds,
            redact_sql,
            rolling_window: rolling_window.max(1),
        }
    }

    pub fn status(&self, category: MetricCategory, value: Option<f64>) -> Status {
        match (value, self.thresholds.rule(category)) {
            (None, _) => Status::Unknown,
            (Some(value), Some(rule)) if rule.is_warn(value) => Status::Warn,
            (Some(_), _) => Status::Ok,
        }
    }

    pub fn sample(
        &self,
        category: MetricCategory,
        value: Option<f64>,
        captured_at: DateTime<Utc>,
    ) -> MetricSample {
        let value = value.filter(|v| v.is_finite());
        MetricSample {
            category,
            value,
            unit: category.unit(),
            captured_at,
            status: self.status(category, value),
        }
    }

    /// Latest host metrics row (rows arrive newest first). `None` when the
    /// collector table is empty.
    pub fn host(&self, rows: &RowSet, captured_at: DateTime<Utc>) -> Option<HostMetrics> {
        let row = rows.first()?;
        Some(HostMetrics {
            recorded_at: row.timestamp("recorded_at"),
            samples: MetricCategory::HOST
                .iter()
                .map(|category| self.sample(*category, row.f64(category.as_str()), captured_at))
                .collect(),
        })
    }

    pub fn host_trend(&self, rows: &RowSet) -> HostTrend {
        let mut ordered: Vec<RowRef<'_>> = rows.rows().collect();
        ordered.reverse();
        let series = MetricCategory::HOST
            .iter()
            .map(|category| {
                let values: Vec<Option<f64>> = ordered
                    .iter()
                    .map(|row| row.f64(category.as_str()))
                    .collect();
                TrendSeries {
                    category: *category,
                    rolling_average: derive::rolling_average(&values, self.rolling_window),
                    statuses: values
                        .iter()
                        .map(|value| self.status(*category, *value))
                        .collect(),
                    values,
                }
            })
            .collect();
        HostTrend {
            window: self.rolling_window,
            recorded_at: ordered.iter().map(|row| row.timestamp("recorded_at")).collect(),
            series,
        }
    }

    pub fn connection_load(&self, rows: &RowSet, captured_at: DateTime<Utc>) -> ConnectionSummary {
        let row = rows.first();
        let active = row.and_then(|r| r.i64("active_connections"));
        let max = row.and_then(|r| r.i64("max_connections"));
        let load = derive::connection_load_percent(
            active.map(|v| v as f64),
            max.map(|v| v as f64),
        );
        ConnectionSummary {
            active,
            max,
            remote_clients: row.and_then(|r| r.i64("remote_clients")),
            load: self.sample(MetricCategory::ConnectionLoad, load, captured_at),
        }
    }

    pub fn cache_hit_ratio(&self, rows: &RowSet, captured_at: DateTime<Utc>) -> CacheSummary {
        let row = rows.first();
        let hits = row.and_then(|r| r.f64("blks_hit"));
        let reads = row.and_then(|r| r.f64("blks_read"));
        CacheSummary {
            hits,
            reads,
            ratio: self.sample(
                MetricCategory::CacheHitRatio,
                derive::cache_hit_percent(hits, reads),
                captured_at,
            ),
        }
    }

    pub fn server(&self, rows: &RowSet, captured_at: DateTime<Utc>) -> ServerSummary {
        let row = rows.first();
        let tps = derive::transactions_per_second(
            row.and_then(|r| r.f64("xact_total")),
            row.and_then(|r| r.f64("seconds_since_reset")),
        );
        ServerSummary {
            version: row.and_then(|r| r.text("version")).map(str::to_string),
            started_at: row.and_then(|r| r.timestamp("started_at")),
            uptime_seconds: row.and_then(|r| r.f64("uptime_seconds")),
            total_sessions: row.and_then(|r| r.i64("total_sessions")),
            transactions_per_second: self.sample(
                MetricCategory::TransactionsPerSecond,
                tps,
                captured_at,
            ),
        }
    }

    pub fn backup(&self, rows: &RowSet, captured_at: DateTime<Utc>) -> BackupSummary {
        let history: Vec<BackupRecord> = rows
            .rows()
            .map(|row| BackupRecord {
                start_time: row.timestamp("start_time"),
                end_time: row.timestamp("end_time"),
                duration_seconds: row.i64("duration_seconds"),
                size_bytes: row.f64("size_bytes"),
                status: owned_text(&row, "status"),
                server_start_count: row.i64("server_start_count"),
            })
            .collect();
        let points: Vec<_> = history
            .iter()
            .map(|record| (record.start_time, record.size_bytes))
            .collect();
        let latest = history
            .iter()
            .filter(|record| record.start_time.is_some())
            .max_by_key(|record| record.start_time)
            .cloned();
        BackupSummary {
            latest,
            size_delta: self.sample(
                MetricCategory::BackupSizeDelta,
                derive::backup_size_delta(&points),
                captured_at,
            ),
            history,
        }
    }

    pub fn filesystem(
        &self,
        rows: &RowSet,
        captured_at: DateTime<Utc>,
    ) -> BoundedList<FilesystemUsage> {
        collect(rows, |row| {
            let mount_point = owned_text(row, "mount_point")?;
            let size_bytes = row.i64("size_bytes");
            let used_bytes = row.i64("used_bytes");
            let percent = derive::percent_of(
                used_bytes.map(|v| v as f64),
                size_bytes.map(|v| v as f64),
            );
            Some(FilesystemUsage {
                mount_point,
                size_bytes,
                used_bytes,
                usage: self.sample(MetricCategory::DiskUsage, percent, captured_at),
                recorded_at: row.timestamp("recorded_at"),
                os_version: owned_text(row, "os_version"),
            })
        })
    }

    /// Newest OS (`O`) and database (`D`) release rows.
    pub fn software(&self, rows: &RowSet) -> SoftwareVersions {
        let mut versions = SoftwareVersions::default();
        for row in rows.rows() {
            let Some(version) = owned_text(&row, "version") else {
                continue;
            };
            let entry = SoftwareVersion {
                version,
                release_date: row.timestamp("release_date"),
            };
            let slot = match row.text("kind").map(str::trim) {
                Some("O") => &mut versions.os,
                Some("D") => &mut versions.database,
                _ => continue,
            };
            let newer = slot
                .as_ref()
                .is_none_or(|current| entry.release_date > current.release_date);
            if newer {
                *slot = Some(entry);
            }
        }
        versions
    }

    pub fn activity(&self, kind: ActivityKind, rows: &RowSet) -> BoundedList<ActivityRecord> {
        collect(rows, |row| {
            Some(ActivityRecord {
                kind,
                pid: row.i64("pid")?,
                application: owned_text(row, "application_name").filter(|app| !app.is_empty()),
                query: self.query_text(row.text("query")),
                state: owned_text(row, "state"),
                started_at: row.timestamp("started_at"),
                elapsed_seconds: row.f64("elapsed_seconds"),
                relation: owned_text(row, "relation"),
                lock_mode: owned_text(row, "lock_mode"),
                lock_type: owned_text(row, "lock_type"),
            })
        })
    }

    pub fn tables(&self, rows: &RowSet) -> BoundedList<TableStat> {
        collect(rows, |row| {
            let total_bytes = row.i64("total_bytes");
            let table_bytes = row.i64("table_bytes");
            let live = row.i64("live_tuples");
            let dead = row.i64("dead_tuples");
            let dead_ratio = match (live, dead) {
                (Some(live), Some(dead)) if live + dead > 0 => {
                    Some(dead as f64 / (live + dead) as f64)
                }
                _ => None,
            };
            Some(TableStat {
                schema: owned_text(row, "schema_name")?,
                table: owned_text(row, "table_name")?,
                total_bytes,
                table_bytes,
                overhead_bytes: total_bytes.zip(table_bytes).map(|(t, h)| (t - h).max(0)),
                estimated_bloat_bytes: table_bytes
                    .zip(dead_ratio)
                    .map(|(bytes, ratio)| bytes as f64 * ratio),
                live_tuples: live,
                dead_tuples: dead,
                dead_tuple_percent: dead_ratio.map(|ratio| ratio * 100.0),
                last_vacuum: row.timestamp("last_vacuum"),
            })
        })
    }

    pub fn statements(&self, rows: &RowSet) -> BoundedList<StatementStat> {
        collect(rows, |row| {
            Some(StatementStat {
                query: if self.redact_sql {
                    row.text("query")?;
                    "<redacted>".to_string()
                } else {
                    owned_text(row, "query")?
                },
                calls: row.i64("calls"),
                total_time_seconds: row.f64("total_time_seconds"),
                mean_time_seconds: row.f64("mean_time_seconds"),
                rows: row.i64("total_rows"),
                avg_shared_hit_kb: row.f64("avg_shared_hit_kb"),
                avg_shared_read_kb: row.f64("avg_shared_read_kb"),
            })
        })
    }

    pub fn high_cpu(&self, rows: &RowSet) -> BoundedList<HighCpuProcess> {
        collect(rows, |row| {
            Some(HighCpuProcess {
                pid: row.i64("pid")?,
                system_cpu_usage: row.f64("system_cpu_usage"),
                process_cpu_usage: row.f64("process_cpu_usage"),
                user_name: owned_text(row, "user_name"),
                mem_usage: row.f64("mem_usage"),
                database: owned_text(row, "database"),
                state: owned_text(row, "state"),
                query: self.query_text(row.text("query")),
                query_start: row.timestamp("query_start"),
                duration_seconds: row.f64("duration_seconds"),
                recorded_at: row.timestamp("recorded_at"),
            })
        })
    }

    pub fn optimization(&self, rows: &RowSet) -> BoundedList<OptimizationSetting> {
        collect(rows, |row| {
            let metric_value = row.f64("metric_value");
            let min_value = row.f64("min_value");
            let max_value = row.f64("max_value");
            let within_range = match (metric_value, min_value, max_value) {
                (Some(value), Some(min), Some(max)) => Some(value >= min && value <= max),
                _ => None,
            };
            Some(OptimizationSetting {
                metric_name: owned_text(row, "metric_name")?,
                metric_value,
                unit: owned_text(row, "unit"),
                min_value,
                max_value,
                within_range,
            })
        })
    }

    fn query_text(&self, raw: Option<&str>) -> Option<String> {
        if self.redact_sql {
            return None;
        }
        raw.map(str::trim).filter(|q| !q.is_empty()).map(str::to_string)
    }
}

fn owned_text(row: &RowRef<'_>, name: &str) -> Option<String> {
    row.text(name).map(str::to_string)
}

fn collect<T, F>(rows: &RowSet, mut parse: F) -> BoundedList<T>
where
    F: FnMut(&RowRef<'_>) -> Option<T>,
{
    let mut items = Vec::with_capacity(rows.len());
    let mut skipped = 0;
    for row in rows.rows() {
        match parse(&row) {
            Some(item) => items.push(item),
            None => skipped += 1,
        }
    }
    BoundedList::parsed(items, skipped)
}
