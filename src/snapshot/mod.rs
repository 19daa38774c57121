use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ProbeErrorKind;
use crate::normalize::{
    ActivityRecord, BackupSummary, BoundedList, CacheSummary, ConnectionSummary, FilesystemUsage,
    HighCpuProcess, HostMetrics, HostTrend, OptimizationSetting, ServerSummary, SoftwareVersions,
    StatementStat, TableStat,
};

mod aggregator;

pub use aggregator::{Aggregator, high_cpu_filter};

/// Why a section carries no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableKind {
    ConnectionFailure,
    Timeout,
    PermissionDenied,
    MalformedResult,
    /// The probe succeeded but the source holds no rows.
    NoData,
    /// The newest row is older than the configured freshness bound.
    Stale,
}

impl From<ProbeErrorKind> for UnavailableKind {
    fn from(kind: ProbeErrorKind) -> Self {
        match kind {
            ProbeErrorKind::ConnectionFailure => UnavailableKind::ConnectionFailure,
            ProbeErrorKind::Timeout => UnavailableKind::Timeout,
            ProbeErrorKind::PermissionDenied => UnavailableKind::PermissionDenied,
            ProbeErrorKind::MalformedResult => UnavailableKind::MalformedResult,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Section<T> {
    Available {
        #[serde(with = "chrono::serde::ts_milliseconds")]
        captured_at: DateTime<Utc>,
        data: T,
    },
    Unavailable {
        kind: UnavailableKind,
        reason: String,
    },
}

impl<T> Section<T> {
    pub fn data(&self) -> Option<&T> {
        match self {
            Section::Available { data, .. } => Some(data),
            Section::Unavailable { .. } => None,
        }
    }

    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Section::Available { captured_at, .. } => Some(*captured_at),
            Section::Unavailable { .. } => None,
        }
    }

    pub fn unavailable_kind(&self) -> Option<UnavailableKind> {
        match self {
            Section::Available { .. } => None,
            Section::Unavailable { kind, .. } => Some(*kind),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Section::Available { .. })
    }
}

/// Everything gathered for one dashboard render.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub cluster: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub finished_at: DateTime<Utc>,
    pub host: Section<HostMetrics>,
    pub host_trend: Section<HostTrend>,
    pub connection_load: Section<ConnectionSummary>,
    pub cache_hit_ratio: Section<CacheSummary>,
    pub server: Section<ServerSummary>,
    pub backup: Section<BackupSummary>,
    pub filesystem: Section<BoundedList<FilesystemUsage>>,
    pub software: Section<SoftwareVersions>,
    pub slow_queries: Section<BoundedList<ActivityRecord>>,
    pub idle_sessions: Section<BoundedList<ActivityRecord>>,
    pub locks: Section<BoundedList<ActivityRecord>>,
    pub table_bloat: Section<BoundedList<TableStat>>,
    pub table_sizes: Section<BoundedList<TableStat>>,
    pub top_statements: Section<BoundedList<StatementStat>>,
}

impl DashboardSnapshot {
    /// Capture time of every available section, keyed by section name.
    pub fn capture_times(&self) -> Vec<(&'static str, Option<DateTime<Utc>>)> {
        vec![
            ("host", self.host.captured_at()),
            ("host_trend", self.host_trend.captured_at()),
            ("connection_load", self.connection_load.captured_at()),
            ("cache_hit_ratio", self.cache_hit_ratio.captured_at()),
            ("server", self.server.captured_at()),
            ("backup", self.backup.captured_at()),
            ("filesystem", self.filesystem.captured_at()),
            ("software", self.software.captured_at()),
            ("slow_queries", self.slow_queries.captured_at()),
            ("idle_sessions", self.idle_sessions.captured_at()),
            ("locks", self.locks.captured_at()),
            ("table_bloat", self.table_bloat.captured_at()),
            ("table_sizes", self.table_sizes.captured_at()),
            ("top_statements", self.top_statements.captured_at()),
        ]
    }

    /// Names of sections that carry no data.
    pub fn unavailable_sections(&self) -> Vec<&'static str> {
        self.capture_times()
            .into_iter()
            .filter_map(|(name, captured_at)| captured_at.is_none().then_some(name))
            .collect()
    }

    pub fn is_partial(&self) -> bool {
        !self.unavailable_sections().is_empty()
    }
}

/// Host resource drill-down: trend, correlated high-CPU sessions and tuning settings.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceReport {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub finished_at: DateTime<Utc>,
    pub host: Section<HostMetrics>,
    pub trend: Section<HostTrend>,
    pub high_cpu_sessions: Section<BoundedList<HighCpuProcess>>,
    /// `Some(true)` when live sessions correlate with a recorded CPU spike.
    pub high_cpu_detected: Option<bool>,
    pub optimization: Section<BoundedList<OptimizationSetting>>,
}
