use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use tracing::{debug, instrument, warn};

use crate::config::{AppConfig, Limits};
use crate::error::{ProbeError, ValidationError};
use crate::metrics::AppMetrics;
use crate::normalize::derive::{asc_time_unknown_last, desc_unknown_last};
use crate::normalize::{
    ActivityKind, ActivityRecord, BoundedList, HighCpuProcess, HostMetrics, Normalizer,
};
use crate::probe::{
    self, ActivityFilter, HighCpuFilter, ProbeClient, ProbeId, ProbeResult, RowSet, TableScope,
};
use crate::snapshot::{DashboardSnapshot, ResourceReport, Section, UnavailableKind};

const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"];

/// One probe result tagged with the moment it completed.
struct Captured {
    captured_at: DateTime<Utc>,
    result: ProbeResult,
}

/// Collection window of a single request.
struct Window {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl Window {
    fn close(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: Utc::now().max(started_at),
        }
    }

    /// Build a section from a captured probe. `build` returning `None` marks the
    /// section as holding no data.
    fn section<T, F>(&self, captured: &Captured, build: F) -> Section<T>
    where
        F: FnOnce(&RowSet, DateTime<Utc>) -> Option<T>,
    {
        match &captured.result {
            Ok(rows) => {
                let captured_at = captured
                    .captured_at
                    .clamp(self.started_at, self.finished_at);
                match build(rows, captured_at) {
                    Some(data) => Section::Available { captured_at, data },
                    None => Section::Unavailable {
                        kind: UnavailableKind::NoData,
                        reason: "probe returned no rows".into(),
                    },
                }
            }
            Err(err) => Section::Unavailable {
                kind: err.kind.into(),
                reason: err.to_string(),
            },
        }
    }
}

fn non_empty(rows: &RowSet) -> Option<&RowSet> {
    (!rows.is_empty()).then_some(rows)
}

fn by_elapsed_desc(a: &ActivityRecord, b: &ActivityRecord) -> std::cmp::Ordering {
    desc_unknown_last(a.elapsed_seconds, b.elapsed_seconds)
}

fn by_wait_start_asc(a: &ActivityRecord, b: &ActivityRecord) -> std::cmp::Ordering {
    asc_time_unknown_last(a.started_at, b.started_at)
}

fn by_process_cpu_desc(a: &HighCpuProcess, b: &HighCpuProcess) -> std::cmp::Ordering {
    desc_unknown_last(a.process_cpu_usage, b.process_cpu_usage)
}

/// Fans out the probe set for one request and merges the normalized sections.
#[derive(Clone)]
pub struct Aggregator {
    cluster: String,
    probes: Arc<dyn ProbeClient>,
    normalizer: Normalizer,
    limits: Limits,
    probe_timeout: Duration,
    metrics: AppMetrics,
}

impl Aggregator {
    pub fn new(config: &AppConfig, probes: Arc<dyn ProbeClient>, metrics: AppMetrics) -> Self {
        Self {
            cluster: config.cluster.clone(),
            probes,
            normalizer: Normalizer::new(
                config.thresholds.clone(),
                config.security.redact_sql_text,
                config.limits.rolling_window,
            ),
            limits: config.limits.clone(),
            probe_timeout: config.timeouts.probe,
            metrics,
        }
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn probes(&self) -> &dyn ProbeClient {
        self.probes.as_ref()
    }

    async fn capture<F>(&self, probe: ProbeId, fut: F) -> Captured
    where
        F: Future<Output = ProbeResult>,
    {
        let start = Instant::now();
        let result = probe::with_timeout(probe, self.probe_timeout, fut).await;
        let captured_at = Utc::now();
        let failure = result.as_ref().err().map(|err| err.kind);
        self.metrics.observe_probe(probe, start.elapsed(), failure);
        match &result {
            Ok(rows) => debug!(probe = probe.as_str(), rows = rows.len(), "probe completed"),
            Err(err) => warn!(
                probe = probe.as_str(),
                kind = err.kind.as_str(),
                detail = %err.detail,
                "probe failed; section degraded"
            ),
        }
        Captured {
            captured_at,
            result,
        }
    }

    /// Collect a full dashboard snapshot. Probe failures degrade only their own
    /// section.
    #[instrument(skip_all, fields(cluster = %self.cluster))]
    pub async fn dashboard(&self) -> DashboardSnapshot {
        let started_at = Utc::now();
        let top_n = self.limits.top_n as usize;
        // One extra row tells a full list apart from a truncated one.
        let fetch_limit = self.limits.top_n.saturating_add(1);
        let slow = ActivityFilter {
            min_age: self.limits.slow_query_age,
            limit: fetch_limit,
        };
        let idle = ActivityFilter {
            min_age: self.limits.idle_session_age,
            limit: fetch_limit,
        };
        let scope = TableScope {
            schema: self.limits.table_schema.clone(),
            limit: fetch_limit,
        };
        let probes = self.probes.as_ref();

        let (
            host,
            connections,
            cache,
            server,
            backup,
            filesystem,
            software,
            slow_queries,
            idle_sessions,
            locks,
            bloat,
            sizes,
            statements,
        ) = tokio::join!(
            self.capture(
                ProbeId::SystemMetrics,
                probes.system_metrics(self.limits.history_rows.max(1)),
            ),
            self.capture(ProbeId::ConnectionStats, probes.connection_stats()),
            self.capture(ProbeId::CacheStats, probes.cache_stats()),
            self.capture(ProbeId::ServerInfo, probes.server_info()),
            self.capture(
                ProbeId::BackupHistory,
                probes.backup_history(self.limits.backup_rows.max(2)),
            ),
            self.capture(ProbeId::FilesystemUsage, probes.filesystem_usage()),
            self.capture(ProbeId::SoftwareVersions, probes.software_versions()),
            self.capture(ProbeId::SlowQueries, probes.slow_queries(slow)),
            self.capture(ProbeId::IdleSessions, probes.idle_sessions(idle)),
            self.capture(ProbeId::LockWaits, probes.lock_waits(fetch_limit)),
            self.capture(ProbeId::TableBloat, probes.table_bloat(&scope)),
            self.capture(ProbeId::TableSizes, probes.table_sizes(&scope)),
            self.capture(ProbeId::TopStatements, probes.top_statements(fetch_limit)),
        );

        let window = Window::close(started_at);
        let n = &self.normalizer;

        let snapshot = DashboardSnapshot {
            cluster: self.cluster.clone(),
            started_at: window.started_at,
            finished_at: window.finished_at,
            host: self.fresh_host(window.section(&host, |rows, at| n.host(rows, at))),
            host_trend: window.section(&host, |rows, _| non_empty(rows).map(|r| n.host_trend(r))),
            connection_load: window.section(&connections, |rows, at| {
                non_empty(rows).map(|r| n.connection_load(r, at))
            }),
            cache_hit_ratio: window.section(&cache, |rows, at| {
                non_empty(rows).map(|r| n.cache_hit_ratio(r, at))
            }),
            server: window.section(&server, |rows, at| non_empty(rows).map(|r| n.server(r, at))),
            backup: window.section(&backup, |rows, at| non_empty(rows).map(|r| n.backup(r, at))),
            filesystem: window.section(&filesystem, |rows, at| {
                non_empty(rows).map(|r| n.filesystem(r, at))
            }),
            software: window.section(&software, |rows, _| non_empty(rows).map(|r| n.software(r))),
            slow_queries: window.section(&slow_queries, |rows, _| {
                Some(
                    n.activity(ActivityKind::SlowQuery, rows)
                        .ranked(top_n, by_elapsed_desc),
                )
            }),
            idle_sessions: window.section(&idle_sessions, |rows, _| {
                Some(
                    n.activity(ActivityKind::IdleSession, rows)
                        .ranked(top_n, by_elapsed_desc),
                )
            }),
            locks: window.section(&locks, |rows, _| {
                Some(
                    n.activity(ActivityKind::LockWait, rows)
                        .ranked(top_n, by_wait_start_asc),
                )
            }),
            table_bloat: window.section(&bloat, |rows, _| {
                Some(n.tables(rows).ranked(top_n, |a, b| {
                    desc_unknown_last(a.estimated_bloat_bytes, b.estimated_bloat_bytes)
                }))
            }),
            table_sizes: window.section(&sizes, |rows, _| {
                Some(n.tables(rows).ranked(top_n, |a, b| {
                    desc_unknown_last(
                        a.total_bytes.map(|v| v as f64),
                        b.total_bytes.map(|v| v as f64),
                    )
                }))
            }),
            top_statements: window.section(&statements, |rows, _| {
                Some(n.statements(rows).ranked(top_n, |a, b| {
                    desc_unknown_last(a.total_time_seconds, b.total_time_seconds)
                }))
            }),
        };

        if snapshot.is_partial() {
            warn!(
                unavailable = ?snapshot.unavailable_sections(),
                "dashboard snapshot is partial"
            );
        }
        snapshot
    }

    /// Demote a host section whose newest row is past `host_metrics_max_age`.
    fn fresh_host(&self, section: Section<HostMetrics>) -> Section<HostMetrics> {
        let max_age = self.limits.host_metrics_max_age;
        match section {
            Section::Available { captured_at, data } if !data.is_fresh(captured_at, max_age) => {
                let recorded = data
                    .recorded_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "an unknown time".into());
                debug!(recorded = %recorded, "host metrics are stale");
                Section::Unavailable {
                    kind: UnavailableKind::Stale,
                    reason: format!(
                        "newest host metrics row was recorded at {recorded}, more than {}s ago",
                        max_age.as_secs()
                    ),
                }
            }
            other => other,
        }
    }

    /// Host trend, correlated high-CPU sessions and tuning settings.
    #[instrument(skip_all, fields(cluster = %self.cluster))]
    pub async fn resources(&self) -> ResourceReport {
        let started_at = Utc::now();
        let probes = self.probes.as_ref();
        let high_cpu_limit = self.limits.high_cpu_rows;

        let (history, live, settings) = tokio::join!(
            self.capture(
                ProbeId::SystemMetrics,
                probes.system_metrics(self.limits.history_rows.max(1)),
            ),
            self.capture(
                ProbeId::LiveHighCpuSessions,
                probes.live_high_cpu_sessions(high_cpu_limit.saturating_add(1)),
            ),
            self.capture(ProbeId::OptimizationSettings, probes.optimization_settings()),
        );

        let window = Window::close(started_at);
        let n = &self.normalizer;
        let high_cpu_sessions = window.section(&live, |rows, _| {
            Some(
                n.high_cpu(rows)
                    .ranked(high_cpu_limit as usize, by_process_cpu_desc),
            )
        });
        let high_cpu_detected = high_cpu_sessions.data().map(|list| !list.is_empty());

        ResourceReport {
            started_at: window.started_at,
            finished_at: window.finished_at,
            host: self.fresh_host(window.section(&history, |rows, at| n.host(rows, at))),
            trend: window.section(&history, |rows, _| non_empty(rows).map(|r| n.host_trend(r))),
            high_cpu_sessions,
            high_cpu_detected,
            optimization: window.section(&settings, |rows, _| Some(n.optimization(rows))),
        }
    }

    /// Recorded high-CPU processes matching `filter`, highest process CPU first.
    #[instrument(skip_all, fields(cluster = %self.cluster))]
    pub async fn high_cpu_processes(
        &self,
        filter: &HighCpuFilter,
    ) -> Result<BoundedList<HighCpuProcess>, ProbeError> {
        let fetch = HighCpuFilter {
            limit: filter.limit.saturating_add(1),
            ..filter.clone()
        };
        let captured = self
            .capture(
                ProbeId::HighCpuProcesses,
                self.probes.high_cpu_processes(&fetch),
            )
            .await;
        let rows = captured.result?;
        Ok(self
            .normalizer
            .high_cpu(&rows)
            .ranked(filter.limit as usize, by_process_cpu_desc))
    }
}

/// Build a drill-down filter from loosely typed request parameters. The
/// timestamp is truncated to its minute.
pub fn high_cpu_filter(
    timestamp: Option<&str>,
    min_cpu: Option<f64>,
    limit: u32,
) -> Result<HighCpuFilter, ValidationError> {
    let recorded_minute = match timestamp.map(str::trim).filter(|raw| !raw.is_empty()) {
        Some(raw) => Some(parse_minute(raw).ok_or_else(|| ValidationError::InvalidParameter {
            name: "timestamp".into(),
            reason: format!("{raw:?} is not of the form YYYY-MM-DDTHH:MM[:SS]"),
        })?),
        None => None,
    };
    if let Some(cpu) = min_cpu {
        if !cpu.is_finite() || !(0.0..=100.0).contains(&cpu) {
            return Err(ValidationError::InvalidParameter {
                name: "min_cpu".into(),
                reason: format!("{cpu} is outside 0..=100"),
            });
        }
    }
    if limit == 0 {
        return Err(ValidationError::InvalidParameter {
            name: "limit".into(),
            reason: "must be at least 1".into(),
        });
    }
    Ok(HighCpuFilter {
        recorded_minute,
        min_cpu,
        limit,
    })
}

fn parse_minute(raw: &str) -> Option<NaiveDateTime> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .and_then(|ts| ts.with_second(0))
        .and_then(|ts| ts.with_nanosecond(0))
}
