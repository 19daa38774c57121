use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::error::ProbeErrorKind;
use crate::normalize::{CacheSummary, ConnectionSummary, HostMetrics, MetricCategory, Status};
use crate::probe::ProbeId;

/// Metrics registry scraped by Prometheus.
#[derive(Clone)]
pub struct AppMetrics {
    registry: Arc<Registry>,
    loops: LoopMetrics,
    probes: ProbeMetrics,
    host: HostGauges,
    database: DatabaseGauges,
    maintenance: MaintenanceMetrics,
    alert_counters: AlertCounters,
}

impl AppMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new_custom(Some("pgdash".into()), None)?);

        let loops = LoopMetrics::register(&registry)?;
        let probes = ProbeMetrics::register(&registry)?;
        let host = HostGauges::register(&registry)?;
        let database = DatabaseGauges::register(&registry)?;
        let maintenance = MaintenanceMetrics::register(&registry)?;
        let alert_counters = AlertCounters::register(&registry)?;

        Ok(Self {
            registry,
            loops,
            probes,
            host,
            database,
            maintenance,
            alert_counters,
        })
    }

    /// Observe the execution duration for a loop.
    pub fn observe_duration(&self, loop_name: &str, duration: Duration) {
        self.loops
            .scrape_duration
            .with_label_values(&[loop_name])
            .observe(duration.as_secs_f64());
    }

    /// Record a success flag for a loop iteration (1=success, 0=failed).
    pub fn record_success(&self, loop_name: &str, success: bool) {
        self.loops
            .last_success
            .with_label_values(&[loop_name])
            .set(if success { 1 } else { 0 });
    }

    /// Increment the error counter for a loop.
    pub fn inc_error(&self, loop_name: &str) {
        self.loops
            .errors_total
            .with_label_values(&[loop_name])
            .inc();
    }

    /// Record one probe call and, when it failed, its failure class.
    pub fn observe_probe(&self, probe: ProbeId, duration: Duration, failure: Option<ProbeErrorKind>) {
        self.probes
            .duration
            .with_label_values(&[probe.as_str()])
            .observe(duration.as_secs_f64());
        if let Some(kind) = failure {
            self.probes
                .failures_total
                .with_label_values(&[probe.as_str(), kind.as_str()])
                .inc();
        }
    }

    pub fn set_host_metrics(&self, cluster: &str, host: &HostMetrics) {
        for sample in &host.samples {
            let labels = &[cluster, sample.category.as_str()];
            self.host
                .value
                .with_label_values(labels)
                .set(sample.value.unwrap_or(0.0));
            self.host
                .status
                .with_label_values(labels)
                .set(status_value(sample.status));
        }
    }

    pub fn set_database_metrics(
        &self,
        cluster: &str,
        connections: &ConnectionSummary,
        cache: Option<&CacheSummary>,
    ) {
        set_optional_int_gauge(&self.database.connections, cluster, connections.active);
        set_optional_int_gauge(&self.database.max_connections, cluster, connections.max);
        set_optional_gauge(
            &self.database.connection_headroom,
            cluster,
            connections.load.value,
        );
        if let Some(cache) = cache {
            set_optional_gauge(&self.database.cache_hit_ratio, cluster, cache.ratio.value);
        }
    }

    pub fn inc_maintenance(&self, kind: &str, outcome: &str) {
        self.maintenance
            .jobs_total
            .with_label_values(&[kind, outcome])
            .inc();
    }

    pub fn inc_alert(&self, cluster: &str, category: MetricCategory) {
        self.alert_counters
            .alerts_total
            .with_label_values(&[cluster, category.as_str()])
            .inc();
    }

    /// Encode metrics into Prometheus exposition format.
    pub fn encode(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[derive(Clone)]
struct LoopMetrics {
    scrape_duration: HistogramVec,
    last_success: IntGaugeVec,
    errors_total: IntCounterVec,
}

impl LoopMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let scrape_duration = HistogramVec::new(
            HistogramOpts::new("loop_duration_seconds", "Loop execution duration"),
            &["loop"],
        )?;
        registry.register(Box::new(scrape_duration.clone()))?;

        let last_success = IntGaugeVec::new(
            Opts::new(
                "loop_last_success",
                "Loop success flag (1=success, 0=failure)",
            ),
            &["loop"],
        )?;
        registry.register(Box::new(last_success.clone()))?;

        let errors_total =
            IntCounterVec::new(Opts::new("loop_errors_total", "Total loop errors"), &["loop"])?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            scrape_duration,
            last_success,
            errors_total,
        })
    }
}

#[derive(Clone)]
struct ProbeMetrics {
    duration: HistogramVec,
    failures_total: IntCounterVec,
}

impl ProbeMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let duration = HistogramVec::new(
            HistogramOpts::new("probe_duration_seconds", "Diagnostic probe latency")
                .buckets(vec![0.005, 0.025, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["probe"],
        )?;
        registry.register(Box::new(duration.clone()))?;

        let failures_total = IntCounterVec::new(
            Opts::new("probe_failures_total", "Failed probes grouped by failure kind"),
            &["probe", "kind"],
        )?;
        registry.register(Box::new(failures_total.clone()))?;

        Ok(Self {
            duration,
            failures_total,
        })
    }
}

#[derive(Clone)]
struct HostGauges {
    value: GaugeVec,
    status: IntGaugeVec,
}

impl HostGauges {
    fn register(registry: &Registry) -> Result<Self> {
        let value = GaugeVec::new(
            Opts::new("host_metric", "Latest host metric reported by the collector"),
            &["cluster", "category"],
        )?;
        registry.register(Box::new(value.clone()))?;

        let status = IntGaugeVec::new(
            Opts::new(
                "host_metric_status",
                "Host metric status (0=ok, 1=warn, 2=unknown)",
            ),
            &["cluster", "category"],
        )?;
        registry.register(Box::new(status.clone()))?;

        Ok(Self { value, status })
    }
}

#[derive(Clone)]
struct DatabaseGauges {
    connections: IntGaugeVec,
    max_connections: IntGaugeVec,
    connection_headroom: GaugeVec,
    cache_hit_ratio: GaugeVec,
}

impl DatabaseGauges {
    fn register(registry: &Registry) -> Result<Self> {
        let connections = IntGaugeVec::new(
            Opts::new("pg_connections", "Active connections observed"),
            &["cluster"],
        )?;
        registry.register(Box::new(connections.clone()))?;

        let max_connections = IntGaugeVec::new(
            Opts::new("pg_max_connections", "Postgres max_connections setting"),
            &["cluster"],
        )?;
        registry.register(Box::new(max_connections.clone()))?;

        let connection_headroom = GaugeVec::new(
            Opts::new(
                "pg_connection_headroom_percent",
                "Share of max_connections still available",
            ),
            &["cluster"],
        )?;
        registry.register(Box::new(connection_headroom.clone()))?;

        let cache_hit_ratio = GaugeVec::new(
            Opts::new("pg_cache_hit_ratio_percent", "Buffer cache hit ratio"),
            &["cluster"],
        )?;
        registry.register(Box::new(cache_hit_ratio.clone()))?;

        Ok(Self {
            connections,
            max_connections,
            connection_headroom,
            cache_hit_ratio,
        })
    }
}

#[derive(Clone)]
struct MaintenanceMetrics {
    jobs_total: IntCounterVec,
}

impl MaintenanceMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let jobs_total = IntCounterVec::new(
            Opts::new(
                "maintenance_jobs_total",
                "Maintenance jobs grouped by kind and outcome",
            ),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(jobs_total.clone()))?;
        Ok(Self { jobs_total })
    }
}

#[derive(Clone)]
struct AlertCounters {
    alerts_total: IntCounterVec,
}

impl AlertCounters {
    fn register(registry: &Registry) -> Result<Self> {
        let alerts_total = IntCounterVec::new(
            Opts::new(
                "alerts_total",
                "Persistent threshold alerts grouped by category",
            ),
            &["cluster", "category"],
        )?;
        registry.register(Box::new(alerts_total.clone()))?;
        Ok(Self { alerts_total })
    }
}

fn set_optional_gauge(vec: &GaugeVec, cluster: &str, value: Option<f64>) {
    vec.with_label_values(&[cluster]).set(value.unwrap_or(0.0));
}

fn set_optional_int_gauge(vec: &IntGaugeVec, cluster: &str, value: Option<i64>) {
    vec.with_label_values(&[cluster]).set(value.unwrap_or(0));
}

fn status_value(status: Status) -> i64 {
    match status {
        Status::Ok => 0,
        Status::Warn => 1,
        Status::Unknown => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Thresholds;
    use crate::normalize::Normalizer;
    use chrono::Utc;

    #[test]
    fn probe_failures_are_labelled_by_kind() {
        let metrics = AppMetrics::new().expect("metrics");
        metrics.observe_probe(
            ProbeId::LockWaits,
            Duration::from_millis(5),
            Some(ProbeErrorKind::Timeout),
        );
        metrics.observe_probe(ProbeId::LockWaits, Duration::from_millis(5), None);

        let output = metrics.encode().expect("encode");
        let failure_line = output.lines().find(|line| {
            line.starts_with("pgdash_probe_failures_total")
                && line.contains("probe=\"lock_waits\"")
                && line.contains("kind=\"timeout\"")
                && line.trim_end().ends_with(" 1")
        });
        assert!(failure_line.is_some(), "probe failure missing: {output}");
        assert!(
            output.contains("pgdash_probe_duration_seconds_count{probe=\"lock_waits\"} 2"),
            "probe histogram missing: {output}"
        );
    }

    #[test]
    fn host_metrics_export_value_and_status() {
        let metrics = AppMetrics::new().expect("metrics");
        let normalizer = Normalizer::new(Thresholds::default(), false, 3);
        let host = HostMetrics {
            recorded_at: None,
            samples: vec![
                normalizer.sample(MetricCategory::CpuUsage, Some(97.5), Utc::now()),
                normalizer.sample(MetricCategory::RamUsage, None, Utc::now()),
            ],
        };
        metrics.set_host_metrics("prod", &host);

        let output = metrics.encode().expect("encode");
        let cpu_status = output.lines().find(|line| {
            line.starts_with("pgdash_host_metric_status")
                && line.contains("category=\"cpu_usage\"")
                && line.trim_end().ends_with(" 1")
        });
        let ram_status = output.lines().find(|line| {
            line.starts_with("pgdash_host_metric_status")
                && line.contains("category=\"ram_usage\"")
                && line.trim_end().ends_with(" 2")
        });
        assert!(cpu_status.is_some(), "cpu status missing: {output}");
        assert!(ram_status.is_some(), "ram status missing: {output}");
    }

    #[test]
    fn maintenance_counter_records_outcomes() {
        let metrics = AppMetrics::new().expect("metrics");
        metrics.inc_maintenance("archive", "failed");
        metrics.inc_maintenance("archive", "failed");
        let output = metrics.encode().expect("encode");
        let line = output.lines().find(|line| {
            line.starts_with("pgdash_maintenance_jobs_total")
                && line.contains("kind=\"archive\"")
                && line.contains("outcome=\"failed\"")
                && line.trim_end().ends_with(" 2")
        });
        assert!(line.is_some(), "maintenance counter missing: {output}");
    }
}
