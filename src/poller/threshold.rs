use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::app::AppContext;
use crate::normalize::{MetricCategory, MetricSample};
use crate::notify::{self, Notification, NotificationKind};
use crate::probe::{self, ProbeId};

/// Sample host and database indicators, refresh the gauges and raise a
/// notification for every category that just crossed the persistence
/// threshold. Returns the categories alerted on this cycle.
pub async fn run(ctx: &AppContext) -> Result<Vec<MetricCategory>> {
    let probes = ctx.aggregator.probes();
    let normalizer = ctx.aggregator.normalizer();
    let limit = ctx.config.timeouts.probe;
    let cluster = ctx.cluster_name();

    let (host, connections, cache) = tokio::join!(
        probe::with_timeout(ProbeId::SystemMetrics, limit, probes.system_metrics(1)),
        probe::with_timeout(ProbeId::ConnectionStats, limit, probes.connection_stats()),
        probe::with_timeout(ProbeId::CacheStats, limit, probes.cache_stats()),
    );
    let now = Utc::now();

    // Each sample is paired with the time its reading was taken. Host rows are
    // written by an external collector, so their reading time is `recorded_at`.
    let mut samples: Vec<(MetricSample, DateTime<Utc>)> = Vec::new();
    let mut failures = Vec::new();
    let max_age = ctx.config.limits.host_metrics_max_age;

    match host {
        Ok(rows) => match normalizer.host(&rows, now) {
            Some(metrics) if metrics.is_fresh(now, max_age) => {
                ctx.metrics.set_host_metrics(cluster, &metrics);
                if let Some(recorded_at) = metrics.recorded_at {
                    samples.extend(metrics.samples.into_iter().map(|s| (s, recorded_at)));
                }
            }
            Some(metrics) => debug!(
                recorded_at = ?metrics.recorded_at,
                max_age_secs = max_age.as_secs(),
                "host metrics are stale, skipping"
            ),
            None => debug!("no host metrics recorded yet"),
        },
        Err(err) => failures.push(err),
    }

    let cache = match cache {
        Ok(rows) => Some(normalizer.cache_hit_ratio(&rows, now)),
        Err(err) => {
            failures.push(err);
            None
        }
    };
    match connections {
        Ok(rows) => {
            let summary = normalizer.connection_load(&rows, now);
            ctx.metrics
                .set_database_metrics(cluster, &summary, cache.as_ref());
            samples.push((summary.load, now));
        }
        Err(err) => failures.push(err),
    }
    if let Some(cache) = cache {
        samples.push((cache.ratio, now));
    }

    if samples.is_empty() {
        if let Some(err) = failures.into_iter().next() {
            bail!(err);
        }
        return Ok(Vec::new());
    }
    for err in &failures {
        warn!(probe = err.probe.as_str(), kind = err.kind.as_str(), detail = %err.detail, "threshold watch probe failed");
    }

    let persist = ctx.config.alerts.persist_cycles;
    let mut alerted = Vec::new();
    for (sample, observed_at) in &samples {
        if !ctx
            .state
            .observe_status(sample.category, sample.status, *observed_at, persist)
            .await
        {
            continue;
        }
        ctx.metrics.inc_alert(cluster, sample.category);
        alerted.push(sample.category);

        let value = sample
            .value
            .map(|v| format!("{v:.2}"))
            .unwrap_or_else(|| "unknown".into());
        warn!(category = sample.category.as_str(), value = %value, cycles = persist, "threshold breach persisted");
        notify::dispatch(
            ctx.notifier.clone(),
            Notification::new(
                NotificationKind::ThresholdBreach,
                cluster,
                format!("{} in warning state", sample.category.as_str()),
                format!(
                    "{} = {} for {} consecutive checks",
                    sample.category.as_str(),
                    value,
                    persist
                ),
            ),
        );
    }
    Ok(alerted)
}
