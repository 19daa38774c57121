use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::maintenance::MaintenanceJob;
use crate::normalize::{MetricCategory, Status};

/// Jobs kept in the in-memory log; older entries fall off.
pub const JOB_LOG_CAPACITY: usize = 200;

#[derive(Default)]
struct SharedStateInner {
    loop_health: RwLock<HashMap<String, LoopHealth>>,
    jobs: RwLock<VecDeque<MaintenanceJob>>,
    warn_streaks: RwLock<HashMap<MetricCategory, WarnStreak>>,
}

/// Consecutive Warn observations of one category and the timestamp of the
/// last one counted.
#[derive(Debug, Clone, Copy)]
struct WarnStreak {
    cycles: u32,
    observed_at: DateTime<Utc>,
}

/// Process-wide state shared by the poller and the HTTP handlers.
#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<SharedStateInner>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopHealth {
    pub name: String,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl LoopHealth {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            last_success_at: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job or replace the entry with the same id.
    pub async fn record_job(&self, job: MaintenanceJob) {
        let mut jobs = self.inner.jobs.write().await;
        if let Some(existing) = jobs.iter_mut().find(|entry| entry.id == job.id) {
            *existing = job;
            return;
        }
        if jobs.len() == JOB_LOG_CAPACITY {
            jobs.pop_front();
        }
        jobs.push_back(job);
    }

    /// Newest first.
    pub async fn recent_jobs(&self, limit: usize) -> Vec<MaintenanceJob> {
        self.inner
            .jobs
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Tracks consecutive Warn observations per category. Returns true exactly
    /// once, on the observation that brings the streak to `persist_cycles`.
    /// An observation carrying the same `observed_at` as the last one counted
    /// is the same reading seen again and leaves the streak untouched.
    pub async fn observe_status(
        &self,
        category: MetricCategory,
        status: Status,
        observed_at: DateTime<Utc>,
        persist_cycles: u32,
    ) -> bool {
        let mut streaks = self.inner.warn_streaks.write().await;
        if status != Status::Warn {
            streaks.remove(&category);
            return false;
        }
        let streak = streaks.entry(category).or_insert(WarnStreak {
            cycles: 0,
            observed_at,
        });
        if streak.cycles > 0 && streak.observed_at == observed_at {
            return false;
        }
        streak.cycles = streak.cycles.saturating_add(1);
        streak.observed_at = observed_at;
        streak.cycles == persist_cycles.max(1)
    }

    pub async fn record_loop_success(&self, loop_name: &str) {
        let mut guard = self.inner.loop_health.write().await;
        let entry = guard
            .entry(loop_name.to_string())
            .or_insert_with(|| LoopHealth::new(loop_name));
        entry.last_success_at = Some(Utc::now());
        entry.consecutive_failures = 0;
        entry.last_error = None;
    }

    pub async fn record_loop_failure(&self, loop_name: &str, error: String) {
        let mut guard = self.inner.loop_health.write().await;
        let entry = guard
            .entry(loop_name.to_string())
            .or_insert_with(|| LoopHealth::new(loop_name));
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_error = Some(error);
    }

    pub async fn loop_health(&self) -> Vec<LoopHealth> {
        let mut health: Vec<_> = self
            .inner
            .loop_health
            .read()
            .await
            .values()
            .cloned()
            .collect();
        health.sort_by(|a, b| a.name.cmp(&b.name));
        health
    }

    pub async fn is_ready(&self, loop_names: &[&str], max_staleness: Duration) -> bool {
        let health = self.inner.loop_health.read().await;
        let now = Utc::now();
        let staleness = chrono::Duration::from_std(max_staleness)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        loop_names.iter().all(|name| match health.get(*name) {
            Some(entry) if entry.consecutive_failures == 0 => entry
                .last_success_at
                .is_some_and(|last| now.signed_duration_since(last) <= staleness),
            _ => false,
        })
    }
}
