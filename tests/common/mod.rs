#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pgdash::app::AppContext;
use pgdash::config::AppConfig;
use pgdash::error::{ProbeError, ProbeErrorKind, StoreError};
use pgdash::maintenance::{
    BackendError, MaintenanceBackend, MaintenanceTx, RemoteExecutor, RemoteOutput, RestorePlan,
    TableRef, VacuumMode,
};
use pgdash::metrics::AppMetrics;
use pgdash::notify::{Notification, Notifier};
use pgdash::policy::{ActorId, Role};
use pgdash::probe::{
    ActivityFilter, ColumnKind, HighCpuFilter, ProbeClient, ProbeId, ProbeResult, RowSet,
    TableScope, Value,
};
use pgdash::state::SharedState;
use pgdash::users::{RoleStore, UserRecord};

// ---------------------------------------------------------------- probes

#[derive(Default)]
pub struct FakeProbeClient {
    responses: Mutex<HashMap<ProbeId, ProbeResult>>,
    delays: Mutex<HashMap<ProbeId, Duration>>,
    calls: AtomicUsize,
}

impl FakeProbeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, probe: ProbeId, rows: RowSet) -> Self {
        self.responses.lock().unwrap().insert(probe, Ok(rows));
        self
    }

    /// Replace the canned answer of an already shared client.
    pub fn set_response(&self, probe: ProbeId, rows: RowSet) {
        self.responses.lock().unwrap().insert(probe, Ok(rows));
    }

    pub fn fail(self, probe: ProbeId, kind: ProbeErrorKind) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(probe, Err(ProbeError::new(probe, kind, "injected failure")));
        self
    }

    pub fn delay(self, probe: ProbeId, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(probe, delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn answer(&self, probe: ProbeId) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.lock().unwrap().get(&probe).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .get(&probe)
            .cloned()
            .unwrap_or_else(|| Ok(RowSet::default()))
    }
}

#[async_trait]
impl ProbeClient for FakeProbeClient {
    async fn connection_stats(&self) -> ProbeResult {
        self.answer(ProbeId::ConnectionStats).await
    }
    async fn cache_stats(&self) -> ProbeResult {
        self.answer(ProbeId::CacheStats).await
    }
    async fn server_info(&self) -> ProbeResult {
        self.answer(ProbeId::ServerInfo).await
    }
    async fn slow_queries(&self, _filter: ActivityFilter) -> ProbeResult {
        self.answer(ProbeId::SlowQueries).await
    }
    async fn idle_sessions(&self, _filter: ActivityFilter) -> ProbeResult {
        self.answer(ProbeId::IdleSessions).await
    }
    async fn lock_waits(&self, _limit: u32) -> ProbeResult {
        self.answer(ProbeId::LockWaits).await
    }
    async fn table_bloat(&self, _scope: &TableScope) -> ProbeResult {
        self.answer(ProbeId::TableBloat).await
    }
    async fn table_sizes(&self, _scope: &TableScope) -> ProbeResult {
        self.answer(ProbeId::TableSizes).await
    }
    async fn top_statements(&self, _limit: u32) -> ProbeResult {
        self.answer(ProbeId::TopStatements).await
    }
    async fn system_metrics(&self, _limit: u32) -> ProbeResult {
        self.answer(ProbeId::SystemMetrics).await
    }
    async fn backup_history(&self, _limit: u32) -> ProbeResult {
        self.answer(ProbeId::BackupHistory).await
    }
    async fn filesystem_usage(&self) -> ProbeResult {
        self.answer(ProbeId::FilesystemUsage).await
    }
    async fn software_versions(&self) -> ProbeResult {
        self.answer(ProbeId::SoftwareVersions).await
    }
    async fn high_cpu_processes(&self, _filter: &HighCpuFilter) -> ProbeResult {
        self.answer(ProbeId::HighCpuProcesses).await
    }
    async fn live_high_cpu_sessions(&self, _limit: u32) -> ProbeResult {
        self.answer(ProbeId::LiveHighCpuSessions).await
    }
    async fn optimization_settings(&self) -> ProbeResult {
        self.answer(ProbeId::OptimizationSettings).await
    }
}

pub fn connection_rows(active: i64, max: i64) -> RowSet {
    RowSet::with_columns(&[
        ("active_connections", ColumnKind::Int),
        ("max_connections", ColumnKind::Int),
        ("remote_clients", ColumnKind::Int),
    ])
    .with_row(vec![active.into(), max.into(), 0i64.into()])
}

pub fn cache_rows(hits: i64, reads: i64) -> RowSet {
    RowSet::with_columns(&[("blks_hit", ColumnKind::Int), ("blks_read", ColumnKind::Int)])
        .with_row(vec![hits.into(), reads.into()])
}

pub fn system_rows(cpu: f64, ram: f64) -> RowSet {
    system_rows_at(cpu, ram, Utc::now())
}

pub fn system_rows_at(cpu: f64, ram: f64, recorded_at: DateTime<Utc>) -> RowSet {
    RowSet::with_columns(&[
        ("cpu_usage", ColumnKind::Float),
        ("ram_usage", ColumnKind::Float),
        ("cache_usage", ColumnKind::Float),
        ("disk_usage", ColumnKind::Float),
        ("cpu_load1", ColumnKind::Float),
        ("cpu_load5", ColumnKind::Float),
        ("recorded_at", ColumnKind::Timestamp),
    ])
    .with_row(vec![
        cpu.into(),
        ram.into(),
        95.0.into(),
        40.0.into(),
        1.5.into(),
        1.2.into(),
        recorded_at.into(),
    ])
}

/// Activity rows as `(pid, elapsed_seconds, started_at)`.
pub fn activity_rows(rows: &[(i64, f64, DateTime<Utc>)]) -> RowSet {
    let mut set = RowSet::with_columns(&[
        ("pid", ColumnKind::Int),
        ("application_name", ColumnKind::Text),
        ("query", ColumnKind::Text),
        ("state", ColumnKind::Text),
        ("started_at", ColumnKind::Timestamp),
        ("elapsed_seconds", ColumnKind::Float),
        ("lock_mode", ColumnKind::Text),
        ("lock_type", ColumnKind::Text),
        ("relation", ColumnKind::Text),
    ]);
    for (pid, elapsed, started_at) in rows {
        set.push_row(vec![
            (*pid).into(),
            "psql".into(),
            "SELECT pg_sleep(1000)".into(),
            "active".into(),
            (*started_at).into(),
            (*elapsed).into(),
            Value::Null,
            Value::Null,
            Value::Null,
        ]);
    }
    set
}

// ---------------------------------------------------------------- maintenance

#[derive(Debug, Clone, PartialEq)]
pub struct FakeRow {
    pub id: i64,
    pub archived_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeDb {
    pub tables: HashMap<String, Vec<FakeRow>>,
}

impl FakeDb {
    pub fn rows(&self, table: &str) -> Option<&Vec<FakeRow>> {
        self.tables.get(table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    CreateArchive,
    CopyRows,
    Truncate,
    RecordPlan,
    Commit,
    Vacuum,
}

#[derive(Default)]
struct BackendShared {
    db: Mutex<FakeDb>,
    plans: Mutex<HashMap<String, RestorePlan>>,
    locks: Mutex<HashSet<String>>,
    fail_at: Mutex<Option<FailPoint>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

/// In-memory database with transactional copy-on-write semantics.
#[derive(Clone, Default)]
pub struct FakeBackend {
    shared: Arc<BackendShared>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, key: &str, ids: impl IntoIterator<Item = i64>) -> Self {
        let rows = ids
            .into_iter()
            .map(|id| FakeRow {
                id,
                archived_at: None,
            })
            .collect();
        self.shared
            .db
            .lock()
            .unwrap()
            .tables
            .insert(key.to_string(), rows);
        self
    }

    pub fn fail_at(&self, point: Option<FailPoint>) {
        *self.shared.fail_at.lock().unwrap() = point;
    }

    /// Delay applied inside every transaction step.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.shared.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.shared.calls.load(Ordering::SeqCst)
    }

    pub fn db(&self) -> FakeDb {
        self.shared.db.lock().unwrap().clone()
    }

    /// Committed restore plans, keyed by source table.
    pub fn stored_plans(&self) -> HashMap<String, RestorePlan> {
        self.shared.plans.lock().unwrap().clone()
    }

    /// Shift every archive timestamp of `table` into the past.
    pub fn backdate(&self, table: &str, days: i64) {
        let mut db = self.shared.db.lock().unwrap();
        if let Some(rows) = db.tables.get_mut(table) {
            for row in rows {
                row.archived_at = row
                    .archived_at
                    .map(|at| at - chrono::Duration::days(days));
            }
        }
    }

    fn failing(&self, point: FailPoint) -> Result<(), BackendError> {
        if *self.shared.fail_at.lock().unwrap() == Some(point) {
            return Err(BackendError::new(format!("injected failure at {point:?}")));
        }
        Ok(())
    }

    async fn pause(&self) {
        let delay = *self.shared.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl MaintenanceBackend for FakeBackend {
    async fn vacuum(&self, table: &TableRef, _mode: VacuumMode) -> Result<(), BackendError> {
        self.shared.calls.fetch_add(1, Ordering::SeqCst);
        self.failing(FailPoint::Vacuum)?;
        if !self.shared.db.lock().unwrap().tables.contains_key(&table.key()) {
            return Err(BackendError::new(format!(
                "relation \"{}\" does not exist",
                table.key()
            )));
        }
        Ok(())
    }

    async fn total_size(&self, table: &TableRef) -> Result<Option<i64>, BackendError> {
        self.shared.calls.fetch_add(1, Ordering::SeqCst);
        let db = self.shared.db.lock().unwrap();
        Ok(db.tables.get(&table.key()).map(|rows| rows.len() as i64 * 8192))
    }

    async fn restore_plan(&self, table: &TableRef) -> Result<Option<RestorePlan>, BackendError> {
        self.shared.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.shared.plans.lock().unwrap().get(&table.key()).cloned())
    }

    async fn begin(&self) -> Result<Box<dyn MaintenanceTx>, BackendError> {
        self.shared.calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let staged = self.shared.db.lock().unwrap().clone();
        Ok(Box::new(FakeTx {
            backend: self.clone(),
            staged,
            staged_plans: Vec::new(),
            held: Vec::new(),
        }))
    }
}

struct FakeTx {
    backend: FakeBackend,
    staged: FakeDb,
    staged_plans: Vec<RestorePlan>,
    held: Vec<String>,
}

impl FakeTx {
    fn release(&mut self) {
        let mut locks = self.backend.shared.locks.lock().unwrap();
        for key in self.held.drain(..) {
            locks.remove(&key);
        }
    }

    fn cutoff(days: u32) -> DateTime<Utc> {
        let today = Utc::now().date_naive();
        let day = today - chrono::Duration::days(i64::from(days));
        day.and_hms_opt(0, 0, 0).unwrap().and_utc()
    }

    fn source_rows(&self, table: &TableRef) -> Result<Vec<FakeRow>, BackendError> {
        self.staged
            .tables
            .get(&table.key())
            .cloned()
            .ok_or_else(|| BackendError::new(format!("relation \"{}\" does not exist", table.key())))
    }
}

impl Drop for FakeTx {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl MaintenanceTx for FakeTx {
    async fn try_lock_target(&mut self, key: &str) -> Result<bool, BackendError> {
        let acquired = self.backend.shared.locks.lock().unwrap().insert(key.to_string());
        if acquired {
            self.held.push(key.to_string());
        }
        Ok(acquired)
    }

    async fn create_archive(
        &mut self,
        source: &TableRef,
        archive: &TableRef,
    ) -> Result<(), BackendError> {
        self.backend.pause().await;
        self.source_rows(source)?;
        self.backend.failing(FailPoint::CreateArchive)?;
        self.staged.tables.entry(archive.key()).or_default();
        Ok(())
    }

    async fn copy_into_archive(
        &mut self,
        source: &TableRef,
        archive: &TableRef,
    ) -> Result<u64, BackendError> {
        self.backend.pause().await;
        self.backend.failing(FailPoint::CopyRows)?;
        let now = Utc::now();
        let rows = self.source_rows(source)?;
        let target = self.staged.tables.entry(archive.key()).or_default();
        for row in &rows {
            target.push(FakeRow {
                id: row.id,
                archived_at: Some(now),
            });
        }
        Ok(rows.len() as u64)
    }

    async fn truncate(&mut self, table: &TableRef) -> Result<(), BackendError> {
        self.backend.failing(FailPoint::Truncate)?;
        if let Some(rows) = self.staged.tables.get_mut(&table.key()) {
            rows.clear();
        }
        Ok(())
    }

    async fn record_restore_plan(&mut self, plan: &RestorePlan) -> Result<(), BackendError> {
        self.backend.failing(FailPoint::RecordPlan)?;
        self.staged_plans.push(plan.clone());
        Ok(())
    }

    async fn restore_from_archive(
        &mut self,
        archive: &TableRef,
        source: &TableRef,
        retention_days: u32,
    ) -> Result<u64, BackendError> {
        let cutoff = Self::cutoff(retention_days);
        let moved: Vec<FakeRow> = self
            .source_rows(archive)?
            .into_iter()
            .filter(|row| row.archived_at.is_some_and(|at| at < cutoff))
            .map(|row| FakeRow {
                id: row.id,
                archived_at: None,
            })
            .collect();
        let count = moved.len() as u64;
        self.staged
            .tables
            .entry(source.key())
            .or_default()
            .extend(moved);
        Ok(count)
    }

    async fn purge_archive(
        &mut self,
        archive: &TableRef,
        retention_days: u32,
    ) -> Result<u64, BackendError> {
        let cutoff = Self::cutoff(retention_days);
        let rows = self
            .staged
            .tables
            .get_mut(&archive.key())
            .ok_or_else(|| BackendError::new("archive missing"))?;
        let before = rows.len();
        rows.retain(|row| !row.archived_at.is_some_and(|at| at < cutoff));
        Ok((before - rows.len()) as u64)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), BackendError> {
        self.backend.failing(FailPoint::Commit)?;
        *self.backend.shared.db.lock().unwrap() = std::mem::take(&mut self.staged);
        let staged_plans = std::mem::take(&mut self.staged_plans);
        {
            let mut plans = self.backend.shared.plans.lock().unwrap();
            for plan in staged_plans {
                plans.insert(plan.table.key(), plan);
            }
        }
        self.release();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), BackendError> {
        self.release();
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRemote {
    output: Mutex<Option<RemoteOutput>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl FakeRemote {
    pub fn succeeding() -> Self {
        let remote = Self::default();
        remote.set_output(Some(RemoteOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        }));
        remote
    }

    /// `None` simulates a spawn failure.
    pub fn set_output(&self, output: Option<RemoteOutput>) {
        *self.output.lock().unwrap() = output;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteExecutor for FakeRemote {
    async fn restart_service(&self, _host: &str) -> Result<RemoteOutput, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.output
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BackendError::new("failed to start ssh: No such file or directory"))
    }
}

// ---------------------------------------------------------------- roles

#[derive(Default)]
pub struct MemoryRoleStore {
    users: Mutex<BTreeMap<ActorId, (String, Role)>>,
}

impl MemoryRoleStore {
    pub fn with_users(users: &[(ActorId, &str, Role)]) -> Self {
        let store = Self::default();
        {
            let mut map = store.users.lock().unwrap();
            for (id, name, role) in users {
                map.insert(*id, ((*name).to_string(), *role));
            }
        }
        store
    }

    fn admins(map: &BTreeMap<ActorId, (String, Role)>) -> usize {
        map.values().filter(|(_, role)| *role == Role::Admin).count()
    }
}

#[async_trait]
impl RoleStore for MemoryRoleStore {
    async fn role_of(&self, user: ActorId) -> Result<Option<Role>, StoreError> {
        Ok(self.users.lock().unwrap().get(&user).map(|(_, role)| *role))
    }

    async fn admin_count(&self) -> Result<u64, StoreError> {
        Ok(Self::admins(&self.users.lock().unwrap()) as u64)
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .map(|(id, (name, role))| UserRecord {
                id: *id,
                username: name.clone(),
                email: None,
                role: *role,
            })
            .collect())
    }

    async fn set_role(&self, user: ActorId, role: Role) -> Result<(), StoreError> {
        let mut map = self.users.lock().unwrap();
        let admins = Self::admins(&map);
        let entry = map.get_mut(&user).ok_or(StoreError::NotFound(user))?;
        if entry.1 == Role::Admin && role != Role::Admin && admins <= 1 {
            return Err(StoreError::LastAdmin);
        }
        entry.1 = role;
        Ok(())
    }

    async fn delete_user(&self, user: ActorId) -> Result<(), StoreError> {
        let mut map = self.users.lock().unwrap();
        let admins = Self::admins(&map);
        let role = map.get(&user).map(|(_, role)| *role).ok_or(StoreError::NotFound(user))?;
        if role == Role::Admin && admins <= 1 {
            return Err(StoreError::LastAdmin);
        }
        map.remove(&user);
        Ok(())
    }
}

// ---------------------------------------------------------------- notifications

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------- wiring

pub const ADMIN: ActorId = 1;
pub const SECOND_ADMIN: ActorId = 2;
pub const MODERATOR: ActorId = 3;
pub const USER: ActorId = 4;

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.cluster = "test".into();
    config.remote.hosts = vec!["db1.internal".into()];
    config.timeouts.probe = Duration::from_millis(200);
    config.timeouts.maintenance_step = Duration::from_millis(500);
    config.timeouts.remote_exec = Duration::from_millis(500);
    config.limits.top_n = 3;
    config
}

pub struct Harness {
    pub ctx: AppContext,
    pub probes: Arc<FakeProbeClient>,
    pub backend: FakeBackend,
    pub remote: Arc<FakeRemote>,
    pub roles: Arc<MemoryRoleStore>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn harness_with(config: AppConfig, probes: FakeProbeClient, backend: FakeBackend) -> Harness {
    let probes = Arc::new(probes);
    let remote = Arc::new(FakeRemote::succeeding());
    let roles = Arc::new(MemoryRoleStore::with_users(&[
        (ADMIN, "alice", Role::Admin),
        (SECOND_ADMIN, "bob", Role::Admin),
        (MODERATOR, "carol", Role::Moderator),
        (USER, "dave", Role::User),
    ]));
    let notifier = Arc::new(RecordingNotifier::default());
    let ctx = AppContext::new(
        config,
        probes.clone(),
        AppMetrics::new().expect("metrics registry"),
        SharedState::new(),
        notifier.clone(),
    )
    .with_admin(Arc::new(backend.clone()), remote.clone(), roles.clone());
    Harness {
        ctx,
        probes,
        backend,
        remote,
        roles,
        notifier,
    }
}

pub fn harness(backend: FakeBackend) -> Harness {
    harness_with(test_config(), FakeProbeClient::new(), backend)
}
