mod backend;
mod executor;
mod guard;
mod postgres;
mod remote;
mod restore;
mod table;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::{AppConfig, RemoteConfig};
use crate::error::{Applied, CoreError, MaintenanceError, ValidationError};
use crate::metrics::AppMetrics;
use crate::notify::{self, Notification, NotificationKind, Notifier};
use crate::policy::{AccessGate, Action, Actor, ActorId, RoleFacts};
use crate::state::SharedState;

pub use backend::{
    BackendError, MaintenanceBackend, MaintenanceTx, RemoteExecutor, RemoteOutput, VacuumMode,
};
pub use executor::MaintenanceExecutor;
pub use guard::{TargetGuard, TargetGuards};
pub use postgres::PgMaintenanceBackend;
pub use remote::SshRemote;
pub use restore::{RestorePlan, RestorePlans};
pub use table::{MAX_IDENTIFIER_LEN, TableRef, validate_identifier};

/// Upper bound accepted for `retention_days`.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Unit of work inside a maintenance job, reported when it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Begin,
    Lock,
    CreateArchive,
    CopyRows,
    Truncate,
    RecordPlan,
    LoadPlan,
    RestoreRows,
    PurgeArchive,
    Commit,
    Vacuum,
    MeasureSize,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::Begin => "begin",
            Step::Lock => "lock",
            Step::CreateArchive => "create_archive",
            Step::CopyRows => "copy_rows",
            Step::Truncate => "truncate",
            Step::RecordPlan => "record_plan",
            Step::LoadPlan => "load_plan",
            Step::RestoreRows => "restore_rows",
            Step::PurgeArchive => "purge_archive",
            Step::Commit => "commit",
            Step::Vacuum => "vacuum",
            Step::MeasureSize => "measure_size",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Vacuum,
    Archive,
    Restore,
    RestartService,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Vacuum => "vacuum",
            JobKind::Archive => "archive",
            JobKind::Restore => "restore",
            JobKind::RestartService => "restart_service",
        }
    }
}

/// What a job acts on; also the single-flight key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTarget {
    Table(TableRef),
    Host(String),
}

impl fmt::Display for JobTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobTarget::Table(table) => write!(f, "{table}"),
            JobTarget::Host(host) => write!(f, "host:{host}"),
        }
    }
}

/// A validated maintenance operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Vacuum {
        table: TableRef,
        mode: VacuumMode,
    },
    Archive {
        table: TableRef,
        retention_days: u32,
    },
    Restore {
        table: TableRef,
        retention_days: Option<u32>,
    },
    RestartService {
        host: String,
    },
}

impl Operation {
    pub fn kind(&self) -> JobKind {
        match self {
            Operation::Vacuum { .. } => JobKind::Vacuum,
            Operation::Archive { .. } => JobKind::Archive,
            Operation::Restore { .. } => JobKind::Restore,
            Operation::RestartService { .. } => JobKind::RestartService,
        }
    }

    pub fn target(&self) -> JobTarget {
        match self {
            Operation::Vacuum { table, .. }
            | Operation::Archive { table, .. }
            | Operation::Restore { table, .. } => JobTarget::Table(table.clone()),
            Operation::RestartService { host } => JobTarget::Host(host.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job {0} already reached a terminal status")]
pub struct JobAlreadySettled(pub Uuid);

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceJob {
    pub id: Uuid,
    #[serde(flatten)]
    pub operation: Operation,
    pub requested_by: ActorId,
    pub status: JobStatus,
    pub error: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub requested_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl MaintenanceJob {
    pub fn new(operation: Operation, requested_by: ActorId) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            requested_by,
            status: JobStatus::Pending,
            error: None,
            requested_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.operation.kind()
    }

    pub fn target(&self) -> JobTarget {
        self.operation.target()
    }

    /// Moves the job to its terminal status. Refused once already settled.
    pub fn settle<T>(
        &mut self,
        result: &Result<T, MaintenanceError>,
    ) -> Result<(), JobAlreadySettled> {
        if self.status != JobStatus::Pending {
            return Err(JobAlreadySettled(self.id));
        }
        match result {
            Ok(_) => self.status = JobStatus::Succeeded,
            Err(err) => {
                self.status = JobStatus::Failed;
                self.error = Some(err.to_string());
            }
        }
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}

/// Maintenance request as submitted by a caller, before validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum MaintenanceRequest {
    Vacuum {
        schema: String,
        table: String,
        #[serde(default)]
        full: bool,
    },
    Archive {
        schema: String,
        table: String,
        retention_days: u32,
    },
    Restore {
        schema: String,
        table: String,
        #[serde(default)]
        retention_days: Option<u32>,
    },
    RestartService {
        host: String,
    },
}

impl MaintenanceRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            MaintenanceRequest::Vacuum { .. } => JobKind::Vacuum,
            MaintenanceRequest::Archive { .. } => JobKind::Archive,
            MaintenanceRequest::Restore { .. } => JobKind::Restore,
            MaintenanceRequest::RestartService { .. } => JobKind::RestartService,
        }
    }

    pub fn validate(&self, remote: &RemoteConfig) -> Result<Operation, ValidationError> {
        match self {
            MaintenanceRequest::Vacuum {
                schema,
                table,
                full,
            } => Ok(Operation::Vacuum {
                table: TableRef::new(schema, table)?,
                mode: if *full {
                    VacuumMode::Full
                } else {
                    VacuumMode::Analyze
                },
            }),
            MaintenanceRequest::Archive {
                schema,
                table,
                retention_days,
            } => {
                let table = TableRef::new(schema, table)?;
                table.archive()?;
                Ok(Operation::Archive {
                    table,
                    retention_days: check_retention(*retention_days)?,
                })
            }
            MaintenanceRequest::Restore {
                schema,
                table,
                retention_days,
            } => {
                let table = TableRef::new(schema, table)?;
                table.archive()?;
                Ok(Operation::Restore {
                    table,
                    retention_days: retention_days.map(check_retention).transpose()?,
                })
            }
            MaintenanceRequest::RestartService { host } => {
                if !remote.allows(host) {
                    return Err(ValidationError::UnknownHost(host.clone()));
                }
                Ok(Operation::RestartService { host: host.clone() })
            }
        }
    }
}

fn check_retention(days: u32) -> Result<u32, ValidationError> {
    if days > MAX_RETENTION_DAYS {
        return Err(ValidationError::InvalidParameter {
            name: "retention_days".into(),
            reason: format!("must be at most {MAX_RETENTION_DAYS}"),
        });
    }
    Ok(days)
}

/// What a successful job did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobResult {
    Vacuumed {
        table: TableRef,
        mode: VacuumMode,
        total_bytes: Option<i64>,
    },
    Archived {
        table: TableRef,
        archive_table: TableRef,
        rows_archived: u64,
        restore_plan: RestorePlan,
    },
    Restored {
        table: TableRef,
        archive_table: TableRef,
        rows_restored: u64,
        retention_days: u32,
    },
    Restarted {
        host: String,
        output: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded(JobResult),
    Failed(MaintenanceError),
}

/// Result of one executed job, reported to the caller unmodified.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceOutcome {
    pub job: MaintenanceJob,
    pub applied: Applied,
    pub detail: Outcome,
}

impl MaintenanceOutcome {
    fn new(job: MaintenanceJob, result: Result<JobResult, MaintenanceError>) -> Self {
        match result {
            Ok(done) => Self {
                job,
                applied: Applied::Complete,
                detail: Outcome::Succeeded(done),
            },
            Err(err) => Self {
                job,
                applied: err.applied(),
                detail: Outcome::Failed(err),
            },
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.detail, Outcome::Succeeded(_))
    }

    pub fn error(&self) -> Option<&MaintenanceError> {
        match &self.detail {
            Outcome::Failed(err) => Some(err),
            Outcome::Succeeded(_) => None,
        }
    }

    /// True when a failed job is known to have left the target untouched.
    pub fn is_safe_to_retry(&self) -> bool {
        self.applied == Applied::Nothing
    }

    pub fn into_result(self) -> Result<JobResult, CoreError> {
        match self.detail {
            Outcome::Succeeded(done) => Ok(done),
            Outcome::Failed(err) => Err(err.into()),
        }
    }
}

/// Inbound maintenance operation: gate, validate, execute, record.
#[derive(Clone)]
pub struct MaintenanceService {
    executor: MaintenanceExecutor,
    gate: AccessGate,
    remote: RemoteConfig,
    state: SharedState,
    notifier: Arc<dyn Notifier>,
    metrics: AppMetrics,
    cluster: String,
    notify_on_failure: bool,
}

impl MaintenanceService {
    pub fn new(
        config: &AppConfig,
        backend: Arc<dyn MaintenanceBackend>,
        remote: Arc<dyn RemoteExecutor>,
        state: SharedState,
        notifier: Arc<dyn Notifier>,
        metrics: AppMetrics,
    ) -> Self {
        Self {
            executor: MaintenanceExecutor::new(
                backend,
                remote,
                config.timeouts.maintenance_step,
                config.timeouts.remote_exec,
            ),
            gate: AccessGate,
            remote: config.remote.clone(),
            state,
            notifier,
            metrics,
            cluster: config.cluster.clone(),
            notify_on_failure: config.alerts.notify_on_maintenance_failure,
        }
    }

    pub fn restore_plans(&self) -> &RestorePlans {
        self.executor.restore_plans()
    }

    #[instrument(skip_all, fields(actor = actor.id, kind = request.kind().as_str()))]
    pub async fn run(
        &self,
        request: MaintenanceRequest,
        actor: &Actor,
    ) -> Result<MaintenanceOutcome, CoreError> {
        let kind = request.kind();
        if let Err(err) =
            self.gate
                .check(actor, &Action::RunMaintenance(kind), &RoleFacts::default())
        {
            info!(target: "audit", actor = actor.id, kind = kind.as_str(), reason = %err.reason, "maintenance denied");
            self.metrics.inc_maintenance(kind.as_str(), "denied");
            return Err(err.into());
        }

        let operation = match request.validate(&self.remote) {
            Ok(operation) => operation,
            Err(err) => {
                info!(target: "audit", actor = actor.id, kind = kind.as_str(), error = %err, "maintenance rejected");
                self.metrics.inc_maintenance(kind.as_str(), "rejected");
                return Err(err.into());
            }
        };

        let mut job = MaintenanceJob::new(operation, actor.id);
        self.state.record_job(job.clone()).await;
        info!(target: "audit", actor = actor.id, job_id = %job.id, kind = kind.as_str(), on = %job.target(), "maintenance started");

        let result = self.executor.run(&job).await;
        if let Err(err) = job.settle(&result) {
            warn!(error = %err, "job settled twice");
        }
        self.state.record_job(job.clone()).await;

        let outcome = MaintenanceOutcome::new(job, result);
        let label = if outcome.succeeded() { "succeeded" } else { "failed" };
        self.metrics.inc_maintenance(kind.as_str(), label);
        info!(
            target: "audit",
            actor = actor.id,
            job_id = %outcome.job.id,
            kind = kind.as_str(),
            on = %outcome.job.target(),
            outcome = label,
            applied = ?outcome.applied,
            error = outcome.job.error.as_deref().unwrap_or(""),
            "maintenance finished"
        );

        if let Some(err) = outcome.error() {
            self.notify_failure(&outcome.job, err);
        }
        Ok(outcome)
    }

    fn notify_failure(&self, job: &MaintenanceJob, err: &MaintenanceError) {
        if !self.notify_on_failure || matches!(err, MaintenanceError::Busy { .. }) {
            return;
        }
        let subject = format!("{} on {} failed", job.kind().as_str(), job.target());
        let body = if err.is_safe_to_retry() {
            format!("{err}. Nothing was changed.")
        } else {
            format!("{err}. The target may be partially changed and needs inspection.")
        };
        notify::dispatch(
            self.notifier.clone(),
            Notification::new(NotificationKind::MaintenanceFailure, &self.cluster, subject, body),
        );
    }
}
