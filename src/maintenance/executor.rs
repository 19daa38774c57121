use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};

use crate::error::{Applied, MaintenanceError};
use crate::maintenance::backend::{
    BackendError, MaintenanceBackend, MaintenanceTx, RemoteExecutor, VacuumMode,
};
use crate::maintenance::guard::TargetGuards;
use crate::maintenance::restore::{RestorePlan, RestorePlans};
use crate::maintenance::table::TableRef;
use crate::maintenance::{JobResult, MaintenanceJob, Operation, Step};

/// ssh reserves this exit status for its own failures (unreachable host,
/// refused authentication); the remote command never ran.
const SSH_CHANNEL_FAILURE: i32 = 255;

/// Runs accepted jobs against the backend, one job per target at a time.
#[derive(Clone)]
pub struct MaintenanceExecutor {
    backend: Arc<dyn MaintenanceBackend>,
    remote: Arc<dyn RemoteExecutor>,
    guards: TargetGuards,
    plans: RestorePlans,
    step_timeout: Duration,
    remote_timeout: Duration,
}

impl MaintenanceExecutor {
    pub fn new(
        backend: Arc<dyn MaintenanceBackend>,
        remote: Arc<dyn RemoteExecutor>,
        step_timeout: Duration,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            remote,
            guards: TargetGuards::new(),
            plans: RestorePlans::new(),
            step_timeout,
            remote_timeout,
        }
    }

    pub fn restore_plans(&self) -> &RestorePlans {
        &self.plans
    }

    #[instrument(skip_all, fields(job_id = %job.id, kind = job.kind().as_str(), on = %job.target()))]
    pub async fn run(&self, job: &MaintenanceJob) -> Result<JobResult, MaintenanceError> {
        let key = job.target().to_string();
        let Some(_guard) = self.guards.try_acquire(&key) else {
            warn!("target busy; job rejected");
            return Err(MaintenanceError::Busy { target: key });
        };

        match &job.operation {
            Operation::Vacuum { table, mode } => self.vacuum(table, *mode).await,
            Operation::Archive {
                table,
                retention_days,
            } => self.archive(table, *retention_days).await,
            Operation::Restore {
                table,
                retention_days,
            } => self.restore(table, *retention_days).await,
            Operation::RestartService { host } => self.restart(host).await,
        }
    }

    async fn vacuum(&self, table: &TableRef, mode: VacuumMode) -> Result<JobResult, MaintenanceError> {
        self.outside_tx(Step::Vacuum, self.backend.vacuum(table, mode))
            .await?;
        let total_bytes = match self
            .outside_tx(Step::MeasureSize, self.backend.total_size(table))
            .await
        {
            Ok(size) => size,
            Err(err) => {
                warn!(error = %err, "vacuum succeeded but size lookup failed");
                None
            }
        };
        info!(total_bytes, "vacuum completed");
        Ok(JobResult::Vacuumed {
            table: table.clone(),
            mode,
            total_bytes,
        })
    }

    async fn archive(&self, table: &TableRef, retention_days: u32) -> Result<JobResult, MaintenanceError> {
        let archive = table.archive().map_err(|err| MaintenanceError::StepFailed {
            step: Step::CreateArchive,
            detail: err.to_string(),
            applied: Applied::Nothing,
        })?;

        let plan = RestorePlan {
            table: table.clone(),
            archive_table: archive.clone(),
            retention_days,
            registered_at: Utc::now(),
        };

        let mut tx = self.in_tx(Step::Begin, self.backend.begin()).await?;
        let sequence = async {
            self.lock(&mut *tx, table).await?;
            self.in_tx(Step::CreateArchive, tx.create_archive(table, &archive))
                .await?;
            let rows = self
                .in_tx(Step::CopyRows, tx.copy_into_archive(table, &archive))
                .await?;
            self.in_tx(Step::Truncate, tx.truncate(table)).await?;
            self.in_tx(Step::RecordPlan, tx.record_restore_plan(&plan))
                .await?;
            Ok::<u64, MaintenanceError>(rows)
        }
        .await;

        let rows_archived = match sequence {
            Ok(rows) => rows,
            Err(err) => {
                self.rollback(tx).await;
                return Err(err);
            }
        };
        self.commit(tx).await?;

        self.plans.register(plan.clone()).await;
        info!(rows_archived, "archive committed");
        Ok(JobResult::Archived {
            table: table.clone(),
            archive_table: archive,
            rows_archived,
            restore_plan: plan,
        })
    }

    async fn restore(
        &self,
        table: &TableRef,
        retention_days: Option<u32>,
    ) -> Result<JobResult, MaintenanceError> {
        let (archive, retention_days) = match retention_days {
            Some(days) => (
                table.archive().map_err(|err| MaintenanceError::StepFailed {
                    step: Step::RestoreRows,
                    detail: err.to_string(),
                    applied: Applied::Nothing,
                })?,
                days,
            ),
            None => match self.known_plan(table).await? {
                Some(plan) => (plan.archive_table, plan.retention_days),
                None => {
                    return Err(MaintenanceError::NoRestorePlan {
                        target: table.key(),
                    });
                }
            },
        };

        let mut tx = self.in_tx(Step::Begin, self.backend.begin()).await?;
        let sequence = async {
            self.lock(&mut *tx, table).await?;
            let restored = self
                .in_tx(
                    Step::RestoreRows,
                    tx.restore_from_archive(&archive, table, retention_days),
                )
                .await?;
            let purged = self
                .in_tx(Step::PurgeArchive, tx.purge_archive(&archive, retention_days))
                .await?;
            if purged != restored {
                return Err(MaintenanceError::StepFailed {
                    step: Step::PurgeArchive,
                    detail: format!("restored {restored} rows but would purge {purged}"),
                    applied: Applied::Nothing,
                });
            }
            Ok::<u64, MaintenanceError>(restored)
        }
        .await;

        let rows_restored = match sequence {
            Ok(rows) => rows,
            Err(err) => {
                self.rollback(tx).await;
                return Err(err);
            }
        };
        self.commit(tx).await?;
        info!(rows_restored, retention_days, "restore committed");
        Ok(JobResult::Restored {
            table: table.clone(),
            archive_table: archive,
            rows_restored,
            retention_days,
        })
    }

    /// Plan registered by this process, or else the one persisted by an
    /// earlier process.
    async fn known_plan(&self, table: &TableRef) -> Result<Option<RestorePlan>, MaintenanceError> {
        if let Some(plan) = self.plans.get(table).await {
            return Ok(Some(plan));
        }
        let stored = self
            .bounded(Step::LoadPlan, Applied::Nothing, self.backend.restore_plan(table))
            .await?;
        if let Some(plan) = &stored {
            info!(retention_days = plan.retention_days, "restore plan loaded from database");
            self.plans.register(plan.clone()).await;
        }
        Ok(stored)
    }

    async fn restart(&self, host: &str) -> Result<JobResult, MaintenanceError> {
        let remote_failure = |detail: String, output: String, applied: Applied| {
            MaintenanceError::RemoteExec {
                host: host.to_string(),
                detail,
                output,
                applied,
            }
        };

        let output = match timeout(self.remote_timeout, self.remote.restart_service(host)).await {
            Err(_) => {
                return Err(remote_failure(
                    format!("no result within {:?}", self.remote_timeout),
                    String::new(),
                    Applied::Unknown,
                ));
            }
            Ok(Err(err)) => {
                return Err(remote_failure(err.message, String::new(), Applied::Nothing));
            }
            Ok(Ok(output)) => output,
        };

        if output.success() {
            info!("remote restart completed");
            return Ok(JobResult::Restarted {
                host: host.to_string(),
                output: output.combined(),
            });
        }

        let applied = match output.exit_code {
            Some(SSH_CHANNEL_FAILURE) => Applied::Nothing,
            _ => Applied::Unknown,
        };
        let detail = match output.exit_code {
            Some(code) => format!("remote command exited with status {code}"),
            None => "remote command terminated by signal".to_string(),
        };
        Err(remote_failure(detail, output.combined(), applied))
    }

    async fn lock(&self, tx: &mut dyn MaintenanceTx, table: &TableRef) -> Result<(), MaintenanceError> {
        let locked = self
            .in_tx(Step::Lock, tx.try_lock_target(&table.key()))
            .await?;
        if locked {
            Ok(())
        } else {
            Err(MaintenanceError::StepFailed {
                step: Step::Lock,
                detail: format!("advisory lock on {table} is held by another session"),
                applied: Applied::Nothing,
            })
        }
    }

    /// A step inside an uncommitted transaction: whatever happens, the
    /// rollback leaves the target untouched.
    async fn in_tx<T, F>(&self, step: Step, fut: F) -> Result<T, MaintenanceError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        self.bounded(step, Applied::Nothing, fut).await
    }

    /// A step with no enclosing transaction: a timeout leaves its effect unknown.
    async fn outside_tx<T, F>(&self, step: Step, fut: F) -> Result<T, MaintenanceError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        self.bounded(step, Applied::Unknown, fut).await
    }

    async fn bounded<T, F>(
        &self,
        step: Step,
        applied_on_timeout: Applied,
        fut: F,
    ) -> Result<T, MaintenanceError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        match timeout(self.step_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                warn!(step = step.as_str(), error = %err, "maintenance step failed");
                Err(MaintenanceError::StepFailed {
                    step,
                    detail: err.message,
                    applied: Applied::Nothing,
                })
            }
            Err(_) => {
                warn!(step = step.as_str(), "maintenance step timed out");
                Err(MaintenanceError::StepFailed {
                    step,
                    detail: format!("no result within {:?}", self.step_timeout),
                    applied: applied_on_timeout,
                })
            }
        }
    }

    async fn commit(&self, tx: Box<dyn MaintenanceTx>) -> Result<(), MaintenanceError> {
        match timeout(self.step_timeout, tx.commit()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(MaintenanceError::StepFailed {
                step: Step::Commit,
                detail: err.message,
                applied: Applied::Nothing,
            }),
            Err(_) => {
                error!("commit outcome unknown; target needs inspection");
                Err(MaintenanceError::StepFailed {
                    step: Step::Commit,
                    detail: format!("no commit acknowledgement within {:?}", self.step_timeout),
                    applied: Applied::Unknown,
                })
            }
        }
    }

    async fn rollback(&self, tx: Box<dyn MaintenanceTx>) {
        match timeout(self.step_timeout, tx.rollback()).await {
            Ok(Ok(())) => info!("transaction rolled back"),
            // the server aborts the transaction when the connection goes away
            Ok(Err(err)) => error!(error = %err, "rollback failed"),
            Err(_) => error!("rollback timed out"),
        }
    }
}
