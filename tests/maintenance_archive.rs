mod common;

use std::time::Duration;

use chrono::Utc;
use pgdash::error::{Applied, CoreError, MaintenanceError, ValidationError};
use pgdash::maintenance::{
    JobResult, JobStatus, MaintenanceRequest, MaintenanceService, RemoteOutput, Step,
};
use pgdash::policy::{Actor, Role};

use common::{ADMIN, FailPoint, FakeBackend, MODERATOR, USER, harness};

const ORDERS: &str = "public.orders";
const ORDERS_ARCHIVE: &str = "public.orders_archive";

fn admin() -> Actor {
    Actor {
        id: ADMIN,
        role: Role::Admin,
    }
}

fn archive_orders(days: u32) -> MaintenanceRequest {
    MaintenanceRequest::Archive {
        schema: "public".into(),
        table: "orders".into(),
        retention_days: days,
    }
}

fn service(h: &common::Harness) -> MaintenanceService {
    h.ctx.maintenance.clone().expect("maintenance enabled")
}

#[tokio::test]
async fn archive_moves_every_row() {
    let h = harness(FakeBackend::new().with_table(ORDERS, 1..=5));
    let started = Utc::now();

    let outcome = service(&h)
        .run(archive_orders(30), &admin())
        .await
        .expect("admin may archive");

    assert!(outcome.succeeded());
    assert_eq!(outcome.applied, Applied::Complete);
    assert_eq!(outcome.job.status, JobStatus::Succeeded);

    let db = h.backend.db();
    assert!(db.rows(ORDERS).expect("source").is_empty());
    let archived = db.rows(ORDERS_ARCHIVE).expect("archive");
    assert_eq!(archived.len(), 5);
    assert!(
        archived
            .iter()
            .all(|row| row.archived_at.is_some_and(|at| at >= started))
    );

    match outcome.into_result().expect("success") {
        JobResult::Archived {
            rows_archived,
            restore_plan,
            ..
        } => {
            assert_eq!(rows_archived, 5);
            assert_eq!(restore_plan.retention_days, 30);
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn failure_after_create_leaves_source_untouched() {
    let h = harness(
        FakeBackend::new()
            .with_table(ORDERS, 1..=4)
            .with_table(ORDERS_ARCHIVE, []),
    );
    h.backend.fail_at(Some(FailPoint::CopyRows));

    let outcome = service(&h)
        .run(archive_orders(30), &admin())
        .await
        .expect("gate passes");

    assert!(!outcome.succeeded());
    assert_eq!(outcome.applied, Applied::Nothing);
    assert!(outcome.is_safe_to_retry());
    assert!(matches!(
        outcome.error(),
        Some(MaintenanceError::StepFailed {
            step: Step::CopyRows,
            ..
        })
    ));
    assert_eq!(outcome.job.status, JobStatus::Failed);

    let db = h.backend.db();
    assert_eq!(db.rows(ORDERS).expect("source").len(), 4);
    assert!(db.rows(ORDERS_ARCHIVE).expect("archive").is_empty());
}

#[tokio::test]
async fn failed_commit_changes_nothing() {
    let h = harness(FakeBackend::new().with_table(ORDERS, 1..=2));
    h.backend.fail_at(Some(FailPoint::Commit));

    let outcome = service(&h).run(archive_orders(7), &admin()).await.unwrap();
    assert!(matches!(
        outcome.error(),
        Some(MaintenanceError::StepFailed {
            step: Step::Commit,
            applied: Applied::Nothing,
            ..
        })
    ));
    assert_eq!(h.backend.db().rows(ORDERS).map(Vec::len), Some(2));
    assert!(h.backend.db().rows(ORDERS_ARCHIVE).is_none());
}

#[tokio::test]
async fn concurrent_archives_on_one_target_never_both_run() {
    let h = harness(FakeBackend::new().with_table(ORDERS, 1..=3));
    h.backend.set_delay(Some(Duration::from_millis(50)));
    let svc = service(&h);
    let actor = admin();

    let (first, second) = tokio::join!(
        svc.run(archive_orders(30), &actor),
        svc.run(archive_orders(30), &actor),
    );
    let outcomes = [first.unwrap(), second.unwrap()];

    let succeeded = outcomes.iter().filter(|o| o.succeeded()).count();
    let busy = outcomes
        .iter()
        .filter(|o| matches!(o.error(), Some(MaintenanceError::Busy { .. })))
        .count();
    assert_eq!(succeeded, 1);
    assert_eq!(busy, 1);
    assert!(outcomes.iter().all(|o| o.succeeded() || o.is_safe_to_retry()));

    assert_eq!(h.backend.db().rows(ORDERS_ARCHIVE).map(Vec::len), Some(3));
}

#[tokio::test]
async fn non_admin_is_denied_before_any_backend_call() {
    let h = harness(FakeBackend::new().with_table(ORDERS, 1..=3));
    let svc = service(&h);

    for (id, role) in [(MODERATOR, Role::Moderator), (USER, Role::User)] {
        let err = svc
            .run(archive_orders(30), &Actor { id, role })
            .await
            .expect_err("denied");
        assert!(matches!(err, CoreError::Policy(_)));
        assert!(err.is_safe_to_retry());
    }
    assert_eq!(h.backend.calls(), 0);
    assert!(h.ctx.state.recent_jobs(10).await.is_empty());
}

#[tokio::test]
async fn invalid_identifiers_are_rejected_without_backend_calls() {
    let h = harness(FakeBackend::new());
    let svc = service(&h);

    let requests = [
        MaintenanceRequest::Vacuum {
            schema: "public".into(),
            table: "orders\"; DROP TABLE x; --".into(),
            full: false,
        },
        MaintenanceRequest::Archive {
            schema: "1public".into(),
            table: "orders".into(),
            retention_days: 30,
        },
        MaintenanceRequest::Archive {
            schema: "public".into(),
            table: "x".repeat(64),
            retention_days: 30,
        },
    ];
    for request in requests {
        let err = svc.run(request, &admin()).await.expect_err("rejected");
        assert!(matches!(
            err,
            CoreError::Validation(ValidationError::InvalidIdentifier(_))
        ));
    }
    assert_eq!(h.backend.calls(), 0);
}

#[tokio::test]
async fn restore_uses_registered_plan() {
    let h = harness(FakeBackend::new().with_table(ORDERS, 1..=3));
    let svc = service(&h);

    let restore = MaintenanceRequest::Restore {
        schema: "public".into(),
        table: "orders".into(),
        retention_days: None,
    };
    let outcome = svc.run(restore.clone(), &admin()).await.unwrap();
    assert!(matches!(
        outcome.error(),
        Some(MaintenanceError::NoRestorePlan { .. })
    ));

    svc.run(archive_orders(30), &admin()).await.unwrap();
    h.backend.backdate(ORDERS_ARCHIVE, 40);

    let outcome = svc.run(restore, &admin()).await.unwrap();
    match outcome.into_result().expect("restored") {
        JobResult::Restored {
            rows_restored,
            retention_days,
            ..
        } => {
            assert_eq!(rows_restored, 3);
            assert_eq!(retention_days, 30);
        }
        other => panic!("unexpected result {other:?}"),
    }
    let db = h.backend.db();
    assert_eq!(db.rows(ORDERS).map(Vec::len), Some(3));
    assert_eq!(db.rows(ORDERS_ARCHIVE).map(Vec::len), Some(0));
}

#[tokio::test]
async fn restore_plan_outlives_the_process_that_archived() {
    let backend = FakeBackend::new().with_table(ORDERS, 1..=3);
    let before = harness(backend.clone());
    service(&before)
        .run(archive_orders(30), &admin())
        .await
        .unwrap();
    assert_eq!(
        backend.stored_plans().get(ORDERS).map(|plan| plan.retention_days),
        Some(30)
    );
    backend.backdate(ORDERS_ARCHIVE, 40);

    // fresh executor with an empty in-memory registry over the same database
    let after = harness(backend.clone());
    let outcome = service(&after)
        .run(
            MaintenanceRequest::Restore {
                schema: "public".into(),
                table: "orders".into(),
                retention_days: None,
            },
            &admin(),
        )
        .await
        .unwrap();
    match outcome.into_result().expect("restored") {
        JobResult::Restored {
            rows_restored,
            retention_days,
            ..
        } => {
            assert_eq!(rows_restored, 3);
            assert_eq!(retention_days, 30);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(backend.db().rows(ORDERS).map(Vec::len), Some(3));
}

#[tokio::test]
async fn plan_write_failure_rolls_back_archive() {
    let h = harness(FakeBackend::new().with_table(ORDERS, 1..=3));
    h.backend.fail_at(Some(FailPoint::RecordPlan));

    let outcome = service(&h).run(archive_orders(30), &admin()).await.unwrap();
    assert!(matches!(
        outcome.error(),
        Some(MaintenanceError::StepFailed {
            step: Step::RecordPlan,
            applied: Applied::Nothing,
            ..
        })
    ));
    assert_eq!(h.backend.db().rows(ORDERS).map(Vec::len), Some(3));
    assert!(h.backend.db().rows(ORDERS_ARCHIVE).is_none());
    assert!(h.backend.stored_plans().is_empty());
}

#[tokio::test]
async fn recent_archive_rows_stay_archived() {
    let h = harness(FakeBackend::new().with_table(ORDERS, 1..=2));
    let svc = service(&h);
    svc.run(archive_orders(30), &admin()).await.unwrap();

    let outcome = svc
        .run(
            MaintenanceRequest::Restore {
                schema: "public".into(),
                table: "orders".into(),
                retention_days: Some(30),
            },
            &admin(),
        )
        .await
        .unwrap();
    assert!(outcome.succeeded());
    assert_eq!(h.backend.db().rows(ORDERS_ARCHIVE).map(Vec::len), Some(2));
}

#[tokio::test]
async fn vacuum_reports_engine_error_verbatim() {
    let h = harness(FakeBackend::new());
    let outcome = service(&h)
        .run(
            MaintenanceRequest::Vacuum {
                schema: "public".into(),
                table: "missing".into(),
                full: false,
            },
            &admin(),
        )
        .await
        .unwrap();
    match outcome.error() {
        Some(MaintenanceError::StepFailed { step, detail, .. }) => {
            assert_eq!(*step, Step::Vacuum);
            assert_eq!(detail, "relation \"public.missing\" does not exist");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn restart_requires_allow_listed_host() {
    let h = harness(FakeBackend::new());
    let svc = service(&h);

    let err = svc
        .run(
            MaintenanceRequest::RestartService {
                host: "db9.internal".into(),
            },
            &admin(),
        )
        .await
        .expect_err("host not allowed");
    assert!(matches!(
        err,
        CoreError::Validation(ValidationError::UnknownHost(_))
    ));
    assert_eq!(h.remote.calls(), 0);

    let outcome = svc
        .run(
            MaintenanceRequest::RestartService {
                host: "db1.internal".into(),
            },
            &admin(),
        )
        .await
        .unwrap();
    assert!(outcome.succeeded());
    assert_eq!(h.remote.calls(), 1);
}

#[tokio::test]
async fn restart_failures_carry_output_and_applied_state() {
    let h = harness(FakeBackend::new());
    let svc = service(&h);
    let restart = || MaintenanceRequest::RestartService {
        host: "db1.internal".into(),
    };

    h.remote.set_output(Some(RemoteOutput {
        exit_code: Some(1),
        stdout: String::new(),
        stderr: "Job for postgresql-14.service failed".into(),
    }));
    let outcome = svc.run(restart(), &admin()).await.unwrap();
    match outcome.error() {
        Some(MaintenanceError::RemoteExec {
            output, applied, ..
        }) => {
            assert!(output.contains("postgresql-14.service failed"));
            assert_eq!(*applied, Applied::Unknown);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!outcome.is_safe_to_retry());

    h.remote.set_output(None);
    let outcome = svc.run(restart(), &admin()).await.unwrap();
    assert_eq!(outcome.applied, Applied::Nothing);

    h.remote.set_output(Some(RemoteOutput {
        exit_code: Some(0),
        stdout: String::new(),
        stderr: String::new(),
    }));
    h.remote.set_delay(Some(Duration::from_secs(2)));
    let outcome = svc.run(restart(), &admin()).await.unwrap();
    assert_eq!(outcome.applied, Applied::Unknown);
}

#[tokio::test]
async fn failures_are_logged_and_notified() {
    let h = harness(FakeBackend::new().with_table(ORDERS, 1..=2));
    h.backend.fail_at(Some(FailPoint::Truncate));

    let outcome = service(&h).run(archive_orders(30), &admin()).await.unwrap();
    assert!(!outcome.succeeded());

    let jobs = h.ctx.state.recent_jobs(10).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, outcome.job.id);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert!(jobs[0].error.as_deref().unwrap_or("").contains("truncate"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].subject.contains("archive"));
}
