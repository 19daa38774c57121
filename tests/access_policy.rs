mod common;

use std::time::Duration;

use chrono::Utc;

use pgdash::error::{CoreError, ValidationError};
use pgdash::normalize::MetricCategory;
use pgdash::notify::NotificationKind;
use pgdash::policy::{Actor, Role};
use pgdash::poller::run_threshold_watch;
use pgdash::probe::ProbeId;
use pgdash::snapshot::UnavailableKind;
use pgdash::users::RoleStore;

use common::{
    ADMIN, FakeBackend, FakeProbeClient, MODERATOR, SECOND_ADMIN, USER, cache_rows,
    connection_rows, harness, harness_with, system_rows, system_rows_at, test_config,
};

fn actor(id: i64, role: Role) -> Actor {
    Actor { id, role }
}

#[tokio::test]
async fn admin_cannot_demote_or_delete_themselves() {
    let h = harness(FakeBackend::new());
    let users = h.ctx.users.clone().expect("role store");
    let alice = actor(ADMIN, Role::Admin);

    let err = users
        .change_role(&alice, ADMIN, "Moderator")
        .await
        .expect_err("self-demotion");
    assert!(matches!(err, CoreError::Policy(_)));

    let err = users.delete(&alice, ADMIN).await.expect_err("self-deletion");
    assert!(matches!(err, CoreError::Policy(_)));

    assert_eq!(h.roles.role_of(ADMIN).await.unwrap(), Some(Role::Admin));
}

#[tokio::test]
async fn last_admin_is_never_removed() {
    let h = harness(FakeBackend::new());
    let users = h.ctx.users.clone().expect("role store");
    let alice = actor(ADMIN, Role::Admin);

    let role = users
        .change_role(&alice, SECOND_ADMIN, "User")
        .await
        .expect("two admins exist");
    assert_eq!(role, Role::User);
    assert_eq!(h.roles.admin_count().await.unwrap(), 1);

    let bob = users.load_actor(SECOND_ADMIN).await.unwrap().expect("bob");
    assert_eq!(bob.role, Role::User);
    let err = users.delete(&bob, ADMIN).await.expect_err("bob demoted");
    assert!(matches!(err, CoreError::Policy(_)));

    // a stale Admin actor still hits the last-admin rule
    let stale = actor(SECOND_ADMIN, Role::Admin);
    for result in [
        users.change_role(&stale, ADMIN, "User").await.map(|_| ()),
        users.delete(&stale, ADMIN).await,
    ] {
        match result {
            Err(CoreError::Policy(err)) => assert!(err.reason.contains("last Admin")),
            other => panic!("unexpected result {other:?}"),
        }
    }
    assert_eq!(h.roles.admin_count().await.unwrap(), 1);
}

#[tokio::test]
async fn role_change_validates_role_and_target() {
    let h = harness(FakeBackend::new());
    let users = h.ctx.users.clone().expect("role store");
    let alice = actor(ADMIN, Role::Admin);

    let err = users
        .change_role(&alice, USER, "Superuser")
        .await
        .expect_err("unknown role");
    assert!(matches!(
        err,
        CoreError::Validation(ValidationError::InvalidRole(_))
    ));

    let err = users
        .change_role(&alice, 99, "Moderator")
        .await
        .expect_err("unknown user");
    assert!(matches!(
        err,
        CoreError::Validation(ValidationError::UnknownUser(99))
    ));

    let role = users.change_role(&alice, USER, "Moderator").await.unwrap();
    assert_eq!(role, Role::Moderator);
    assert_eq!(h.roles.role_of(USER).await.unwrap(), Some(Role::Moderator));
}

#[tokio::test]
async fn listing_users_requires_moderator() {
    let h = harness(FakeBackend::new());
    let users = h.ctx.users.clone().expect("role store");

    let listed = users
        .list(&actor(MODERATOR, Role::Moderator))
        .await
        .expect("moderators may list");
    assert_eq!(listed.len(), 4);

    let err = users
        .list(&actor(USER, Role::User))
        .await
        .expect_err("users may not list");
    assert!(matches!(err, CoreError::Policy(_)));
}

#[tokio::test]
async fn moderator_cannot_manage_roles() {
    let h = harness(FakeBackend::new());
    let users = h.ctx.users.clone().expect("role store");
    let carol = actor(MODERATOR, Role::Moderator);

    let err = users
        .change_role(&carol, USER, "Admin")
        .await
        .expect_err("moderator");
    assert!(matches!(err, CoreError::Policy(_)));
    let err = users.delete(&carol, USER).await.expect_err("moderator");
    assert!(matches!(err, CoreError::Policy(_)));
    assert_eq!(h.roles.role_of(USER).await.unwrap(), Some(Role::User));
}

#[tokio::test]
async fn admin_deletes_other_user() {
    let h = harness(FakeBackend::new());
    let users = h.ctx.users.clone().expect("role store");

    users
        .delete(&actor(ADMIN, Role::Admin), USER)
        .await
        .expect("delete");
    assert_eq!(h.roles.role_of(USER).await.unwrap(), None);

    let err = users
        .delete(&actor(ADMIN, Role::Admin), USER)
        .await
        .expect_err("already gone");
    assert!(matches!(
        err,
        CoreError::Validation(ValidationError::UnknownUser(_))
    ));
}

fn warn_probes(cpu_row: pgdash::probe::RowSet) -> FakeProbeClient {
    FakeProbeClient::new()
        .respond(ProbeId::SystemMetrics, cpu_row)
        .respond(ProbeId::ConnectionStats, connection_rows(40, 100))
        .respond(ProbeId::CacheStats, cache_rows(990, 10))
}

#[tokio::test]
async fn persistent_warning_notifies_once() {
    let mut config = test_config();
    config.alerts.persist_cycles = 2;
    let first = Utc::now() - chrono::Duration::minutes(2);
    let h = harness_with(config, warn_probes(system_rows_at(99.0, 30.0, first)), FakeBackend::new());

    assert!(run_threshold_watch(&h.ctx).await.unwrap().is_empty());

    h.probes.set_response(
        ProbeId::SystemMetrics,
        system_rows_at(99.0, 30.0, first + chrono::Duration::minutes(1)),
    );
    assert_eq!(
        run_threshold_watch(&h.ctx).await.unwrap(),
        vec![MetricCategory::CpuUsage]
    );

    h.probes.set_response(
        ProbeId::SystemMetrics,
        system_rows_at(99.0, 30.0, first + chrono::Duration::minutes(2)),
    );
    assert!(run_threshold_watch(&h.ctx).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::ThresholdBreach);
    assert_eq!(sent[0].cluster, "test");
}

#[tokio::test]
async fn unchanged_host_row_never_becomes_persistent() {
    let mut config = test_config();
    config.alerts.persist_cycles = 2;
    let h = harness_with(config, warn_probes(system_rows(99.0, 30.0)), FakeBackend::new());

    for _ in 0..3 {
        assert!(run_threshold_watch(&h.ctx).await.unwrap().is_empty());
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn stale_host_row_is_not_alerted_or_shown() {
    let mut config = test_config();
    config.alerts.persist_cycles = 1;
    let old = Utc::now() - chrono::Duration::days(2);
    let h = harness_with(config, warn_probes(system_rows_at(99.0, 30.0, old)), FakeBackend::new());

    for _ in 0..3 {
        assert!(run_threshold_watch(&h.ctx).await.unwrap().is_empty());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.notifier.sent().is_empty());

    let snapshot = h.ctx.aggregator.dashboard().await;
    assert_eq!(snapshot.host.unavailable_kind(), Some(UnavailableKind::Stale));
    assert!(snapshot.host_trend.is_available());
}

#[tokio::test]
async fn threshold_watch_fails_only_when_every_probe_fails() {
    let probes = FakeProbeClient::new()
        .fail(
            ProbeId::SystemMetrics,
            pgdash::error::ProbeErrorKind::ConnectionFailure,
        )
        .fail(
            ProbeId::ConnectionStats,
            pgdash::error::ProbeErrorKind::ConnectionFailure,
        )
        .fail(
            ProbeId::CacheStats,
            pgdash::error::ProbeErrorKind::ConnectionFailure,
        );
    let h = harness_with(test_config(), probes, FakeBackend::new());
    assert!(run_threshold_watch(&h.ctx).await.is_err());

    let probes = FakeProbeClient::new()
        .fail(
            ProbeId::SystemMetrics,
            pgdash::error::ProbeErrorKind::Timeout,
        )
        .respond(ProbeId::ConnectionStats, connection_rows(40, 100));
    let h = harness_with(test_config(), probes, FakeBackend::new());
    assert!(run_threshold_watch(&h.ctx).await.is_ok());
}
