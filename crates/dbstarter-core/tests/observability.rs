//! Structured lifecycle events emitted by the supervisor and the service state.

use std::sync::Arc;
use std::time::Duration;

use dbstarter_core::fakes::FlakyProbe;
use dbstarter_core::obs::{emit_role_given_up, emit_role_started, emit_role_terminated};
use dbstarter_core::supervisor::{run_role, RoleOutcome, SupervisorContext};
use dbstarter_core::{
    Lifecycle, Peers, Registration, RestartPolicy, ServerRole, ServiceConfig, ServiceState,
};
use dbstarter_runner::fakes::FakeRunner;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

#[traced_test]
#[test]
fn test_role_started_event_fields() {
    emit_role_started(ServerRole::Coordinator, 8530, 2, false);
    assert!(logs_contain("role.started"));
    assert!(logs_contain("role=coordinator"));
    assert!(logs_contain("port=8530"));
    assert!(logs_contain("generation=2"));
}

#[traced_test]
#[test]
fn test_role_terminated_event_fields() {
    emit_role_terminated(ServerRole::DbServer, Duration::from_millis(1500), 4);
    assert!(logs_contain("role.terminated"));
    assert!(logs_contain("uptime_ms=1500"));
    assert!(logs_contain("recent_failures=4"));
}

#[traced_test]
#[test]
fn test_role_given_up_is_error() {
    emit_role_given_up(ServerRole::Agent, 100);
    assert!(logs_contain("ERROR"));
    assert!(logs_contain("role.given_up"));
}

#[traced_test]
#[test]
fn test_state_transition_is_logged() {
    let state = ServiceState::new(&CancellationToken::new(), Peers::new(1, false));
    state.transition_to(Lifecycle::Master);
    assert!(logs_contain("service.state_changed"));
    assert!(logs_contain("from=start"));
    assert!(logs_contain("to=master"));
}

#[traced_test]
#[tokio::test(start_paused = true)]
async fn test_supervisor_emits_restart_and_give_up_events() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServiceConfig {
        id: "obs00001".to_string(),
        agency_size: 1,
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let mut peers = Peers::new(1, false);
    peers
        .register(Registration {
            id: "obs00001".to_string(),
            address: "127.0.0.1".to_string(),
            data_dir: dir.path().display().to_string(),
            has_dbserver: true,
            has_coordinator: true,
        })
        .unwrap();
    let state = Arc::new(ServiceState::new(&CancellationToken::new(), peers));
    let mut ctx = SupervisorContext::new(
        Arc::new(config),
        Arc::new(FakeRunner::with_uptime(Duration::from_secs(1))),
        Arc::new(FlakyProbe::ready_after(0)),
        state,
    );
    ctx.policy = RestartPolicy {
        min_uptime: Duration::from_secs(30),
        max_recent_failures: 2,
    };

    let outcome = run_role(&ctx, ServerRole::DbServer).await;

    assert_eq!(outcome, RoleOutcome::GaveUp { failures: 2 });
    assert!(logs_contain("role.started"));
    assert!(logs_contain("role.terminated"));
    assert!(logs_contain("role.given_up"));
    assert!(logs_contain("role=dbserver"));
}
