//! Single-node lifecycle: start all roles, stop in order, persist setup.

use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dbstarter_core::fakes::FlakyProbe;
use dbstarter_core::setup::{load_setup, SETUP_FILE_NAME};
use dbstarter_core::{
    Lifecycle, RestartPolicy, Service, ServiceConfig, ServiceError, ServiceTimings,
};
use dbstarter_runner::fakes::FakeRunner;
use tokio_util::sync::CancellationToken;

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn fast_timings() -> ServiceTimings {
    ServiceTimings {
        role_start_delay: Duration::from_millis(20),
        shutdown_delay: Duration::from_millis(20),
        peer_poll_interval: Duration::from_millis(50),
        supervisor_join_timeout: Duration::from_secs(5),
    }
}

fn single_node(data_dir: &Path) -> ServiceConfig {
    ServiceConfig {
        id: "solo0001".to_string(),
        agency_size: 1,
        master_port: free_port(),
        data_dir: data_dir.to_path_buf(),
        own_address: "127.0.0.1".to_string(),
        ..Default::default()
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_shutdown_stops_agent_last() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::long_running());
    let root = CancellationToken::new();
    let service = Service::with_runner(
        single_node(dir.path()),
        runner.clone(),
        Arc::new(FlakyProbe::ready_after(0)),
        root.clone(),
    )
    .unwrap()
    .with_timings(fast_timings());
    let state = service.state();
    let task = tokio::spawn(service.run());

    wait_for(|| runner.start_count() == 3).await;
    assert_eq!(state.lifecycle(), Lifecycle::Running);
    root.cancel();
    task.await.unwrap().unwrap();

    let shutdown: Vec<String> = runner
        .calls()
        .into_iter()
        .filter(|c| !c.starts_with("start:"))
        .map(|c| {
            // "terminate:agent-solo0001-0-127.0.0.1-8529" -> "terminate:agent"
            c.split('-').next().unwrap_or_default().to_string()
        })
        .collect();
    assert_eq!(
        shutdown,
        vec![
            "terminate:coordinator",
            "terminate:dbserver",
            "terminate:agent",
            "cleanup:coordinator",
            "cleanup:dbserver",
            "cleanup:agent",
            "cleanup:runner",
        ]
    );
    assert_eq!(state.lifecycle(), Lifecycle::Stopped);
}

#[tokio::test]
async fn test_roles_start_in_order_and_setup_is_saved() {
    let dir = tempfile::tempdir().unwrap();
    let config = single_node(dir.path());
    let port = config.master_port;
    let runner = Arc::new(FakeRunner::long_running());
    let root = CancellationToken::new();
    let service = Service::with_runner(
        config,
        runner.clone(),
        Arc::new(FlakyProbe::ready_after(0)),
        root.clone(),
    )
    .unwrap()
    .with_timings(fast_timings());
    let task = tokio::spawn(service.run());

    wait_for(|| runner.start_count() == 3).await;
    let names: Vec<String> = runner.starts().into_iter().map(|s| s.instance_name).collect();
    assert_eq!(
        names,
        vec![
            format!("agent-solo0001-0-127.0.0.1-{}", port + 1),
            format!("dbserver-solo0001-0-127.0.0.1-{}", port + 3),
            format!("coordinator-solo0001-0-127.0.0.1-{}", port + 2),
        ]
    );

    let setup = load_setup(&dir.path().join(SETUP_FILE_NAME))
        .unwrap()
        .expect("setup.json written");
    assert_eq!(setup.id, "solo0001");
    assert_eq!(setup.peers.peers.len(), 1);
    assert!(setup.peers.peers[0].has_agent);

    root.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_relaunch_reuses_saved_peers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = single_node(dir.path());

    // First run writes setup.json.
    let runner = Arc::new(FakeRunner::long_running());
    let root = CancellationToken::new();
    let service = Service::with_runner(
        config.clone(),
        runner.clone(),
        Arc::new(FlakyProbe::ready_after(0)),
        root.clone(),
    )
    .unwrap()
    .with_timings(fast_timings());
    let task = tokio::spawn(service.run());
    wait_for(|| runner.start_count() == 3).await;
    root.cancel();
    task.await.unwrap().unwrap();

    // Second run without an id picks up the saved one.
    config.id = String::new();
    config.master_port = free_port();
    let runner = Arc::new(FakeRunner::long_running());
    let root = CancellationToken::new();
    let service = Service::with_runner(
        config,
        runner.clone(),
        Arc::new(FlakyProbe::ready_after(0)),
        root.clone(),
    )
    .unwrap()
    .with_timings(fast_timings());
    assert!(service.is_relaunch());
    assert_eq!(service.config().id, "solo0001");
    let task = tokio::spawn(service.run());
    wait_for(|| runner.start_count() == 3).await;
    root.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_role_given_up_stops_service_with_error() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::with_uptime(Duration::from_millis(5)));
    let service = Service::with_runner(
        single_node(dir.path()),
        runner.clone(),
        Arc::new(FlakyProbe::ready_after(0)),
        CancellationToken::new(),
    )
    .unwrap()
    .with_timings(fast_timings())
    .with_restart_policy(RestartPolicy {
        min_uptime: Duration::from_secs(30),
        max_recent_failures: 3,
    });

    let result = tokio::time::timeout(Duration::from_secs(10), service.run())
        .await
        .expect("service did not stop");
    assert!(matches!(
        result,
        Err(ServiceError::GaveUp { failures: 3, .. })
    ));
    assert_eq!(runner.cleanup_count(), 1);
}
