//! Per-role supervision loop.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dbstarter_runner::{ProcessHandle, Runner, StartRequest, Volume};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::machine::{RestartPolicy, SupervisorEvent, SupervisorMachine, SupervisorState};
use crate::args::{build_server_args, instance_name};
use crate::config::ServiceConfig;
use crate::conffile;
use crate::error::{ServiceError, ServiceResult};
use crate::obs;
use crate::peers::{Peer, Peers, ServerRole};
use crate::readiness::{
    spawn_readiness_observer, wait_until_ready, ReadinessProbe, ReadinessSchedule,
};
use crate::state::ServiceState;

/// Readiness bound when deciding whether to adopt a running instance.
pub const ADOPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a supervisor loop needs. Shared by all roles.
pub struct SupervisorContext {
    pub config: Arc<ServiceConfig>,
    pub runner: Arc<dyn Runner>,
    pub probe: Arc<dyn ReadinessProbe>,
    pub state: Arc<ServiceState>,
    pub policy: RestartPolicy,
    pub readiness: ReadinessSchedule,
    pub adopt_timeout: Duration,
}

impl SupervisorContext {
    pub fn new(
        config: Arc<ServiceConfig>,
        runner: Arc<dyn Runner>,
        probe: Arc<dyn ReadinessProbe>,
        state: Arc<ServiceState>,
    ) -> Self {
        Self {
            config,
            runner,
            probe,
            state,
            policy: RestartPolicy::default(),
            readiness: ReadinessSchedule::default(),
            adopt_timeout: ADOPT_TIMEOUT,
        }
    }
}

/// How a supervisor loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleOutcome {
    /// The service stopped.
    Stopped,
    /// The instance failed too often.
    GaveUp { failures: u32 },
    /// The instance could not be launched.
    StartFailed,
}

/// Run the supervisor loop of `role` on its own task.
pub fn spawn_role(ctx: Arc<SupervisorContext>, role: ServerRole) -> JoinHandle<RoleOutcome> {
    tokio::spawn(async move { run_role(&ctx, role).await })
}

/// Start `role`, restart it whenever it exits, until the service stops or
/// the restart policy gives up.
pub async fn run_role(ctx: &SupervisorContext, role: ServerRole) -> RoleOutcome {
    let peers = ctx.state.peers();
    let Some(me) = peers.peer_by_id(&ctx.config.id).cloned() else {
        error!(role = %role, id = %ctx.config.id, "Cannot find peer information for my id");
        return RoleOutcome::StartFailed;
    };
    let port = me.port(ctx.config.master_port, role);
    let host_dir = ctx.config.data_dir.join(format!("{role}{port}"));

    let mut machine = SupervisorMachine::new(ctx.policy);
    let mut start_failed = false;
    loop {
        match machine.state() {
            SupervisorState::GivenUp => {
                let failures = machine.recent_failures();
                obs::emit_role_given_up(role, failures);
                ctx.state.give_up(role, failures);
                return RoleOutcome::GaveUp { failures };
            }
            SupervisorState::Stopped => {
                return if start_failed {
                    RoleOutcome::StartFailed
                } else {
                    RoleOutcome::Stopped
                };
            }
            SupervisorState::Restarting { generation } => {
                info!(role = %role, generation = generation + 1, "Restarting server");
                machine.on_event(SupervisorEvent::Restart);
            }
            SupervisorState::Starting { generation }
            | SupervisorState::AwaitingReady { generation }
            | SupervisorState::Running { generation } => {
                if ctx.state.is_stopping() {
                    machine.on_event(SupervisorEvent::StopRequested);
                    continue;
                }
                let started_at = Instant::now();
                let launch = Launch {
                    ctx,
                    peers: &peers,
                    me: &me,
                    role,
                    port,
                    host_dir: &host_dir,
                };
                let (handle, adopted) = match launch.run(generation).await {
                    Ok(started) => started,
                    Err(e) => {
                        error!(role = %role, port, error = %e, "Error while starting server");
                        start_failed = true;
                        machine.on_event(SupervisorEvent::StartFailed);
                        continue;
                    }
                };
                ctx.state.set_handle(role, Arc::clone(&handle));
                obs::emit_role_started(role, port, generation, adopted);
                machine.on_event(if adopted {
                    SupervisorEvent::Adopted
                } else {
                    SupervisorEvent::Started
                });
                if ctx.state.is_stopping() {
                    // Shutdown may have collected handles before this one was stored.
                    if let Err(e) = handle.terminate().await {
                        warn!(role = %role, error = %e, "Failed to terminate server");
                    }
                }

                watch_instance(ctx, &mut machine, role, &me.address, port, handle.as_ref()).await;

                let uptime = started_at.elapsed();
                machine.on_event(SupervisorEvent::Exited {
                    uptime,
                    stopping: ctx.state.is_stopping(),
                });
                ctx.state.record_failures(role, machine.recent_failures());
                obs::emit_role_terminated(role, uptime, machine.recent_failures());
            }
        }
    }
}

/// Wait for `handle` to exit while a detached observer reports readiness.
async fn watch_instance(
    ctx: &SupervisorContext,
    machine: &mut SupervisorMachine,
    role: ServerRole,
    address: &str,
    port: u16,
    handle: &dyn ProcessHandle,
) {
    let cancel = ctx.state.stop_token().child_token();
    let (_observer, mut ready_rx) = spawn_readiness_observer(
        Arc::clone(&ctx.probe),
        role,
        address.to_string(),
        port,
        ctx.readiness,
        cancel.clone(),
    );

    let exit = handle.wait();
    tokio::pin!(exit);
    let mut ready_reported = false;
    loop {
        tokio::select! {
            _ = &mut exit => break,
            ready = &mut ready_rx, if !ready_reported => {
                ready_reported = true;
                if ready == Ok(true) {
                    machine.on_event(SupervisorEvent::Ready);
                }
            }
        }
    }
    cancel.cancel();
}

/// One launch attempt: adopt a running instance or start a new one.
struct Launch<'a> {
    ctx: &'a SupervisorContext,
    peers: &'a Peers,
    me: &'a Peer,
    role: ServerRole,
    port: u16,
    host_dir: &'a Path,
}

impl Launch<'_> {
    async fn run(&self, generation: u32) -> ServiceResult<(Arc<dyn ProcessHandle>, bool)> {
        let (role, port) = (self.role, self.port);
        fs::create_dir_all(self.host_dir.join("data"))?;
        fs::create_dir_all(self.host_dir.join("apps"))?;

        info!(role = %role, port, "Looking for a running instance");
        let existing = self
            .ctx
            .runner
            .get_running_server(self.host_dir)
            .await
            .map_err(ServiceError::Runner)?;
        if let Some(existing) = existing {
            info!(role = %role, port, "Instance seems to be running already, checking readiness");
            let ready = tokio::time::timeout(
                self.ctx.adopt_timeout,
                wait_until_ready(
                    self.ctx.probe.as_ref(),
                    &self.me.address,
                    port,
                    self.ctx.readiness,
                ),
            )
            .await
            .unwrap_or(false);
            if ready {
                info!(role = %role, port, "Already running, no need to start anything");
                return Ok((existing, true));
            }
            info!(role = %role, port, "Instance is not up, terminating it");
            if let Err(e) = existing.terminate().await {
                warn!(role = %role, error = %e, "Failed to terminate stale instance");
            }
        }

        info!(role = %role, port, generation, "Starting server");
        conffile::ensure_conf_file(self.host_dir, role, port)?;
        let container_dir = self.ctx.runner.container_dir(self.host_dir);
        let args = build_server_args(&self.ctx.config, self.peers, self.me, role, &container_dir);
        if let Err(e) = conffile::write_command_file(self.host_dir, &args) {
            warn!(role = %role, error = %e, "Failed to write command file");
        }
        let Some((executable, rest)) = args.split_first() else {
            return Err(ServiceError::InvalidConfig(
                "empty server command line".to_string(),
            ));
        };
        let request = StartRequest {
            executable: executable.clone(),
            args: rest.to_vec(),
            volumes: vec![Volume::read_write(self.host_dir, container_dir)],
            ports: vec![port],
            instance_name: instance_name(
                &self.ctx.config,
                role,
                generation,
                &self.me.address,
                port,
            ),
            host_dir: PathBuf::from(self.host_dir),
        };
        let handle = self
            .ctx
            .runner
            .start(request)
            .await
            .map_err(ServiceError::Runner)?;
        Ok((handle, false))
    }
}
