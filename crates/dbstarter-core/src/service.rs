//! Starter service: bootstrap, run and shut down one peer.
//!
//! ```text
//! Start ──► Master ──┐
//!   │                ├──► Running ──► Stopped
//!   ├─────► Slave ───┘       ▲
//!   └── (setup.json) ────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use dbstarter_client::{ControlClient, HelloRequest};
use dbstarter_runner::{DockerRunner, ProcessRunner, Runner};
use futures::future::join_all;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::{ServiceConfig, DEFAULT_OWN_ADDRESS};
use crate::error::{ServiceError, ServiceResult};
use crate::jwt::create_jwt_authorization_header;
use crate::obs;
use crate::peers::{Peers, Registration, ServerRole};
use crate::readiness::{HttpReadinessProbe, ReadinessProbe, ReadinessSchedule};
use crate::server::{self, ApiState};
use crate::setup::{load_setup, save_setup, SetupConfig};
use crate::state::{Lifecycle, ServiceState};
use crate::supervisor::{spawn_role, RestartPolicy, RoleOutcome, SupervisorContext};

/// Fixed delays of the service lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceTimings {
    /// Pause between starting agent, dbserver and coordinator.
    pub role_start_delay: Duration,
    /// Pause between stopping dbserver/coordinator and the agent.
    pub shutdown_delay: Duration,
    /// Interval of peer set polling and registration retries.
    pub peer_poll_interval: Duration,
    /// Upper bound on waiting for supervisor loops to end.
    pub supervisor_join_timeout: Duration,
}

impl Default for ServiceTimings {
    fn default() -> Self {
        Self {
            role_start_delay: Duration::from_secs(1),
            shutdown_delay: Duration::from_secs(3),
            peer_poll_interval: Duration::from_secs(1),
            supervisor_join_timeout: Duration::from_secs(60),
        }
    }
}

/// One starter.
pub struct Service {
    config: Arc<ServiceConfig>,
    runner: Arc<dyn Runner>,
    probe: Arc<dyn ReadinessProbe>,
    state: Arc<ServiceState>,
    root: CancellationToken,
    relaunch: Option<Peers>,
    timings: ServiceTimings,
    policy: RestartPolicy,
    readiness: ReadinessSchedule,
}

impl Service {
    /// Build a service from configuration, choosing the runner backend.
    ///
    /// Cancelling `root` stops the service.
    pub fn new(config: ServiceConfig, root: CancellationToken) -> ServiceResult<Self> {
        config.validate()?;
        let (config, runner) = create_runner(&config)?;
        let authorization = create_jwt_authorization_header(config.jwt_secret.as_deref())
            .map_err(|e| ServiceError::InvalidConfig(format!("invalid JWT secret: {e}")))?;
        let probe = HttpReadinessProbe::new(Some(authorization))
            .map_err(|e| ServiceError::InvalidConfig(format!("cannot build HTTP client: {e}")))?;
        Self::with_runner(config, runner, Arc::new(probe), root)
    }

    /// Build a service on an explicit runner and readiness probe.
    pub fn with_runner(
        config: ServiceConfig,
        runner: Arc<dyn Runner>,
        probe: Arc<dyn ReadinessProbe>,
        root: CancellationToken,
    ) -> ServiceResult<Self> {
        config.validate()?;
        let mut config = config;

        let setup = load_setup(&config.setup_file())?;
        let relaunch = setup.and_then(|s| {
            let id = s.relaunch_id(&config.id)?;
            Some((id, s.peers))
        });
        let relaunch = match relaunch {
            Some((id, list)) => {
                config.id = id;
                Some(Peers::try_from(list)?)
            }
            None => {
                config = config.with_generated_id();
                None
            }
        };

        let peers = Peers::new(config.agency_size, config.all_port_offsets_unique);
        let state = Arc::new(ServiceState::new(&root, peers));
        Ok(Self {
            config: Arc::new(config),
            runner,
            probe,
            state,
            root,
            relaunch,
            timings: ServiceTimings::default(),
            policy: RestartPolicy::default(),
            readiness: ReadinessSchedule::default(),
        })
    }

    pub fn with_timings(mut self, timings: ServiceTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_readiness_schedule(mut self, schedule: ReadinessSchedule) -> Self {
        self.readiness = schedule;
        self
    }

    /// Final configuration, with the id resolved.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn state(&self) -> Arc<ServiceState> {
        Arc::clone(&self.state)
    }

    /// Whether this start reuses a saved peer set.
    pub fn is_relaunch(&self) -> bool {
        self.relaunch.is_some()
    }

    /// Run until stopped. Returns an error when bootstrapping fails or a
    /// role had to be given up.
    pub async fn run(mut self) -> ServiceResult<()> {
        let span = obs::service_span(&self.config.id);
        async move {
            let api_shutdown = CancellationToken::new();
            let result = self.run_lifecycle(&api_shutdown).await;
            api_shutdown.cancel();
            self.state.transition_to(Lifecycle::Stopped);
            result
        }
        .instrument(span)
        .await
    }

    async fn run_lifecycle(&mut self, api_shutdown: &CancellationToken) -> ServiceResult<()> {
        if let Some(peers) = self.relaunch.take() {
            info!(peers = peers.len(), "Relaunching with saved setup");
            self.state.set_peers(peers);
            self.serve_control_api(api_shutdown).await?;
        } else if let Some(master) = self.config.master_address.clone() {
            self.state.transition_to(Lifecycle::Slave);
            self.join(&master, api_shutdown).await?;
        } else {
            self.state.transition_to(Lifecycle::Master);
            self.bootstrap_master(api_shutdown).await?;
        }

        if self.state.is_stopping() {
            info!("Stopped before the peer set was complete");
            return Ok(());
        }
        self.run_servers().await
    }

    /// First starter: seed the peer set with ourselves and accept
    /// registrations until the agency is complete.
    ///
    /// Without a configured own address the master registers as
    /// [`DEFAULT_OWN_ADDRESS`] until the first joining peer reveals the
    /// address it reached the master on.
    async fn bootstrap_master(&self, api_shutdown: &CancellationToken) -> ServiceResult<()> {
        let address = if self.config.own_address.is_empty() {
            DEFAULT_OWN_ADDRESS.to_string()
        } else {
            self.config.own_address.clone()
        };
        let me = self.state.register(Registration {
            id: self.config.id.clone(),
            address,
            data_dir: self.config.data_dir.display().to_string(),
            has_dbserver: self.config.start_dbserver,
            has_coordinator: self.config.start_coordinator,
        })?;
        debug!(port_offset = me.port_offset, "Registered self as master");
        self.serve_control_api(api_shutdown).await?;

        if !self.state.peers_complete() {
            info!(
                agency_size = self.config.agency_size,
                "Waiting for peers to join"
            );
        }
        self.state.wait_for_complete_peers().await;
        Ok(())
    }

    /// Joining starter: register with the master, then poll until the
    /// peer set is complete.
    async fn join(&self, master: &str, api_shutdown: &CancellationToken) -> ServiceResult<()> {
        let endpoint = master_endpoint(master, self.config.master_port);
        let client = ControlClient::new(&endpoint).map_err(|source| ServiceError::Registration {
            master: endpoint.clone(),
            source,
        })?;
        // Left empty when unset: the master then uses our remote address.
        let request = HelloRequest {
            slave_id: self.config.id.clone(),
            slave_address: self.config.own_address.clone(),
            slave_port: self.config.master_port,
            data_dir: self.config.data_dir.display().to_string(),
            start_dbserver: self.config.start_dbserver,
            start_coordinator: self.config.start_coordinator,
        };

        let stop = self.state.stop_token();
        let list = loop {
            match client.hello(&request).await {
                Ok(list) => break list,
                Err(dbstarter_client::ClientError::Http(e)) => {
                    warn!(master = %endpoint, error = %e, "Master not reachable, retrying");
                }
                Err(source) => {
                    return Err(ServiceError::Registration {
                        master: endpoint,
                        source,
                    })
                }
            }
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.timings.peer_poll_interval) => {}
            }
        };
        self.state.set_peers(Peers::try_from(list)?);
        if self.state.peers().peer_by_id(&self.config.id).is_none() {
            return Err(ServiceError::IdentityMissing {
                id: self.config.id.clone(),
            });
        }
        info!(master = %endpoint, "Registered with master");
        self.serve_control_api(api_shutdown).await?;

        while !self.state.peers_complete() {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.timings.peer_poll_interval) => {}
            }
            match client.peers().await {
                Ok(list) => self.state.set_peers(Peers::try_from(list)?),
                Err(e) => warn!(master = %endpoint, error = %e, "Failed to fetch peers"),
            }
        }
        Ok(())
    }

    /// Bind the control API on `master_port + own port offset` and serve
    /// it in the background.
    async fn serve_control_api(&self, api_shutdown: &CancellationToken) -> ServiceResult<()> {
        let peers = self.state.peers();
        let me = peers
            .peer_by_id(&self.config.id)
            .ok_or_else(|| ServiceError::IdentityMissing {
                id: self.config.id.clone(),
            })?;
        let port = me.control_port(self.config.master_port);
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(ServiceError::ControlApi)?;
        let api = ApiState {
            config: Arc::clone(&self.config),
            state: Arc::clone(&self.state),
            root: self.root.clone(),
        };
        let shutdown = api_shutdown.clone();
        tokio::spawn(
            async move {
                if let Err(e) = server::serve(listener, api, shutdown).await {
                    error!(error = %e, "Control API failed");
                }
            }
            .in_current_span(),
        );
        Ok(())
    }

    /// Persist the peer set, start the configured roles and supervise them
    /// until the service stops.
    async fn run_servers(&self) -> ServiceResult<()> {
        self.state.transition_to(Lifecycle::Running);
        let peers = self.state.peers();
        save_setup(
            &self.config.setup_file(),
            &SetupConfig::new(&self.config.id, peers.to_list()),
        )?;

        let mut ctx = SupervisorContext::new(
            Arc::clone(&self.config),
            Arc::clone(&self.runner),
            Arc::clone(&self.probe),
            Arc::clone(&self.state),
        );
        ctx.policy = self.policy;
        ctx.readiness = self.readiness;
        let ctx = Arc::new(ctx);

        let stop = self.state.stop_token();
        let plan = [
            (ServerRole::Agent, peers.needs_agent(&self.config.id)),
            (ServerRole::DbServer, self.config.start_dbserver),
            (ServerRole::Coordinator, self.config.start_coordinator),
        ];
        let mut tasks: Vec<(ServerRole, JoinHandle<RoleOutcome>)> = Vec::new();
        for (i, (role, enabled)) in plan.into_iter().enumerate() {
            if i > 0 {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(self.timings.role_start_delay) => {}
                }
            }
            if enabled {
                tasks.push((role, spawn_role(Arc::clone(&ctx), role)));
            }
        }

        stop.cancelled().await;
        self.shutdown_servers().await;

        let roles: Vec<ServerRole> = tasks.iter().map(|(r, _)| *r).collect();
        let joined = tokio::time::timeout(
            self.timings.supervisor_join_timeout,
            join_all(tasks.into_iter().map(|(_, t)| t)),
        )
        .await;
        match joined {
            Ok(outcomes) => {
                for (role, outcome) in roles.iter().zip(outcomes) {
                    debug!(role = %role, outcome = ?outcome.ok(), "Supervisor ended");
                }
            }
            Err(_) => warn!("Supervisors did not end in time"),
        }

        if let Err(e) = self.runner.cleanup().await {
            warn!(error = %e, "Failed to cleanup runner");
        }

        match self.state.given_up() {
            Some((role, failures)) => Err(ServiceError::GaveUp { role, failures }),
            None => Ok(()),
        }
    }

    /// Terminate, then clean up, coordinator and dbserver before the agent.
    async fn shutdown_servers(&self) {
        info!("Shutting down services...");
        self.for_role(ServerRole::Coordinator, Action::Terminate).await;
        self.for_role(ServerRole::DbServer, Action::Terminate).await;
        tokio::time::sleep(self.timings.shutdown_delay).await;
        self.for_role(ServerRole::Agent, Action::Terminate).await;

        self.for_role(ServerRole::Coordinator, Action::Cleanup).await;
        self.for_role(ServerRole::DbServer, Action::Cleanup).await;
        tokio::time::sleep(self.timings.shutdown_delay).await;
        self.for_role(ServerRole::Agent, Action::Cleanup).await;
    }

    async fn for_role(&self, role: ServerRole, action: Action) {
        let Some(handle) = self.state.handle(role) else {
            return;
        };
        let result = match action {
            Action::Terminate => handle.terminate().await,
            Action::Cleanup => handle.cleanup().await,
        };
        if let Err(e) = result {
            warn!(role = %role, action = ?action, error = %e, "Shutdown step failed");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Terminate,
    Cleanup,
}

/// Pick the runner backend; the container backend also rewrites the
/// executable paths to those inside the image.
fn create_runner(config: &ServiceConfig) -> ServiceResult<(ServiceConfig, Arc<dyn Runner>)> {
    if config.docker.is_configured() {
        let runner =
            DockerRunner::new(config.docker.runner_config()).map_err(ServiceError::Runner)?;
        debug!(image = %config.docker.image, "Using docker runner");
        return Ok((config.with_container_executables(), Arc::new(runner)));
    }
    if config.running_in_docker {
        return Err(ServiceError::InvalidConfig(
            "when running in docker, a docker endpoint and image must be provided".to_string(),
        ));
    }
    debug!("Using process runner");
    Ok((config.clone(), Arc::new(ProcessRunner::new())))
}

/// Control API URL of the master. A bare host gets `port` appended.
pub fn master_endpoint(address: &str, port: u16) -> String {
    if address.contains("://") {
        return address.trim_end_matches('/').to_string();
    }
    let has_port = address
        .rsplit_once(':')
        .is_some_and(|(_, p)| p.parse::<u16>().is_ok());
    if has_port {
        format!("http://{address}")
    } else {
        format!("http://{address}:{port}")
    }
}
