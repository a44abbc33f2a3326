//! Docker container backend
//!
//! Every server runs in its own container created from the configured image.
//! Containers are labelled with the host directory they serve, which is how
//! `get_running_server` finds survivors of a previous starter run. Exited
//! containers left behind by a crashed run are removed before their name is
//! reused.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerSummary, HostConfig, PortBinding};
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use crate::error::{RunnerError, RunnerResult};
use crate::traits::{ExitSignal, ProcessHandle, Runner, StartRequest};

/// Label carrying the host directory of a managed container.
pub const HOST_DIR_LABEL: &str = "dbstarter.hostdir";

/// Directory inside the container where the host directory is mounted.
pub const CONTAINER_DATA_DIR: &str = "/data";

/// Seconds docker waits for a graceful stop before killing.
const STOP_TIMEOUT_SECS: i64 = 60;

/// Client timeout for docker daemon requests.
const DOCKER_CLIENT_TIMEOUT_SECS: u64 = 120;

/// Docker runner settings
#[derive(Debug, Clone, Default)]
pub struct DockerConfig {
    /// Docker daemon endpoint (`unix://...`, `tcp://...` or `http://...`)
    pub endpoint: String,
    /// Server image
    pub image: String,
    /// User to run containers as
    pub user: Option<String>,
    /// Delay before removing exited containers during cleanup
    pub gc_delay: Duration,
    /// Use host networking instead of port bindings
    pub net_host: bool,
    /// Run containers privileged
    pub privileged: bool,
}

/// Runner that starts servers as docker containers.
pub struct DockerRunner {
    docker: Docker,
    config: DockerConfig,
    created: Mutex<Vec<String>>,
}

impl DockerRunner {
    /// Connect to the configured docker daemon.
    pub fn new(config: DockerConfig) -> RunnerResult<Self> {
        if config.image.is_empty() {
            return Err(RunnerError::InvalidConfig("docker image must be set".into()));
        }
        let docker = connect(&config.endpoint)?;
        Ok(Self {
            docker,
            config,
            created: Mutex::new(Vec::new()),
        })
    }

    async fn ensure_image(&self) -> RunnerResult<()> {
        if self.docker.inspect_image(&self.config.image).await.is_ok() {
            return Ok(());
        }
        info!(image = %self.config.image, "Pulling image");
        let options = CreateImageOptions {
            from_image: self.config.image.clone(),
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    fn container_config(&self, request: &StartRequest) -> Config<String> {
        let binds = request
            .volumes
            .iter()
            .map(|v| {
                let mode = if v.read_only { ":ro" } else { "" };
                format!(
                    "{}:{}{}",
                    v.host_path.display(),
                    v.container_path.display(),
                    mode
                )
            })
            .collect::<Vec<_>>();

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &request.ports {
            let key = format!("{port}/tcp");
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            binds: Some(binds),
            port_bindings: (!self.config.net_host).then_some(port_bindings),
            network_mode: self.config.net_host.then(|| "host".to_string()),
            privileged: Some(self.config.privileged),
            ..Default::default()
        };

        let labels = HashMap::from([(
            HOST_DIR_LABEL.to_string(),
            request.host_dir.display().to_string(),
        )]);

        Config {
            image: Some(self.config.image.clone()),
            entrypoint: Some(vec![request.executable.clone()]),
            cmd: Some(request.args.clone()),
            user: self.config.user.clone(),
            labels: Some(labels),
            exposed_ports: (!self.config.net_host).then_some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    fn track(&self, id: &str) {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id.to_string());
    }

    /// Remove exited containers holding `name`, so it can be created again.
    async fn remove_stale(&self, name: &str) -> RunnerResult<()> {
        let filters = HashMap::from([("name".to_string(), vec![format!("^/{name}$")])]);
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        for id in stale_container_ids(&containers, name) {
            info!(container = %id, name, "Removing exited container");
            remove(&self.docker, &id).await?;
        }
        Ok(())
    }
}

/// Ids of non-running containers named exactly `name`.
fn stale_container_ids(containers: &[ContainerSummary], name: &str) -> Vec<String> {
    let wanted = format!("/{name}");
    containers
        .iter()
        .filter(|c| c.names.iter().flatten().any(|n| *n == wanted))
        .filter(|c| c.state.as_deref() != Some("running"))
        .filter_map(|c| c.id.clone())
        .collect()
}

#[async_trait]
impl Runner for DockerRunner {
    fn container_dir(&self, _host_dir: &Path) -> PathBuf {
        PathBuf::from(CONTAINER_DATA_DIR)
    }

    async fn get_running_server(
        &self,
        host_dir: &Path,
    ) -> RunnerResult<Option<Arc<dyn ProcessHandle>>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{HOST_DIR_LABEL}={}", host_dir.display())],
        )]);
        let options = ListContainersOptions::<String> {
            all: false,
            filters,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        let Some(id) = containers.into_iter().find_map(|c| c.id) else {
            return Ok(None);
        };

        info!(container = %id, "Found running container");
        self.track(&id);
        Ok(Some(Arc::new(DockerContainer::watch(
            self.docker.clone(),
            id,
        ))))
    }

    async fn start(&self, request: StartRequest) -> RunnerResult<Arc<dyn ProcessHandle>> {
        self.ensure_image().await?;
        self.remove_stale(&request.instance_name).await?;

        let options = CreateContainerOptions {
            name: request.instance_name.clone(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), self.container_config(&request))
            .await?;
        self.track(&created.id);

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;
        debug!(container = %created.id, name = %request.instance_name, "Started container");

        Ok(Arc::new(DockerContainer::watch(
            self.docker.clone(),
            created.id,
        )))
    }

    async fn cleanup(&self) -> RunnerResult<()> {
        let ids = std::mem::take(
            &mut *self
                .created
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if ids.is_empty() {
            return Ok(());
        }
        if !self.config.gc_delay.is_zero() {
            tokio::time::sleep(self.config.gc_delay).await;
        }
        for id in ids {
            if let Err(err) = remove(&self.docker, &id).await {
                warn!(container = %id, error = %err, "Failed to remove container");
            }
        }
        Ok(())
    }
}

/// Handle to a server running in a docker container.
#[derive(Debug)]
pub struct DockerContainer {
    docker: Docker,
    id: String,
    exit: ExitSignal,
}

impl DockerContainer {
    fn watch(docker: Docker, id: String) -> Self {
        let (notifier, exit) = ExitSignal::channel();
        let waiter = docker.clone();
        let wait_id = id.clone();
        tokio::spawn(async move {
            let options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut stream = waiter.wait_container(&wait_id, Some(options));
            // Non-zero exit codes surface as errors; either way the container is gone.
            if let Some(result) = stream.next().await {
                match result {
                    Ok(resp) => {
                        debug!(container = %wait_id, code = resp.status_code, "Container exited")
                    }
                    Err(err) => {
                        debug!(container = %wait_id, error = %err, "Container exited")
                    }
                }
            }
            notifier.notify();
        });
        Self { docker, id, exit }
    }
}

#[async_trait]
impl ProcessHandle for DockerContainer {
    fn process_id(&self) -> Option<u32> {
        None
    }

    fn container_id(&self) -> Option<String> {
        Some(self.id.clone())
    }

    async fn wait(&self) {
        self.exit.wait().await;
    }

    async fn terminate(&self) -> RunnerResult<()> {
        if self.exit.has_exited() {
            return Ok(());
        }
        self.docker
            .stop_container(&self.id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await?;
        Ok(())
    }

    async fn cleanup(&self) -> RunnerResult<()> {
        remove(&self.docker, &self.id).await
    }
}

async fn remove(docker: &Docker, id: &str) -> RunnerResult<()> {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    match docker.remove_container(id, Some(options)).await {
        Ok(()) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn connect(endpoint: &str) -> RunnerResult<Docker> {
    let docker = if endpoint.is_empty() {
        Docker::connect_with_local_defaults()?
    } else if let Some(path) = endpoint.strip_prefix("unix://") {
        Docker::connect_with_unix(
            path,
            DOCKER_CLIENT_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )?
    } else if let Some(addr) = endpoint.strip_prefix("tcp://") {
        Docker::connect_with_http(
            &format!("http://{addr}"),
            DOCKER_CLIENT_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )?
    } else if endpoint.starts_with("http://") {
        Docker::connect_with_http(
            endpoint,
            DOCKER_CLIENT_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )?
    } else {
        return Err(RunnerError::InvalidConfig(format!(
            "unsupported docker endpoint: {endpoint}"
        )));
    };
    Ok(docker)
}
