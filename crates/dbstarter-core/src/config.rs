//! Immutable deployment configuration.

use std::path::PathBuf;
use std::time::Duration;

use dbstarter_runner::DockerConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};
use crate::peers::MAX_PORT_SPAN;

/// Default port of the first starter's control API.
pub const DEFAULT_MASTER_PORT: u16 = 8528;

/// Largest base port that leaves room for every derived port.
pub const MAX_MASTER_PORT: u16 = u16::MAX - MAX_PORT_SPAN;

/// Address the master registers itself with when no own address is set.
pub const DEFAULT_OWN_ADDRESS: &str = "127.0.0.1";

/// Executable path inside the database image.
pub const CONTAINER_EXECUTABLE: &str = "/usr/sbin/arangod";
/// JavaScript startup directory inside the database image.
pub const CONTAINER_JS_STARTUP_DIR: &str = "/usr/share/arangodb3/js";

/// Container settings. The container backend is used when both
/// `endpoint` and `image` are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerSettings {
    /// Name of the container this starter itself runs in, if any.
    pub container: Option<String>,
    pub endpoint: String,
    pub image: String,
    pub user: Option<String>,
    pub gc_delay: Duration,
    pub net_host: bool,
    pub privileged: bool,
}

impl DockerSettings {
    pub fn is_configured(&self) -> bool {
        !self.endpoint.is_empty() && !self.image.is_empty()
    }

    /// Runner configuration for these settings.
    pub fn runner_config(&self) -> DockerConfig {
        DockerConfig {
            endpoint: self.endpoint.clone(),
            image: self.image.clone(),
            user: self.user.clone(),
            gc_delay: self.gc_delay,
            net_host: self.net_host,
            privileged: self.privileged,
        }
    }
}

/// Configuration of one starter. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique id of this peer; generated when empty.
    pub id: String,
    pub agency_size: usize,
    pub arangod_executable: String,
    pub js_startup_dir: String,
    /// Base of all derived ports; also the control API port of offset 0.
    pub master_port: u16,
    /// Debugger to prefix every server invocation with.
    pub rr_path: Option<String>,
    pub start_coordinator: bool,
    pub start_dbserver: bool,
    pub data_dir: PathBuf,
    /// Address other peers reach this starter on. When empty, the master
    /// learns it from joining peers and joining peers are registered under
    /// their remote address.
    pub own_address: String,
    /// Address of the master when joining; `None` makes this starter the master.
    pub master_address: Option<String>,
    pub verbose: bool,
    /// Added as `--server.threads` when set.
    pub server_threads: Option<u32>,
    pub all_port_offsets_unique: bool,
    pub docker: DockerSettings,
    pub running_in_docker: bool,
    pub jwt_secret: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            agency_size: 3,
            arangod_executable: "/usr/sbin/arangod".to_string(),
            js_startup_dir: "/usr/share/arangodb3/js".to_string(),
            master_port: DEFAULT_MASTER_PORT,
            rr_path: None,
            start_coordinator: true,
            start_dbserver: true,
            data_dir: PathBuf::from("."),
            own_address: String::new(),
            master_address: None,
            verbose: false,
            server_threads: None,
            all_port_offsets_unique: false,
            docker: DockerSettings::default(),
            running_in_docker: false,
            jwt_secret: None,
        }
    }
}

impl ServiceConfig {
    /// Reject configurations that cannot form a cluster.
    pub fn validate(&self) -> ServiceResult<()> {
        if self.agency_size == 0 {
            return Err(ServiceError::InvalidConfig(
                "agency size must be at least 1".to_string(),
            ));
        }
        if self.agency_size % 2 == 0 {
            tracing::warn!(
                agency_size = self.agency_size,
                "Even agency size tolerates no more failures than the next smaller odd size"
            );
        }
        if self.master_port == 0 || self.master_port > MAX_MASTER_PORT {
            return Err(ServiceError::InvalidConfig(format!(
                "master port must be between 1 and {MAX_MASTER_PORT}, got {}",
                self.master_port
            )));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(ServiceError::InvalidConfig(
                "data directory must not be empty".to_string(),
            ));
        }
        if self.running_in_docker && !self.docker.is_configured() {
            return Err(ServiceError::InvalidConfig(
                "when running in docker, a docker endpoint and image must be provided".to_string(),
            ));
        }
        if self.docker.container.is_some() && self.own_address.is_empty() {
            return Err(ServiceError::InvalidConfig(
                "own address must be specified when running in a container".to_string(),
            ));
        }
        Ok(())
    }

    /// A copy with `id` filled in, generating one when empty.
    pub fn with_generated_id(&self) -> Self {
        let mut config = self.clone();
        if config.id.is_empty() {
            config.id = generate_id();
        }
        config
    }

    /// A copy with executable paths pointing into the database image.
    pub fn with_container_executables(&self) -> Self {
        Self {
            arangod_executable: CONTAINER_EXECUTABLE.to_string(),
            js_startup_dir: CONTAINER_JS_STARTUP_DIR.to_string(),
            ..self.clone()
        }
    }

    /// Whether this starter joins an existing master.
    pub fn is_joining(&self) -> bool {
        self.master_address.is_some()
    }

    /// Prefix for server instance names.
    pub fn instance_name_prefix(&self) -> String {
        match &self.docker.container {
            Some(c) if !c.is_empty() => format!("{c}-"),
            _ => String::new(),
        }
    }

    /// Location of the persisted peer set.
    pub fn setup_file(&self) -> PathBuf {
        self.data_dir.join(crate::setup::SETUP_FILE_NAME)
    }
}

/// Random 8 hex char peer id.
pub fn generate_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
