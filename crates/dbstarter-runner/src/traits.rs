//! Capability traits for process execution backends
//!
//! - `Runner`: starts, locates and globally cleans up server instances
//! - `ProcessHandle`: one running server instance
//!
//! The supervisor only depends on these traits. Concrete backends are
//! `ProcessRunner` (native child processes) and `DockerRunner` (containers);
//! an in-memory fake lives in the `fakes` module.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::RunnerResult;

/// A host directory made visible inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub read_only: bool,
}

impl Volume {
    /// Create a read-write volume mapping.
    pub fn read_write(host_path: impl Into<PathBuf>, container_path: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }
}

/// Everything a backend needs to launch one server instance.
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Executable (or `rr` wrapper) to launch.
    pub executable: String,
    /// Arguments, not including the executable.
    pub args: Vec<String>,
    pub volumes: Vec<Volume>,
    /// Ports the instance listens on.
    pub ports: Vec<u16>,
    /// Unique name for this instance (used as container name).
    pub instance_name: String,
    /// Host-side data directory of the instance.
    pub host_dir: PathBuf,
}

/// A single running server instance.
#[async_trait]
pub trait ProcessHandle: Send + Sync + Debug {
    /// OS process id, if known.
    fn process_id(&self) -> Option<u32>;

    /// Container id, for container-backed instances.
    fn container_id(&self) -> Option<String>;

    /// Block until the instance has exited.
    async fn wait(&self);

    /// Ask the instance to stop.
    async fn terminate(&self) -> RunnerResult<()>;

    /// Release backend resources held for this instance.
    async fn cleanup(&self) -> RunnerResult<()>;
}

/// Backend able to start and locate server instances.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Translate a host directory into the path the instance sees.
    fn container_dir(&self, host_dir: &Path) -> PathBuf;

    /// Look for an instance already running in the given data directory.
    async fn get_running_server(
        &self,
        host_dir: &Path,
    ) -> RunnerResult<Option<Arc<dyn ProcessHandle>>>;

    /// Launch a new instance.
    async fn start(&self, request: StartRequest) -> RunnerResult<Arc<dyn ProcessHandle>>;

    /// Release everything this runner created.
    async fn cleanup(&self) -> RunnerResult<()>;
}

/// Exit notification shared between a background waiter task and any
/// number of `wait()` callers.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    rx: watch::Receiver<bool>,
}

/// Sending half of an [`ExitSignal`].
#[derive(Debug)]
pub struct ExitNotifier {
    tx: watch::Sender<bool>,
}

impl ExitSignal {
    /// Create a connected notifier/signal pair.
    pub fn channel() -> (ExitNotifier, ExitSignal) {
        let (tx, rx) = watch::channel(false);
        (ExitNotifier { tx }, ExitSignal { rx })
    }

    /// Whether the instance has already exited.
    pub fn has_exited(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the instance has exited.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // A dropped notifier also means the waiter is gone.
        let _ = rx.wait_for(|exited| *exited).await;
    }
}

impl ExitNotifier {
    /// Mark the instance as exited.
    pub fn notify(self) {
        self.tx.send_replace(true);
    }
}
