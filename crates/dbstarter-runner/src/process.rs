//! Native process backend
//!
//! Launches servers as child processes of the starter. The pid of every
//! started server is written to `<host_dir>/arangod.pid` so that a restarted
//! starter can find and adopt a server that survived it. The file is removed
//! again once the server is seen to exit.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{RunnerError, RunnerResult};
use crate::traits::{ExitSignal, ProcessHandle, Runner, StartRequest};

/// Name of the pid file written into every host directory.
pub const PID_FILE_NAME: &str = "arangod.pid";

/// Interval used to poll liveness of adopted processes.
const ADOPTED_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Runner that starts servers as local child processes.
#[derive(Debug, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    fn container_dir(&self, host_dir: &Path) -> PathBuf {
        host_dir.to_path_buf()
    }

    async fn get_running_server(
        &self,
        host_dir: &Path,
    ) -> RunnerResult<Option<Arc<dyn ProcessHandle>>> {
        let pid_path = host_dir.join(PID_FILE_NAME);
        let content = match tokio::fs::read_to_string(&pid_path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Ok(pid) = content.trim().parse::<u32>() else {
            warn!(path = %pid_path.display(), "Ignoring malformed pid file");
            return Ok(None);
        };
        if !serves_host_dir(pid, host_dir).await {
            debug!(pid, "Process from pid file is gone or serves another directory");
            if let Err(err) = remove_pid_file(&pid_path).await {
                warn!(path = %pid_path.display(), error = %err, "Failed to remove stale pid file");
            }
            return Ok(None);
        }

        info!(pid, "Found running process");
        Ok(Some(Arc::new(NativeProcess::adopt(pid, pid_path))))
    }

    async fn start(&self, request: StartRequest) -> RunnerResult<Arc<dyn ProcessHandle>> {
        let mut child = Command::new(&request.executable)
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                executable: request.executable.clone(),
                source,
            })?;

        let pid = child.id().unwrap_or_default();
        let pid_path = request.host_dir.join(PID_FILE_NAME);
        if let Err(err) = tokio::fs::write(&pid_path, pid.to_string()).await {
            // Nothing could find this child again.
            if let Err(kill_err) = child.kill().await {
                warn!(pid, error = %kill_err, "Failed to kill process without pid file");
            }
            return Err(err.into());
        }
        debug!(pid, name = %request.instance_name, "Spawned process");

        let (notifier, exit) = ExitSignal::channel();
        let exited_pid_path = pid_path.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(pid, %status, "Process exited"),
                Err(err) => warn!(pid, error = %err, "Failed to wait for process"),
            }
            if let Err(err) = release_pid_file(&exited_pid_path, pid).await {
                warn!(pid, error = %err, "Failed to remove pid file");
            }
            notifier.notify();
        });

        Ok(Arc::new(NativeProcess {
            pid,
            pid_path,
            exit,
        }))
    }

    async fn cleanup(&self) -> RunnerResult<()> {
        Ok(())
    }
}

/// Handle to a native server process.
#[derive(Debug)]
pub struct NativeProcess {
    pid: u32,
    pid_path: PathBuf,
    exit: ExitSignal,
}

impl NativeProcess {
    /// Wrap a process this starter did not spawn; exit is detected by polling.
    fn adopt(pid: u32, pid_path: PathBuf) -> Self {
        let (notifier, exit) = ExitSignal::channel();
        let exited_pid_path = pid_path.clone();
        tokio::spawn(async move {
            while is_alive(pid).await {
                tokio::time::sleep(ADOPTED_POLL_INTERVAL).await;
            }
            if let Err(err) = release_pid_file(&exited_pid_path, pid).await {
                warn!(pid, error = %err, "Failed to remove pid file");
            }
            notifier.notify();
        });
        Self {
            pid,
            pid_path,
            exit,
        }
    }
}

#[async_trait]
impl ProcessHandle for NativeProcess {
    fn process_id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn container_id(&self) -> Option<String> {
        None
    }

    async fn wait(&self) {
        self.exit.wait().await;
    }

    async fn terminate(&self) -> RunnerResult<()> {
        if self.exit.has_exited() {
            return Ok(());
        }
        signal(self.pid, "-TERM").await
    }

    async fn cleanup(&self) -> RunnerResult<()> {
        remove_pid_file(&self.pid_path).await
    }
}

/// Remove the pid file if it still names `pid`; a replacement server may
/// already have written its own.
async fn release_pid_file(path: &Path, pid: u32) -> RunnerResult<()> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) if content.trim() == pid.to_string() => remove_pid_file(path).await,
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn remove_pid_file(path: &Path) -> RunnerResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Whether `pid` is alive and was started for `host_dir`.
///
/// Every server argv names files inside its host directory, which tells a
/// server apart from an unrelated process that reused a stale pid. Without
/// `/proc` only liveness can be checked.
async fn serves_host_dir(pid: u32, host_dir: &Path) -> bool {
    match tokio::fs::read(format!("/proc/{pid}/cmdline")).await {
        Ok(raw) => {
            let dir = host_dir.to_string_lossy();
            raw.split(|b| *b == 0)
                .any(|arg| String::from_utf8_lossy(arg).contains(dir.as_ref()))
        }
        Err(_) if Path::new("/proc/self").exists() => false,
        Err(_) => is_alive(pid).await,
    }
}

/// Check whether a process with the given pid exists.
async fn is_alive(pid: u32) -> bool {
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

async fn signal(pid: u32, sig: &str) -> RunnerResult<()> {
    let output = Command::new("kill")
        .arg(sig)
        .arg(pid.to_string())
        .output()
        .await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(RunnerError::Signal {
            pid,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
