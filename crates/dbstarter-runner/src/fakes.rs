//! In-memory fakes for the runner traits (testing only)
//!
//! `FakeRunner` never spawns anything: each started instance "runs" for a
//! configured uptime on the tokio clock, so supervisor tests can drive
//! hundreds of restarts with a paused runtime.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{RunnerError, RunnerResult};
use crate::traits::{ExitNotifier, ExitSignal, ProcessHandle, Runner, StartRequest};

/// Shared, ordered log of lifecycle calls (`start:<name>`, `terminate:<name>`, ...).
pub type CallLog = Arc<Mutex<Vec<String>>>;

// ---------------------------------------------------------------------------
// FakeProcess
// ---------------------------------------------------------------------------

/// A pretend server instance that exits after its uptime or on terminate.
#[derive(Debug)]
pub struct FakeProcess {
    name: String,
    exit: ExitSignal,
    notifier: Arc<Mutex<Option<ExitNotifier>>>,
    terminated: AtomicBool,
    log: CallLog,
}

impl FakeProcess {
    /// Create an instance that exits on its own after `uptime`.
    pub fn spawn(name: &str, uptime: Duration, log: CallLog) -> Arc<Self> {
        let process = Self::running(name, log);
        let notifier = Arc::clone(&process.notifier);
        tokio::spawn(async move {
            tokio::time::sleep(uptime).await;
            fire(&notifier);
        });
        process
    }

    /// Create an instance that only exits when terminated.
    pub fn running(name: &str, log: CallLog) -> Arc<Self> {
        let (notifier, exit) = ExitSignal::channel();
        Arc::new(Self {
            name: name.to_string(),
            exit,
            notifier: Arc::new(Mutex::new(Some(notifier))),
            terminated: AtomicBool::new(false),
            log,
        })
    }

    /// Whether `terminate` has been called.
    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn record(&self, call: &str) {
        if let Ok(mut log) = self.log.lock() {
            log.push(format!("{call}:{}", self.name));
        }
    }
}

fn fire(notifier: &Mutex<Option<ExitNotifier>>) {
    if let Some(n) = notifier.lock().ok().and_then(|mut n| n.take()) {
        n.notify();
    }
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    fn process_id(&self) -> Option<u32> {
        Some(4242)
    }

    fn container_id(&self) -> Option<String> {
        None
    }

    async fn wait(&self) {
        self.exit.wait().await;
    }

    async fn terminate(&self) -> RunnerResult<()> {
        self.record("terminate");
        self.terminated.store(true, Ordering::SeqCst);
        fire(&self.notifier);
        Ok(())
    }

    async fn cleanup(&self) -> RunnerResult<()> {
        self.record("cleanup");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeRunner
// ---------------------------------------------------------------------------

/// Runner whose instances live for a fixed uptime.
#[derive(Debug)]
pub struct FakeRunner {
    uptime: Option<Duration>,
    starts: Mutex<Vec<StartRequest>>,
    existing: Mutex<Option<Arc<FakeProcess>>>,
    fail_start: AtomicBool,
    cleanups: AtomicUsize,
    log: CallLog,
}

impl FakeRunner {
    /// Every started instance exits after `uptime`.
    pub fn with_uptime(uptime: Duration) -> Self {
        Self {
            uptime: Some(uptime),
            starts: Mutex::new(Vec::new()),
            existing: Mutex::new(None),
            fail_start: AtomicBool::new(false),
            cleanups: AtomicUsize::new(0),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Instances never exit on their own.
    pub fn long_running() -> Self {
        Self {
            uptime: None,
            ..Self::with_uptime(Duration::ZERO)
        }
    }

    /// Report `process` as already running on the next lookup.
    pub fn with_existing(self, process: Arc<FakeProcess>) -> Self {
        if let Ok(mut existing) = self.existing.lock() {
            *existing = Some(process);
        }
        self
    }

    /// Make every `start` call fail.
    pub fn failing(self) -> Self {
        self.fail_start.store(true, Ordering::SeqCst);
        self
    }

    /// Number of `start` calls so far.
    pub fn start_count(&self) -> usize {
        self.starts.lock().map(|s| s.len()).unwrap_or_default()
    }

    /// Snapshot of all start requests.
    pub fn starts(&self) -> Vec<StartRequest> {
        self.starts.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Number of global cleanups.
    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    /// Shared call log, also used by every process this runner creates.
    pub fn log(&self) -> CallLog {
        Arc::clone(&self.log)
    }

    /// Snapshot of the call log.
    pub fn calls(&self) -> Vec<String> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Runner for FakeRunner {
    fn container_dir(&self, host_dir: &Path) -> PathBuf {
        host_dir.to_path_buf()
    }

    async fn get_running_server(
        &self,
        _host_dir: &Path,
    ) -> RunnerResult<Option<Arc<dyn ProcessHandle>>> {
        let existing = self.existing.lock().ok().and_then(|mut e| e.take());
        Ok(existing.map(|p| p as Arc<dyn ProcessHandle>))
    }

    async fn start(&self, request: StartRequest) -> RunnerResult<Arc<dyn ProcessHandle>> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RunnerError::InvalidConfig("start disabled".into()));
        }
        if let Ok(mut log) = self.log.lock() {
            log.push(format!("start:{}", request.instance_name));
        }
        let process = match self.uptime {
            Some(uptime) => FakeProcess::spawn(&request.instance_name, uptime, self.log()),
            None => FakeProcess::running(&request.instance_name, self.log()),
        };
        if let Ok(mut starts) = self.starts.lock() {
            starts.push(request);
        }
        Ok(process)
    }

    async fn cleanup(&self) -> RunnerResult<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut log) = self.log.lock() {
            log.push("cleanup:runner".to_string());
        }
        Ok(())
    }
}
