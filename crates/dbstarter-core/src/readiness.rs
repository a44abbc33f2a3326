//! Server readiness probing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::peers::ServerRole;

/// Per-request timeout of a readiness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often and how long to poll for readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessSchedule {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessSchedule {
    /// 300 attempts, 500 ms apart: about five minutes.
    fn default() -> Self {
        Self {
            attempts: 300,
            interval: Duration::from_millis(500),
        }
    }
}

/// Answers whether a server is ready to accept requests.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn is_ready(&self, address: &str, port: u16) -> bool;
}

/// Probe that expects `200` from `GET /_api/version`.
#[derive(Debug, Clone)]
pub struct HttpReadinessProbe {
    http: reqwest::Client,
    authorization: Option<String>,
}

impl HttpReadinessProbe {
    pub fn new(authorization: Option<String>) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Self {
            http,
            authorization: authorization.filter(|a| !a.is_empty()),
        })
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProbe {
    async fn is_ready(&self, address: &str, port: u16) -> bool {
        let url = format!("http://{address}:{port}/_api/version");
        let mut req = self.http.get(&url);
        if let Some(auth) = &self.authorization {
            req = req.header(reqwest::header::AUTHORIZATION, auth);
        }
        match req.send().await {
            Ok(resp) => resp.status() == StatusCode::OK,
            Err(e) => {
                debug!(url = %url, error = %e, "Readiness probe failed");
                false
            }
        }
    }
}

/// Poll `probe` until it reports ready or the schedule is exhausted.
pub async fn wait_until_ready(
    probe: &dyn ReadinessProbe,
    address: &str,
    port: u16,
    schedule: ReadinessSchedule,
) -> bool {
    for _ in 0..schedule.attempts {
        if probe.is_ready(address, port).await {
            return true;
        }
        tokio::time::sleep(schedule.interval).await;
    }
    false
}

/// Watch a freshly started instance in the background.
///
/// Logs once the instance becomes ready, or warns when it never does.
/// Cancelling `cancel` (done when the instance exits) ends the task
/// silently. The receiver yields the outcome unless cancelled.
pub fn spawn_readiness_observer(
    probe: Arc<dyn ReadinessProbe>,
    role: ServerRole,
    address: String,
    port: u16,
    schedule: ReadinessSchedule,
    cancel: CancellationToken,
) -> (JoinHandle<()>, oneshot::Receiver<bool>) {
    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let ready = tokio::select! {
            _ = cancel.cancelled() => return,
            ready = wait_until_ready(probe.as_ref(), &address, port, schedule) => ready,
        };
        if ready {
            info!(role = %role, port, "Server up and running");
        } else {
            let waited = schedule.interval * schedule.attempts;
            warn!(role = %role, port, ?waited, "Server not ready in time");
        }
        let _ = tx.send(ready);
    });
    (handle, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FlakyProbe, NeverReady};

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_after_some_attempts() {
        let probe = FlakyProbe::ready_after(3);
        assert!(wait_until_ready(&probe, "127.0.0.1", 8529, ReadinessSchedule::default()).await);
        assert_eq!(probe.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_gives_up() {
        let schedule = ReadinessSchedule {
            attempts: 5,
            interval: Duration::from_millis(500),
        };
        assert!(!wait_until_ready(&NeverReady, "127.0.0.1", 8529, schedule).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_reports_readiness() {
        let (handle, rx) = spawn_readiness_observer(
            Arc::new(FlakyProbe::ready_after(0)),
            ServerRole::Agent,
            "127.0.0.1".to_string(),
            8529,
            ReadinessSchedule::default(),
            CancellationToken::new(),
        );
        assert_eq!(rx.await, Ok(true));
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_observer_sends_nothing() {
        let cancel = CancellationToken::new();
        let (handle, rx) = spawn_readiness_observer(
            Arc::new(NeverReady),
            ServerRole::DbServer,
            "127.0.0.1".to_string(),
            8531,
            ReadinessSchedule::default(),
            cancel.clone(),
        );
        cancel.cancel();
        handle.await.unwrap();
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_http_probe_unreachable_is_not_ready() {
        let probe = HttpReadinessProbe::new(None).unwrap();
        assert!(!probe.is_ready("127.0.0.1", 9).await);
    }
}
