//! Mutable state of a running starter.
//!
//! One record behind one lock. Supervisor loops, the control API and the
//! shutdown path only touch it through the methods below.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dbstarter_runner::ProcessHandle;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::PeersError;
use crate::obs;
use crate::peers::{Peer, Peers, Registration, ServerRole};

/// Lifecycle of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Start,
    Master,
    Slave,
    Running,
    Stopped,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Start => "start",
            Lifecycle::Master => "master",
            Lifecycle::Slave => "slave",
            Lifecycle::Running => "running",
            Lifecycle::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct Inner {
    lifecycle: Lifecycle,
    peers: Peers,
    handles: HashMap<ServerRole, Arc<dyn ProcessHandle>>,
    failures: HashMap<ServerRole, u32>,
    given_up: Option<(ServerRole, u32)>,
}

/// Shared service state.
#[derive(Debug)]
pub struct ServiceState {
    inner: Mutex<Inner>,
    stop: CancellationToken,
    peers_changed: Notify,
}

impl ServiceState {
    /// Create the state. The stop flag is a child of `root`, so cancelling
    /// the root stops the service.
    pub fn new(root: &CancellationToken, peers: Peers) -> Self {
        Self {
            inner: Mutex::new(Inner {
                lifecycle: Lifecycle::Start,
                peers,
                handles: HashMap::new(),
                failures: HashMap::new(),
                given_up: None,
            }),
            stop: root.child_token(),
            peers_changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lock().lifecycle
    }

    /// Move to `next`, logging the change.
    pub fn transition_to(&self, next: Lifecycle) {
        let previous = {
            let mut inner = self.lock();
            std::mem::replace(&mut inner.lifecycle, next)
        };
        if previous != next {
            obs::emit_state_changed(previous, next);
        }
    }

    /// Snapshot of the peer set.
    pub fn peers(&self) -> Peers {
        self.lock().peers.clone()
    }

    /// Replace the peer set (joining starters adopt the master's).
    pub fn set_peers(&self, peers: Peers) {
        self.lock().peers = peers;
        self.peers_changed.notify_waiters();
    }

    /// Register a joining starter (master only).
    pub fn register(&self, registration: Registration) -> Result<Peer, PeersError> {
        let peer = self.lock().peers.register(registration)?;
        self.peers_changed.notify_waiters();
        Ok(peer)
    }

    /// Replace the address of a registered peer.
    pub fn set_peer_address(&self, id: &str, address: &str) -> bool {
        self.lock().peers.set_address(id, address)
    }

    pub fn peers_complete(&self) -> bool {
        self.lock().peers.is_complete()
    }

    /// Wait until the peer set is complete or the service is stopping.
    pub async fn wait_for_complete_peers(&self) {
        loop {
            let notified = self.peers_changed.notified();
            if self.peers_complete() || self.is_stopping() {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.stop.cancelled() => return,
            }
        }
    }

    pub fn set_handle(&self, role: ServerRole, handle: Arc<dyn ProcessHandle>) {
        self.lock().handles.insert(role, handle);
    }

    pub fn handle(&self, role: ServerRole) -> Option<Arc<dyn ProcessHandle>> {
        self.lock().handles.get(&role).cloned()
    }

    /// Handles of all roles that have been started.
    pub fn handles(&self) -> Vec<(ServerRole, Arc<dyn ProcessHandle>)> {
        let inner = self.lock();
        ServerRole::ALL
            .iter()
            .filter_map(|role| inner.handles.get(role).map(|h| (*role, Arc::clone(h))))
            .collect()
    }

    pub fn record_failures(&self, role: ServerRole, recent_failures: u32) {
        self.lock().failures.insert(role, recent_failures);
    }

    pub fn failures(&self, role: ServerRole) -> u32 {
        self.lock().failures.get(&role).copied().unwrap_or_default()
    }

    /// Record that `role` was given up and stop the service.
    pub fn give_up(&self, role: ServerRole, failures: u32) {
        {
            let mut inner = self.lock();
            inner.failures.insert(role, failures);
            inner.given_up.get_or_insert((role, failures));
        }
        self.stop.cancel();
    }

    /// The first role given up, with its failure count.
    pub fn given_up(&self) -> Option<(ServerRole, u32)> {
        self.lock().given_up
    }

    /// Set the stop flag.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Token cancelled once the service is stopping.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbstarter_runner::fakes::FakeProcess;
    use std::sync::Mutex as StdMutex;

    fn registration(id: &str) -> Registration {
        Registration {
            id: id.to_string(),
            address: format!("{id}.local"),
            data_dir: "/data".to_string(),
            has_dbserver: true,
            has_coordinator: true,
        }
    }

    #[test]
    fn test_root_cancellation_sets_stop_flag() {
        let root = CancellationToken::new();
        let state = ServiceState::new(&root, Peers::new(1, false));
        assert!(!state.is_stopping());
        root.cancel();
        assert!(state.is_stopping());
    }

    #[test]
    fn test_give_up_keeps_first_role_and_stops() {
        let state = ServiceState::new(&CancellationToken::new(), Peers::new(1, false));
        state.give_up(ServerRole::DbServer, 100);
        state.give_up(ServerRole::Coordinator, 100);
        assert_eq!(state.given_up(), Some((ServerRole::DbServer, 100)));
        assert!(state.is_stopping());
        assert_eq!(state.failures(ServerRole::Coordinator), 100);
    }

    #[test]
    fn test_handles_in_role_order() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let state = ServiceState::new(&CancellationToken::new(), Peers::new(1, false));
        state.set_handle(ServerRole::Coordinator, FakeProcess::running("c", Arc::clone(&log)));
        state.set_handle(ServerRole::Agent, FakeProcess::running("a", log));
        let roles: Vec<_> = state.handles().into_iter().map(|(r, _)| r).collect();
        assert_eq!(roles, vec![ServerRole::Agent, ServerRole::Coordinator]);
        assert!(state.handle(ServerRole::DbServer).is_none());
    }

    #[tokio::test]
    async fn test_wait_for_complete_peers_wakes_on_registration() {
        let state = Arc::new(ServiceState::new(
            &CancellationToken::new(),
            Peers::new(2, false),
        ));
        state.register(registration("a")).unwrap();

        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.wait_for_complete_peers().await })
        };
        tokio::task::yield_now().await;
        state.register(registration("b")).unwrap();
        waiter.await.unwrap();
        assert!(state.peers_complete());
    }

    #[test]
    fn test_transition_updates_lifecycle() {
        let state = ServiceState::new(&CancellationToken::new(), Peers::new(1, false));
        assert_eq!(state.lifecycle(), Lifecycle::Start);
        state.transition_to(Lifecycle::Master);
        assert_eq!(state.lifecycle(), Lifecycle::Master);
        assert_eq!(Lifecycle::Running.to_string(), "running");
    }
}
