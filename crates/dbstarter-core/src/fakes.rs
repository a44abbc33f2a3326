//! In-memory fakes for readiness probes and agency members (testing only)

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::agency::{key_path, AgencyApi, LastResponse};
use crate::error::{AgencyError, AgencyResult};
use crate::readiness::ReadinessProbe;

// ---------------------------------------------------------------------------
// Readiness probes
// ---------------------------------------------------------------------------

/// Probe that reports ready after a number of failed attempts.
#[derive(Debug, Default)]
pub struct FlakyProbe {
    failures_left: AtomicU32,
    calls: AtomicU32,
}

impl FlakyProbe {
    pub fn ready_after(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    /// Number of probes so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadinessProbe for FlakyProbe {
    async fn is_ready(&self, _address: &str, _port: u16) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
    }
}

/// Probe that never reports ready.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverReady;

#[async_trait]
impl ReadinessProbe for NeverReady {
    async fn is_ready(&self, _address: &str, _port: u16) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// FakeAgency
// ---------------------------------------------------------------------------

/// How a fake agency member answers reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentBehavior {
    /// Leader; unknown keys yield key-not-found.
    Leader,
    /// Follower redirecting to the given leader location.
    Follower(String),
    /// Answers with an unexpected status.
    Failing(u16),
    /// Never answers.
    Hanging,
}

/// Single in-memory agency member with a flat key space.
#[derive(Debug)]
pub struct FakeAgency {
    endpoint: String,
    behavior: AgentBehavior,
    store: Mutex<serde_json::Map<String, Value>>,
    last: Mutex<Option<LastResponse>>,
}

impl FakeAgency {
    pub fn new(endpoint: &str, behavior: AgentBehavior) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            behavior,
            store: Mutex::new(serde_json::Map::new()),
            last: Mutex::new(None),
        }
    }

    pub fn leader(endpoint: &str) -> Self {
        Self::new(endpoint, AgentBehavior::Leader)
    }

    pub fn follower(endpoint: &str, leader: &str) -> Self {
        Self::new(endpoint, AgentBehavior::Follower(leader.to_string()))
    }

    pub fn hanging(endpoint: &str) -> Self {
        Self::new(endpoint, AgentBehavior::Hanging)
    }

    fn record(&self, status: u16, location: Option<String>) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(LastResponse { status, location });
    }

    /// Apply leader/follower behavior; `Ok` means "act as leader".
    async fn answer(&self) -> AgencyResult<()> {
        match &self.behavior {
            AgentBehavior::Leader => {
                self.record(200, None);
                Ok(())
            }
            AgentBehavior::Follower(leader) => {
                self.record(307, Some(leader.clone()));
                Err(AgencyError::Redirect {
                    location: Some(leader.clone()),
                })
            }
            AgentBehavior::Failing(status) => {
                self.record(*status, None);
                Err(AgencyError::UnexpectedStatus {
                    status: *status,
                    endpoint: self.endpoint.clone(),
                })
            }
            AgentBehavior::Hanging => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    fn write_if(
        &self,
        key: &[&str],
        value: Value,
        precondition: impl FnOnce(Option<&Value>) -> bool,
    ) -> AgencyResult<()> {
        let path = key_path(key);
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        if !precondition(store.get(&path)) {
            self.record(412, None);
            return Err(AgencyError::PreconditionFailed { key: path });
        }
        store.insert(path, value);
        Ok(())
    }
}

#[async_trait]
impl AgencyApi for FakeAgency {
    fn endpoints(&self) -> Vec<String> {
        vec![self.endpoint.clone()]
    }

    async fn read_key(&self, key: &[&str]) -> AgencyResult<Value> {
        self.answer().await?;
        let path = key_path(key);
        let store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        store
            .get(&path)
            .cloned()
            .ok_or(AgencyError::KeyNotFound { key: path })
    }

    async fn write_key_if_empty(
        &self,
        key: &[&str],
        value: Value,
        _ttl: Option<Duration>,
    ) -> AgencyResult<()> {
        self.answer().await?;
        self.write_if(key, value, |current| current.is_none())
    }

    async fn write_key_if_equal_to(
        &self,
        key: &[&str],
        new_value: Value,
        old_value: Value,
        _ttl: Option<Duration>,
    ) -> AgencyResult<()> {
        self.answer().await?;
        self.write_if(key, new_value, |current| current == Some(&old_value))
    }

    fn last_response(&self) -> Option<LastResponse> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
