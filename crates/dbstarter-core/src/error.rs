//! Error taxonomy for dbstarter-core.
//!
//! - `ServiceError`: fatal configuration and bootstrap failures
//! - `PeersError`: a peer that cannot be given valid ports
//! - `AgencyError`: outcome of a single agency request
//! - `HealthError`: a violated agency quorum invariant

use dbstarter_client::ClientError;
use dbstarter_runner::RunnerError;

use crate::peers::ServerRole;

/// Fatal errors of the starter service. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot find peer information for my id ({id})")]
    IdentityMissing { id: String },

    #[error("runner error: {0}")]
    Runner(#[source] RunnerError),

    #[error("failed to register with master {master}: {source}")]
    Registration {
        master: String,
        #[source]
        source: ClientError,
    },

    #[error("{role} failed {failures} times in a row, giving up")]
    GaveUp { role: ServerRole, failures: u32 },

    #[error("failed to serve control API: {0}")]
    ControlApi(#[source] std::io::Error),

    #[error("peer registry error: {0}")]
    Peers(#[from] PeersError),

    #[error("setup file error: {0}")]
    Setup(#[source] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for service operations.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// A peer whose ports would not fit the port range.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeersError {
    #[error("no free port offset left for host {host}")]
    NoFreePortOffset { host: String },

    #[error("peer {id} has port offset {port_offset} beyond the supported range")]
    PortOffsetOutOfRange { id: String, port_offset: u16 },
}

/// Errors produced by agency requests.
#[derive(Debug, thiserror::Error)]
pub enum AgencyError {
    #[error("key not found: {key}")]
    KeyNotFound { key: String },

    /// The member is a follower and redirects to the leader.
    #[error("redirected to {}", .location.as_deref().unwrap_or("<no location>"))]
    Redirect { location: Option<String> },

    #[error("precondition failed for key {key}")]
    PreconditionFailed { key: String },

    #[error("unexpected status {status} from {endpoint}")]
    UnexpectedStatus { status: u16, endpoint: String },

    #[error("agency connection has no endpoints")]
    NoEndpoints,

    #[error("failed to create authorization token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid agency response: {0}")]
    InvalidResponse(#[from] serde_json::Error),
}

impl AgencyError {
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, AgencyError::KeyNotFound { .. })
    }
}

/// Result type for agency requests.
pub type AgencyResult<T> = std::result::Result<T, AgencyError>;

/// A violated agency health invariant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HealthError {
    #[error("agent {endpoint} is not responding")]
    NotResponding { endpoint: String },

    #[error("not all agents report the same leader endpoint ({expected} vs {actual})")]
    LeadersDisagree { expected: String, actual: String },

    #[error("unexpected leader count: {count}")]
    UnexpectedLeaderCount { count: usize },
}
