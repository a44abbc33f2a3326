//! dbstarter-core: bootstrap and supervision of a database cluster
//!
//! - [`peers`]: peer registry, port offsets, endpoint comparison
//! - [`config`]: immutable `ServiceConfig`
//! - [`supervisor`]: per-role restart loop with failure circuit breaker
//! - [`agency`]: agency client and single-leader health check
//! - [`service`]: Master/Slave/Running lifecycle, ordered shutdown
//! - [`server`]: control API (`/hello`, `/process`, `/shutdown`, ...)
//!
//! Test doubles for the readiness probe and the agency live in [`fakes`];
//! runner fakes are in `dbstarter_runner::fakes`.

pub mod agency;
pub mod args;
pub mod conffile;
pub mod config;
pub mod error;
pub mod fakes;
pub mod jwt;
pub mod obs;
pub mod peers;
pub mod readiness;
pub mod server;
pub mod service;
pub mod setup;
pub mod state;
pub mod supervisor;
pub mod telemetry;

pub use agency::{check_agency_health, AgencyApi, AgentStatus, HttpAgency};
pub use config::{DockerSettings, ServiceConfig};
pub use error::{AgencyError, AgencyResult, HealthError, PeersError, ServiceError, ServiceResult};
pub use jwt::create_jwt_authorization_header;
pub use peers::{is_same_endpoint, normalize_host, Peer, Peers, Registration, ServerRole};
pub use readiness::{HttpReadinessProbe, ReadinessProbe, ReadinessSchedule};
pub use service::{Service, ServiceTimings};
pub use state::{Lifecycle, ServiceState};
pub use supervisor::{RestartPolicy, RoleOutcome, SupervisorState};
pub use telemetry::init_tracing;
