//! Agency access and quorum health checks.
//!
//! - [`api`]    : `AgencyApi` trait and recorded `LastResponse`
//! - [`http`]   : `HttpAgency`, the HTTP implementation (redirects not followed)
//! - [`health`] : `check_agency_health()` single-leader quorum verification

pub mod api;
pub mod health;
pub mod http;

pub use api::{key_path, AgencyApi, LastResponse};
pub use health::{
    check_agency_health, evaluate_statuses, probe_agent, AgentStatus, HEALTH_PROBE_KEY,
    MAX_AGENT_RESPONSE_TIME,
};
pub use http::HttpAgency;
