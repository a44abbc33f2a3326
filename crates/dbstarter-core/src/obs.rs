//! Structured lifecycle events.
//!
//! Every event carries an `event` field (`role.started`, `role.terminated`,
//! ...) so log pipelines can filter on it. Set `RUST_LOG` to control
//! verbosity.

use std::time::Duration;

use tracing::{error, info};

use crate::peers::ServerRole;
use crate::state::Lifecycle;

/// Span tagged with this starter's id. Attach with
/// [`tracing::Instrument::instrument`] so it survives across awaits.
pub fn service_span(peer_id: &str) -> tracing::Span {
    tracing::info_span!("dbstarter.service", peer_id = %peer_id)
}

/// Emit event: a server instance was started or adopted.
pub fn emit_role_started(role: ServerRole, port: u16, generation: u32, adopted: bool) {
    info!(
        event = "role.started",
        role = %role,
        port = port,
        generation = generation,
        adopted = adopted,
    );
}

/// Emit event: a server instance exited.
pub fn emit_role_terminated(role: ServerRole, uptime: Duration, recent_failures: u32) {
    info!(
        event = "role.terminated",
        role = %role,
        uptime_ms = uptime.as_millis() as u64,
        recent_failures = recent_failures,
    );
}

/// Emit event: a role failed too often and will not be restarted.
pub fn emit_role_given_up(role: ServerRole, recent_failures: u32) {
    error!(
        event = "role.given_up",
        role = %role,
        recent_failures = recent_failures,
    );
}

/// Emit event: service lifecycle change.
pub fn emit_state_changed(from: Lifecycle, to: Lifecycle) {
    info!(event = "service.state_changed", from = %from, to = %to);
}
