//! Agency quorum health check.
//!
//! Every member is asked for a key that never exists. The leader answers
//! (with the value or key-not-found); followers redirect to the leader.
//! The agency is healthy when every member responds, exactly one claims
//! leadership, and all members agree on the leader's host.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

use super::api::AgencyApi;
use crate::error::{AgencyError, HealthError};
use crate::peers::is_same_endpoint;

/// Key read by the health probe. Never written by anyone.
pub const HEALTH_PROBE_KEY: &str = "does-not-exist-70ddb948-59ea-52f3-9a19-baaca18de7ae";

/// Upper bound on a single member's answer.
pub const MAX_AGENT_RESPONSE_TIME: Duration = Duration::from_secs(10);

/// Outcome of probing one agency member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentStatus {
    pub is_leader: bool,
    pub leader_endpoint: String,
    pub is_responding: bool,
}

impl AgentStatus {
    fn leader(endpoint: String) -> Self {
        Self {
            is_leader: true,
            leader_endpoint: endpoint,
            is_responding: true,
        }
    }

    fn follower(leader_endpoint: String) -> Self {
        Self {
            is_leader: false,
            leader_endpoint,
            is_responding: true,
        }
    }

    fn not_responding() -> Self {
        Self::default()
    }
}

/// Probe one member, bounded by `timeout`.
pub async fn probe_agent(conn: &dyn AgencyApi, timeout: Duration) -> AgentStatus {
    let endpoint = conn.endpoints().join(",");
    match tokio::time::timeout(timeout, conn.read_key(&[HEALTH_PROBE_KEY])).await {
        Ok(Ok(_)) => AgentStatus::leader(endpoint),
        Ok(Err(e)) if e.is_key_not_found() => AgentStatus::leader(endpoint),
        Ok(Err(AgencyError::Redirect {
            location: Some(location),
        })) => AgentStatus::follower(location),
        Ok(Err(e)) => {
            debug!(endpoint = %endpoint, error = %e, "Agent gave an unexpected answer");
            AgentStatus::not_responding()
        }
        Err(_) => {
            debug!(endpoint = %endpoint, "Agent did not answer in time");
            AgentStatus::not_responding()
        }
    }
}

/// Judge probe results. `endpoints[i]` names the member behind `statuses[i]`.
///
/// Responsiveness is checked for all members first, so an unresponsive
/// member is reported regardless of what the others answered.
pub fn evaluate_statuses(
    statuses: &[AgentStatus],
    endpoints: &[String],
) -> Result<(), HealthError> {
    if let Some(i) = statuses.iter().position(|s| !s.is_responding) {
        return Err(HealthError::NotResponding {
            endpoint: endpoints.get(i).cloned().unwrap_or_default(),
        });
    }
    for pair in statuses.windows(2) {
        if !is_same_endpoint(&pair[0].leader_endpoint, &pair[1].leader_endpoint) {
            return Err(HealthError::LeadersDisagree {
                expected: pair[0].leader_endpoint.clone(),
                actual: pair[1].leader_endpoint.clone(),
            });
        }
    }
    let leaders = statuses.iter().filter(|s| s.is_leader).count();
    if leaders != 1 {
        return Err(HealthError::UnexpectedLeaderCount { count: leaders });
    }
    Ok(())
}

/// Check that `members` form a healthy agency with a single leader.
///
/// All members are probed concurrently; each probe is bounded by `timeout`.
pub async fn check_agency_health(
    members: &[Arc<dyn AgencyApi>],
    timeout: Duration,
) -> Result<(), HealthError> {
    let statuses = join_all(members.iter().map(|m| probe_agent(m.as_ref(), timeout))).await;
    let endpoints: Vec<String> = members.iter().map(|m| m.endpoints().join(",")).collect();
    let result = evaluate_statuses(&statuses, &endpoints);
    if let Err(e) = &result {
        warn!(error = %e, members = members.len(), "Agency is not healthy");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("http://10.0.0.{}:8529", i + 1)).collect()
    }

    #[test]
    fn test_one_leader_two_followers_is_healthy() {
        let statuses = vec![
            AgentStatus::leader("http://10.0.0.1:8529".to_string()),
            AgentStatus::follower("http://10.0.0.1:8529/_api/agency/read".to_string()),
            AgentStatus::follower("tcp://10.0.0.1:8529".to_string()),
        ];
        assert_eq!(evaluate_statuses(&statuses, &endpoints(3)), Ok(()));
    }

    #[test]
    fn test_follower_pointing_elsewhere_disagrees() {
        let statuses = vec![
            AgentStatus::leader("http://10.0.0.1:8529".to_string()),
            AgentStatus::follower("http://10.0.0.1:8529".to_string()),
            AgentStatus::follower("http://10.0.0.9:8529".to_string()),
        ];
        assert!(matches!(
            evaluate_statuses(&statuses, &endpoints(3)),
            Err(HealthError::LeadersDisagree { .. })
        ));
    }

    #[test]
    fn test_unresponsive_member_named_regardless_of_others() {
        let statuses = vec![
            AgentStatus::leader("http://10.0.0.1:8529".to_string()),
            AgentStatus::follower("http://10.0.0.7:8529".to_string()),
            AgentStatus::not_responding(),
        ];
        assert_eq!(
            evaluate_statuses(&statuses, &endpoints(3)),
            Err(HealthError::NotResponding {
                endpoint: "http://10.0.0.3:8529".to_string()
            })
        );
    }

    #[test]
    fn test_no_leader_is_unhealthy() {
        let statuses = vec![
            AgentStatus::follower("http://10.0.0.1:8529".to_string()),
            AgentStatus::follower("http://10.0.0.1:8529".to_string()),
        ];
        assert_eq!(
            evaluate_statuses(&statuses, &endpoints(2)),
            Err(HealthError::UnexpectedLeaderCount { count: 0 })
        );
    }

    #[test]
    fn test_empty_member_list_has_no_leader() {
        assert_eq!(
            evaluate_statuses(&[], &[]),
            Err(HealthError::UnexpectedLeaderCount { count: 0 })
        );
    }
}
