//! Peer registry and port assignment.
//!
//! Every server port is derived from one shared base port:
//! `base_port + peer.port_offset + role.port_offset()`. Peers are spaced by
//! [`PORT_OFFSET_INCREMENT`], leaving slot 0 for the starter's control API
//! and slot 4 free for future roles. Offsets never exceed [`MAX_PORT_OFFSET`],
//! so any base port up to `u16::MAX - MAX_PORT_SPAN` yields valid ports.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use dbstarter_client::{PeerEntry, PeerList};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::PeersError;

pub const PORT_OFFSET_AGENT: u16 = 1;
pub const PORT_OFFSET_COORDINATOR: u16 = 2;
pub const PORT_OFFSET_DBSERVER: u16 = 3;
/// {control API, agent, coordinator, dbserver, reserved}
pub const PORT_OFFSET_INCREMENT: u16 = 5;
/// Starters per host (or per cluster, with unique offsets).
pub const MAX_PEERS_PER_HOST: u16 = 64;
pub const MAX_PORT_OFFSET: u16 = (MAX_PEERS_PER_HOST - 1) * PORT_OFFSET_INCREMENT;
/// Distance from the base port to the highest derived port.
pub const MAX_PORT_SPAN: u16 = MAX_PORT_OFFSET + PORT_OFFSET_DBSERVER;

/// A server role managed by the starter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    Agent,
    DbServer,
    Coordinator,
}

impl ServerRole {
    /// All roles in start order.
    pub const ALL: [ServerRole; 3] = [
        ServerRole::Agent,
        ServerRole::DbServer,
        ServerRole::Coordinator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerRole::Agent => "agent",
            ServerRole::DbServer => "dbserver",
            ServerRole::Coordinator => "coordinator",
        }
    }

    /// Offset of this role's port relative to the peer's port base.
    pub fn port_offset(&self) -> u16 {
        match self {
            ServerRole::Agent => PORT_OFFSET_AGENT,
            ServerRole::DbServer => PORT_OFFSET_DBSERVER,
            ServerRole::Coordinator => PORT_OFFSET_COORDINATOR,
        }
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One participating starter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub address: String,
    pub port_offset: u16,
    pub data_dir: String,
    pub has_agent: bool,
    pub has_dbserver: bool,
    pub has_coordinator: bool,
}

impl Peer {
    /// Listening port of `role` on this peer, whether or not the peer runs it.
    ///
    /// Saturates at `u16::MAX`; base ports accepted by
    /// [`ServiceConfig::validate`](crate::ServiceConfig::validate) never do.
    pub fn port(&self, base_port: u16, role: ServerRole) -> u16 {
        self.control_port(base_port).saturating_add(role.port_offset())
    }

    /// Port of this peer's control API.
    pub fn control_port(&self, base_port: u16) -> u16 {
        base_port.saturating_add(self.port_offset)
    }

    /// `tcp://` endpoint of `role` on this peer, as passed to servers.
    pub fn tcp_endpoint(&self, base_port: u16, role: ServerRole) -> String {
        format!("tcp://{}:{}", self.address, self.port(base_port, role))
    }

    /// `http://` endpoint of `role` on this peer, as used by clients.
    pub fn http_endpoint(&self, base_port: u16, role: ServerRole) -> String {
        format!("http://{}:{}", self.address, self.port(base_port, role))
    }
}

impl From<PeerEntry> for Peer {
    fn from(e: PeerEntry) -> Self {
        Self {
            id: e.id,
            address: e.address,
            port_offset: e.port_offset,
            data_dir: e.data_dir,
            has_agent: e.has_agent,
            has_dbserver: e.has_dbserver,
            has_coordinator: e.has_coordinator,
        }
    }
}

impl From<&Peer> for PeerEntry {
    fn from(p: &Peer) -> Self {
        Self {
            id: p.id.clone(),
            address: p.address.clone(),
            port_offset: p.port_offset,
            data_dir: p.data_dir.clone(),
            has_agent: p.has_agent,
            has_dbserver: p.has_dbserver,
            has_coordinator: p.has_coordinator,
        }
    }
}

/// Registration data of a starter asking to join.
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: String,
    pub address: String,
    pub data_dir: String,
    pub has_dbserver: bool,
    pub has_coordinator: bool,
}

/// Ordered set of peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peers {
    peers: Vec<Peer>,
    agency_size: usize,
    all_port_offsets_unique: bool,
}

impl Peers {
    pub fn new(agency_size: usize, all_port_offsets_unique: bool) -> Self {
        Self {
            peers: Vec::new(),
            agency_size,
            all_port_offsets_unique,
        }
    }

    pub fn agency_size(&self) -> usize {
        self.agency_size
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    /// Append a peer as-is.
    pub fn add_peer(&mut self, peer: Peer) {
        self.peers.push(peer);
    }

    pub fn peer_by_id(&self, id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// The first `agency_size` agency participants, in registration order.
    pub fn agent_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers
            .iter()
            .filter(|p| p.has_agent)
            .take(self.agency_size)
    }

    /// Replace the address of a known peer. Returns false for unknown ids.
    pub fn set_address(&mut self, id: &str, address: &str) -> bool {
        match self.peers.iter_mut().find(|p| p.id == id) {
            Some(peer) => {
                peer.address = address.to_string();
                true
            }
            None => false,
        }
    }

    /// Whether the peer with `id` runs an agent.
    pub fn needs_agent(&self, id: &str) -> bool {
        self.agent_peers().any(|p| p.id == id)
    }

    /// Whether enough agency participants have joined.
    pub fn is_complete(&self) -> bool {
        self.agent_peers().count() >= self.agency_size
    }

    /// `http://` endpoints of all agents.
    pub fn agency_endpoints(&self, base_port: u16) -> Vec<String> {
        self.agent_peers()
            .map(|p| p.http_endpoint(base_port, ServerRole::Agent))
            .collect()
    }

    /// Add a joining starter, or return its entry if it is already known.
    ///
    /// New peers get the lowest free port offset (per normalized host, or
    /// across all peers with `all_port_offsets_unique`) and join the agency
    /// while it is not yet full. Fails once all [`MAX_PEERS_PER_HOST`]
    /// offsets are taken.
    pub fn register(&mut self, reg: Registration) -> Result<Peer, PeersError> {
        if let Some(existing) = self.peer_by_id(&reg.id) {
            return Ok(existing.clone());
        }

        let host = normalize_host(&reg.address);
        let used: HashSet<u16> = self
            .peers
            .iter()
            .filter(|p| self.all_port_offsets_unique || normalize_host(&p.address) == host)
            .map(|p| p.port_offset)
            .collect();
        let port_offset = (0..MAX_PEERS_PER_HOST)
            .map(|slot| slot * PORT_OFFSET_INCREMENT)
            .find(|offset| !used.contains(offset))
            .ok_or(PeersError::NoFreePortOffset { host })?;

        let peer = Peer {
            id: reg.id,
            address: reg.address,
            port_offset,
            data_dir: reg.data_dir,
            has_agent: !self.is_complete(),
            has_dbserver: reg.has_dbserver,
            has_coordinator: reg.has_coordinator,
        };
        self.peers.push(peer.clone());
        Ok(peer)
    }

    /// Wire form of this peer set.
    pub fn to_list(&self) -> PeerList {
        PeerList {
            peers: self.peers.iter().map(PeerEntry::from).collect(),
            agency_size: self.agency_size,
            all_port_offsets_unique: self.all_port_offsets_unique,
        }
    }
}

/// Peer sets received from other starters or read from disk; offsets beyond
/// [`MAX_PORT_OFFSET`] are rejected.
impl TryFrom<PeerList> for Peers {
    type Error = PeersError;

    fn try_from(list: PeerList) -> Result<Self, Self::Error> {
        if let Some(e) = list.peers.iter().find(|e| e.port_offset > MAX_PORT_OFFSET) {
            return Err(PeersError::PortOffsetOutOfRange {
                id: e.id.clone(),
                port_offset: e.port_offset,
            });
        }
        Ok(Self {
            peers: list.peers.into_iter().map(Peer::from).collect(),
            agency_size: list.agency_size,
            all_port_offsets_unique: list.all_port_offsets_unique,
        })
    }
}

/// Host part of an address, with loopback spellings folded to `127.0.0.1`.
pub fn normalize_host(address: &str) -> String {
    let host = match address.parse::<std::net::SocketAddr>() {
        Ok(sa) => sa.ip().to_string(),
        Err(_) => address.split(':').next().unwrap_or_default().to_string(),
    };
    match host.parse::<IpAddr>() {
        Ok(ip) if ip.is_loopback() => "127.0.0.1".to_string(),
        Ok(_) => host,
        Err(_) if host == "localhost" => "127.0.0.1".to_string(),
        Err(_) => host,
    }
}

/// Whether two endpoints refer to the same server.
///
/// Equal when literally identical, or when both parse as URLs with the same
/// hostname. Scheme and port are ignored: a leader redirect may name the
/// leader with a different scheme or port than the one used to reach it.
pub fn is_same_endpoint(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (Url::parse(a), Url::parse(b)) {
        (Ok(ua), Ok(ub)) => ua.host_str().is_some() && ua.host_str() == ub.host_str(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(id: &str, address: &str) -> Registration {
        Registration {
            id: id.to_string(),
            address: address.to_string(),
            data_dir: format!("/data/{id}"),
            has_dbserver: true,
            has_coordinator: true,
        }
    }

    #[test]
    fn test_port_derivation_for_agency_of_three() {
        let mut peers = Peers::new(3, false);
        let hosts = [
            ("a", "10.0.0.1"),
            ("b", "10.0.0.2"),
            ("c", "10.0.0.3"),
            ("d", "10.0.0.4"),
        ];
        for (id, host) in hosts {
            peers.register(reg(id, host)).unwrap();
        }

        let agents: Vec<_> = peers.agent_peers().map(|p| p.id.as_str()).collect();
        assert_eq!(agents, vec!["a", "b", "c"]);
        for p in peers.agent_peers() {
            assert_eq!(p.port(8528, ServerRole::Agent), 8528 + p.port_offset + 1);
        }
        for p in peers.iter() {
            assert_eq!(p.port(8528, ServerRole::Coordinator), 8528 + p.port_offset + 2);
            assert_eq!(p.port(8528, ServerRole::DbServer), 8528 + p.port_offset + 3);
        }
        assert!(!peers.needs_agent("d"));
        assert!(peers.needs_agent("a"));
    }

    #[test]
    fn test_offsets_unique_per_host() {
        let mut peers = Peers::new(3, false);
        let a = peers.register(reg("a", "localhost")).unwrap();
        let b = peers.register(reg("b", "127.0.0.1")).unwrap();
        let c = peers.register(reg("c", "127.0.0.1:8600")).unwrap();
        let d = peers.register(reg("d", "10.0.0.9")).unwrap();

        assert_eq!(a.port_offset, 0);
        assert_eq!(b.port_offset, 5);
        assert_eq!(c.port_offset, 10);
        assert_eq!(d.port_offset, 0);
    }

    #[test]
    fn test_offsets_unique_globally_when_configured() {
        let mut peers = Peers::new(3, true);
        let a = peers.register(reg("a", "10.0.0.1")).unwrap();
        let b = peers.register(reg("b", "10.0.0.2")).unwrap();
        assert_eq!(a.port_offset, 0);
        assert_eq!(b.port_offset, 5);
    }

    #[test]
    fn test_register_known_id_is_idempotent() {
        let mut peers = Peers::new(3, false);
        let first = peers.register(reg("a", "10.0.0.1")).unwrap();
        let again = peers.register(reg("a", "10.0.0.1")).unwrap();
        assert_eq!(first, again);
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn test_agency_fills_then_completes() {
        let mut peers = Peers::new(2, false);
        assert!(!peers.is_complete());
        peers.register(reg("a", "h1")).unwrap();
        assert!(!peers.is_complete());
        peers.register(reg("b", "h2")).unwrap();
        assert!(peers.is_complete());
        let c = peers.register(reg("c", "h3")).unwrap();
        assert!(!c.has_agent);
        assert_eq!(
            peers.agency_endpoints(8528),
            vec!["http://h1:8529".to_string(), "http://h2:8529".to_string()]
        );
    }

    #[test]
    fn test_peer_list_conversion_keeps_order() {
        let mut peers = Peers::new(1, false);
        peers.register(reg("a", "h1")).unwrap();
        peers.register(reg("b", "h2")).unwrap();
        let back = Peers::try_from(peers.to_list()).unwrap();
        assert_eq!(back, peers);
    }

    #[test]
    fn test_port_offsets_run_out_per_host() {
        let mut peers = Peers::new(1, false);
        for i in 0..MAX_PEERS_PER_HOST {
            let p = peers.register(reg(&format!("p{i}"), "10.0.0.1")).unwrap();
            assert!(p.port_offset <= MAX_PORT_OFFSET);
        }
        let err = peers.register(reg("late", "10.0.0.1")).unwrap_err();
        assert_eq!(
            err,
            PeersError::NoFreePortOffset {
                host: "10.0.0.1".to_string()
            }
        );
        // Other hosts still have room.
        assert_eq!(peers.register(reg("far", "10.0.0.2")).unwrap().port_offset, 0);
    }

    #[test]
    fn test_highest_ports_fit_below_u16_max() {
        let base = u16::MAX - MAX_PORT_SPAN;
        let mut peers = Peers::new(1, true);
        let mut last = None;
        for i in 0..MAX_PEERS_PER_HOST {
            last = Some(peers.register(reg(&format!("p{i}"), "10.0.0.1")).unwrap());
        }
        let last = last.unwrap();
        assert_eq!(last.port_offset, MAX_PORT_OFFSET);
        assert_eq!(last.port(base, ServerRole::DbServer), u16::MAX);
        assert_eq!(last.port(base, ServerRole::Agent), u16::MAX - 2);
    }

    #[test]
    fn test_port_saturates_instead_of_overflowing() {
        let mut peers = Peers::new(1, false);
        peers.register(reg("a", "10.0.0.1")).unwrap();
        let b = peers.register(reg("b", "10.0.0.1")).unwrap();
        assert_eq!(b.port(65530, ServerRole::DbServer), u16::MAX);
    }

    #[test]
    fn test_peer_list_with_oversized_offset_is_rejected() {
        let mut peers = Peers::new(1, false);
        peers.register(reg("a", "h1")).unwrap();
        let mut list = peers.to_list();
        list.peers[0].port_offset = MAX_PORT_OFFSET + PORT_OFFSET_INCREMENT;
        assert!(matches!(
            Peers::try_from(list),
            Err(PeersError::PortOffsetOutOfRange { .. })
        ));
    }

    #[test]
    fn test_set_address_of_known_peer() {
        let mut peers = Peers::new(1, false);
        peers.register(reg("a", "127.0.0.1")).unwrap();
        assert!(peers.set_address("a", "10.0.0.5"));
        assert_eq!(peers.peer_by_id("a").unwrap().address, "10.0.0.5");
        assert!(!peers.set_address("zz", "10.0.0.6"));
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("localhost"), "127.0.0.1");
        assert_eq!(normalize_host("localhost:8528"), "127.0.0.1");
        assert_eq!(normalize_host("127.0.0.2:9000"), "127.0.0.1");
        assert_eq!(normalize_host("10.1.2.3:8528"), "10.1.2.3");
        assert_eq!(normalize_host("db1.example.com"), "db1.example.com");
    }

    #[test]
    fn test_same_endpoint_literal() {
        assert!(is_same_endpoint("tcp://h1:8531", "tcp://h1:8531"));
        assert!(is_same_endpoint("not a url", "not a url"));
    }

    #[test]
    fn test_same_endpoint_ignores_scheme_and_port() {
        assert!(is_same_endpoint("http://10.0.0.1:8531", "tcp://10.0.0.1:4001"));
        assert!(is_same_endpoint("https://db1:8531", "http://db1"));
    }

    #[test]
    fn test_different_host_is_different_endpoint() {
        assert!(!is_same_endpoint("http://10.0.0.1:8531", "http://10.0.0.2:8531"));
        assert!(!is_same_endpoint("not a url", "http://10.0.0.2:8531"));
    }

    #[test]
    fn test_role_names_and_offsets() {
        assert_eq!(ServerRole::Agent.to_string(), "agent");
        assert_eq!(ServerRole::DbServer.port_offset(), 3);
        assert_eq!(ServerRole::Coordinator.port_offset(), 2);
    }
}
