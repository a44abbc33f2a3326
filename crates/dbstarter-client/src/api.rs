//! Request and response bodies of the control API.

use serde::{Deserialize, Serialize};

/// One peer as exchanged between starters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: String,
    pub address: String,
    pub port_offset: u16,
    pub data_dir: String,
    pub has_agent: bool,
    pub has_dbserver: bool,
    pub has_coordinator: bool,
}

/// The current peer set, as served by `GET /hello` and `POST /hello`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerList {
    pub peers: Vec<PeerEntry>,
    pub agency_size: usize,
    #[serde(default)]
    pub all_port_offsets_unique: bool,
}

/// Registration request sent by a joining starter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRequest {
    pub slave_id: String,
    /// Address the master can reach the joining starter on; empty means
    /// "use the address the request came from".
    #[serde(default)]
    pub slave_address: String,
    pub slave_port: u16,
    pub data_dir: String,
    #[serde(default = "default_true")]
    pub start_dbserver: bool,
    #[serde(default = "default_true")]
    pub start_coordinator: bool,
}

fn default_true() -> bool {
    true
}

/// Response of `GET /id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdInfo {
    pub id: String,
}

/// One server managed by a starter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerProcess {
    /// `agent`, `dbserver` or `coordinator`
    pub role: String,
    pub address: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub container_id: Option<String>,
}

/// Response of `GET /process`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessList {
    pub servers: Vec<ServerProcess>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_request_defaults_role_flags() {
        let req: HelloRequest = serde_json::from_str(
            r#"{"slave_id": "b1", "slave_port": 8528, "data_dir": "/data"}"#,
        )
        .unwrap();
        assert!(req.start_dbserver);
        assert!(req.start_coordinator);
        assert!(req.slave_address.is_empty());
    }

    #[test]
    fn test_peer_list_without_uniqueness_flag() {
        let list: PeerList = serde_json::from_str(r#"{"peers": [], "agency_size": 3}"#).unwrap();
        assert!(!list.all_port_offsets_unique);
        assert_eq!(list.agency_size, 3);
    }
}
