//! Persisted peer set, used to relaunch without re-registering.

use std::fs;
use std::io;
use std::path::Path;

use dbstarter_client::PeerList;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ServiceError, ServiceResult};

pub const SETUP_FILE_NAME: &str = "setup.json";

/// Contents of `<data_dir>/setup.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupConfig {
    /// Version of the starter that wrote the file.
    pub version: String,
    /// Id of the starter that wrote the file.
    pub id: String,
    pub peers: PeerList,
}

impl SetupConfig {
    pub fn new(id: &str, peers: PeerList) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            id: id.to_string(),
            peers,
        }
    }

    fn knows(&self, id: &str) -> bool {
        self.peers.peers.iter().any(|p| p.id == id)
    }

    /// The id to relaunch as, if this setup can be reused.
    ///
    /// A configured id must be part of the saved peer set; without one the
    /// saved id is taken over.
    pub fn relaunch_id(&self, configured_id: &str) -> Option<String> {
        let id = if configured_id.is_empty() {
            self.id.as_str()
        } else {
            configured_id
        };
        self.knows(id).then(|| id.to_string())
    }
}

/// Write `setup` to `path`, replacing the old file atomically.
pub fn save_setup(path: &Path, setup: &SetupConfig) -> ServiceResult<()> {
    let json = serde_json::to_vec_pretty(setup)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(ServiceError::Setup)?;
    fs::rename(&tmp, path).map_err(ServiceError::Setup)?;
    info!(path = %path.display(), peers = setup.peers.peers.len(), "Saved setup");
    Ok(())
}

/// Read the setup at `path`; `None` when there is none.
pub fn load_setup(path: &Path) -> ServiceResult<Option<SetupConfig>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No setup file");
            return Ok(None);
        }
        Err(e) => return Err(ServiceError::Setup(e)),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}
