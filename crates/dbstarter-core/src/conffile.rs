//! Server configuration and command files.
//!
//! Both files are written at most once per host directory so that manual
//! edits survive restarts.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info};

use crate::peers::ServerRole;

pub const CONF_FILE_NAME: &str = "arangod.conf";
pub const COMMAND_FILE_NAME: &str = "arangod_command.txt";

const LOG_LEVEL: &str = "INFO";

/// Per-role tuning written into a fresh configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleTuning {
    pub threads: u32,
    pub v8_contexts: u32,
}

impl RoleTuning {
    pub fn for_role(role: ServerRole) -> Self {
        match role {
            ServerRole::Agent => Self {
                threads: 8,
                v8_contexts: 1,
            },
            ServerRole::DbServer => Self {
                threads: 4,
                v8_contexts: 4,
            },
            ServerRole::Coordinator => Self {
                threads: 16,
                v8_contexts: 4,
            },
        }
    }
}

/// Render the configuration file for `role` listening on `port`.
pub fn render_conf_file(role: ServerRole, port: u16) -> String {
    let tuning = RoleTuning::for_role(role);
    format!(
        "# ArangoDB configuration file\n\
         #\n\
         # Documentation:\n\
         # https://docs.arangodb.com/Manual/Administration/Configuration/\n\
         #\n\
         \n\
         [server]\n\
         endpoint = tcp://0.0.0.0:{port}\n\
         threads = {threads}\n\
         authentication = false\n\
         \n\
         [log]\n\
         level = {level}\n\
         \n\
         [javascript]\n\
         v8-contexts = {contexts}\n",
        threads = tuning.threads,
        level = LOG_LEVEL,
        contexts = tuning.v8_contexts,
    )
}

/// Write `<host_dir>/arangod.conf` unless it already exists.
///
/// Returns `true` when a new file was written.
pub fn ensure_conf_file(host_dir: &Path, role: ServerRole, port: u16) -> io::Result<bool> {
    let path = host_dir.join(CONF_FILE_NAME);
    if path.exists() {
        debug!(path = %path.display(), "Keeping existing configuration file");
        return Ok(false);
    }
    fs::write(&path, render_conf_file(role, port))?;
    info!(path = %path.display(), role = %role, "Wrote configuration file");
    Ok(true)
}

/// Write the full invocation to `<host_dir>/arangod_command.txt` unless it
/// already exists. Arguments are joined by a backslash line continuation.
pub fn write_command_file(host_dir: &Path, args: &[String]) -> io::Result<bool> {
    let path = host_dir.join(COMMAND_FILE_NAME);
    if path.exists() {
        return Ok(false);
    }
    let content = format!("{}\n", args.join(" \\\n"));
    fs::write(&path, content)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_conf_file_contents() {
        let conf = render_conf_file(ServerRole::Agent, 8529);
        assert!(conf.contains("[server]\nendpoint = tcp://0.0.0.0:8529\nthreads = 8\n"));
        assert!(conf.contains("authentication = false"));
        assert!(conf.contains("[log]\nlevel = INFO\n"));
        assert!(conf.ends_with("[javascript]\nv8-contexts = 1\n"));
    }

    #[test]
    fn test_role_tuning() {
        assert_eq!(
            RoleTuning::for_role(ServerRole::DbServer),
            RoleTuning {
                threads: 4,
                v8_contexts: 4
            }
        );
        assert_eq!(RoleTuning::for_role(ServerRole::Coordinator).threads, 16);
    }

    #[test]
    fn test_conf_file_written_once() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ensure_conf_file(dir.path(), ServerRole::DbServer, 8531).unwrap());
        let first = fs::read(dir.path().join(CONF_FILE_NAME)).unwrap();

        assert!(!ensure_conf_file(dir.path(), ServerRole::Coordinator, 9999).unwrap());
        let second = fs::read(dir.path().join(CONF_FILE_NAME)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_existing_conf_file_is_not_touched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONF_FILE_NAME);
        fs::write(&path, "# hand edited\n").unwrap();
        ensure_conf_file(dir.path(), ServerRole::Agent, 8529).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "# hand edited\n");
    }

    #[test]
    fn test_command_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let args = vec![
            "/usr/sbin/arangod".to_string(),
            "-c".to_string(),
            "/data/arangod.conf".to_string(),
        ];
        assert!(write_command_file(dir.path(), &args).unwrap());
        let content = fs::read_to_string(dir.path().join(COMMAND_FILE_NAME)).unwrap();
        assert_eq!(content, "/usr/sbin/arangod \\\n-c \\\n/data/arangod.conf\n");

        assert!(!write_command_file(dir.path(), &["other".to_string()]).unwrap());
    }
}
