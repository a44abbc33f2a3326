//! Command line of a database server instance.

use std::path::Path;

use crate::config::ServiceConfig;
use crate::conffile::CONF_FILE_NAME;
use crate::peers::{Peer, Peers, ServerRole};

/// Paths are passed to servers with forward slashes on every platform.
fn slashed(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Full argv (including the executable, and the rr prefix when configured)
/// for running `role` of `me`. `container_dir` is the host directory as
/// seen by the instance.
pub fn build_server_args(
    config: &ServiceConfig,
    peers: &Peers,
    me: &Peer,
    role: ServerRole,
    container_dir: &Path,
) -> Vec<String> {
    let port = me.port(config.master_port, role);
    let my_endpoint = format!("tcp://{}:{}", me.address, port);

    let mut args: Vec<String> = Vec::with_capacity(40);
    if let Some(rr) = &config.rr_path {
        args.push(rr.clone());
    }
    args.push(config.arangod_executable.clone());
    push_pairs(
        &mut args,
        [
            ("-c", slashed(&container_dir.join(CONF_FILE_NAME))),
            ("--database.directory", slashed(&container_dir.join("data"))),
            (
                "--javascript.startup-directory",
                slashed(Path::new(&config.js_startup_dir)),
            ),
            ("--javascript.app-path", slashed(&container_dir.join("apps"))),
            ("--log.file", slashed(&container_dir.join("arangod.log"))),
            ("--log.force-direct", "false".to_string()),
        ],
    );
    if let Some(threads) = config.server_threads {
        push_pairs(&mut args, [("--server.threads", threads.to_string())]);
    }

    match role {
        ServerRole::Agent => {
            push_pairs(
                &mut args,
                [
                    ("--agency.activate", "true".to_string()),
                    ("--agency.my-address", my_endpoint),
                    ("--agency.size", config.agency_size.to_string()),
                    ("--agency.supervision", "true".to_string()),
                    ("--foxx.queues", "false".to_string()),
                    ("--server.statistics", "false".to_string()),
                ],
            );
            for p in peers.agent_peers().filter(|p| p.id != me.id) {
                push_pairs(
                    &mut args,
                    [(
                        "--agency.endpoint",
                        p.tcp_endpoint(config.master_port, ServerRole::Agent),
                    )],
                );
            }
        }
        ServerRole::DbServer | ServerRole::Coordinator => {
            let (cluster_role, foxx_queues) = match role {
                ServerRole::Coordinator => ("COORDINATOR", "true"),
                _ => ("PRIMARY", "false"),
            };
            push_pairs(
                &mut args,
                [
                    ("--cluster.my-address", my_endpoint.clone()),
                    ("--cluster.my-role", cluster_role.to_string()),
                    ("--cluster.my-local-info", my_endpoint),
                    ("--foxx.queues", foxx_queues.to_string()),
                    ("--server.statistics", "true".to_string()),
                ],
            );
            for p in peers.agent_peers() {
                push_pairs(
                    &mut args,
                    [(
                        "--cluster.agency-endpoint",
                        p.tcp_endpoint(config.master_port, ServerRole::Agent),
                    )],
                );
            }
        }
    }
    args
}

fn push_pairs<const N: usize>(args: &mut Vec<String>, pairs: [(&str, String); N]) {
    for (flag, value) in pairs {
        args.push(flag.to_string());
        args.push(value);
    }
}

/// Instance name: `[<container>-]<role>-<id>-<restart>-<host>-<port>`.
pub fn instance_name(
    config: &ServiceConfig,
    role: ServerRole,
    restart: u32,
    host: &str,
    port: u16,
) -> String {
    format!(
        "{}{}-{}-{}-{}-{}",
        config.instance_name_prefix(),
        role,
        config.id,
        restart,
        host,
        port
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::Registration;

    fn cluster() -> (ServiceConfig, Peers) {
        let config = ServiceConfig {
            id: "aaaa0001".to_string(),
            agency_size: 3,
            ..Default::default()
        };
        let mut peers = Peers::new(3, false);
        for (id, host) in [
            ("aaaa0001", "10.0.0.1"),
            ("bbbb0002", "10.0.0.2"),
            ("cccc0003", "10.0.0.3"),
        ] {
            peers
                .register(Registration {
                    id: id.to_string(),
                    address: host.to_string(),
                    data_dir: "/data".to_string(),
                    has_dbserver: true,
                    has_coordinator: true,
                })
                .unwrap();
        }
        (config, peers)
    }

    fn value_of<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn test_agent_args_list_other_agents() {
        let (config, peers) = cluster();
        let me = peers.peer_by_id("aaaa0001").unwrap();
        let args = build_server_args(
            &config,
            &peers,
            me,
            ServerRole::Agent,
            Path::new("/data/agent8529"),
        );

        assert_eq!(args[0], "/usr/sbin/arangod");
        assert_eq!(value_of(&args, "-c"), vec!["/data/agent8529/arangod.conf"]);
        assert_eq!(value_of(&args, "--agency.my-address"), vec!["tcp://10.0.0.1:8529"]);
        assert_eq!(value_of(&args, "--agency.size"), vec!["3"]);
        assert_eq!(
            value_of(&args, "--agency.endpoint"),
            vec!["tcp://10.0.0.2:8529", "tcp://10.0.0.3:8529"]
        );
        assert!(value_of(&args, "--cluster.agency-endpoint").is_empty());
        assert!(value_of(&args, "--server.threads").is_empty());
    }

    #[test]
    fn test_coordinator_args_list_all_agents() {
        let (config, peers) = cluster();
        let me = peers.peer_by_id("bbbb0002").unwrap();
        let args = build_server_args(
            &config,
            &peers,
            me,
            ServerRole::Coordinator,
            Path::new("/data/coordinator8530"),
        );

        assert_eq!(value_of(&args, "--cluster.my-role"), vec!["COORDINATOR"]);
        assert_eq!(value_of(&args, "--cluster.my-address"), vec!["tcp://10.0.0.2:8530"]);
        assert_eq!(value_of(&args, "--foxx.queues"), vec!["true"]);
        assert_eq!(value_of(&args, "--cluster.agency-endpoint").len(), 3);
    }

    #[test]
    fn test_dbserver_args_with_rr_and_threads() {
        let (mut config, peers) = cluster();
        config.rr_path = Some("/usr/bin/rr".to_string());
        config.server_threads = Some(12);
        let me = peers.peer_by_id("cccc0003").unwrap();
        let args = build_server_args(
            &config,
            &peers,
            me,
            ServerRole::DbServer,
            Path::new("/data/dbserver8531"),
        );

        assert_eq!(args[0], "/usr/bin/rr");
        assert_eq!(args[1], "/usr/sbin/arangod");
        assert_eq!(value_of(&args, "--server.threads"), vec!["12"]);
        assert_eq!(value_of(&args, "--cluster.my-role"), vec!["PRIMARY"]);
        assert_eq!(value_of(&args, "--server.statistics"), vec!["true"]);
    }

    #[test]
    fn test_backslashes_become_forward_slashes() {
        assert_eq!(slashed(Path::new(r"C:\data\agent8529")), "C:/data/agent8529");
    }

    #[test]
    fn test_instance_name() {
        let (mut config, _) = cluster();
        assert_eq!(
            instance_name(&config, ServerRole::Agent, 2, "10.0.0.1", 8529),
            "agent-aaaa0001-2-10.0.0.1-8529"
        );
        config.docker.container = Some("starter".to_string());
        assert_eq!(
            instance_name(&config, ServerRole::DbServer, 0, "10.0.0.1", 8531),
            "starter-dbserver-aaaa0001-0-10.0.0.1-8531"
        );
    }
}
