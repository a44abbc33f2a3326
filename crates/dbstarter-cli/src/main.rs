//! dbstarter - bootstrap and supervise a database cluster
//!
//! ## Commands
//!
//! - `run`: start this peer (master, or joining with `--join`)
//! - `agency-health`: check that the agency has exactly one leader
//! - `status`: show the peer set and servers of a running starter
//! - `stop`: ask a running starter to shut down

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use dbstarter_client::ControlClient;
use dbstarter_core::agency::{check_agency_health, AgencyApi, HttpAgency, MAX_AGENT_RESPONSE_TIME};
use dbstarter_core::config::DEFAULT_MASTER_PORT;
use dbstarter_core::{init_tracing, DockerSettings, Service, ServiceConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "dbstarter")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Bootstrap and supervise a database cluster", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true, env = "DBSTARTER_VERBOSE")]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true, env = "DBSTARTER_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start this peer and supervise its servers until stopped
    Run(RunArgs),

    /// Check the agency for a single agreed-upon leader
    AgencyHealth {
        /// Agent endpoints, e.g. http://10.0.0.1:8529 (comma separated)
        #[arg(
            long = "endpoint",
            required = true,
            value_delimiter = ',',
            env = "DBSTARTER_AGENCY_ENDPOINTS"
        )]
        endpoints: Vec<String>,

        /// Secret used to sign agency requests
        #[arg(long, env = "DBSTARTER_JWT_SECRET")]
        jwt_secret: Option<String>,
    },

    /// Show peers and servers of a running starter
    Status {
        /// Control API endpoint of the starter
        #[arg(long, default_value = "http://127.0.0.1:8528", env = "DBSTARTER_ENDPOINT")]
        endpoint: String,
    },

    /// Stop a running starter
    Stop {
        /// Control API endpoint of the starter
        #[arg(long, default_value = "http://127.0.0.1:8528", env = "DBSTARTER_ENDPOINT")]
        endpoint: String,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Unique id of this peer (generated, or taken from setup.json, when empty)
    #[arg(long, default_value = "", env = "DBSTARTER_ID")]
    id: String,

    /// Number of agents in the agency
    #[arg(long, default_value_t = 3, env = "DBSTARTER_AGENCY_SIZE")]
    agency_size: usize,

    /// Address of the master starter; omit to become the master
    #[arg(long = "join", env = "DBSTARTER_JOIN")]
    master_address: Option<String>,

    /// Base port shared by all peers
    #[arg(long, default_value_t = DEFAULT_MASTER_PORT, env = "DBSTARTER_MASTER_PORT")]
    master_port: u16,

    /// Address other peers reach this starter on; learned from peers when empty
    #[arg(long, default_value = "", env = "DBSTARTER_OWN_ADDRESS")]
    own_address: String,

    /// Directory holding the per-server data directories and setup.json
    #[arg(long, default_value = ".", env = "DBSTARTER_DATA_DIR")]
    data_dir: PathBuf,

    /// Database server executable
    #[arg(long, default_value = "/usr/sbin/arangod", env = "DBSTARTER_ARANGOD")]
    arangod: String,

    /// JavaScript startup directory of the database server
    #[arg(long, default_value = "/usr/share/arangodb3/js", env = "DBSTARTER_JS_DIR")]
    js_dir: String,

    /// Run a coordinator on this peer
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        env = "DBSTARTER_START_COORDINATOR"
    )]
    start_coordinator: bool,

    /// Run a dbserver on this peer
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "DBSTARTER_START_DBSERVER")]
    start_dbserver: bool,

    /// Value of --server.threads passed to every server
    #[arg(long, env = "DBSTARTER_SERVER_THREADS")]
    server_threads: Option<u32>,

    /// Record every server with this rr binary
    #[arg(long, env = "DBSTARTER_RR")]
    rr: Option<String>,

    /// Make port offsets unique across all peers, not only per host
    #[arg(long, env = "DBSTARTER_ALL_PORT_OFFSETS_UNIQUE")]
    all_port_offsets_unique: bool,

    /// Secret used for the readiness probe and agency requests
    #[arg(long, env = "DBSTARTER_JWT_SECRET")]
    jwt_secret: Option<String>,

    /// Docker endpoint; together with --docker-image selects the container backend
    #[arg(long, default_value = "", env = "DBSTARTER_DOCKER_ENDPOINT")]
    docker_endpoint: String,

    /// Database image to run servers from
    #[arg(long, default_value = "", env = "DBSTARTER_DOCKER_IMAGE")]
    docker_image: String,

    /// User to run containers as
    #[arg(long, env = "DBSTARTER_DOCKER_USER")]
    docker_user: Option<String>,

    /// Name of the container this starter runs in
    #[arg(long, env = "DBSTARTER_DOCKER_CONTAINER")]
    docker_container: Option<String>,

    /// Seconds to keep exited containers before removal
    #[arg(long, default_value_t = 60, env = "DBSTARTER_DOCKER_GC_DELAY")]
    docker_gc_delay: u64,

    /// Run containers with host networking
    #[arg(long, env = "DBSTARTER_DOCKER_NET_HOST")]
    docker_net_host: bool,

    /// Run containers privileged
    #[arg(long, env = "DBSTARTER_DOCKER_PRIVILEGED")]
    docker_privileged: bool,

    /// This starter itself runs inside a container
    #[arg(long, env = "DBSTARTER_RUNNING_IN_DOCKER")]
    running_in_docker: bool,
}

impl RunArgs {
    fn into_config(self, verbose: bool) -> ServiceConfig {
        ServiceConfig {
            id: self.id,
            agency_size: self.agency_size,
            arangod_executable: self.arangod,
            js_startup_dir: self.js_dir,
            master_port: self.master_port,
            rr_path: self.rr,
            start_coordinator: self.start_coordinator,
            start_dbserver: self.start_dbserver,
            data_dir: self.data_dir,
            own_address: self.own_address,
            master_address: self.master_address,
            verbose,
            server_threads: self.server_threads,
            all_port_offsets_unique: self.all_port_offsets_unique,
            docker: DockerSettings {
                container: self.docker_container,
                endpoint: self.docker_endpoint,
                image: self.docker_image,
                user: self.docker_user,
                gc_delay: Duration::from_secs(self.docker_gc_delay),
                net_host: self.docker_net_host,
                privileged: self.docker_privileged,
            },
            running_in_docker: self.running_in_docker,
            jwt_secret: self.jwt_secret,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    match cli.command {
        Commands::Run(args) => cmd_run(args.into_config(cli.verbose)).await,
        Commands::AgencyHealth {
            endpoints,
            jwt_secret,
        } => cmd_agency_health(&endpoints, jwt_secret.as_deref()).await,
        Commands::Status { endpoint } => cmd_status(&endpoint).await,
        Commands::Stop { endpoint } => cmd_stop(&endpoint).await,
    }
}

/// Run this peer until Ctrl-C, `POST /shutdown`, or a role is given up.
async fn cmd_run(config: ServiceConfig) -> Result<()> {
    let root = CancellationToken::new();
    let service = Service::new(config, root.clone()).context("Invalid configuration")?;
    info!(
        id = %service.config().id,
        relaunch = service.is_relaunch(),
        "Starting dbstarter"
    );

    let signal_root = root.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt, shutting down");
                signal_root.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for interrupt"),
        }
    });

    service.run().await.context("dbstarter stopped with an error")?;
    info!("dbstarter stopped");
    Ok(())
}

async fn cmd_agency_health(endpoints: &[String], jwt_secret: Option<&str>) -> Result<()> {
    let mut members: Vec<Arc<dyn AgencyApi>> = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        let agency = HttpAgency::new(vec![endpoint.clone()], jwt_secret)
            .with_context(|| format!("Failed to create agency client for {endpoint}"))?;
        members.push(Arc::new(agency));
    }

    match check_agency_health(&members, MAX_AGENT_RESPONSE_TIME).await {
        Ok(()) => {
            println!("Agency healthy ({} agents)", endpoints.len());
            Ok(())
        }
        Err(e) => bail!("Agency unhealthy: {e}"),
    }
}

async fn cmd_status(endpoint: &str) -> Result<()> {
    let client = ControlClient::new(endpoint)?;
    let id = client.id().await.context("Failed to reach starter")?;
    let peers = client.peers().await?;
    let processes = client.processes().await?;

    println!("Starter {} at {}", id.id, client.endpoint());
    println!();
    println!("Peers (agency size {}):", peers.agency_size);
    for peer in &peers.peers {
        let marker = if peer.id == id.id { "*" } else { " " };
        println!(
            "{} {:<10} {:<16} offset={:<3} agent={} dbserver={} coordinator={}",
            marker,
            peer.id,
            peer.address,
            peer.port_offset,
            peer.has_agent,
            peer.has_dbserver,
            peer.has_coordinator
        );
    }

    println!();
    if processes.servers.is_empty() {
        println!("No servers running");
    } else {
        println!("Servers:");
        for server in &processes.servers {
            let owner = match (&server.container_id, server.pid) {
                (Some(container), _) => format!("container={container}"),
                (None, Some(pid)) => format!("pid={pid}"),
                (None, None) => "-".to_string(),
            };
            println!(
                "  {:<12} {}:{} {}",
                server.role, server.address, server.port, owner
            );
        }
    }
    Ok(())
}

async fn cmd_stop(endpoint: &str) -> Result<()> {
    let client = ControlClient::new(endpoint)?;
    client
        .shutdown()
        .await
        .with_context(|| format!("Failed to stop starter at {endpoint}"))?;
    println!("Shutdown requested");
    Ok(())
}
