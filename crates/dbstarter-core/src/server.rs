//! Control API of a starter.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/id` | Id of this starter |
//! | `GET` | `/hello` | Current peer set |
//! | `POST` | `/hello` | Register a joining starter (master only) |
//! | `GET` | `/process` | Servers run by this starter |
//! | `POST` | `/shutdown` | Stop this starter |
//! | `GET` | `/agency/health` | Agency quorum health |
//!
//! Errors are returned as `{"Error": "<message>"}` with a matching status.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dbstarter_client::{HelloRequest, IdInfo, PeerList, ProcessList, ServerProcess, StatusError};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agency::{check_agency_health, AgencyApi, HttpAgency, MAX_AGENT_RESPONSE_TIME};
use crate::config::{ServiceConfig, DEFAULT_OWN_ADDRESS};
use crate::peers::{normalize_host, Registration};
use crate::state::{Lifecycle, ServiceState};

/// Shared by all handlers.
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<ServiceConfig>,
    pub state: Arc<ServiceState>,
    /// Cancelled by `POST /shutdown`.
    pub root: CancellationToken,
}

/// A [`StatusError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub StatusError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0.to_response())).into_response()
    }
}

impl From<StatusError> for ApiError {
    fn from(e: StatusError) -> Self {
        Self(e)
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Build the control API router.
pub fn router(api: ApiState) -> Router {
    Router::new()
        .route("/id", get(get_id))
        .route("/hello", get(get_peers).post(post_hello))
        .route("/process", get(get_processes))
        .route("/shutdown", post(post_shutdown))
        .route("/agency/health", get(get_agency_health))
        .with_state(api)
}

/// Serve the control API on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    api: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "Control API listening");
    axum::serve(
        listener,
        router(api).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await
}

/// `GET /id`
async fn get_id(State(api): State<ApiState>) -> Json<IdInfo> {
    Json(IdInfo {
        id: api.config.id.clone(),
    })
}

/// `GET /hello`
async fn get_peers(State(api): State<ApiState>) -> Json<PeerList> {
    Json(api.state.peers().to_list())
}

/// `POST /hello`
async fn post_hello(
    State(api): State<ApiState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<HelloRequest>, JsonRejection>,
) -> ApiResult<PeerList> {
    let Json(req) = body.map_err(|e| StatusError::bad_request(e.body_text()))?;
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    Ok(Json(register_peer(&api, req, remote.ip(), host)?))
}

/// Register a joining starter that connected from `remote` and addressed
/// this starter as `host` (the `Host` header).
///
/// Only the master accepts new peers. Once running, known peers get the
/// final peer set back and unknown ones are refused with 412.
pub fn register_peer(
    api: &ApiState,
    req: HelloRequest,
    remote: IpAddr,
    host: Option<&str>,
) -> Result<PeerList, StatusError> {
    if req.slave_id.is_empty() {
        return Err(StatusError::bad_request("slave_id must be set"));
    }

    match api.state.lifecycle() {
        Lifecycle::Master => {}
        Lifecycle::Running => {
            let peers = api.state.peers();
            return match peers.peer_by_id(&req.slave_id) {
                Some(_) => Ok(peers.to_list()),
                None => Err(StatusError::precondition_failed(
                    "cluster is already running, cannot add new peers",
                )),
            };
        }
        Lifecycle::Start | Lifecycle::Slave | Lifecycle::Stopped => {
            return Err(StatusError::service_unavailable("not a master"));
        }
    }

    if let Some(host) = host {
        learn_own_address(api, host);
    }
    let address = if req.slave_address.is_empty() {
        remote.to_string()
    } else {
        req.slave_address.clone()
    };

    let peers = api.state.peers();
    if peers.peer_by_id(&req.slave_id).is_none() && !api.config.docker.is_configured() {
        let host = normalize_host(&address);
        let clash = peers
            .iter()
            .any(|p| normalize_host(&p.address) == host && p.data_dir == req.data_dir);
        if clash {
            warn!(
                id = %req.slave_id,
                address = %address,
                "Rejecting peer with duplicate data directory"
            );
            return Err(StatusError::bad_request(format!(
                "cannot use same directory as peer on {address}"
            )));
        }
    }

    let peer = api
        .state
        .register(Registration {
            id: req.slave_id.clone(),
            address,
            data_dir: req.data_dir.clone(),
            has_dbserver: req.start_dbserver,
            has_coordinator: req.start_coordinator,
        })
        .map_err(|e| StatusError::precondition_failed(e.to_string()))?;
    info!(
        id = %peer.id,
        address = %peer.address,
        port_offset = peer.port_offset,
        slave_port = req.slave_port,
        has_agent = peer.has_agent,
        "Peer registered"
    );
    Ok(api.state.peers().to_list())
}

/// Replace the placeholder address of a master without a configured own
/// address by the host a joining peer used to reach it.
fn learn_own_address(api: &ApiState, host: &str) {
    if !api.config.own_address.is_empty() {
        return;
    }
    let learned = normalize_host(host);
    if learned.is_empty() || learned == DEFAULT_OWN_ADDRESS {
        return;
    }
    let peers = api.state.peers();
    match peers.peer_by_id(&api.config.id) {
        Some(me) if me.address == DEFAULT_OWN_ADDRESS => {}
        _ => return,
    }
    if api.state.set_peer_address(&api.config.id, &learned) {
        info!(address = %learned, "Learned own address from joining peer");
    }
}

/// `GET /process`
async fn get_processes(State(api): State<ApiState>) -> Json<ProcessList> {
    let peers = api.state.peers();
    let me = peers.peer_by_id(&api.config.id);
    let servers = api
        .state
        .handles()
        .into_iter()
        .map(|(role, handle)| ServerProcess {
            role: role.to_string(),
            address: me.map(|p| p.address.clone()).unwrap_or_default(),
            port: me
                .map(|p| p.port(api.config.master_port, role))
                .unwrap_or_default(),
            pid: handle.process_id(),
            container_id: handle.container_id(),
        })
        .collect();
    Json(ProcessList { servers })
}

/// `POST /shutdown`
async fn post_shutdown(State(api): State<ApiState>) -> &'static str {
    info!("Shutdown requested through control API");
    api.root.cancel();
    "OK"
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    healthy: bool,
    agents: Vec<String>,
}

/// `GET /agency/health`
async fn get_agency_health(State(api): State<ApiState>) -> ApiResult<HealthResponse> {
    let endpoints = api.state.peers().agency_endpoints(api.config.master_port);
    let mut members: Vec<Arc<dyn AgencyApi>> = Vec::with_capacity(endpoints.len());
    for endpoint in &endpoints {
        let agency = HttpAgency::new(vec![endpoint.clone()], api.config.jwt_secret.as_deref())
            .map_err(|e| StatusError::internal(e.to_string()))?;
        members.push(Arc::new(agency));
    }
    check_agency_health(&members, MAX_AGENT_RESPONSE_TIME)
        .await
        .map_err(|e| StatusError::service_unavailable(e.to_string()))?;
    Ok(Json(HealthResponse {
        healthy: true,
        agents: endpoints,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::Peers;

    #[test]
    fn test_api_error_status() {
        let resp = ApiError(StatusError::precondition_failed("nope")).into_response();
        assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);

        let resp = ApiError(StatusError::new(999)).into_response();
        assert_eq!(resp.status().as_u16(), 999);
    }

    fn master_api(own_address: &str) -> ApiState {
        let root = CancellationToken::new();
        let mut peers = Peers::new(3, false);
        peers
            .register(Registration {
                id: "m1".to_string(),
                address: if own_address.is_empty() {
                    DEFAULT_OWN_ADDRESS.to_string()
                } else {
                    own_address.to_string()
                },
                data_dir: "/data/m1".to_string(),
                has_dbserver: true,
                has_coordinator: true,
            })
            .unwrap();
        let state = Arc::new(ServiceState::new(&root, peers));
        state.transition_to(Lifecycle::Master);
        ApiState {
            config: Arc::new(ServiceConfig {
                id: "m1".to_string(),
                own_address: own_address.to_string(),
                ..Default::default()
            }),
            state,
            root,
        }
    }

    fn hello(id: &str) -> HelloRequest {
        HelloRequest {
            slave_id: id.to_string(),
            slave_address: String::new(),
            slave_port: 8528,
            data_dir: format!("/data/{id}"),
            start_dbserver: true,
            start_coordinator: true,
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn join(api: &ApiState, id: &str, remote: &str, host: &str) -> PeerList {
        register_peer(api, hello(id), ip(remote), Some(host)).unwrap()
    }

    fn address_of(list: &PeerList, id: &str) -> (String, u16) {
        let p = list.peers.iter().find(|p| p.id == id).unwrap();
        (p.address.clone(), p.port_offset)
    }

    #[test]
    fn test_peer_on_master_host_shares_learned_address() {
        let api = master_api("");
        let list = join(&api, "s1", "192.0.2.2", "192.0.2.2:8528");

        assert_eq!(address_of(&list, "m1"), ("192.0.2.2".to_string(), 0));
        assert_eq!(address_of(&list, "s1"), ("192.0.2.2".to_string(), 5));
    }

    #[test]
    fn test_peer_on_other_host_registers_with_remote_address() {
        let api = master_api("");
        let list = join(&api, "s1", "10.0.0.7", "192.0.2.2:8528");

        assert_eq!(address_of(&list, "m1"), ("192.0.2.2".to_string(), 0));
        assert_eq!(address_of(&list, "s1"), ("10.0.0.7".to_string(), 0));

        // Learned once; later peers do not move the master.
        let list = join(&api, "s2", "10.0.0.8", "master.lan:8528");
        assert_eq!(address_of(&list, "m1").0, "192.0.2.2");
    }

    #[test]
    fn test_configured_own_address_is_kept() {
        let api = master_api("10.9.9.9");
        let list = join(&api, "s1", "10.0.0.7", "192.0.2.2:8528");
        assert_eq!(address_of(&list, "m1").0, "10.9.9.9");
    }

    #[test]
    fn test_explicit_slave_address_wins_over_remote() {
        let api = master_api("");
        let mut req = hello("s1");
        req.slave_address = "10.0.0.42".to_string();
        let list = register_peer(&api, req, ip("10.0.0.7"), None).unwrap();
        assert_eq!(address_of(&list, "s1").0, "10.0.0.42");
        assert_eq!(address_of(&list, "m1").0, DEFAULT_OWN_ADDRESS);
    }

    #[test]
    fn test_router_builds() {
        let root = CancellationToken::new();
        let api = ApiState {
            config: Arc::new(ServiceConfig::default()),
            state: Arc::new(ServiceState::new(&root, Peers::new(1, false))),
            root,
        };
        let _ = router(api);
    }
}
