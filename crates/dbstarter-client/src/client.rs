//! HTTP client for the control API of a starter.

use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::api::{HelloRequest, IdInfo, PeerList, ProcessList};
use crate::error::{ClientError, ClientResult, StatusError};

/// Default timeout for control API requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for one starter's control API.
#[derive(Debug, Clone)]
pub struct ControlClient {
    base: Url,
    http: reqwest::Client,
}

impl ControlClient {
    /// Create a client for `endpoint`, e.g. `http://10.0.0.1:8528`.
    pub fn new(endpoint: &str) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("dbstarter/", env!("CARGO_PKG_VERSION")))
            .timeout(DEFAULT_TIMEOUT)
            .build()?;
        Self::with_http_client(endpoint, http)
    }

    /// Create a client reusing an existing `reqwest::Client`.
    pub fn with_http_client(endpoint: &str, http: reqwest::Client) -> ClientResult<Self> {
        let base = Url::parse(endpoint).map_err(|source| ClientError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            source,
        })?;
        Ok(Self { base, http })
    }

    /// Base URL of the starter.
    pub fn endpoint(&self) -> &Url {
        &self.base
    }

    fn url(&self, path: &str) -> ClientResult<Url> {
        self.base
            .join(path)
            .map_err(|source| ClientError::InvalidEndpoint {
                endpoint: self.base.to_string(),
                source,
            })
    }

    /// Fetch the id of the starter.
    pub async fn id(&self) -> ClientResult<IdInfo> {
        let resp = self.http.get(self.url("id")?).send().await?;
        decode(resp).await
    }

    /// Register with a master starter and receive the current peer set.
    pub async fn hello(&self, request: &HelloRequest) -> ClientResult<PeerList> {
        debug!(master = %self.base, id = %request.slave_id, "Sending hello");
        let resp = self
            .http
            .post(self.url("hello")?)
            .json(request)
            .send()
            .await?;
        decode(resp).await
    }

    /// Fetch the current peer set.
    pub async fn peers(&self) -> ClientResult<PeerList> {
        let resp = self.http.get(self.url("hello")?).send().await?;
        decode(resp).await
    }

    /// List the servers run by the starter.
    pub async fn processes(&self) -> ClientResult<ProcessList> {
        let resp = self.http.get(self.url("process")?).send().await?;
        decode(resp).await
    }

    /// Ask the starter to shut down.
    pub async fn shutdown(&self) -> ClientResult<()> {
        let resp = self.http.post(self.url("shutdown")?).send().await?;
        check(resp).await.map(|_| ())
    }
}

async fn check(resp: Response) -> ClientResult<Response> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(StatusError::from_response(resp).await.into())
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> ClientResult<T> {
    let resp = check(resp).await?;
    if resp.status() == StatusCode::NO_CONTENT {
        // Every decoded endpoint returns a body; an empty one is a server bug.
        return Err(StatusError::internal("empty response body").into());
    }
    Ok(resp.json::<T>().await?)
}
