//! HTTP agency client over `/_api/agency/read` and `/_api/agency/write`.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, LOCATION};
use reqwest::{redirect, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use super::api::{key_path, AgencyApi, LastResponse};
use crate::error::{AgencyError, AgencyResult};
use crate::jwt::create_jwt_authorization_header;

/// Timeout of a single agency request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Agency connection. Redirects are returned to the caller as
/// [`AgencyError::Redirect`] instead of being followed, so a follower can
/// be told apart from the leader.
#[derive(Debug)]
pub struct HttpAgency {
    endpoints: Vec<String>,
    http: reqwest::Client,
    authorization: Option<String>,
    last: Mutex<Option<LastResponse>>,
}

struct RawResponse {
    status: StatusCode,
    endpoint: String,
    body: Vec<u8>,
}

impl HttpAgency {
    /// Connect to the given endpoints, authenticating with a JWT when
    /// `jwt_secret` is set.
    pub fn new(endpoints: Vec<String>, jwt_secret: Option<&str>) -> AgencyResult<Self> {
        if endpoints.is_empty() {
            return Err(AgencyError::NoEndpoints);
        }
        let http = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;
        let authorization = create_jwt_authorization_header(jwt_secret)?;
        Ok(Self {
            endpoints: endpoints
                .into_iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            http,
            authorization: Some(authorization).filter(|a| !a.is_empty()),
            last: Mutex::new(None),
        })
    }

    fn record(&self, last: LastResponse) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(last);
    }

    /// POST `body` to `path`, trying endpoints in order until one answers.
    async fn post(&self, path: &str, body: &Value) -> AgencyResult<RawResponse> {
        let mut last_err = None;
        for endpoint in &self.endpoints {
            let mut req = self.http.post(format!("{endpoint}{path}")).json(body);
            if let Some(auth) = &self.authorization {
                req = req.header(AUTHORIZATION, auth);
            }
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let location = resp
                        .headers()
                        .get(LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    self.record(LastResponse {
                        status: status.as_u16(),
                        location: location.clone(),
                    });
                    if status == StatusCode::TEMPORARY_REDIRECT {
                        return Err(AgencyError::Redirect { location });
                    }
                    let body = resp.bytes().await?.to_vec();
                    return Ok(RawResponse {
                        status,
                        endpoint: endpoint.clone(),
                        body,
                    });
                }
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "Agency endpoint unreachable");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.map_or(AgencyError::NoEndpoints, AgencyError::Http))
    }

    async fn write(&self, key: &[&str], transaction: Value) -> AgencyResult<()> {
        let resp = self.post("/_api/agency/write", &json!([transaction])).await?;
        match resp.status {
            StatusCode::OK => {
                let body: Value = serde_json::from_slice(&resp.body)?;
                let applied = body
                    .get("results")
                    .and_then(Value::as_array)
                    .map(|results| results.iter().all(|r| r.as_u64() != Some(0)))
                    .unwrap_or(true);
                if applied {
                    Ok(())
                } else {
                    Err(AgencyError::PreconditionFailed { key: key_path(key) })
                }
            }
            StatusCode::PRECONDITION_FAILED => {
                Err(AgencyError::PreconditionFailed { key: key_path(key) })
            }
            status => Err(AgencyError::UnexpectedStatus {
                status: status.as_u16(),
                endpoint: resp.endpoint,
            }),
        }
    }
}

fn set_operation(value: Value, ttl: Option<Duration>) -> Value {
    let mut op = json!({ "op": "set", "new": value });
    if let Some(ttl) = ttl.filter(|t| !t.is_zero()) {
        op["ttl"] = json!(ttl.as_secs().max(1));
    }
    op
}

/// Walk a read result `[{"a": {"b": value}}]` down to `value`.
fn lookup(body: &Value, key: &[&str]) -> Option<Value> {
    key.iter()
        .try_fold(body.get(0)?, |node, segment| node.get(*segment))
        .cloned()
}

#[async_trait]
impl AgencyApi for HttpAgency {
    fn endpoints(&self) -> Vec<String> {
        self.endpoints.clone()
    }

    async fn read_key(&self, key: &[&str]) -> AgencyResult<Value> {
        let resp = self
            .post("/_api/agency/read", &json!([[key_path(key)]]))
            .await?;
        if resp.status != StatusCode::OK {
            return Err(AgencyError::UnexpectedStatus {
                status: resp.status.as_u16(),
                endpoint: resp.endpoint,
            });
        }
        let body: Value = serde_json::from_slice(&resp.body)?;
        lookup(&body, key).ok_or_else(|| AgencyError::KeyNotFound { key: key_path(key) })
    }

    async fn write_key_if_empty(
        &self,
        key: &[&str],
        value: Value,
        ttl: Option<Duration>,
    ) -> AgencyResult<()> {
        let path = key_path(key);
        let transaction = json!([
            { (path.clone()): set_operation(value, ttl) },
            { (path): { "oldEmpty": true } },
        ]);
        self.write(key, transaction).await
    }

    async fn write_key_if_equal_to(
        &self,
        key: &[&str],
        new_value: Value,
        old_value: Value,
        ttl: Option<Duration>,
    ) -> AgencyResult<()> {
        let path = key_path(key);
        let transaction = json!([
            { (path.clone()): set_operation(new_value, ttl) },
            { (path): { "old": old_value } },
        ]);
        self.write(key, transaction).await
    }

    fn last_response(&self) -> Option<LastResponse> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_nested_value() {
        let body = json!([{ "arango": { "Plan": { "Version": 7 } } }]);
        assert_eq!(lookup(&body, &["arango", "Plan", "Version"]), Some(json!(7)));
        assert_eq!(lookup(&body, &["arango", "Current"]), None);
        assert_eq!(lookup(&json!([{}]), &["does-not-exist"]), None);
        assert_eq!(lookup(&json!([]), &["x"]), None);
    }

    #[test]
    fn test_set_operation_ttl() {
        assert_eq!(
            set_operation(json!("v"), None),
            json!({ "op": "set", "new": "v" })
        );
        assert_eq!(
            set_operation(json!("v"), Some(Duration::from_secs(30)))["ttl"],
            json!(30)
        );
    }

    #[test]
    fn test_no_endpoints_rejected() {
        assert!(matches!(
            HttpAgency::new(Vec::new(), None),
            Err(AgencyError::NoEndpoints)
        ));
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let agency = HttpAgency::new(vec!["http://10.0.0.1:8529/".to_string()], None).unwrap();
        assert_eq!(agency.endpoints(), vec!["http://10.0.0.1:8529".to_string()]);
        assert!(agency.last_response().is_none());
    }
}
