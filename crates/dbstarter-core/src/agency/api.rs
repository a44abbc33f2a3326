//! Agency client abstraction.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AgencyResult;

/// Status and redirect target of the most recent agency response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastResponse {
    pub status: u16,
    pub location: Option<String>,
}

/// Read/write access to one agency member (or a set of endpoints of it).
#[async_trait]
pub trait AgencyApi: Send + Sync {
    /// Endpoints this connection talks to.
    fn endpoints(&self) -> Vec<String>;

    /// Read the value at `key`; `KeyNotFound` when absent.
    async fn read_key(&self, key: &[&str]) -> AgencyResult<Value>;

    /// Write `value` at `key` only if the key is currently empty.
    async fn write_key_if_empty(
        &self,
        key: &[&str],
        value: Value,
        ttl: Option<Duration>,
    ) -> AgencyResult<()>;

    /// Replace the value at `key` only if it currently equals `old_value`.
    async fn write_key_if_equal_to(
        &self,
        key: &[&str],
        new_value: Value,
        old_value: Value,
        ttl: Option<Duration>,
    ) -> AgencyResult<()>;

    /// Status and `Location` of the last response received, if any.
    fn last_response(&self) -> Option<LastResponse>;
}

/// Agency path of `key`: `["a", "b"]` becomes `/a/b`.
pub fn key_path(key: &[&str]) -> String {
    format!("/{}", key.join("/"))
}
