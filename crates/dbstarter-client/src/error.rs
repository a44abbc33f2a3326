//! Status-coded errors for the control API
//!
//! A [`StatusError`] carries the HTTP status of a failed request and the
//! message from an `{"Error": "..."}` body when one was sent. Callers inspect
//! errors by [`StatusKind`], never by message text; [`status_kind`] finds the
//! status anywhere in a wrapped error's source chain.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The closed set of status kinds the control API produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    NotFound,
    BadRequest,
    PreconditionFailed,
    ServiceUnavailable,
    Internal,
}

impl StatusKind {
    /// HTTP status code for this kind.
    pub fn status_code(self) -> u16 {
        match self {
            StatusKind::NotFound => StatusCode::NOT_FOUND.as_u16(),
            StatusKind::BadRequest => StatusCode::BAD_REQUEST.as_u16(),
            StatusKind::PreconditionFailed => StatusCode::PRECONDITION_FAILED.as_u16(),
            StatusKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE.as_u16(),
            StatusKind::Internal => StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
        }
    }

    /// Classify a status code; `None` for codes outside the set.
    pub fn from_status(code: u16) -> Option<Self> {
        match StatusCode::from_u16(code).ok()? {
            StatusCode::NOT_FOUND => Some(StatusKind::NotFound),
            StatusCode::BAD_REQUEST => Some(StatusKind::BadRequest),
            StatusCode::PRECONDITION_FAILED => Some(StatusKind::PreconditionFailed),
            StatusCode::SERVICE_UNAVAILABLE => Some(StatusKind::ServiceUnavailable),
            StatusCode::INTERNAL_SERVER_ERROR => Some(StatusKind::Internal),
            _ => None,
        }
    }
}

/// JSON body of an API error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "Error")]
    pub error: String,
}

/// An error with an HTTP status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusError {
    pub status: u16,
    message: Option<String>,
}

impl StatusError {
    /// Status-only error without message.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            message: None,
        }
    }

    /// Error of the given kind with a message.
    pub fn with_message(kind: StatusKind, message: impl Into<String>) -> Self {
        Self {
            status: kind.status_code(),
            message: Some(message.into()),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::with_message(StatusKind::NotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::with_message(StatusKind::BadRequest, message)
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::with_message(StatusKind::PreconditionFailed, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::with_message(StatusKind::ServiceUnavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_message(StatusKind::Internal, message)
    }

    /// Kind of this error, if its status is one of the known kinds.
    pub fn kind(&self) -> Option<StatusKind> {
        StatusKind::from_status(self.status)
    }

    /// Message sent by the server, if any.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    fn display_message(&self) -> String {
        match &self.message {
            Some(m) if !m.is_empty() => m.clone(),
            _ => format!("Status {}", self.status),
        }
    }

    /// Build an error from a response status and body.
    ///
    /// Uses the message of an `{"Error": "..."}` body when it decodes,
    /// otherwise returns a status-only error.
    pub fn from_body(status: u16, body: &[u8]) -> Self {
        if !body.is_empty() {
            if let Ok(parsed) = serde_json::from_slice::<ErrorResponse>(body) {
                return Self {
                    status,
                    message: Some(parsed.error),
                };
            }
        }
        Self::new(status)
    }

    /// Read the body of a failed response and build an error from it.
    pub async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        match response.bytes().await {
            Ok(body) => Self::from_body(status, &body),
            Err(_) => Self::new(status),
        }
    }

    /// Body to send for this error.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.display_message(),
        }
    }
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_message())
    }
}

impl std::error::Error for StatusError {}

/// Find the status kind of the first [`StatusError`] in an error's source chain.
pub fn status_kind(err: &(dyn std::error::Error + 'static)) -> Option<StatusKind> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(status) = e.downcast_ref::<StatusError>() {
            return status.kind();
        }
        current = e.source();
    }
    None
}

pub fn is_not_found(err: &(dyn std::error::Error + 'static)) -> bool {
    status_kind(err) == Some(StatusKind::NotFound)
}

pub fn is_bad_request(err: &(dyn std::error::Error + 'static)) -> bool {
    status_kind(err) == Some(StatusKind::BadRequest)
}

pub fn is_precondition_failed(err: &(dyn std::error::Error + 'static)) -> bool {
    status_kind(err) == Some(StatusKind::PreconditionFailed)
}

pub fn is_service_unavailable(err: &(dyn std::error::Error + 'static)) -> bool {
    status_kind(err) == Some(StatusKind::ServiceUnavailable)
}

pub fn is_internal(err: &(dyn std::error::Error + 'static)) -> bool {
    status_kind(err) == Some(StatusKind::Internal)
}

/// Errors returned by [`crate::ControlClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered with a non-success status
    #[error("{0}")]
    Status(#[from] StatusError),

    /// The request could not be sent or the response not decoded
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint is not a usable base URL
    #[error("Invalid endpoint {endpoint}: {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
}

/// Result type for client operations
pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_body_uses_error_message() {
        let err = StatusError::from_body(404, br#"{"Error": "peer not found"}"#);
        assert_eq!(err.kind(), Some(StatusKind::NotFound));
        assert_eq!(err.message(), Some("peer not found"));
        assert_eq!(err.to_string(), "peer not found");
    }

    #[test]
    fn test_from_body_without_json_is_status_only() {
        let err = StatusError::from_body(503, b"<html>busy</html>");
        assert_eq!(err.kind(), Some(StatusKind::ServiceUnavailable));
        assert!(err.message().is_none());
        assert_eq!(err.to_string(), "Status 503");
    }

    #[test]
    fn test_from_empty_body() {
        let err = StatusError::from_body(412, b"");
        assert_eq!(err.kind(), Some(StatusKind::PreconditionFailed));
        assert_eq!(err.to_string(), "Status 412");
    }

    #[test]
    fn test_unknown_status_has_no_kind() {
        let err = StatusError::new(418);
        assert!(err.kind().is_none());
    }

    #[test]
    fn test_kind_status_codes() {
        for kind in [
            StatusKind::NotFound,
            StatusKind::BadRequest,
            StatusKind::PreconditionFailed,
            StatusKind::ServiceUnavailable,
            StatusKind::Internal,
        ] {
            assert_eq!(StatusKind::from_status(kind.status_code()), Some(kind));
        }
    }

    #[test]
    fn test_status_kind_through_wrapping() {
        let err = ClientError::from(StatusError::bad_request("missing slave_id"));
        assert!(is_bad_request(&err));
        assert!(!is_not_found(&err));

        #[derive(Debug, Error)]
        #[error("registration failed")]
        struct Outer(#[source] ClientError);

        let outer = Outer(ClientError::from(StatusError::service_unavailable("not master")));
        assert!(is_service_unavailable(&outer));
        assert!(!is_internal(&outer));
        assert!(!is_precondition_failed(&outer));
    }

    #[test]
    fn test_error_response_wire_format() {
        let body = serde_json::to_string(&StatusError::internal("boom").to_response()).unwrap();
        assert_eq!(body, r#"{"Error":"boom"}"#);
    }
}
