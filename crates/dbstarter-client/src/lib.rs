//! dbstarter-client: control API of a starter
//!
//! - [`api`]: request/response bodies shared by server and client
//! - [`error`]: status-coded errors, parsed from `{"Error": "..."}` bodies
//! - [`client`]: `ControlClient`, used by joining starters and tooling

pub mod api;
pub mod client;
pub mod error;

pub use api::{HelloRequest, IdInfo, PeerEntry, PeerList, ProcessList, ServerProcess};
pub use client::ControlClient;
pub use error::{
    is_bad_request, is_internal, is_not_found, is_precondition_failed, is_service_unavailable,
    status_kind, ClientError, ClientResult, ErrorResponse, StatusError, StatusKind,
};
