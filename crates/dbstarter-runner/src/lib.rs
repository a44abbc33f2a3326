//! dbstarter-runner: process execution backends
//!
//! Starts, locates and terminates single database server instances. The
//! supervisor in `dbstarter-core` only sees the [`Runner`] and
//! [`ProcessHandle`] traits; this crate provides two implementations:
//!
//! - [`ProcessRunner`]: native child processes with pid files
//! - [`DockerRunner`]: one docker container per server
//!
//! In-memory fakes for tests live in [`fakes`].

pub mod docker;
pub mod error;
pub mod fakes;
pub mod process;
pub mod traits;

pub use docker::{DockerConfig, DockerContainer, DockerRunner};
pub use error::{RunnerError, RunnerResult};
pub use process::{NativeProcess, ProcessRunner};
pub use traits::{ExitNotifier, ExitSignal, ProcessHandle, Runner, StartRequest, Volume};
