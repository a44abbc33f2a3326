//! Error types for dbstarter-runner

use thiserror::Error;

/// Errors that can occur while starting or controlling server processes
#[derive(Error, Debug)]
pub enum RunnerError {
    /// The executable could not be spawned
    #[error("Failed to spawn {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    /// Sending a signal to a process failed
    #[error("Failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    /// Runner configuration is unusable
    #[error("Invalid runner configuration: {0}")]
    InvalidConfig(String),

    /// Docker daemon error
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for runner operations
pub type RunnerResult<T> = std::result::Result<T, RunnerError>;
