/// Error types for the container monitoring core

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("failed to connect to Docker daemon: {0}")]
    Connect(String),

    #[error("failed to list containers: {0}")]
    List(String),

    #[error("failed to inspect container {id}: {reason}")]
    Inspect { id: String, reason: String },

    #[error("failed to open stats stream for container {id}: {reason}")]
    StatsOpen { id: String, reason: String },

    #[error("stats stream for container {id} failed: {reason}")]
    StatsRead { id: String, reason: String },

    #[error("stats stream for container {id} idle for {secs}s")]
    StatsIdle { id: String, secs: u64 },

    #[error("malformed stats sample for container {id}: {reason}")]
    MalformedSample { id: String, reason: String },

    #[error("service discovery failed: {0}")]
    Discovery(String),
}

impl DockerError {
    /// Whether the error only affects a single sample and the stream may continue
    pub fn is_recoverable_sample(&self) -> bool {
        matches!(self, DockerError::MalformedSample { .. })
    }
}

pub type DockerResult<T> = std::result::Result<T, DockerError>;
