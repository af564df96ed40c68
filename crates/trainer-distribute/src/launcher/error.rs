use std::io;
use thiserror::Error;

/// Errors raised while preparing or running a worker group.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// No usable device set, bad flag combination, etc. Nothing has been spawned.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The OS refused to start a worker (missing executable, permissions, resource limits).
    #[error("Failed to spawn rank {rank} ({program}): {source}")]
    Spawn {
        rank: usize,
        program: String,
        #[source]
        source: io::Error,
    },

    /// Waiting on a spawned worker failed.
    #[error("Failed to wait on rank {rank}: {source}")]
    Wait {
        rank: usize,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, LaunchError>;

impl LaunchError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Launcher exit code when this error aborts a run: 2 for configuration
    /// errors, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 2,
            _ => 1,
        }
    }
}
