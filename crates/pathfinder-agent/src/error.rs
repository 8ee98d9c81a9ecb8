use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Code is already running in session {0}")]
    AlreadyRunning(String),

    #[error("No code is running in session {0}")]
    NotRunning(String),

    #[error("Stop did not complete within {timeout_ms}ms; the job may still be running")]
    CancellationTimeout { timeout_ms: u64 },

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
