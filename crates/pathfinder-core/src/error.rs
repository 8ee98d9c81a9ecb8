use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathfinderError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PathfinderError>;

/// Coordination failures reported back to the originating browser session.
///
/// Duplicate robot registration is deliberately absent: it is handled as a
/// reconnect, never surfaced as an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("No robot is assigned to this session. Select a robot first.")]
    NotAssigned,

    #[error("Robot {0} is not connected")]
    RobotUnreachable(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Code is already running in this session")]
    AlreadyRunning,

    #[error("No code is running in this session")]
    NoActiveJob,

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Permission denied: {0}")]
    Forbidden(String),
}

impl RelayError {
    /// Wire error code carried in `res.error.code`.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::NotAssigned => "not_assigned",
            RelayError::RobotUnreachable(_) => "robot_unreachable",
            RelayError::NotFound(_) => "not_found",
            RelayError::AlreadyRunning => "already_running",
            RelayError::NoActiveJob => "no_active_job",
            RelayError::InvalidParams(_) => "invalid_params",
            RelayError::Forbidden(_) => "forbidden",
        }
    }
}
