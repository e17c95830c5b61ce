use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("failed to start eval process for {container}: {message}")]
    Spawn { container: String, message: String },
    #[error("invalid container name '{0}'")]
    InvalidContainer(String),
    #[error("no console session for {0}")]
    SessionNotFound(String),
    #[error("no container selected")]
    NoContainerSelected,
    #[error("eval process for {0} has exited")]
    ProcessDead(String),
    #[error("write to {container} failed: {message}")]
    WriteFailed { container: String, message: String },
    #[error("command on {container} timed out after {waited_ms} ms")]
    CommandTimedOut { container: String, waited_ms: u64 },
}

impl SessionError {
    /// Stable identifier used in wire error frames and log events.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Spawn { .. } => "spawn_error",
            SessionError::InvalidContainer(_) => "invalid_container",
            SessionError::SessionNotFound(_) => "session_not_found",
            SessionError::NoContainerSelected => "no_container_selected",
            SessionError::ProcessDead(_) => "process_dead",
            SessionError::WriteFailed { .. } => "write_failed",
            SessionError::CommandTimedOut { .. } => "command_timed_out",
        }
    }
}
