/// Failure reported by, or while talking to, the backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The backend ran the command and it failed. `message` is the backend's
    /// own error text.
    #[error("{message}")]
    Call { command: String, message: String },
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("subscribe to {topic} failed: {message}")]
    Subscribe { topic: String, message: String },
    #[error("invalid payload: {0}")]
    Payload(String),
}

#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("invalid parameters for {operation}: {reason}")]
    InvalidParams {
        operation: &'static str,
        reason: String,
    },
    #[error("operation {running} is already running")]
    AlreadyRunning { running: &'static str },
    #[error("operation {operation} failed: {source}")]
    Failed {
        operation: &'static str,
        #[source]
        source: BackendError,
    },
    #[error("operation {operation} was cancelled")]
    Cancelled { operation: &'static str },
    #[error("failed to encode parameters for {operation}: {message}")]
    Encode {
        operation: &'static str,
        message: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command {current} is already running")]
    Busy { current: String },
    #[error("command {command} was cancelled")]
    Cancelled { command: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
}
