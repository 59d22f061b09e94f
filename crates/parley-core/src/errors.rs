/// Error taxonomy shared by the session, multiplexer and bridge.
///
/// Only `Connection` (and `Cancelled`) end a connection. Everything else is
/// scoped to the single request or frame that produced it.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    // Request-scoped
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("internal error: {0}")]
    Internal(String),

    // Swallowed after logging on the post path
    #[error("broadcast error: {0}")]
    Broadcast(String),

    // Frame-scoped
    #[error("protocol error: {0}")]
    Protocol(String),

    // Connection-scoped
    #[error("connection error: {0}")]
    Connection(String),
    #[error("cancelled")]
    Cancelled,
}

impl ChatError {
    /// Whether this error ends the connection it occurred on.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Cancelled)
    }

    /// Stable machine-readable code, used in error frames and HTTP bodies.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Storage(_) => "storage_error",
            Self::Internal(_) => "internal",
            Self::Broadcast(_) => "broadcast_error",
            Self::Protocol(_) => "protocol_error",
            Self::Connection(_) => "connection_error",
            Self::Cancelled => "cancelled",
        }
    }
}
