use thiserror::Error;

/// Application-wide error type
///
/// Nothing here is fatal to the host process: every variant ends up as a log
/// line and a status change at the boundary that observes it.
#[derive(Error, Debug)]
pub enum AppError {
    /// Signaling connection failed or closed unexpectedly
    #[error("Transport error: {0}")]
    Transport(String),

    /// A handshake step was rejected by the engine
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Operation attempted in the wrong state (caller bug)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Empty or malformed ICE candidate
    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Data channel '{0}' is not open")]
    ChannelNotOpen(String),

    /// The owning session was closed while an operation was in flight
    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Raw error reported by the WebRTC engine
    #[error("WebRTC engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Whether this error only means the session went away underneath the caller
    pub fn is_session_closed(&self) -> bool {
        matches!(self, AppError::SessionClosed(_))
    }
}

impl From<webrtc::Error> for AppError {
    fn from(e: webrtc::Error) -> Self {
        AppError::Engine(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
