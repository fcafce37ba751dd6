use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Browser debugger endpoint not available: {0}")]
    ResolutionTimeout(String),

    #[error("Failed to connect to Chrome: {0}")]
    ConnectionFailed(String),

    #[error("Failed to launch Chrome: {0}")]
    LaunchFailed(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Login timed out ({0} seconds).")]
    CaptureTimeout(u64),

    #[error("Browser window closed before login was captured.")]
    CaptureAborted,

    #[error("Request blocked: {0}")]
    TransportBlocked(String),

    #[error("Request timed out: {0}")]
    TransportTimeout(String),

    #[error("DOM interaction failed: {0}")]
    DomInteractionFailure(String),

    #[error("No reply detected: {0}")]
    NoReplyDetected(String),

    #[error("{0}")]
    TaskFailed(String),

    #[error("Task timeout after {0}s")]
    TaskTimeout(u64),

    #[error("Request cancelled")]
    Cancelled,

    #[error("API error: {0}")]
    Api(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Credential storage error: {0}")]
    Storage(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("CDP error: {0}")]
    CdpError(#[from] chromiumoxide::error::CdpError),

    #[error("Other error: {0}")]
    Other(String),
}

impl BridgeError {
    /// True for outcomes that should send a chat turn down the DOM path.
    pub fn is_blocking(&self) -> bool {
        matches!(self, BridgeError::TransportBlocked(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
