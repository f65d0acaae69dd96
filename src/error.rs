use std::time::Duration;

// ============================================================================
// Error Type
// ============================================================================

/// Everything that can go wrong between typing a query and a terminal
/// session state.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SearchError {
    /// A precondition on the client configuration failed (e.g. missing
    /// search key). No network call was attempted.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The start-flow call returned a non-success status or an
    /// uninterpretable body.
    #[error("flow.execute failed: {0}")]
    Protocol(String),

    /// The start-flow response was well-formed but carried no usable
    /// session id.
    #[error("flow.execute missing sessionId")]
    MissingSessionId,

    /// The stream delivered an explicit error event; the message is the
    /// upstream-provided one.
    #[error("flow error: {0}")]
    Flow(String),

    /// No terminal event arrived within the configured deadline.
    #[error("flow timed out after {0:?}")]
    Timeout(Duration),

    /// The session was superseded by a newer search or torn down. Silent
    /// by design; never shown to the user as a failure.
    #[error("search cancelled")]
    Cancelled,
}

impl SearchError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn flow(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.trim().is_empty() {
            Self::Flow("Search failed".to_string())
        } else {
            Self::Flow(message)
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Message suitable for direct display next to the search box.
    pub fn user_message(&self) -> String {
        match self {
            Self::Flow(msg) => msg.clone(),
            Self::Configuration(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for SearchError {
    fn from(err: reqwest::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for SearchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("invalid JSON: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, SearchError>;

// ============================================================================
// Tests
// ============================================================================
