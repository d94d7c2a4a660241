use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad error category used for recovery decisions and user-facing handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionErrorCategory {
    /// Malformed request, such as an unparseable cursor.
    Config,
    /// The caller credential was rejected.
    Auth,
    /// Transport failure; the call may succeed later.
    Network,
    /// Rate-limited by the chat service.
    RateLimited,
    /// The conversation or message does not exist.
    NotFound,
    /// A payload could not be decoded.
    Serialization,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload carried by session state and failure signals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SessionError {
    /// Drives recovery decisions.
    pub category: SessionErrorCategory,
    /// Stable code such as `conversation_not_found`.
    pub code: String,
    /// Free-form detail for logs.
    pub message: String,
}

impl SessionError {
    /// Construct a new session error.
    pub fn new(
        category: SessionErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Error for an operation the current phase does not allow.
    pub fn invalid_state(current: &'static str, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            SessionErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while session is {current}"),
        )
    }

    /// Build a network-classified error, the default for transport failures.
    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SessionErrorCategory::Network, code, message)
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            SessionErrorCategory::Network | SessionErrorCategory::RateLimited
        )
    }
}
