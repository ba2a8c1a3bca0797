//! Error taxonomy for call sessions

/// Conditions that end or degrade a call.
///
/// Every variant resolves back to `Idle`; none of them is fatal to the
/// daemon. They differ only in what the presentation layer shows.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("microphone access denied")]
    PermissionDenied,

    #[error("failed to open conversation session: {0}")]
    SessionOpenFailed(String),

    #[error("conversation session error: {0}")]
    SessionRuntimeError(String),

    /// Logged only, the call carries on without a greeting
    #[error("failed to send greeting: {0}")]
    GreetingSendFailed(String),
}

impl CallError {
    /// Whether this condition drives a visible notice
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, CallError::GreetingSendFailed(_))
    }
}
