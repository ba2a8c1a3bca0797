//! Read-only projection of the call session for the presentation layer

use serde::{Deserialize, Serialize};

use crate::error::CallError;

use super::session::{CallSession, MicPermission, Phase};

const IDLE_TEXT: &str = "AI Powered Tips";
const INITIALIZING_TEXT: &str = "Initializing...";
const LISTENING_TEXT: &str = "Listening...";
const SPEAKING_TEXT: &str = "Talking...";

/// What the UI renders for the current call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallView {
    pub display_text: String,
    /// Label of the toggle button
    pub action_label: String,
    pub is_connected: bool,
    /// Toggle is disabled while this is set
    pub is_busy: bool,
    pub microphone: MicPermission,
    /// User-visible condition from the last call attempt
    pub notice: Option<String>,
}

impl CallView {
    /// Project a session snapshot. Pure function of its inputs.
    pub fn render(session: &CallSession, last_error: Option<&CallError>) -> Self {
        let phase = session.phase();
        let display_text = match phase {
            Phase::AwaitingPermission | Phase::Initializing => INITIALIZING_TEXT,
            Phase::Active => LISTENING_TEXT,
            Phase::Speaking => SPEAKING_TEXT,
            Phase::Idle | Phase::Ending => IDLE_TEXT,
        };
        let is_connected = phase.is_connected();

        Self {
            display_text: display_text.to_string(),
            action_label: if is_connected { "End" } else { "Ask" }.to_string(),
            is_connected,
            is_busy: phase.is_transitional() || session.pending_cleanup(),
            microphone: session.mic(),
            notice: last_error
                .filter(|e| e.is_user_visible())
                .map(|e| e.to_string()),
        }
    }
}

impl Default for CallView {
    fn default() -> Self {
        Self::render(&CallSession::new(), None)
    }
}
