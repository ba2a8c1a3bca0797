//! Events module for call lifecycle transitions
//!
//! Structured events broadcast by the session controller. The IPC server
//! forwards them to subscribed clients and tracks the latest view from
//! `PhaseChanged`.

use serde::{Deserialize, Serialize};

use crate::state::{CallView, Phase};

/// Events emitted by the session controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    /// A toggle started a new call attempt
    CallStarted { call_id: u64 },

    /// The call moved to a new phase
    PhaseChanged {
        from: Phase,
        to: Phase,
        /// Time spent in the previous phase
        duration_ms: u64,
        /// Rendered view after the transition
        view: CallView,
    },

    /// Greeting delivered to the remote agent
    GreetingSent { call_id: u64 },

    /// Inbound message from the remote agent
    AgentMessage { call_id: u64, payload: String },

    /// The call is back to Idle
    CallEnded {
        call_id: u64,
        /// Total time since the call was started
        duration_ms: u64,
        /// User-visible reason the call ended, if it was not a clean hangup
        error: Option<String>,
    },
}

impl std::fmt::Display for CallEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallEvent::CallStarted { call_id } => write!(f, "CALL_STARTED (#{})", call_id),
            CallEvent::PhaseChanged { from, to, .. } => {
                write!(f, "PHASE_CHANGED ({} -> {})", from, to)
            }
            CallEvent::GreetingSent { call_id } => write!(f, "GREETING_SENT (#{})", call_id),
            CallEvent::AgentMessage { call_id, payload } => {
                write!(f, "AGENT_MESSAGE (#{}, {} bytes)", call_id, payload.len())
            }
            CallEvent::CallEnded { call_id, duration_ms, .. } => {
                write!(f, "CALL_ENDED (#{}, {}ms)", call_id, duration_ms)
            }
        }
    }
}
