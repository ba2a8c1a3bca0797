//! Remote conversation service boundary
//!
//! A client opens one streaming session per call and pushes lifecycle
//! events for it over a channel. The controller treats the session handle
//! as opaque.

mod loopback;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use loopback::LoopbackClient;

/// Opaque reference to an open remote session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(String);

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Events pushed by the remote service for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RemoteEvent {
    Connected,
    Disconnected,
    /// The remote agent started (`true`) or stopped (`false`) talking
    Speaking(bool),
    Message(String),
    Error(String),
}

impl std::fmt::Display for RemoteEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteEvent::Connected => write!(f, "CONNECTED"),
            RemoteEvent::Disconnected => write!(f, "DISCONNECTED"),
            RemoteEvent::Speaking(true) => write!(f, "SPEAKING"),
            RemoteEvent::Speaking(false) => write!(f, "LISTENING"),
            RemoteEvent::Message(payload) => write!(f, "MESSAGE ({} bytes)", payload.len()),
            RemoteEvent::Error(reason) => write!(f, "ERROR ({})", reason),
        }
    }
}

/// Result of a successful open: the handle plus its event stream
#[derive(Debug)]
pub struct OpenedSession {
    pub handle: SessionHandle,
    pub events: mpsc::Receiver<RemoteEvent>,
}

/// Errors reported by a remote session client
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to open session: {0}")]
    Open(String),

    #[error("unknown session handle: {0}")]
    UnknownHandle(SessionHandle),

    #[error("failed to send message: {0}")]
    Send(String),

    #[error("close did not finish within {0:?}")]
    CloseTimedOut(std::time::Duration),
}

/// Client for the remote conversation service
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Open a streaming session with the given agent.
    ///
    /// May fail before any `Connected` event is produced.
    async fn open(&self, agent_id: &str) -> Result<OpenedSession, SessionError>;

    /// Close a session. Closing an unknown or already-closed handle is not
    /// an error.
    async fn close(&self, handle: &SessionHandle) -> Result<(), SessionError>;

    /// Send a text message into an open session
    async fn send_message(&self, handle: &SessionHandle, text: &str) -> Result<(), SessionError>;
}
