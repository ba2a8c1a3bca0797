//! In-process conversation service
//!
//! Stands in for a hosted agent: connects after a delay, answers every
//! message by "speaking" an echo of it, and says goodbye on close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use super::{OpenedSession, RemoteEvent, SessionClient, SessionError, SessionHandle};

/// Speaking time per character of a reply
const SPEECH_PER_CHAR: Duration = Duration::from_millis(20);

/// Loopback implementation of [`SessionClient`]
pub struct LoopbackClient {
    connect_delay: Duration,
    next_id: AtomicU64,
    sessions: Arc<Mutex<HashMap<SessionHandle, mpsc::Sender<RemoteEvent>>>>,
}

impl LoopbackClient {
    pub fn new(connect_delay: Duration) -> Self {
        Self {
            connect_delay,
            next_id: AtomicU64::new(1),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of sessions currently open
    #[cfg(test)]
    pub async fn open_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[async_trait]
impl SessionClient for LoopbackClient {
    async fn open(&self, agent_id: &str) -> Result<OpenedSession, SessionError> {
        if agent_id.trim().is_empty() {
            return Err(SessionError::Open("agent id is empty".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = SessionHandle::new(format!("loopback-{agent_id}-{id}"));
        let (tx, rx) = mpsc::channel(32);

        self.sessions.lock().await.insert(handle.clone(), tx.clone());
        info!(%handle, "loopback session opened");

        let delay = self.connect_delay;
        let sessions = Arc::clone(&self.sessions);
        let connect_handle = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Closed before it finished connecting
            if !sessions.lock().await.contains_key(&connect_handle) {
                return;
            }
            let _ = tx.send(RemoteEvent::Connected).await;
        });

        Ok(OpenedSession { handle, events: rx })
    }

    async fn close(&self, handle: &SessionHandle) -> Result<(), SessionError> {
        match self.sessions.lock().await.remove(handle) {
            Some(tx) => {
                info!(%handle, "loopback session closed");
                let _ = tx.try_send(RemoteEvent::Disconnected);
            }
            None => debug!(%handle, "close on unknown loopback session ignored"),
        }
        Ok(())
    }

    async fn send_message(&self, handle: &SessionHandle, text: &str) -> Result<(), SessionError> {
        let tx = self
            .sessions
            .lock()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| SessionError::UnknownHandle(handle.clone()))?;

        if tx.is_closed() {
            return Err(SessionError::Send(format!("{handle} is no longer listening")));
        }

        let reply = format!("echo: {text}");
        let speaking_for = SPEECH_PER_CHAR * reply.chars().count() as u32;
        debug!(%handle, ?speaking_for, "loopback replying");

        tokio::spawn(async move {
            if tx.send(RemoteEvent::Speaking(true)).await.is_err() {
                return;
            }
            let _ = tx.send(RemoteEvent::Message(reply)).await;
            tokio::time::sleep(speaking_for).await;
            let _ = tx.send(RemoteEvent::Speaking(false)).await;
        });

        Ok(())
    }
}
