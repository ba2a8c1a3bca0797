//! Unix domain socket server for IPC
//!
//! Provides request-response communication and push notifications of call
//! events to subscribed clients. The server never touches the call session
//! itself: toggles are forwarded to the controller as intents and status is
//! served from the last view the controller published.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::events::CallEvent;
use crate::state::{CallView, Intent};

use super::protocol::{read_frame, write_frame, DaemonStatus, Request, Response};

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    state: Arc<RwLock<ServerState>>,
    shutdown_tx: broadcast::Sender<()>,
    intent_tx: mpsc::Sender<Intent>,
    /// Source of notifications for subscribed clients
    event_tx: broadcast::Sender<CallEvent>,
}

/// Shared server state
struct ServerState {
    status: DaemonStatus,
    start_time: std::time::Instant,
}

/// What a client handler needs, cloned per connection
#[derive(Clone)]
struct ClientContext {
    state: Arc<RwLock<ServerState>>,
    intent_tx: mpsc::Sender<Intent>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl Server {
    /// Create a new IPC server
    pub fn new(
        socket_path: &Path,
        intent_tx: mpsc::Sender<Intent>,
        event_tx: broadcast::Sender<CallEvent>,
    ) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path)
            .context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
                .context("failed to restrict socket permissions")?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(RwLock::new(ServerState {
            status: DaemonStatus::default(),
            start_time: std::time::Instant::now(),
        }));

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener: Some(listener),
            state,
            shutdown_tx,
            intent_tx,
            event_tx,
        })
    }

    /// Record the latest view published by the controller
    pub async fn set_view(&self, view: CallView) {
        let mut server_state = self.state.write().await;
        if server_state.status.call != view {
            debug!(
                display_text = %view.display_text,
                is_busy = view.is_busy,
                "IPC server: view updated"
            );
        }
        server_state.status.call = view;
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref()
            .context("server not initialized")?;

        let ctx = ClientContext {
            state: Arc::clone(&self.state),
            intent_tx: self.intent_tx.clone(),
            event_tx: self.event_tx.clone(),
        };

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let ctx = ctx.clone();
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, ctx) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => accept_failed(&e).await,
            }
        }
    }

    /// Handle a single client connection
    async fn handle_client(stream: UnixStream, ctx: ClientContext) -> Result<()> {
        let (reader, mut writer) = stream.into_split();

        // Frames are read on their own task since partial reads cannot be
        // abandoned inside a select
        let (request_tx, mut request_rx) = mpsc::channel(8);
        let reader_task = tokio::spawn(Self::read_requests(reader, request_tx));

        let mut notifications: Option<broadcast::Receiver<CallEvent>> = None;

        let result = loop {
            tokio::select! {
                request = request_rx.recv() => {
                    let Some(request) = request else {
                        debug!("client disconnected");
                        break Ok(());
                    };
                    debug!(?request, "received request");

                    let (response, subscribe) = Self::process_request(request, &ctx).await;
                    if subscribe && notifications.is_none() {
                        notifications = Some(ctx.event_tx.subscribe());
                        debug!("client subscribed to notifications");
                    }
                    if let Err(e) = write_frame(&mut writer, &response).await {
                        break Err(e);
                    }
                }
                event = next_notification(&mut notifications) => {
                    match event {
                        Ok(event) => {
                            let frame = Response::Notification { event };
                            if let Err(e) = write_frame(&mut writer, &frame).await {
                                break Err(e);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "subscriber lagged behind call events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            notifications = None;
                        }
                    }
                }
            }
        };

        reader_task.abort();
        result
    }

    /// Parse frames from the client until EOF or a malformed frame
    async fn read_requests(mut reader: OwnedReadHalf, request_tx: mpsc::Sender<Request>) {
        loop {
            match read_frame::<_, Request>(&mut reader).await {
                Ok(Some(request)) => {
                    if request_tx.send(request).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(?e, "failed to read request, disconnecting");
                    return;
                }
            }
        }
    }

    /// Process a request and return a response
    /// Returns (Response, should_subscribe)
    async fn process_request(request: Request, ctx: &ClientContext) -> (Response, bool) {
        match request {
            Request::Ping => (Response::Pong, false),

            Request::GetStatus => {
                let mut state = ctx.state.write().await;
                state.status.uptime_secs = state.start_time.elapsed().as_secs();
                (Response::Status(state.status.clone()), false)
            }

            Request::ToggleCall => match ctx.intent_tx.send(Intent::ToggleCall).await {
                Ok(()) => {
                    info!("toggle requested via IPC");
                    (Response::Accepted, false)
                }
                Err(_) => (
                    Response::Error {
                        code: "controller_unavailable".into(),
                        message: "session controller is not running".into(),
                    },
                    false,
                ),
            },

            Request::Subscribe => (Response::Subscribed, true),
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

async fn next_notification(
    notifications: &mut Option<broadcast::Receiver<CallEvent>>,
) -> Result<CallEvent, broadcast::error::RecvError> {
    match notifications {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Log a failed accept and wait before the next attempt
async fn accept_failed(e: &std::io::Error) {
    error!(?e, "accept error");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}
