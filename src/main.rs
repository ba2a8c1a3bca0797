//! voice-call-daemon: Background daemon for voice calls with a remote agent
//!
//! This daemon provides:
//! - A session controller that runs one call at a time through an explicit
//!   state machine (permission, open, connected, speaking, debounced teardown)
//! - A microphone permission gate probing the host's capture devices
//! - A loopback conversation client for running calls without a hosted agent
//! - IPC server for UI clients: toggle the call, read its view, subscribe to
//!   call events

mod config;
mod error;
mod events;
mod ipc;
mod lifecycle;
mod permission;
mod remote;
mod state;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::events::CallEvent;
use crate::ipc::Server;
use crate::lifecycle::ShutdownSignal;
use crate::remote::LoopbackClient;
use crate::state::SessionController;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "voice-call-daemon starting"
    );

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(
        ?config.socket_path,
        agent_id = %config.agent_id,
        mic_policy = ?config.mic_policy,
        cleanup_delay_ms = config.cleanup_delay.as_millis() as u64,
        "configuration loaded"
    );

    // Create shutdown signal handler
    let mut shutdown = ShutdownSignal::new();

    // IPC server -> session controller
    let (intent_tx, intent_rx) = mpsc::channel(32);
    // Session controller -> IPC server and subscribers
    let (event_tx, _event_rx) = broadcast::channel::<CallEvent>(64);

    let client = Arc::new(LoopbackClient::new(config.connect_delay));
    let mut controller = SessionController::new(
        config.call_settings(),
        config.permission_gate(),
        client,
        event_tx.clone(),
    );

    let server = Server::new(&config.socket_path, intent_tx, event_tx.clone())?;
    server.set_view(controller.view()).await;

    // Subscribe to call events for status tracking
    let mut view_event_rx = event_tx.subscribe();
    let server_for_events = &server;

    info!("daemon initialized, entering main loop");

    tokio::select! {
        // Run the session controller (processes intents and remote events)
        _ = controller.run(intent_rx) => {
            info!("session controller exited");
        }

        // Run the IPC server (accepts client connections)
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        // Keep the served view in sync with the controller
        _ = async {
            loop {
                match view_event_rx.recv().await {
                    Ok(CallEvent::PhaseChanged { view, .. }) => {
                        server_for_events.set_view(view).await;
                    }
                    Ok(event) => {
                        info!(%event, "call event");
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "call event receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        } => {
            info!("call event handler exited");
        }

        // Wait for shutdown signal
        reason = shutdown.wait() => {
            info!(?reason, "shutdown signal received");
        }
    }

    // Cleanup
    info!("shutting down...");

    server.shutdown().await;

    info!("voice-call-daemon stopped");

    Ok(())
}
