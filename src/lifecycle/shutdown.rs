//! Signal handling for graceful shutdown

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, warn};

/// Which signal ended the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Terminate,
    Interrupt,
}

/// Handles shutdown signals (SIGTERM, SIGINT)
pub struct ShutdownSignal {
    sigterm: Option<Signal>,
    sigint: Option<Signal>,
}

impl ShutdownSignal {
    /// Register the signal handlers.
    ///
    /// A handler that cannot be registered is skipped with a warning.
    pub fn new() -> Self {
        Self {
            sigterm: register(SignalKind::terminate(), "SIGTERM"),
            sigint: register(SignalKind::interrupt(), "SIGINT"),
        }
    }

    /// Wait for a shutdown signal
    pub async fn wait(&mut self) -> ShutdownReason {
        let ctrl_c_fallback = self.sigint.is_none();
        tokio::select! {
            Some(()) = recv(&mut self.sigterm) => {
                debug!("received SIGTERM");
                ShutdownReason::Terminate
            }
            Some(()) = recv(&mut self.sigint) => {
                debug!("received SIGINT");
                ShutdownReason::Interrupt
            }
            result = tokio::signal::ctrl_c(), if ctrl_c_fallback => {
                if let Err(e) = result {
                    warn!(?e, "ctrl-c handler failed");
                }
                ShutdownReason::Interrupt
            }
            // Signal driver went away
            else => ShutdownReason::Terminate,
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

fn register(kind: SignalKind, name: &str) -> Option<Signal> {
    match signal(kind) {
        Ok(signal) => Some(signal),
        Err(e) => {
            warn!(?e, signal = name, "failed to register signal handler");
            None
        }
    }
}

async fn recv(signal: &mut Option<Signal>) -> Option<()> {
    match signal {
        Some(signal) => signal.recv().await,
        None => std::future::pending().await,
    }
}
