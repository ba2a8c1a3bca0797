//! The call session entity owned by the controller

use serde::{Deserialize, Serialize};

use crate::permission::Permission;
use crate::remote::SessionHandle;

/// Lifecycle phase of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No call, waiting for a toggle
    Idle,
    /// Waiting on the permission gate
    AwaitingPermission,
    /// Remote session is being opened
    Initializing,
    /// Connected, the remote agent is listening
    Active,
    /// Connected, the remote agent is talking
    Speaking,
    /// Teardown started, waiting for cleanup to settle
    Ending,
}

impl Default for Phase {
    fn default() -> Self {
        Self::Idle
    }
}

impl Phase {
    pub fn is_connected(self) -> bool {
        matches!(self, Phase::Active | Phase::Speaking)
    }

    /// Phases in which the next legal user action is ambiguous
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            Phase::AwaitingPermission | Phase::Initializing | Phase::Ending
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle => write!(f, "Idle"),
            Phase::AwaitingPermission => write!(f, "AwaitingPermission"),
            Phase::Initializing => write!(f, "Initializing"),
            Phase::Active => write!(f, "Active"),
            Phase::Speaking => write!(f, "Speaking"),
            Phase::Ending => write!(f, "Ending"),
        }
    }
}

/// Microphone permission as last reported by the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MicPermission {
    Unknown,
    Granted,
    Denied,
}

impl Default for MicPermission {
    fn default() -> Self {
        Self::Unknown
    }
}

impl From<Permission> for MicPermission {
    fn from(permission: Permission) -> Self {
        match permission {
            Permission::Granted => MicPermission::Granted,
            Permission::Denied => MicPermission::Denied,
        }
    }
}

/// Mutable state of the one call the controller manages.
///
/// Created once and reset in place after every call.
#[derive(Debug, Default)]
pub struct CallSession {
    pub(crate) phase: Phase,
    pub(crate) mic: MicPermission,
    pub(crate) has_greeted: bool,
    pub(crate) handle: Option<SessionHandle>,
    pub(crate) pending_cleanup: bool,
}

impl CallSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn mic(&self) -> MicPermission {
        self.mic
    }

    #[cfg(test)]
    pub fn has_greeted(&self) -> bool {
        self.has_greeted
    }

    #[cfg(test)]
    pub fn handle(&self) -> Option<&SessionHandle> {
        self.handle.as_ref()
    }

    pub fn pending_cleanup(&self) -> bool {
        self.pending_cleanup
    }

    /// Whether a new call may start right now
    pub fn can_start(&self) -> bool {
        self.phase == Phase::Idle && !self.pending_cleanup
    }

    /// Clear per-call fields ahead of the transition into Idle.
    /// The last permission answer is kept.
    pub(crate) fn clear_call(&mut self) {
        self.has_greeted = false;
        self.handle = None;
        self.pending_cleanup = false;
    }
}
