//! Permission gate for microphone access
//!
//! The controller asks the gate once per call attempt and never opens a
//! remote session unless the answer is `Granted`.

mod device;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use device::CaptureDeviceGate;

/// Answer from the platform's permission provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Granted,
    Denied,
}

/// Boundary to whatever grants audio capture on this host
#[async_trait]
pub trait PermissionGate: Send + Sync {
    /// Ask for audio capture access. Failures are reported as `Denied`.
    async fn request_audio_capture(&self) -> Permission;
}

/// Gate that always returns the same answer
#[derive(Debug, Clone, Copy)]
pub struct FixedGate(pub Permission);

#[async_trait]
impl PermissionGate for FixedGate {
    async fn request_audio_capture(&self) -> Permission {
        self.0
    }
}
