//! Capture device probe
//!
//! Grants access when the ALSA device directory is readable and lists at
//! least one capture PCM node (`pcmC<card>D<device>c`).

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Permission, PermissionGate};

/// Permission gate backed by the host's capture devices
#[derive(Debug, Clone)]
pub struct CaptureDeviceGate {
    device_dir: PathBuf,
}

impl CaptureDeviceGate {
    pub fn new(device_dir: impl Into<PathBuf>) -> Self {
        Self {
            device_dir: device_dir.into(),
        }
    }

    async fn find_capture_node(&self) -> std::io::Result<Option<String>> {
        let mut entries = tokio::fs::read_dir(&self.device_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_capture_node(&name) {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl PermissionGate for CaptureDeviceGate {
    async fn request_audio_capture(&self) -> Permission {
        match self.find_capture_node().await {
            Ok(Some(node)) => {
                info!(device = %node, "audio capture granted");
                Permission::Granted
            }
            Ok(None) => {
                warn!(dir = ?self.device_dir, "no capture device found");
                Permission::Denied
            }
            Err(e) => {
                warn!(?e, dir = ?self.device_dir, "capture devices not accessible");
                Permission::Denied
            }
        }
    }
}

/// `pcmC0D0c` is a capture node, `pcmC0D0p` is playback
fn is_capture_node(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("pcmC") else {
        return false;
    };
    let Some(rest) = rest.strip_suffix('c') else {
        return false;
    };
    let Some((card, device)) = rest.split_once('D') else {
        return false;
    };
    let numeric = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());

    let matched = numeric(card) && numeric(device);
    debug!(name, matched, "checked device node");
    matched
}
