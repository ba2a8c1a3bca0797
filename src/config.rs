//! Configuration loading and management

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::permission::{CaptureDeviceGate, FixedGate, Permission, PermissionGate};
use crate::state::CallSettings;

const DEFAULT_AGENT_ID: &str = "gjXeuTR2Uf25WNrBWeul";
const DEFAULT_GREETING: &str = "Hello! I'm your AI assistant. How can I help you today?";
const DEFAULT_CLEANUP_DELAY_MS: u64 = 100;
const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CONNECT_DELAY_MS: u64 = 250;
const DEFAULT_CAPTURE_DIR: &str = "/dev/snd";

/// How the daemon answers microphone permission requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicPolicy {
    /// Look for a capture device on the host
    Probe,
    Allow,
    Deny,
}

impl std::str::FromStr for MicPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "probe" => Ok(MicPolicy::Probe),
            "allow" => Ok(MicPolicy::Allow),
            "deny" => Ok(MicPolicy::Deny),
            other => bail!("unknown microphone policy {other:?} (expected probe, allow or deny)"),
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// Remote agent that calls are opened with
    pub agent_id: String,

    /// Opening message sent once per connected call
    pub greeting: String,

    /// Debounce window between teardown and the return to Idle
    pub cleanup_delay: Duration,

    /// Longest wait for the remote service to acknowledge a close
    pub close_timeout: Duration,

    pub mic_policy: MicPolicy,

    /// Directory probed for capture devices under `MicPolicy::Probe`
    pub capture_dir: PathBuf,

    /// Simulated connection latency of the loopback session client
    pub connect_delay: Duration,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let home = lookup("HOME").context("HOME is not set")?;
        let data_dir = PathBuf::from(&home)
            .join(".local")
            .join("share")
            .join("voice-call");

        let socket_path = lookup("VOICE_CALL_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("daemon.sock"));

        let agent_id = lookup("VOICE_CALL_AGENT_ID").unwrap_or_else(|| DEFAULT_AGENT_ID.to_string());
        if agent_id.trim().is_empty() {
            bail!("VOICE_CALL_AGENT_ID must not be empty");
        }

        let greeting = lookup("VOICE_CALL_GREETING").unwrap_or_else(|| DEFAULT_GREETING.to_string());

        let cleanup_delay = Duration::from_millis(parse_millis(
            &lookup,
            "VOICE_CALL_CLEANUP_DELAY_MS",
            DEFAULT_CLEANUP_DELAY_MS,
        )?);
        let close_timeout = Duration::from_millis(parse_millis(
            &lookup,
            "VOICE_CALL_CLOSE_TIMEOUT_MS",
            DEFAULT_CLOSE_TIMEOUT_MS,
        )?);
        if close_timeout.is_zero() {
            bail!("VOICE_CALL_CLOSE_TIMEOUT_MS must be greater than zero");
        }
        let connect_delay = Duration::from_millis(parse_millis(
            &lookup,
            "VOICE_CALL_CONNECT_DELAY_MS",
            DEFAULT_CONNECT_DELAY_MS,
        )?);

        let mic_policy = match lookup("VOICE_CALL_MIC_POLICY") {
            Some(value) => value.parse().context("invalid VOICE_CALL_MIC_POLICY")?,
            None => MicPolicy::Probe,
        };

        let capture_dir = lookup("VOICE_CALL_CAPTURE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CAPTURE_DIR));

        Ok(Self {
            socket_path,
            data_dir,
            agent_id,
            greeting,
            cleanup_delay,
            close_timeout,
            mic_policy,
            capture_dir,
            connect_delay,
        })
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create {}", self.data_dir.display()))?;
        Ok(())
    }

    /// Settings handed to the session controller
    pub fn call_settings(&self) -> CallSettings {
        CallSettings {
            agent_id: self.agent_id.clone(),
            greeting: self.greeting.clone(),
            cleanup_delay: self.cleanup_delay,
            close_timeout: self.close_timeout,
        }
    }

    /// Permission gate selected by the microphone policy
    pub fn permission_gate(&self) -> Arc<dyn PermissionGate> {
        match self.mic_policy {
            MicPolicy::Probe => Arc::new(CaptureDeviceGate::new(&self.capture_dir)),
            MicPolicy::Allow => Arc::new(FixedGate(Permission::Granted)),
            MicPolicy::Deny => Arc::new(FixedGate(Permission::Denied)),
        }
    }
}

fn parse_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<u64> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a whole number of milliseconds, got {value:?}")),
        None => Ok(default),
    }
}
