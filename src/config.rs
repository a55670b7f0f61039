//! Client configuration.
//!
//! A [`StageConfig`] is assembled by the external stage-configuration
//! collaborator (or loaded from a TOML file) and handed to
//! [`StageClient::connect`](crate::client::StageClient::connect) once; it
//! is immutable afterwards.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::protocol::{MODE_PEER2PEER, StageError};

fn default_relay_port() -> u16 {
    4464
}

fn default_recv_port() -> u16 {
    4004
}

fn default_reorder_deadline_ms() -> u64 {
    10
}

fn default_mode_flags() -> u8 {
    MODE_PEER2PEER
}

fn default_send_local_shortcut() -> bool {
    true
}

/// Immutable session transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Hostname or IP address of the relay server.
    pub relay_host: String,
    /// Port of the relay server.
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,
    /// Local UDP port the audio renderer sends to.
    #[serde(default = "default_recv_port")]
    pub recv_port: u16,
    /// Offset added to inbound user ports before local delivery
    /// (secondary instances on one machine use 64).
    #[serde(default)]
    pub port_offset: u16,
    /// Legacy real-time thread priority; recorded but scheduling is left
    /// to the async runtime.
    #[serde(default)]
    pub priority: u32,
    /// 32-bit session access token chosen by the session originator.
    pub session_secret: u32,
    /// This device's caller id, `0..32`, assigned by the configuration
    /// collaborator.
    pub caller_id: u8,
    /// Device operation mode bitmask (`MODE_*` flags).
    #[serde(default = "default_mode_flags")]
    pub mode_flags: u8,
    /// How long the sorter may hold a deferred datagram before releasing
    /// it out of order, in milliseconds.
    #[serde(default = "default_reorder_deadline_ms")]
    pub reorder_deadline_ms: u64,
    /// Send to a peer's local endpoint when both devices share a /24.
    #[serde(default = "default_send_local_shortcut")]
    pub send_local_shortcut: bool,
    /// Mark outgoing datagrams with the expedited-forwarding PHB instead
    /// of CS6.
    #[serde(default)]
    pub ef_phb: bool,
    /// Probe peers every 50 ms instead of every 500 ms.
    #[serde(default)]
    pub hires_ping: bool,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            relay_host: "localhost".to_string(),
            relay_port: default_relay_port(),
            recv_port: default_recv_port(),
            port_offset: 0,
            priority: 0,
            session_secret: 0,
            caller_id: 0,
            mode_flags: default_mode_flags(),
            reorder_deadline_ms: default_reorder_deadline_ms(),
            send_local_shortcut: default_send_local_shortcut(),
            ef_phb: false,
            hires_ping: false,
        }
    }
}

impl StageConfig {
    /// Ping period derived from the resolution flag, in milliseconds.
    pub fn ping_period_ms(&self) -> u64 {
        if self.hires_ping {
            50
        } else {
            500
        }
    }

    /// Load a configuration from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self, StageError> {
        let content = fs::read_to_string(path)?;
        let cfg: StageConfig =
            toml::from_str(&content).map_err(|e| StageError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load `stagelink/config.toml` from the user's configuration
    /// directory.
    pub fn load() -> Result<Self, StageError> {
        let dir = dirs::config_dir()
            .ok_or_else(|| StageError::Config("no user configuration directory".to_string()))?;
        Self::load_from(&dir.join("stagelink").join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), StageError> {
        if self.caller_id as usize >= crate::protocol::MAX_STAGE_ID {
            return Err(StageError::Config(format!(
                "caller id {} out of range (max {})",
                self.caller_id,
                crate::protocol::MAX_STAGE_ID - 1
            )));
        }
        if self.relay_host.is_empty() {
            return Err(StageError::Config("relay host must not be empty".to_string()));
        }
        Ok(())
    }
}
