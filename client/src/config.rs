//! Session Configuration
//!
//! Defaults suit a public STUN server and a broadcast bus; every field can be
//! overridden from JSON or from environment variables.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use vc_mesh_common::protocol::topics::{DEFAULT_PRESENCE_TEMPLATE, DEFAULT_SIGNAL_TEMPLATE};

/// ICE server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl Default for IceServerConfig {
    fn default() -> Self {
        Self {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            username: None,
            credential: None,
        }
    }
}

/// Voice activity thresholds (RMS of samples in `[-1.0, 1.0]`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakingConfig {
    /// Level that must be exceeded to start speaking.
    pub start_threshold: f32,
    /// Level that must be undercut to stop speaking.
    pub stop_threshold: f32,
    /// Sampling period in milliseconds.
    pub interval_ms: u64,
}

impl SpeakingConfig {
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for SpeakingConfig {
    fn default() -> Self {
        Self {
            start_threshold: 0.04,
            stop_threshold: 0.02,
            interval_ms: 100,
        }
    }
}

/// Configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ice_servers: Vec<IceServerConfig>,
    /// Presence topic template, `{room}` is replaced by the room id.
    pub presence_topic: String,
    /// Signaling topic template, `{room}` is replaced by the room id.
    pub signal_topic: String,
    pub speaking: SpeakingConfig,
    /// Re-publish our own `join` when an unknown peer announces itself.
    pub reannounce_on_peer_join: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig::default()],
            presence_topic: DEFAULT_PRESENCE_TEMPLATE.to_string(),
            signal_topic: DEFAULT_SIGNAL_TEMPLATE.to_string(),
            speaking: SpeakingConfig::default(),
            reannounce_on_peer_join: true,
        }
    }
}

impl SessionConfig {
    /// Load configuration from environment variables on top of the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(stun) = env::var("VC_MESH_STUN_SERVER") {
            config.ice_servers = vec![IceServerConfig {
                urls: vec![stun],
                ..IceServerConfig::default()
            }];
        }

        if let Ok(turn) = env::var("VC_MESH_TURN_SERVER") {
            config.ice_servers.push(IceServerConfig {
                urls: vec![turn],
                username: env::var("VC_MESH_TURN_USERNAME").ok(),
                credential: env::var("VC_MESH_TURN_CREDENTIAL").ok(),
            });
        }

        if let Ok(v) = env::var("VC_MESH_SPEAKING_START") {
            config.speaking.start_threshold = v
                .parse()
                .context("VC_MESH_SPEAKING_START must be a number")?;
        }
        if let Ok(v) = env::var("VC_MESH_SPEAKING_STOP") {
            config.speaking.stop_threshold = v
                .parse()
                .context("VC_MESH_SPEAKING_STOP must be a number")?;
        }
        if let Ok(v) = env::var("VC_MESH_SPEAKING_INTERVAL_MS") {
            config.speaking.interval_ms = v
                .parse()
                .context("VC_MESH_SPEAKING_INTERVAL_MS must be an integer")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject threshold pairs without a hysteresis gap.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.speaking.stop_threshold < self.speaking.start_threshold,
            "speaking stop threshold ({}) must be below start threshold ({})",
            self.speaking.stop_threshold,
            self.speaking.start_threshold
        );
        anyhow::ensure!(self.speaking.interval_ms > 0, "speaking interval must be > 0");
        Ok(())
    }
}
