//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use crate::constants::*;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Control channel (pub/sub broker) configuration
    pub control: ControlConfig,

    /// Audio parameters advertised in the hello request
    pub audio: AudioConfig,

    /// Session lifecycle configuration
    pub channel: ChannelConfig,

    /// Datagram socket configuration
    pub network: NetworkConfig,
}

/// Control channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Broker host; empty means "not configured"
    pub endpoint: String,

    /// Broker port
    pub port: u16,

    /// Client identifier (generated when empty)
    pub client_id: String,

    pub username: String,

    pub password: String,

    /// Keep-alive interval in seconds
    pub keepalive_secs: u64,

    /// Topic for device -> server messages
    pub publish_topic: String,

    /// Topic for server -> device control messages
    pub subscribe_topic: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_CONTROL_ENDPOINT.to_string(),
            port: DEFAULT_CONTROL_PORT,
            client_id: String::new(),
            username: String::new(),
            password: String::new(),
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            publish_topic: DEFAULT_PUBLISH_TOPIC.to_string(),
            subscribe_topic: DEFAULT_SUBSCRIBE_TOPIC.to_string(),
        }
    }
}

impl ControlConfig {
    /// Topic carrying legacy raw audio payloads
    pub fn audio_topic(&self) -> String {
        format!("{}{}", self.subscribe_topic, AUDIO_SUBTOPIC_SUFFIX)
    }

    /// Configured client id, or a fresh random one
    pub fn effective_client_id(&self) -> String {
        if self.client_id.is_empty() {
            format!("voice-{}", uuid::Uuid::new_v4())
        } else {
            self.client_id.clone()
        }
    }
}

/// Audio configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Payload format name
    pub format: String,

    /// Sample rate requested from the server
    pub sample_rate: u32,

    /// Channel count
    pub channels: u16,

    /// Frame duration in ms
    pub frame_duration_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            format: AUDIO_FORMAT_OPUS.to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            frame_duration_ms: DEFAULT_FRAME_DURATION_MS,
        }
    }
}

/// Session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Upper bound on waiting for the server hello
    pub hello_timeout_ms: u64,

    /// Staleness threshold used by `is_open`
    pub liveness_timeout_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            hello_timeout_ms: DEFAULT_HELLO_TIMEOUT_MS,
            liveness_timeout_secs: DEFAULT_LIVENESS_TIMEOUT_SECS,
        }
    }
}

impl ChannelConfig {
    /// Hello wait, never longer than the default bound
    pub fn hello_timeout(&self) -> Duration {
        Duration::from_millis(self.hello_timeout_ms.min(DEFAULT_HELLO_TIMEOUT_MS))
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }
}

/// Datagram socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local bind address
    pub bind_address: String,

    /// Socket send buffer size
    pub send_buffer_size: usize,

    /// Socket receive buffer size
    pub recv_buffer_size: usize,

    /// Receive thread poll interval in ms
    pub recv_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            send_buffer_size: 256 * 1024,
            recv_buffer_size: 256 * 1024,
            recv_timeout_ms: DEFAULT_RECV_TIMEOUT_MS,
        }
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn load(path: &PathBuf) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &PathBuf) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "voice-device", "secure-voice-link")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
