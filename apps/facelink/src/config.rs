use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::webrtc::{DEFAULT_DATA_CHANNEL_LABEL, PeerConfig, PeerConfigError};

const DEFAULT_FRAME_RATE: u32 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Toml(String),
    #[error(transparent)]
    Peer(#[from] PeerConfigError),
    #[error("frame_rate must be between 1 and 120, got {0}")]
    FrameRate(u32),
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        ConfigError::Toml(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerEntry {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// On-disk settings for the `facelink` binary.
///
/// ```toml
/// data_channel_label = "Face Data"
/// store_dir = "/tmp/facelink"
/// stall_warning_secs = 20
/// frame_rate = 30
///
/// [[ice_servers]]
/// urls = ["turn:turn.example.org:3478"]
/// username = "face"
/// credential = "secret"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FacelinkConfig {
    /// Empty keeps the public STUN defaults
    pub ice_servers: Vec<IceServerEntry>,
    pub data_channel_label: String,
    pub store_dir: Option<PathBuf>,
    pub stall_warning_secs: Option<u64>,
    pub frame_rate: u32,
}

impl Default for FacelinkConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            store_dir: None,
            stall_warning_secs: None,
            frame_rate: DEFAULT_FRAME_RATE,
        }
    }
}

impl FacelinkConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&raw)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: FacelinkConfig = toml::from_str(raw)?;
        if !(1..=120).contains(&config.frame_rate) {
            return Err(ConfigError::FrameRate(config.frame_rate));
        }
        Ok(config)
    }

    /// Add plain STUN/TURN urls given on the command line.
    pub fn with_extra_servers(mut self, urls: &[String]) -> Self {
        if !urls.is_empty() {
            self.ice_servers.push(IceServerEntry {
                urls: urls.to_vec(),
                username: None,
                credential: None,
            });
        }
        self
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.frame_rate.max(1)))
    }

    pub fn peer_config(&self) -> Result<PeerConfig, ConfigError> {
        let mut builder = PeerConfig::builder().data_channel_label(self.data_channel_label.clone());
        for server in &self.ice_servers {
            builder = match (&server.username, &server.credential) {
                (Some(username), Some(credential)) => builder.add_ice_server_with_credentials(
                    server.urls.clone(),
                    username.clone(),
                    credential.clone(),
                ),
                _ => builder.add_ice_server(server.urls.clone()),
            };
        }
        if let Some(secs) = self.stall_warning_secs {
            builder = builder.stall_warning(Duration::from_secs(secs));
        }
        Ok(builder.build()?)
    }
}
