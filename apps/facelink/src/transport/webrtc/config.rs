use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::util::vnet::net::Net;

pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "Face Data";

const DEFAULT_STUN_SERVERS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

const ICE_SCHEMES: [&str; 4] = ["stun:", "stuns:", "turn:", "turns:"];

/// ICE agent timers handed to the setting engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IceTimeouts {
    pub disconnected: Duration,
    pub failed: Duration,
    pub keepalive: Duration,
}

impl Default for IceTimeouts {
    fn default() -> Self {
        Self {
            disconnected: Duration::from_secs(5),
            failed: Duration::from_secs(25),
            keepalive: Duration::from_secs(2),
        }
    }
}

/// Configuration for one peer connection attempt.
#[derive(Clone)]
pub struct PeerConfig {
    /// STUN and TURN servers used for candidate discovery
    pub ice_servers: Vec<RTCIceServer>,
    pub data_channel_label: String,
    /// Face frames are only useful while fresh, so the channel is unordered by default
    pub ordered: bool,
    /// `Some(0)` never retransmits
    pub max_retransmits: Option<u16>,
    pub ice_timeouts: IceTimeouts,
    /// Emit a stall warning when the link is not connected within this interval
    pub stall_warning: Option<Duration>,
    /// Virtual network interface; used by tests and the loopback demo
    pub network: Option<Arc<Net>>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            ordered: false,
            max_retransmits: Some(0),
            ice_timeouts: IceTimeouts::default(),
            stall_warning: None,
            network: None,
        }
    }
}

impl fmt::Debug for PeerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let urls: Vec<&str> = self
            .ice_servers
            .iter()
            .flat_map(|server| server.urls.iter().map(String::as_str))
            .collect();
        f.debug_struct("PeerConfig")
            .field("ice_servers", &urls)
            .field("data_channel_label", &self.data_channel_label)
            .field("ordered", &self.ordered)
            .field("max_retransmits", &self.max_retransmits)
            .field("ice_timeouts", &self.ice_timeouts)
            .field("stall_warning", &self.stall_warning)
            .field("virtual_network", &self.network.is_some())
            .finish()
    }
}

impl PeerConfig {
    pub fn builder() -> PeerConfigBuilder {
        PeerConfigBuilder::new()
    }

    /// No STUN or TURN; only host candidates are gathered.
    pub fn host_only() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Default::default()
        }
    }
}

pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: DEFAULT_STUN_SERVERS.iter().map(|url| url.to_string()).collect(),
        ..Default::default()
    }]
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerConfigError {
    #[error("ice server url '{0}' must start with stun:, stuns:, turn: or turns:")]
    InvalidIceUrl(String),
    #[error("turn server '{0}' requires a username and credential")]
    MissingTurnCredentials(String),
    #[error("data channel label must not be empty")]
    EmptyLabel,
}

pub struct PeerConfigBuilder {
    ice_servers: Vec<RTCIceServer>,
    data_channel_label: Option<String>,
    ordered: Option<bool>,
    max_retransmits: Option<Option<u16>>,
    ice_timeouts: Option<IceTimeouts>,
    stall_warning: Option<Duration>,
    network: Option<Arc<Net>>,
}

impl Default for PeerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerConfigBuilder {
    pub fn new() -> Self {
        Self {
            ice_servers: Vec::new(),
            data_channel_label: None,
            ordered: None,
            max_retransmits: None,
            ice_timeouts: None,
            stall_warning: None,
            network: None,
        }
    }

    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls,
            ..Default::default()
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls,
            username,
            credential,
            ..Default::default()
        });
        self
    }

    pub fn data_channel_label(mut self, label: impl Into<String>) -> Self {
        self.data_channel_label = Some(label.into());
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = Some(ordered);
        self
    }

    /// `None` makes the channel reliable.
    pub fn max_retransmits(mut self, max_retransmits: Option<u16>) -> Self {
        self.max_retransmits = Some(max_retransmits);
        self
    }

    pub fn ice_timeouts(mut self, timeouts: IceTimeouts) -> Self {
        self.ice_timeouts = Some(timeouts);
        self
    }

    pub fn stall_warning(mut self, after: Duration) -> Self {
        self.stall_warning = Some(after);
        self
    }

    pub fn virtual_network(mut self, net: Arc<Net>) -> Self {
        self.network = Some(net);
        self
    }

    /// Validate and assemble. An empty server list keeps the public STUN defaults.
    pub fn build(self) -> Result<PeerConfig, PeerConfigError> {
        let mut config = PeerConfig::default();

        if !self.ice_servers.is_empty() {
            for server in &self.ice_servers {
                for url in &server.urls {
                    if !ICE_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
                        return Err(PeerConfigError::InvalidIceUrl(url.clone()));
                    }
                    let is_turn = url.starts_with("turn:") || url.starts_with("turns:");
                    if is_turn && (server.username.is_empty() || server.credential.is_empty()) {
                        return Err(PeerConfigError::MissingTurnCredentials(url.clone()));
                    }
                }
            }
            config.ice_servers = self.ice_servers;
        }

        if let Some(label) = self.data_channel_label {
            if label.trim().is_empty() {
                return Err(PeerConfigError::EmptyLabel);
            }
            config.data_channel_label = label;
        }
        if let Some(ordered) = self.ordered {
            config.ordered = ordered;
        }
        if let Some(max_retransmits) = self.max_retransmits {
            config.max_retransmits = max_retransmits;
        }
        if let Some(timeouts) = self.ice_timeouts {
            config.ice_timeouts = timeouts;
        }
        config.stall_warning = self.stall_warning;
        config.network = self.network;
        Ok(config)
    }
}
