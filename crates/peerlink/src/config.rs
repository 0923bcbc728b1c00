use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::identity::random_token;
use crate::logging::{LogConfig, LogLevel};

pub const CLOUD_HOST: &str = "0.peerjs.com";
pub const CLOUD_PORT: u16 = 443;
pub const DEFAULT_KEY: &str = "peerjs";
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(5000);

/// ICE server entry handed to the transport provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }

    pub fn with_credentials(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: username.into(),
            credential: credential.into(),
        }
    }
}

/// Configuration forwarded untouched to the transport provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub ice_servers: Vec<IceServer>,
    #[serde(default = "default_sdp_semantics")]
    pub sdp_semantics: String,
}

fn default_sdp_semantics() -> String {
    "unified-plan".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::new("stun:stun.l.google.com:19302"),
                IceServer::with_credentials("turn:0.peerjs.com:3478", "peerjs", "peerjsp"),
            ],
            sdp_semantics: default_sdp_semantics(),
        }
    }
}

impl TransportConfig {
    /// No STUN/TURN; host candidates only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            ..Default::default()
        }
    }
}

/// Options recognised by [`crate::Peer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerOptions {
    /// Requested identity; fetched from the server when absent.
    pub identity: Option<String>,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub secure: bool,
    pub key: String,
    pub token: String,
    pub transport: TransportConfig,
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    pub logging: LogConfig,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            identity: None,
            host: CLOUD_HOST.to_string(),
            port: CLOUD_PORT,
            path: "/".to_string(),
            secure: true,
            key: DEFAULT_KEY.to_string(),
            token: random_token(),
            transport: TransportConfig::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT,
            logging: LogConfig::default(),
        }
    }
}

impl PeerOptions {
    /// Options for a self-hosted signaling server.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secure: false,
            ..Default::default()
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.logging.level = level;
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Path with guaranteed leading and trailing slashes.
    pub fn normalized_path(&self) -> String {
        let trimmed = self.path.trim_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}/")
        }
    }

    /// Load options from `PEERLINK_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut options = Self::default();
        if let Ok(host) = env::var("PEERLINK_HOST") {
            options.host = host;
        }
        if let Some(port) = parse_env::<u16>("PEERLINK_PORT")? {
            options.port = port;
        }
        if let Ok(path) = env::var("PEERLINK_PATH") {
            options.path = path;
        }
        if let Some(secure) = parse_env::<bool>("PEERLINK_SECURE")? {
            options.secure = secure;
        }
        if let Ok(key) = env::var("PEERLINK_KEY") {
            options.key = key;
        }
        if let Ok(token) = env::var("PEERLINK_TOKEN") {
            options.token = token;
        }
        if let Ok(id) = env::var("PEERLINK_ID") {
            if !id.trim().is_empty() {
                options.identity = Some(id);
            }
        }
        if let Some(ms) = parse_env::<u64>("PEERLINK_HEARTBEAT_MS")? {
            if ms == 0 {
                return Err(ConfigError::Invalid {
                    var: "PEERLINK_HEARTBEAT_MS",
                    value: ms.to_string(),
                });
            }
            options.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(level) = parse_env::<LogLevel>("PEERLINK_DEBUG")? {
            options.logging.level = level;
        }
        if let Ok(file) = env::var("PEERLINK_LOG_FILE") {
            options.logging.file = Some(file.into());
        }
        Ok(options)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(None),
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
