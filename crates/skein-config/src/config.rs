//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Largest body the 24-bit packet length field can carry.
const MAX_PACKET_BODY: usize = 0x00FF_FFFF;

/// Top-level frontend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Identity of this process in the cluster.
    pub server: ServerConfig,
    /// Client-facing connector.
    pub connector: ConnectorConfig,
    /// Session registry.
    pub session: SessionConfig,
    /// Push scheduling.
    pub push: PushConfig,
    /// Channel registry.
    pub channel: ChannelConfig,
    /// Cross-server fan-out.
    pub cluster: ClusterConfig,
    /// Route compression dictionary.
    pub dictionary: DictionaryConfig,
    /// Logging.
    pub log: LogConfig,
}

/// Identity of this process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Cluster-unique server id.
    pub id: String,
    /// Server type, e.g. `connector`.
    pub server_type: String,
    /// Address to bind the client port on.
    pub host: String,
    /// Client-facing port.
    pub client_port: u16,
    /// Whether this process holds client sockets.
    pub frontend: bool,
}

/// Connector settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Heartbeat interval in seconds (0 = heartbeat disabled).
    pub heartbeat_secs: u64,
    /// Inbound heartbeat timeout in seconds (0 = twice the interval).
    pub heartbeat_timeout_secs: u64,
    /// Close connections that do not finish the handshake in time.
    pub handshake_timeout_secs: u64,
    /// Close connections that send nothing before protocol detection.
    pub sniff_timeout_secs: u64,
    /// Maximum concurrent connections (0 = unlimited).
    pub max_connections: usize,
    /// Maximum packet body size in bytes.
    pub max_packet_size: usize,
    /// Set `TCP_NODELAY` on raw TCP clients.
    pub set_no_delay: bool,
    /// Compress routes through the dictionary.
    pub use_dict: bool,
    /// Encode bodies through the schema codec when a schema exists.
    pub use_proto: bool,
    /// Disconnect clients that miss the heartbeat timeout.
    pub disconnect_on_timeout: bool,
}

/// Session registry settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// At most one session per user.
    pub single_session: bool,
}

/// Push scheduling policy.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum,
)]
pub enum SchedulerKind {
    /// Send every push immediately.
    #[default]
    Direct,
    /// Queue pushes per session and flush on a timer.
    Buffered,
}

/// Push scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PushConfig {
    /// Scheduling policy.
    pub scheduler: SchedulerKind,
    /// Flush period of the buffered policy, in milliseconds.
    pub flush_interval_ms: u64,
}

/// Channel registry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    /// Store key prefix.
    pub prefix: String,
}

/// Fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Per-group remote call timeout in milliseconds.
    pub rpc_timeout_ms: u64,
}

/// Route dictionary contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DictionaryConfig {
    /// Handler routes (`serverType.handler.method`); sorted before coding.
    pub routes: Vec<String>,
    /// Extra routes, coded after the handler routes in the given order.
    pub user_routes: Vec<String>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: "connector-server-1".to_string(),
            server_type: "connector".to_string(),
            host: "0.0.0.0".to_string(),
            client_port: 3010,
            frontend: true,
        }
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 30,
            heartbeat_timeout_secs: 0,
            handshake_timeout_secs: 90,
            sniff_timeout_secs: 90,
            max_connections: 0,
            max_packet_size: 1_048_576,
            set_no_delay: true,
            use_dict: false,
            use_proto: false,
            disconnect_on_timeout: true,
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerKind::Direct,
            flush_interval_ms: 20,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefix: "skein:channel".to_string(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 5_000,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info,tungstenite=warn".to_string(),
        }
    }
}

// --- Derived values ---

impl ConnectorConfig {
    /// Heartbeat interval, or `None` when disabled.
    pub fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_secs > 0).then(|| Duration::from_secs(self.heartbeat_secs))
    }

    /// Inbound heartbeat timeout, or `None` when heartbeats are disabled or
    /// timeouts do not disconnect.
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        let interval = self.heartbeat()?;
        if !self.disconnect_on_timeout {
            return None;
        }
        if self.heartbeat_timeout_secs > 0 {
            Some(Duration::from_secs(self.heartbeat_timeout_secs))
        } else {
            Some(interval * 2)
        }
    }

    /// Handshake idle window.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Protocol sniff window. `None` when `sniff_timeout_secs` is 0.
    pub fn sniff_timeout(&self) -> Option<Duration> {
        (self.sniff_timeout_secs > 0).then(|| Duration::from_secs(self.sniff_timeout_secs))
    }
}

impl PushConfig {
    /// Buffered flush period.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl ClusterConfig {
    /// Per-group remote call timeout.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Platform config directory for skein, e.g. `~/.config/skein`.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("skein"))
}

// --- Load / Save / Reload / Validate ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.id.is_empty() {
            return Err(ConfigError::Invalid {
                field: "server.id",
                reason: "must not be empty".to_string(),
            });
        }
        if self.connector.max_packet_size > MAX_PACKET_BODY {
            return Err(ConfigError::Invalid {
                field: "connector.max_packet_size",
                reason: format!("{} exceeds {MAX_PACKET_BODY}", self.connector.max_packet_size),
            });
        }
        if self.push.scheduler == SchedulerKind::Buffered && self.push.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "push.flush_interval_ms",
                reason: "must be positive for the buffered scheduler".to_string(),
            });
        }
        if self.dictionary.routes.len() + self.dictionary.user_routes.len() > u16::MAX as usize {
            return Err(ConfigError::Invalid {
                field: "dictionary",
                reason: "more routes than 16-bit codes".to_string(),
            });
        }
        Ok(())
    }
}
