//! Configuration for a skein frontend process.
//!
//! Settings persist to disk as `config.ron`, every section falls back to its
//! defaults when missing, and a handful of CLI flags override the file.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    ChannelConfig, ClusterConfig, Config, ConnectorConfig, DictionaryConfig, LogConfig,
    PushConfig, SchedulerKind, ServerConfig, SessionConfig, default_config_dir,
};
pub use error::ConfigError;
