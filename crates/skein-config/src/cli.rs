//! Command-line argument parsing for the frontend process.

use std::path::PathBuf;

use clap::Parser;

use crate::{Config, SchedulerKind};

/// Skein frontend command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "skein-frontend", about = "Skein frontend server")]
pub struct CliArgs {
    /// Server id.
    #[arg(long)]
    pub server_id: Option<String>,

    /// Address to bind the client port on.
    #[arg(long)]
    pub host: Option<String>,

    /// Client-facing port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Heartbeat interval in seconds (0 disables heartbeats).
    #[arg(long)]
    pub heartbeat: Option<u64>,

    /// Push scheduling policy.
    #[arg(long, value_enum)]
    pub scheduler: Option<SchedulerKind>,

    /// Log filter (error, warn, info, debug, trace, or an EnvFilter directive).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref id) = args.server_id {
            self.server.id = id.clone();
        }
        if let Some(ref host) = args.host {
            self.server.host = host.clone();
        }
        if let Some(port) = args.port {
            self.server.client_port = port;
        }
        if let Some(secs) = args.heartbeat {
            self.connector.heartbeat_secs = secs;
        }
        if let Some(kind) = args.scheduler {
            self.push.scheduler = kind;
        }
        if let Some(ref level) = args.log_level {
            self.log.level = level.clone();
        }
    }
}
