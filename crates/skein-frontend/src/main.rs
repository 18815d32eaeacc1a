//! Skein frontend server.
//!
//! Loads `config.ron`, applies CLI overrides, and serves clients over raw
//! TCP and WebSocket on one port. Requests on `connector.entryHandler.*`
//! drive a small chat room; any other route is echoed back.
//!
//! Run with: `cargo run -p skein-frontend -- --port 3010`

mod chat;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use clap::Parser;
use skein_cluster::{ClusterFanout, FrontendRemote, ServerInfo, StaticDirectory};
use skein_config::{CliArgs, Config, ConfigError, default_config_dir};
use skein_connector::{Connector, ConnectorError, DictionaryError, RouteDictionary};
use skein_push::create_scheduler;
use skein_session::{
    ChannelRegistry, MemoryChannelStore, ServerId, SessionConfig, SessionRegistry, StoreError,
};
use tracing::{error, info, warn};

use crate::chat::{ChatHandler, NoRemote};

/// Startup failures.
#[derive(Debug, thiserror::Error)]
enum FrontendError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid listen address {0}")]
    Address(String),

    #[error(transparent)]
    Dictionary(#[from] DictionaryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    let config_dir = args.config.clone().or_else(default_config_dir);

    let loaded = match &config_dir {
        Some(dir) => Config::load_or_create(dir),
        None => Ok(Config::default()),
    };
    let (mut config, load_error) = match loaded {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.as_ref().map(|dir| dir.join("logs"));
    skein_log::init_logging(log_dir.as_deref(), cfg!(debug_assertions), Some(&config));

    if let Some(e) = load_error {
        warn!("Failed to load config, using defaults: {e}");
    }

    if let Err(e) = run(config).await {
        error!("skein-frontend failed: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), FrontendError> {
    config.validate()?;

    let host: IpAddr = config
        .server
        .host
        .parse()
        .map_err(|_| FrontendError::Address(config.server.host.clone()))?;
    let addr = SocketAddr::new(host, config.server.client_port);
    let server_id = ServerId::new(config.server.id.clone());

    info!(
        "[{server_id}] starting {} server, scheduler: {:?}, heartbeat: {}s",
        config.server.server_type, config.push.scheduler, config.connector.heartbeat_secs
    );

    let sessions = Arc::new(SessionRegistry::new(
        server_id.clone(),
        SessionConfig {
            single_session: config.session.single_session,
        },
    ));
    let channels = Arc::new(ChannelRegistry::new(
        server_id.clone(),
        config.channel.prefix.clone(),
        Some(Arc::new(MemoryChannelStore::default())),
    ));
    let restored = channels.restore().await?;
    info!("[{server_id}] restored {restored} channels");

    let scheduler = create_scheduler(&config.push, Arc::clone(&sessions), None);
    let handler = Arc::new(ChatHandler::new(
        server_id.clone(),
        Arc::clone(&sessions),
        Arc::clone(&channels),
    ));

    let mut builder = Connector::builder(
        server_id.clone(),
        config.connector.clone(),
        Arc::clone(&sessions),
        scheduler,
        handler.clone(),
    );
    if config.connector.use_dict {
        builder = builder.with_dictionary(RouteDictionary::new(
            config.dictionary.routes.clone(),
            config.dictionary.user_routes.clone(),
        )?);
    }
    let connector = Arc::new(builder.build()?);

    let directory = StaticDirectory::new(vec![ServerInfo {
        id: server_id.clone(),
        server_type: config.server.server_type.clone(),
        host: config.server.host.clone(),
        port: config.server.client_port,
        frontend: config.server.frontend,
    }]);
    let fanout = ClusterFanout::new(
        server_id.clone(),
        &config.cluster,
        Arc::new(NoRemote),
        Arc::new(directory),
        Arc::clone(&channels),
    )
    .with_local(Arc::new(FrontendRemote::new(Arc::clone(&connector))));
    handler.set_fanout(Arc::new(fanout));
    tokio::spawn(chat::leave_on_close(
        Arc::clone(&handler),
        sessions.subscribe(),
    ));

    let stopper = Arc::clone(&connector);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            stopper.shutdown();
        }
    });

    connector.run(addr).await?;
    info!("[{server_id}] stopped");
    Ok(())
}
