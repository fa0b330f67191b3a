//! WolfRegistry - Clustered Service Registry
//!
//! Runs a registry node replicating ephemeral instances with Distro.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfregistry::api::HttpServer;
use wolfregistry::cluster::{ClientOptions, ClusterConnectionManager, ClusterMembership, MemberSource};
use wolfregistry::config::{LoggingConfig, RegistryConfig, TransportKind};
use wolfregistry::distro::{
    DistroCodec, DistroMapper, DistroOptions, DistroProtocol, DistroTransportAgent,
    HttpTransportAgent, RpcTransportAgent,
};
use wolfregistry::error::Result;
use wolfregistry::network::NetworkServer;
use wolfregistry::store::DataStore;

/// WolfRegistry - Clustered Service Registry
#[derive(Parser)]
#[command(name = "wolfregistry")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfregistry.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the registry node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfregistry.toml")]
        output: PathBuf,

        /// Cluster address of this node (host:port)
        #[arg(long, default_value = "127.0.0.1:7848")]
        address: String,
    },

    /// Validate configuration file
    Validate,

    /// Show a node's health and cluster view
    Status {
        /// HTTP API address of the node
        #[arg(short, long, default_value = "localhost:8848")]
        address: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when it can be read
    let logging = RegistryConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or(logging.level.clone());
    init_logging(&level, &logging);

    match cli.command {
        Commands::Start => run_start(cli.config).await?,
        Commands::Init { output, address } => run_init(output, address)?,
        Commands::Validate => run_validate(cli.config)?,
        Commands::Status { address } => run_status(address).await?,
    }
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the registry node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting WolfRegistry node...");

    let config = match RegistryConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    let address = config.node.address.clone();
    tracing::info!("Loaded configuration for node: {}", address);

    let membership = Arc::new(ClusterMembership::new(
        address.clone(),
        config.cluster.members.clone(),
    ));
    let store = Arc::new(DataStore::new());
    let mapper = Arc::new(DistroMapper::new(address.clone(), config.initial_members()));
    let codec = DistroCodec::new(config.distro.wire_format, config.distro.compression);
    let connections = Arc::new(ClusterConnectionManager::new(
        address.clone(),
        ClientOptions {
            connect_timeout: config.cluster.connect_timeout(),
            beat_interval: config.cluster.beat_interval(),
            reconnect_interval: config.cluster.reconnect_interval(),
        },
    ));

    let transport: Arc<dyn DistroTransportAgent> = match config.distro.transport {
        TransportKind::Http => Arc::new(HttpTransportAgent::new(
            membership.clone(),
            codec,
            config.cluster.http_port_offset,
            config.distro.sync_timeout(),
            config.distro.snapshot_timeout(),
        )?),
        TransportKind::Rpc => Arc::new(RpcTransportAgent::new(
            membership.clone(),
            connections.clone(),
            codec,
            config.distro.sync_timeout(),
            config.distro.snapshot_timeout(),
        )),
    };
    tracing::info!("Distro transport: {:?}", config.distro.transport);

    let mut protocol = DistroProtocol::new(
        membership.clone(),
        store,
        mapper,
        transport,
        codec,
        DistroOptions::from(&config.distro),
    );
    if config.distro.transport == TransportKind::Rpc {
        protocol = protocol.with_connections(connections.clone());
    }
    let protocol = Arc::new(protocol);

    let network_server = (config.distro.transport == TransportKind::Rpc).then(|| {
        NetworkServer::new(
            config.bind_address().to_string(),
            address.clone(),
            protocol.clone(),
        )
    });

    let http_server = config.api.enabled.then(|| {
        HttpServer::new(
            config.api_bind_address(),
            protocol.clone(),
            membership.clone(),
            config.cluster.http_port_offset,
        )
    });

    if config.distro.transport == TransportKind::Rpc {
        let connections = connections.clone();
        let members = membership.all_members().await;
        tokio::spawn(async move { connections.init(&members).await });
    }

    protocol.start(membership.subscribe());

    tokio::select! {
        result = async {
            match &network_server {
                Some(server) => server.start().await,
                None => std::future::pending().await,
            }
        } => {
            if let Err(e) = result {
                tracing::error!("Cluster RPC server error: {}", e);
            }
        }
        result = async {
            match &http_server {
                Some(server) => server.start().await,
                None => std::future::pending().await,
            }
        } => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    protocol.stop();
    if let Some(server) = &network_server {
        server.stop();
    }
    if let Some(server) = &http_server {
        server.stop();
    }
    connections.shutdown_all().await;

    tracing::info!("WolfRegistry node stopped");
    Ok(())
}

/// Show node health and cluster view
async fn run_status(address: String) -> anyhow::Result<()> {
    let health: serde_json::Value = reqwest::get(format!("http://{}/health", address))
        .await?
        .error_for_status()?
        .json()
        .await?;
    let cluster: serde_json::Value = reqwest::get(format!("http://{}/cluster", address))
        .await?
        .error_for_status()?
        .json()
        .await?;

    println!("Health:");
    println!("{}", serde_json::to_string_pretty(&health)?);
    println!("Cluster Info:");
    println!("{}", serde_json::to_string_pretty(&cluster)?);
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, address: String) -> Result<()> {
    let config_content = format!(
        r#"# WolfRegistry Configuration
# Generated configuration file

[node]
# Cluster address of this node; this is its member identity
address = "{address}"
# bind_address = "0.0.0.0:7848"

[cluster]
members = ["{address}"]
# members = ["10.0.0.1:7848", "10.0.0.2:7848", "10.0.0.3:7848"]
# HTTP API of a member listens on its cluster port plus this offset
http_port_offset = 1000
beat_interval_ms = 3000
reconnect_interval_ms = 3000
connect_timeout_ms = 3000

[distro]
# "rpc" (framed TCP, callbacks) or "http"
transport = "rpc"
# "bincode" or "json"
wire_format = "bincode"
compression = false
sync_timeout_ms = 3000
snapshot_timeout_ms = 30000
verify_interval_ms = 5000
load_retry_delay_ms = 30000
max_time_difference_ms = 5000

[api]
enabled = true
# bind_address = "0.0.0.0:8848"

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to list your cluster members.");
    println!("Then start with: wolfregistry --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match RegistryConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Address: {}", config.node.address);
            println!("  RPC Bind Address: {}", config.bind_address());
            println!("  HTTP API: {}", config.api_bind_address());
            println!("  Members: {}", config.initial_members().len());
            println!("  Transport: {:?}", config.distro.transport);
            println!("  Max Time Difference: {}ms", config.distro.max_time_difference_ms);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
