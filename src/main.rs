//! wg-fleet main entry point
//!
//! This binary is the operator front end of the controller. It handles CLI
//! parsing, logging setup, loading the fleet inventory, and the small HTTP
//! surface used for config downloads.

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wg_fleet::{
    config::{validation, FleetConfig},
    control::{DownloadService, Fleet},
    error::FleetError,
    model::{Client, MemoryStore, Server, Store},
    monitoring::MemoryTelemetryCache,
    remote::{ApplyOptions, SshConnector},
    security::Actor,
    wireguard::{KeyPair, PrivateKey},
    APP_NAME, VERSION,
};

/// WireGuard fleet provisioning and reconciliation
#[derive(Parser, Debug)]
#[command(name = APP_NAME, version = VERSION, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(
        short,
        long,
        global = true,
        default_value = "/etc/wg-fleet/config.toml"
    )]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a new private key
    Genkey,

    /// Read a private key from stdin and print its public key
    Pubkey,

    /// Validate and normalize a comma-separated allow-list
    CheckAllowlist {
        /// Allow-list such as "10.0.0.0/8, 192.168.1.10"
        list: String,
    },

    /// Print the config a server would receive
    RenderServer {
        /// Server name from the inventory
        server: String,
    },

    /// Print a client's config document
    RenderClient {
        /// Client name from the inventory
        client: String,
    },

    /// Push the full config to a server
    Apply {
        /// Server name from the inventory
        server: String,

        /// Restart the WireGuard service afterwards
        #[arg(long)]
        restart: bool,

        /// Stop the WireGuard service afterwards
        #[arg(long)]
        stop: bool,
    },

    /// Print live peer statistics of a server as JSON
    Stats {
        /// Server name from the inventory
        server: String,
    },

    /// Serve health and config download endpoints
    Serve,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    // Execute command
    if let Err(e) = run(cli).await {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Initialize structured logging with tracing
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout carries command output
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Run the CLI command
async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Genkey => {
            let keys = KeyPair::generate();
            println!("{}", keys.private.to_base64());
            Ok(())
        }
        Commands::Pubkey => {
            let mut input = zeroize::Zeroizing::new(String::new());
            std::io::stdin()
                .read_to_string(&mut input)
                .context("reading private key from stdin")?;
            let private = PrivateKey::from_base64(input.trim())?;
            println!("{}", private.public_key());
            Ok(())
        }
        Commands::CheckAllowlist { list } => {
            let normalized = validation::normalize_allow_list(&list)?;
            println!("{}", normalized);
            Ok(())
        }
        Commands::RenderServer { server } => {
            let (fleet, _) = load_fleet(&cli.config).await?;
            let server = find_server(&fleet, &server).await?;
            print!("{}", fleet.server_config(&operator(), server.id).await?);
            Ok(())
        }
        Commands::RenderClient { client } => {
            let (fleet, _) = load_fleet(&cli.config).await?;
            let client = find_client(&fleet, &client).await?;
            print!("{}", fleet.client_config(&operator(), client.id).await?);
            Ok(())
        }
        Commands::Apply {
            server,
            restart,
            stop,
        } => {
            let (fleet, _) = load_fleet(&cli.config).await?;
            let server = find_server(&fleet, &server).await?;
            fleet.provision_credentials(server.id).await?;

            let options = ApplyOptions { restart, stop };
            let report = fleet.sync_server(&operator(), server.id, options).await?;
            if report.ok {
                info!("Server '{}' reconciled", server.name);
                Ok(())
            } else {
                anyhow::bail!(
                    "apply to '{}' failed: {}",
                    server.name,
                    report.msg.unwrap_or_default()
                )
            }
        }
        Commands::Stats { server } => {
            let (fleet, _) = load_fleet(&cli.config).await?;
            let server = find_server(&fleet, &server).await?;
            let stats = fleet.refresh_stats(&operator(), server.id).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Commands::Serve => {
            let (fleet, config) = load_fleet(&cli.config).await?;
            let downloads = DownloadService::new(fleet.store().clone());
            let app = create_http_server(downloads);

            let addr = format!("{}:{}", config.http.bind_address, config.http.bind_port);
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("binding {}", addr))?;
            info!("HTTP server listening on {}", addr);

            // Run server with graceful shutdown
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            info!("Shutting down {}", APP_NAME);
            Ok(())
        }
        Commands::Version => {
            println!("{} v{}", APP_NAME, VERSION);
            Ok(())
        }
    }
}

fn operator() -> Actor {
    Actor::operator("cli")
}

/// Load the configuration and seed an in-memory fleet from its inventory
async fn load_fleet(path: &str) -> anyhow::Result<(Fleet, FleetConfig)> {
    info!("Starting {} v{} with config: {}", APP_NAME, VERSION, path);
    let config = FleetConfig::from_file(path).with_context(|| format!("loading {}", path))?;

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let connector = Arc::new(SshConnector::new(
        config.controller.staging_dir.join("control"),
    ));
    let cache = Arc::new(MemoryTelemetryCache::new());
    let fleet = Fleet::new(store, connector, cache, config.controller.clone());

    let summary = fleet.import_inventory(&operator(), &config.inventory).await?;
    if summary.servers == 0 {
        warn!("No servers configured in {}", path);
    }
    Ok((fleet, config))
}

async fn find_server(fleet: &Fleet, name: &str) -> anyhow::Result<Server> {
    fleet
        .store()
        .list_servers()
        .await?
        .into_iter()
        .find(|s| s.name == name)
        .ok_or_else(|| FleetError::NotFound(format!("server '{}'", name)).into())
}

async fn find_client(fleet: &Fleet, name: &str) -> anyhow::Result<Client> {
    for server in fleet.store().list_servers().await? {
        let found = fleet
            .store()
            .list_clients(server.id)
            .await?
            .into_iter()
            .find(|c| c.name == name);
        if let Some(client) = found {
            return Ok(client);
        }
    }
    Err(FleetError::NotFound(format!("client '{}'", name)).into())
}

/// Create HTTP server with routes
fn create_http_server(downloads: DownloadService) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/cfg/:token/", get(download_config))
        .with_state(downloads)
}

/// Health check endpoint
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Token download endpoint
async fn download_config(
    State(downloads): State<DownloadService>,
    Path(token): Path<String>,
) -> Response {
    match downloads.download(&token).await {
        Ok(download) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, download.content_type.to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", download.filename),
                ),
            ],
            download.body,
        )
            .into_response(),
        Err(FleetError::NotFound(_)) => (StatusCode::NOT_FOUND, "Config not found").into_response(),
        Err(e) => {
            error!("Download failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
