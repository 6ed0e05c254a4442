//! Burrow relay server
//!
//! Public HTTP front end for reverse tunnels: clients register an identity,
//! dial back into a per-session TCP pool, and receive traffic addressed to
//! `<identity>.<domain>`.

use anyhow::{Context, Result};
use burrow_control::{RegistryConfig, SessionRegistry};
use burrow_pool::{TcpPoolConfig, TcpPoolFactory};
use burrow_server::{BasicAuth, RelayConfig, RelayServer};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Reverse tunnel relay - exposes local services under public subdomains
#[derive(Parser, Debug)]
#[command(name = "burrow-server")]
#[command(about = "Run a reverse tunnel relay server", long_about = None)]
#[command(version = env!("BURROW_VERSION"))]
#[command(long_version = concat!(env!("BURROW_VERSION"), "\nCommit: ", env!("BURROW_COMMIT"), "\nBuilt: ", env!("BURROW_BUILT_AT")))]
struct Cli {
    /// Listen on this port for outside requests
    #[arg(long, env = "BURROW_PORT", default_value = "80")]
    port: u16,

    /// IP address to bind to
    #[arg(long, env = "BURROW_ADDRESS", default_value = "0.0.0.0")]
    address: IpAddr,

    /// Base domain tunnels are served under (required when the relay itself
    /// runs on a subdomain, e.g. clients at <name>.lt.example.com)
    #[arg(long, env = "BURROW_DOMAIN")]
    domain: Option<String>,

    /// Maximum number of TCP sockets each client may hold open at once
    #[arg(long, env = "BURROW_MAX_SOCKETS", default_value = "10")]
    max_sockets: usize,

    /// Let several clients share one identity instead of issuing a new one
    #[arg(long, env = "BURROW_MULTI_POOL")]
    multi_pool: bool,

    /// Basic auth username for the management endpoints
    #[arg(long, env = "BURROW_USERNAME", requires = "password")]
    username: Option<String>,

    /// Basic auth password for the management endpoints
    #[arg(long, env = "BURROW_PASSWORD", requires = "username")]
    password: Option<String>,

    /// Redirect target for `GET /` on the relay's own host
    #[arg(long, env = "BURROW_LANDING")]
    landing: Option<String>,

    /// Report https:// tunnel URLs (TLS is terminated in front of the relay)
    #[arg(long, env = "BURROW_SECURE")]
    secure: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "BURROW_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    info!("Starting burrow relay {}", env!("BURROW_VERSION"));

    let registry = Arc::new(SessionRegistry::new(
        RegistryConfig {
            max_tcp_sockets: cli.max_sockets,
            multi_pool: cli.multi_pool,
            ..Default::default()
        },
        Arc::new(TcpPoolFactory::new(TcpPoolConfig {
            bind_ip: cli.address,
            max_sockets: cli.max_sockets,
            ..Default::default()
        })),
    ));

    let auth = match (cli.username, cli.password) {
        (Some(username), Some(password)) => Some(BasicAuth::new(username, password)),
        _ => None,
    };

    let config = RelayConfig {
        bind_addr: SocketAddr::new(cli.address, cli.port),
        domain: cli.domain,
        secure: cli.secure,
        landing: cli.landing,
        auth,
        ..Default::default()
    };

    match &config.domain {
        Some(domain) => info!("Tunnels will be: {{name}}.{}", domain),
        None => warn!("No --domain set; the first label of any 3+ label host selects a tunnel"),
    }
    if config.auth.is_some() {
        info!("Management endpoints require basic auth");
    }
    if cli.multi_pool {
        info!("Multi-pool mode: clients may share an identity");
    }

    let server = RelayServer::new(config, registry.clone());
    let listener = server.bind().await.context("Failed to start relay")?;
    let mut server_handle = tokio::spawn(server.serve(listener));

    info!("Press Ctrl+C to stop");

    tokio::select! {
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Relay server failed: {}", e),
                Err(e) => error!("Relay server task failed: {}", e),
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping relay...");
            server_handle.abort();
        }
    }

    for id in registry.session_ids() {
        registry.remove_session(&id);
    }
    info!("Relay stopped");

    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error listening for shutdown signal: {}", e);
        }
    }
}
