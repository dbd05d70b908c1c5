//! Keyring - network-accessible secret-key store
//!
//! Serves named symmetric keys from an encrypted container file over HTTP.
//! All container access goes through a single worker thread.

mod config;
mod router;

use anyhow::Context;
use clap::Parser;
use keyring_keystore::{dispatcher::DEFAULT_QUEUE_DEPTH, Dispatcher, KeystoreEngine, KeystoreState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "keyring")]
#[command(about = "Network-accessible secret-key store", long_about = None)]
struct Args {
    /// Configuration file (defaults to ./keyring.toml if present)
    #[arg(short, long, env = "KEYRING_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on, overrides server.port
    #[arg(short, long, env = "KEYRING_PORT")]
    port: Option<u16>,

    /// Host to bind to, overrides server.host
    #[arg(long, env = "KEYRING_HOST")]
    host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "KEYRING_LOG_LEVEL")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "keyring={lvl},keyring_keystore={lvl},tower_http=debug",
                    lvl = args.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = config::Config::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }

    info!("Starting Keyring...");
    info!("  Keystore: {}", config.keystore.path.display());
    info!("  Process timeout: {:?}", config.server.process_timeout());

    let engine = KeystoreEngine::open_with(&config.keystore.settings())
        .context("Unable to open the keystore")?;
    info!("  Aliases: {}", engine.list_aliases().len());

    let (dispatcher, worker) = Dispatcher::spawn(engine, DEFAULT_QUEUE_DEPTH)?;
    let state = Arc::new(KeystoreState::new(dispatcher, config.server.process_timeout()));

    // Create router
    let app = router::create_router(state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router held the last dispatcher; the worker drains its queue and exits
    tokio::task::spawn_blocking(move || worker.join())
        .await?
        .map_err(|_| anyhow::anyhow!("Keystore worker panicked"))?;

    info!("Keyring stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Unable to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
