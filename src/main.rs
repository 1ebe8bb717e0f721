use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{load_env_file, StorageBackend, TurnstileConfig};
use turnstile::gateway::GatewayServer;
use turnstile::ratelimit::{CounterStore, MemoryStore, RateLimiter, RedisStore};

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "turnstile")]
#[command(about = "Request admission gateway with timed blocking", version)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Dotenv file read before the environment is consulted
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Override the HTTP listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Override the counter store backend (memory or redis)
    #[arg(short, long)]
    backend: Option<StorageBackend>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Before the filter, so RUST_LOG can come from the file too
    let env_loaded = load_env_file(&args.env_file)?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if env_loaded {
        info!(path = %args.env_file.display(), "Loaded environment file");
    } else {
        debug!(path = %args.env_file.display(), "No environment file found");
    }

    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(backend) = args.backend {
        config.storage.backend = backend;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        address_limit = config.limits.address_limit,
        token_limit = config.limits.token_limit,
        block_secs = config.limits.block_time.as_secs_f64(),
        order = ?config.limits.order,
        backend = ?config.storage.backend,
        "Configuration loaded"
    );

    let store: Arc<dyn CounterStore> = match config.storage.backend {
        StorageBackend::Memory => {
            warn!("Using in-memory counter store; counts are not shared between instances");
            Arc::new(MemoryStore::new())
        }
        StorageBackend::Redis => Arc::new(RedisStore::connect(&config.storage.redis_address).await?),
    };

    let limiter = Arc::new(RateLimiter::new(store, config.limiter_config()));
    info!("Rate limiter initialized");

    let server = GatewayServer::new(config.server.listen_addr, limiter);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Turnstile stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
