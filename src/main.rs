use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use authguard::cleanup::DeferredCleanupScheduler;
use authguard::config::{AuthGuardConfig, LogFormat, StoreBackend};
use authguard::grpc::GrpcServer;
use authguard::ratelimit::{Clock, RateLimiterEngine, SystemClock};
use authguard::store::{AttemptStore, MemoryAttemptStore};

/// Sliding-window rate limiting gate for magic link authentication.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "AUTHGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Override the gRPC listen address
    #[arg(long)]
    grpc_addr: Option<std::net::SocketAddr>,

    /// Override the log format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AuthGuardConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.grpc_addr {
        config.server.grpc_addr = addr;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    init_tracing(&config);

    info!("Starting Authguard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        grpc_addr = %config.server.grpc_addr,
        backend = ?config.store.backend,
        max_attempts = config.limits.max_attempts,
        window_secs = config.limits.window_secs,
        lockout_secs = config.limits.lockout_secs,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (store, memory_store) = build_store(&config, Arc::clone(&clock)).await?;

    let mut engine = RateLimiterEngine::new(store, Arc::clone(&clock))
        .with_settings(config.limits.settings())
        .with_store_timeout(config.limits.store_timeout());

    if config.cleanup.enabled {
        let scheduler =
            DeferredCleanupScheduler::new(Arc::clone(&clock), config.cleanup.max_pending);

        // Runs for the life of the process, like the sweeper.
        let purge_clock = Arc::clone(&clock);
        let _consumer = scheduler.spawn_consumer(move |_notice| {
            if let Some(store) = &memory_store {
                store.purge_expired(purge_clock.now());
            }
        });

        engine = engine.with_cleanup_scheduler(Arc::new(scheduler));
        info!("Lockout cleanup notices enabled");
    }

    let server = GrpcServer::new(config.server.grpc_addr, Arc::new(engine), clock)
        .accept_client_time(config.server.accept_client_time);

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Authguard stopped");
    Ok(())
}

fn init_tracing(config: &AuthGuardConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Build the configured attempt store. The in-memory store is also returned
/// concretely so due cleanup notices can purge it.
async fn build_store(
    config: &AuthGuardConfig,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<(Arc<dyn AttemptStore>, Option<Arc<MemoryAttemptStore>>)> {
    let sweep_interval = Duration::from_secs(config.store.sweep_interval_secs);

    match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryAttemptStore::new());
            // The sweeper runs for the life of the process.
            let _sweeper = store.spawn_sweeper(clock, sweep_interval);
            info!("Using in-memory attempt store");
            let shared: Arc<dyn AttemptStore> = store.clone();
            Ok((shared, Some(store)))
        }
        #[cfg(feature = "postgres")]
        StoreBackend::Postgres => {
            let url = config
                .store
                .database_url
                .as_deref()
                .ok_or_else(|| {
                    anyhow::anyhow!("store.database_url is required for the postgres backend")
                })?;
            let store =
                authguard::store::PostgresAttemptStore::connect(url, config.store.max_connections)
                    .await?;
            store.ensure_schema().await?;

            let sweeper = store.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(sweep_interval);
                loop {
                    ticker.tick().await;
                    if let Err(e) = sweeper.purge_expired(clock.now()).await {
                        warn!(error = %e, "Failed to purge expired rate limit records");
                    }
                }
            });
            info!("Using postgres attempt store");
            let shared: Arc<dyn AttemptStore> = Arc::new(store);
            Ok((shared, None))
        }
        #[cfg(not(feature = "postgres"))]
        StoreBackend::Postgres => {
            warn!("Postgres backend requested but this build lacks the `postgres` feature");
            anyhow::bail!("postgres backend not compiled in; rebuild with --features postgres")
        }
    }
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
