//! Portal5 - transparent URL-rewriting proxy.
//!
//! This is the main binary. It runs:
//! - the HTTP front end browsers talk to
//! - the interception pipeline behind it
//! - background sweeps for client records, transient entries and contexts

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use directories::ProjectDirs;
use portal5_app::{resolve_settings, PortalConfig};
use portal5_proxy::{ContextRegistry, HttpUpstream, InterceptionPipeline, ProxyContext};
use portal5_server::{AppState, Server, ServerConfig};
use portal5_storage::{ClientContextTracker, Database, TransientStore};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Portal5 - transparent URL-rewriting proxy
#[derive(Parser, Debug)]
#[command(name = "portal5", version, about)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind to (overrides the configuration)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind to (overrides the configuration)
    #[arg(long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "portal5", "portal5").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("portal5={},warn", log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("portal5")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

fn load_config(args: &Args) -> anyhow::Result<PortalConfig> {
    let mut config = match &args.config {
        Some(path) => {
            tracing::info!("Loading configuration from {:?}", path);
            PortalConfig::load(path)?
        }
        None => PortalConfig::default(),
    };

    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the guard alive for the duration of the program
    let _log_guard = init_logging(&args);

    tracing::info!("Starting Portal5...");
    tracing::debug!("Args: {:?}", args);

    let config = load_config(&args)?;

    let db = match &config.db_path {
        Some(path) => Database::with_path(path),
        None => Database::new(),
    }
    .map_err(|e| anyhow::anyhow!("Database error: {}", e))?;

    let settings = resolve_settings(&db, &config)?;
    tracing::info!(
        id = %settings.id,
        origin = %settings.origin,
        backend = %config.backend,
        "Worker settings loaded"
    );

    let store = Arc::new(TransientStore::new(Arc::new(db.clone())));
    let registry = Arc::new(ContextRegistry::with_timeout(config.heartbeat_timeout()));
    let clients = Arc::new(
        ClientContextTracker::new(store.clone())
            .with_cap(config.record_cap)
            .with_sweep_interval(config.sweep_interval()),
    );
    let upstream = Arc::new(HttpUpstream::new(
        settings.origin.clone(),
        config.backend_url()?,
    )?);

    let ctx = ProxyContext::new(settings, store.clone(), registry.clone(), upstream)
        .with_routes(config.route_table()?)
        .with_passthrough(config.passthrough.clone())
        .with_clients(clients.clone())
        .with_probing(config.probe_policy(), config.probe_timeout());

    tokio::spawn(clients.start_sweeping(registry.clone()));
    tokio::spawn(store.start_expiry_sweep(config.purge_interval()));
    tokio::spawn(registry.clone().start_pruning(config.heartbeat_timeout()));

    let state = AppState::new(InterceptionPipeline::new(Arc::new(ctx)), registry);
    let server_config = ServerConfig::default()
        .with_host(config.host.clone())
        .with_port(config.port);
    let server = Server::with_state(server_config, state)?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
        })
        .await?;

    tracing::info!("Portal5 shutting down");
    Ok(())
}
