use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use droid_mirror::capture::CaptureService;
use droid_mirror::config::ConfigStore;
use droid_mirror::events::EventBus;
use droid_mirror::relay::{self, MediaLauncher};
use droid_mirror::state::AppState;
use droid_mirror::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// droid-mirror command line arguments
#[derive(Parser, Debug)]
#[command(name = "droid-mirror")]
#[command(version, about = "Low-latency Android screen mirroring relay", long_about = None)]
struct CliArgs {
    /// Config file path (created with defaults if missing)
    #[arg(short = 'c', long, value_name = "FILE", default_value = "./droid-mirror.toml")]
    config: PathBuf,

    /// Listen address (overrides config file)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config file)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting droid-mirror v{}", env!("CARGO_PKG_VERSION"));

    let config_store = Arc::new(ConfigStore::new(&args.config).await?);
    tracing::info!("Config file: {}", config_store.path().display());
    let config = config_store.get();

    // CLI overrides apply to this run only and are not persisted
    let bind_address = args.address.unwrap_or_else(|| config.web.bind_address.clone());
    let port = args.port.unwrap_or(config.web.http_port);
    let ip: IpAddr = bind_address
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid bind address: {}", bind_address))?;
    let addr = SocketAddr::new(ip, port);

    let events = Arc::new(EventBus::new());

    let capture: Arc<dyn MediaLauncher> =
        Arc::new(CaptureService::new(config_store.clone(), events.clone()));
    if config.capture.enabled {
        tracing::info!("Local capture enabled ({:?} mode)", config.capture.mode);
    }

    let relay = relay::spawn(config.relay.clone(), events.clone(), Some(capture));
    let state = AppState::new(config_store, relay.clone(), events);
    let app = web::create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);
    tracing::info!("Device socket: ws://{}/ws/device", addr);
    tracing::info!("Viewer socket: ws://{}/ws/viewer", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    relay.shutdown();
    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Initialize logging with the given level and verbosity
fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "droid_mirror=error,tower_http=error",
        LogLevel::Warn => "droid_mirror=warn,tower_http=warn",
        LogLevel::Info => "droid_mirror=info,tower_http=info",
        LogLevel::Verbose => "droid_mirror=debug,tower_http=info",
        LogLevel::Debug => "droid_mirror=debug,tower_http=debug",
        LogLevel::Trace => "droid_mirror=trace,tower_http=debug",
    };

    // RUST_LOG takes priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
