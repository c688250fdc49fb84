//! Galena server entry point

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info};

use galena::config::{Config, StoreKind};
use galena::{create_store, telemetry, Gateway, Hub};

/// Galena — a real-time change-broadcast server over a hierarchical
/// JSON store.
#[derive(Parser, Debug)]
#[command(name = "galena", version, about, long_about = None)]
struct Cli {
    /// Port to listen on (overrides PORT)
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    port: Option<u16>,

    /// Address to bind to
    #[arg(short = 'b', long = "bind", value_name = "ADDR")]
    bind: Option<String>,

    /// Storage backend: memory or mongo (overrides STORE_TYPE)
    #[arg(long = "store", value_name = "KIND")]
    store: Option<String>,

    /// Maximum request body size in megabytes
    #[arg(long = "max-request-size-mb", value_name = "MB")]
    max_request_size_mb: Option<usize>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'l', long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(mb) = cli.max_request_size_mb {
        config.max_request_size_mb = mb;
    }
    if let Some(store) = cli.store {
        match store.parse::<StoreKind>() {
            Ok(kind) => config.store_type = kind,
            Err(e) => {
                eprintln!("galena: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    telemetry::init(&config.log_level);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        store = %config.store_type,
        port = config.port,
        "starting galena"
    );

    let store = match create_store(&config).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "failed to create store");
            return ExitCode::FAILURE;
        }
    };
    info!("{}", store.describe().await);

    let hub = Hub::new(Arc::clone(&store));
    let gateway = Gateway::new(&config, Arc::clone(&store), Arc::clone(&hub));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(());
            }
        }
    });

    let outcome = gateway.start(shutdown_rx).await;
    hub.shutdown().await;

    match outcome {
        Ok(()) => {
            info!("server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "server error");
            ExitCode::FAILURE
        }
    }
}
