//! # Redka Server
//!
//! Scheduler daemon: promotes delayed jobs, recovers jobs whose worker
//! stopped heartbeating and emits configured batches until shut down.

use redka_config::{ConfigLoader, ObservabilityConfig};
use redka_server::app::AppBuilder;
use redka_server::startup::{print_banner, print_startup_info};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match ConfigLoader::from_default_location() {
        Ok(loader) => loader.get().await,
        Err(e) => {
            init_logging(&ObservabilityConfig::default());
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config.observability);
    print_banner();
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    print_startup_info(&config);

    if let Err(e) = AppBuilder::new()
        .with_config(config)
        .run(shutdown_signal())
        .await
    {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(config: &ObservabilityConfig) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},redka=debug", config.log_level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.is_json() {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

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
                error!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        () = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
