use bus_config::JsonFileConfig;
use bus_plugin::PluginRegistry;
use peer::{PeerRuntime, PeerState};
use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config.json".to_owned());
    let broker_url = env::var("BROKER_URL").unwrap_or_else(|_| "ws://127.0.0.1:9000/ws".to_owned());
    let path = env::var("PEER_PATH").unwrap_or_else(|_| "peer".to_owned());

    let config = JsonFileConfig::load(&config_file)
        .await
        .expect("failed to load config.json");
    let plugins = PluginRegistry::new();
    let state = Arc::new(PeerState::new(Arc::new(config), plugins));

    let cancel = CancellationToken::new();
    let runtime = PeerRuntime::new(state);

    info!(url = %broker_url, "peer starting");
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move { runtime.run(broker_url, path, run_cancel).await });

    shutdown_signal().await;
    cancel.cancel();
    let _ = handle.await;
    info!("peer shut down gracefully");
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
