use broker::accounts::AccountStore;
use broker::{resend_timer, BrokerState};
use bus_config::JsonFileConfig;
use bus_plugin::PluginRegistry;
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let account_file = env::var("ACCOUNT_FILE").unwrap_or_else(|_| "account.json".to_owned());
    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:9000".to_owned());

    let config = JsonFileConfig::load(&account_file)
        .await
        .expect("failed to load account.json");
    let accounts = AccountStore::load(Arc::new(config)).await;
    let plugins = PluginRegistry::new();

    let state = Arc::new(BrokerState::new(accounts, plugins));
    let resend_handle = resend_timer::spawn(state.clone());

    let router = broker::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "broker listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("broker error");

    resend_handle.abort();
    state.shutdown().await;
    info!("broker shut down gracefully");
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
