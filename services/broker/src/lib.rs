pub mod accounts;
pub mod bootstrap_key;
pub mod broker;
pub mod error;
pub mod file_relay;
pub mod resend_timer;
pub mod state;

pub use state::BrokerState;

use axum::routing::get;
use axum::Router;
use std::sync::Arc;

pub fn build_router(state: Arc<BrokerState>) -> Router {
    Router::new()
        .route("/ws", get(broker::ws_handler))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;

    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }

    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
