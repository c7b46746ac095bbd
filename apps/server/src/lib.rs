//! Webhook tunnel server: public ingress, endpoint registry and the agent
//! stream server, wired into one axum application.

use std::sync::Arc;

use axum::Router;
use axum::routing::{any, get};
use tower_http::trace::TraceLayer;

pub mod api;
pub mod auth;
pub mod config;
pub mod ingress;
pub mod publish;
pub mod tunnel;

pub use config::{Args, Config};

use publish::{FsBuckets, MemoryStore, Publisher};

/// Shared state for all routes
#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<Publisher>,
    pub config: Arc<Config>,
}

/// Build the application state from a configuration
pub fn build_state(config: Config) -> AppState {
    let store = Arc::new(MemoryStore::new(config.log_max_size, config.log_max_entries));
    let buckets = Arc::new(FsBuckets::new(config.data_dir.clone()));

    AppState {
        publisher: Arc::new(Publisher::new(store, buckets)),
        config: Arc::new(config),
    }
}

/// Assemble the router: the agent tunnel, the recorded-requests listing and
/// the catch-all webhook ingress.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tunnel", get(tunnel::tunnel_handler))
        .route("/api/requests", get(api::list_requests))
        .route("/endpoints", any(ingress::ingress_handler))
        .route("/endpoints/", any(ingress::ingress_handler))
        .route("/endpoints/{*rest}", any(ingress::ingress_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
