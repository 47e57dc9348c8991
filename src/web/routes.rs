use axum::{
    routing::{any, get, put},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::peer::{device_ws_handler, viewer_ws_handler};
use super::ws::events_ws_handler;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/status", get(handlers::relay_status))
        .route("/config", get(handlers::get_config))
        .route("/config/capture", put(handlers::update_capture_config))
        .route("/events", any(events_ws_handler));

    // Signaling sockets for the two sides of the pair
    let ws_routes = Router::new()
        .route("/device", any(device_ws_handler))
        .route("/viewer", any(viewer_ws_handler));

    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/api", api_routes)
        .nest("/ws", ws_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
