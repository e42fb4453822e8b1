use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::state::SharedState;
use crate::{api, auth, ws};

/// Build the main application router with all routes.
pub fn build_router(state: SharedState) -> Router {
    let protected = Router::new()
        .route("/api/status", get(api::status))
        .route("/api/connectors", get(api::list_connectors))
        .route("/api/connectors/{id}", get(api::get_connector))
        .route("/api/connectors/{id}/session", get(api::connector_session))
        .route("/api/connectors/{id}/deactivate", post(api::deactivate))
        .route("/api/connectors/{id}/pair", post(api::trigger_pair))
        .route("/api/connectors/{id}/restart", post(api::restart))
        .route("/ws/agent", get(ws::agent_ws_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
