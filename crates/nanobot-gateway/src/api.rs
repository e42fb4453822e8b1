use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nanobot_common::{ConnectorId, Error};
use serde::Serialize;
use tracing::{info, warn};

use crate::state::SharedState;

#[derive(Serialize)]
pub struct CommandAccepted {
    pub accepted: bool,
    pub command: &'static str,
    pub connector_id: ConnectorId,
}

/// GET /api/status: gateway summary.
pub async fn status(State(state): State<SharedState>) -> impl IntoResponse {
    let connectors = state.board.list();
    let ready = connectors
        .iter()
        .filter(|s| s.state == nanobot_common::BridgeState::Ready)
        .count();
    Json(serde_json::json!({
        "status": "running",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "connectors": connectors.len(),
        "ready": ready,
        "agent_attached": state.inbox.is_attached(),
        "router": state.router_stats.snapshot(),
    }))
}

/// GET /api/connectors: status of every registered connector.
pub async fn list_connectors(State(state): State<SharedState>) -> impl IntoResponse {
    Json(serde_json::json!({ "connectors": state.board.list() }))
}

/// GET /api/connectors/{id}
pub async fn get_connector(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Response {
    let id = ConnectorId::from_string(id);
    match state.board.get(&id) {
        Some(status) => Json(status).into_response(),
        None => error_response(&Error::NotFound(format!("connector '{id}'"))),
    }
}

/// GET /api/connectors/{id}/session: pairing status and audit trail.
/// The credential itself never leaves the store.
pub async fn connector_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Response {
    let id = ConnectorId::from_string(id);
    if state.board.get(&id).is_none() {
        return error_response(&Error::NotFound(format!("connector '{id}'")));
    }
    match state.sessions.load(&id) {
        Ok(Some(session)) => Json(serde_json::json!({
            "connector_id": session.connector_id,
            "status": session.status,
            "updated_at": session.updated_at,
            "history": session.history,
        }))
        .into_response(),
        Ok(None) => error_response(&Error::NotFound(format!("no session for '{id}'"))),
        Err(e) => error_response(&e),
    }
}

/// POST /api/connectors/{id}/deactivate
pub async fn deactivate(State(state): State<SharedState>, Path(id): Path<String>) -> Response {
    let id = ConnectorId::from_string(id);
    accepted("deactivate", &id, state.supervisor.deactivate(&id))
}

/// POST /api/connectors/{id}/pair
pub async fn trigger_pair(State(state): State<SharedState>, Path(id): Path<String>) -> Response {
    let id = ConnectorId::from_string(id);
    accepted("pair", &id, state.supervisor.trigger_pair(&id))
}

/// POST /api/connectors/{id}/restart
pub async fn restart(State(state): State<SharedState>, Path(id): Path<String>) -> Response {
    let id = ConnectorId::from_string(id);
    accepted("restart", &id, state.supervisor.restart(&id))
}

fn accepted(command: &'static str, id: &ConnectorId, result: nanobot_common::Result<()>) -> Response {
    match result {
        Ok(()) => {
            info!(connector = %id, command, "operator command accepted");
            (
                StatusCode::ACCEPTED,
                Json(CommandAccepted {
                    accepted: true,
                    command,
                    connector_id: id.clone(),
                }),
            )
                .into_response()
        }
        Err(e) => {
            warn!(connector = %id, command, "operator command refused: {e}");
            error_response(&e)
        }
    }
}

pub(crate) fn error_response(error: &Error) -> Response {
    let status = match error {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        Error::Supervisor(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": error.to_string() }))).into_response()
}
