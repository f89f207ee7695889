use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::state::SharedState;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub store: Arc<dyn Store>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/snapshot", get(api_snapshot))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn api_snapshot(State(state): State<AppState>) -> Response {
    match state.store.read_snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => {
            error!("web: snapshot read failed: {e}");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

/// Serve the status API. A bind failure disables the API but leaves the
/// hub running.
pub async fn serve(state: AppState, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(%addr, "web: bind failed, status api disabled: {e}");
            return;
        }
    };

    info!("status api listening on http://{addr}");

    if let Err(e) = axum::serve(listener, router(state)).await {
        error!("web server error: {e}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
