//! HTTP surface: the WebSocket call endpoint and a health probe.
//!
//! `/tree` upgrades to a WebSocket that speaks JSON command and result
//! frames. The optional `user` query parameter names the identity the
//! connection's calls are filed under.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use serde::{Deserialize, Serialize};

use crate::connection::{User, ws};
use crate::server::SharedState;

pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/tree", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    user: Option<String>,
}

async fn ws_upgrade(
    upgrade: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<SharedState>>,
) -> impl IntoResponse {
    let user = params.user.filter(|u| !u.is_empty()).map(User::new);
    let root = state.dispatcher.clone();
    let send_queue = state.config.send_queue;
    let send_timeout = state.config.send_timeout();
    upgrade.on_upgrade(move |socket| ws::serve(socket, addr, user, root, send_queue, send_timeout))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    live_calls: usize,
}

async fn health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        live_calls: state.dispatcher.bank().len(),
    })
}
