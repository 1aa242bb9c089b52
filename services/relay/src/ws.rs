// Pre-upgrade admission: ban lookup and connection-cap check happen before
// the WebSocket handshake completes, so a banned or excess peer is turned
// away with a plain HTTP status instead of an open socket (spec.md §4.1).

use crate::config::RelayConfig;
use crate::node::Node;
use crate::processor::Processor;
use crate::session::{self, SessionDeps};
use crate::store::Store;
use crate::validator::ValidatorConfig;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;

/// Read frame limit (spec.md §5, §8: "16 MiB accepted; 16 MiB + 1 rejected").
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct WsState {
    pub node: Arc<Node>,
    pub processor: Arc<Processor>,
    pub store: Arc<Store>,
    pub validator_config: Arc<ValidatorConfig>,
    pub relay_config: Arc<RelayConfig>,
}

pub async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<WsState>,
) -> Response {
    let ip = remote.ip();
    if state.node.bans.is_banned(ip).await {
        return (StatusCode::FORBIDDEN, "banned").into_response();
    }
    if state.node.active_connection_count().await >= state.relay_config.throttling.max_connections {
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }

    let ws = ws.max_message_size(MAX_FRAME_SIZE).max_frame_size(MAX_FRAME_SIZE);

    ws.on_upgrade(move |socket| async move {
        let deps = SessionDeps {
            node: state.node,
            processor: state.processor,
            store: state.store,
            validator_config: state.validator_config,
            relay_config: state.relay_config,
        };
        session::run(socket, ip, deps).await;
    })
}
