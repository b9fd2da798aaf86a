//! The second listener, bound to `web_port + 1`, serving `/ws/logs`,
//! `/ws/status`, and `/ws/obs` from one upgrade handler path-switched by
//! URI, mirroring the source's single-socket design rather than three
//! independently bound listeners.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::core::Core;

pub fn build_router(core: Arc<Core>) -> Router {
    Router::new()
        .route("/ws/logs", get(ws_logs))
        .route("/ws/status", get(ws_status))
        .route("/ws/obs", get(ws_obs))
        .with_state(core)
}

async fn ws_logs(ws: WebSocketUpgrade, State(core): State<Arc<Core>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_logs(socket, core))
}

async fn handle_logs(mut socket: WebSocket, core: Arc<Core>) {
    for record in core.bus.replay_logs() {
        let Ok(text) = serde_json::to_string(&record) else {
            continue;
        };
        if socket.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }

    let mut rx = core.bus.subscribe_logs();
    loop {
        tokio::select! {
            record = rx.recv() => {
                match record {
                    Ok(record) => {
                        let Ok(text) = serde_json::to_string(&record) else { continue };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
            incoming = socket.recv() => {
                if incoming.is_none() {
                    return;
                }
            }
        }
    }
}

async fn ws_status(ws: WebSocketUpgrade, State(core): State<Arc<Core>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_status(socket, core))
}

async fn handle_status(mut socket: WebSocket, core: Arc<Core>) {
    let snapshot = core.status().await;
    let Ok(text) = serde_json::to_string(&snapshot) else {
        return;
    };
    if socket.send(Message::Text(text.into())).await.is_err() {
        return;
    }

    let mut rx = core.bus.subscribe_status();
    loop {
        tokio::select! {
            snapshot = rx.recv() => {
                match snapshot {
                    Ok(snapshot) => {
                        let Ok(text) = serde_json::to_string(&snapshot) else { continue };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
            incoming = socket.recv() => {
                if incoming.is_none() {
                    return;
                }
            }
        }
    }
}

/// Connects upstream *before* completing the browser's handshake, so the
/// switcher's subprotocol choice (if any) can be reported back in this
/// same upgrade response per spec §4.7.
async fn ws_obs(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(core): State<Arc<Core>>,
) -> Response {
    let config = core.config_snapshot().await;
    let requested: Vec<String> = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    match crate::obs_proxy::connect_upstream(&config.switcher_host, config.switcher_port, &requested).await {
        Ok((upstream, selected_protocol)) => {
            let mut upgrade = ws;
            if let Some(proto) = selected_protocol {
                upgrade = upgrade.protocols([proto]);
            }
            debug!("browser connected to /ws/obs");
            upgrade
                .on_upgrade(move |browser_ws| crate::obs_proxy::proxy_connected(browser_ws, upstream))
                .into_response()
        }
        Err(e) => {
            warn!("obs proxy: failed to connect to switcher: {e}");
            ws.on_upgrade(crate::obs_proxy::reject_unreachable).into_response()
        }
    }
}
