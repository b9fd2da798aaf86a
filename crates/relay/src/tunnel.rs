//! `GET /tunnel`: the daemon's (C8) inbound registration and the
//! frame-dispatch loop that keeps an installed `TunnelInstance` alive.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::StreamExt;
use matchbox_protocol::tunnel::TunnelFrame;
use tracing::{info, warn};

use crate::instance::{self, BrowserFrame, PendingOutcome, TunnelInstance};
use crate::AppState;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_tunnel(socket, state))
}

async fn handle_tunnel(socket: WebSocket, state: Arc<AppState>) {
    let (sink, mut stream) = socket.split();

    let first = match tokio::time::timeout(REGISTRATION_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        _ => {
            warn!("tunnel connection dropped before registration");
            return;
        }
    };

    let frame: TunnelFrame = match serde_json::from_str(&first) {
        Ok(f) => f,
        Err(e) => {
            warn!("unparseable registration frame: {e}");
            return;
        }
    };

    let TunnelFrame::Register {
        event_code,
        token,
        admin_hash,
        admin_salt,
        ..
    } = frame
    else {
        warn!("first tunnel frame was not a registration");
        return;
    };

    if !matchbox_protocol::crypto::constant_time_eq(token.as_bytes(), state.admin_token.as_bytes()) {
        warn!(event_code, "tunnel registration rejected: bad token");
        return;
    }

    instance::evict_if_present(&state.registry, &event_code).await;

    let new_instance = Arc::new(TunnelInstance::new(
        event_code.clone(),
        sink,
        admin_hash,
        admin_salt,
    ));
    instance::install(&state.registry, Arc::clone(&new_instance)).await;

    let registered = TunnelFrame::Registered {
        instance_id: event_code.clone(),
    };
    if new_instance.send_frame(&registered).await.is_err() {
        instance::remove(&state.registry, &event_code).await;
        return;
    }
    info!(event_code, "tunnel instance registered");

    drive(&state, &new_instance, &mut stream).await;

    instance::remove(&state.registry, &event_code).await;
    info!(event_code, "tunnel instance disconnected");
}

/// Dispatches frames the daemon sends back over the already-registered
/// tunnel: `http_response` resolves the matching pending future,
/// `ws_data`/`ws_close` are forwarded to the matching browser bridge.
async fn drive(
    _state: &Arc<AppState>,
    instance: &Arc<TunnelInstance>,
    stream: &mut futures_util::stream::SplitStream<WebSocket>,
) {
    loop {
        let frame = match stream.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<TunnelFrame>(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("unparseable tunnel frame: {e}");
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => return,
            Some(Err(_)) => return,
            _ => continue,
        };

        match frame {
            whole @ TunnelFrame::HttpResponse { .. } => {
                let stream_id = whole.stream_id().expect("http_response always carries stream_id");
                if let Some(tx) = instance.pending_http.lock().await.remove(&stream_id) {
                    let _ = tx.send(PendingOutcome::Response(whole));
                }
            }
            TunnelFrame::WsData { stream_id, data } => {
                if let Some(tx) = instance.browser_ws.lock().await.get(&stream_id) {
                    let _ = tx.send(BrowserFrame::Data(data)).await;
                }
            }
            TunnelFrame::WsClose { stream_id } => {
                if let Some(tx) = instance.browser_ws.lock().await.remove(&stream_id) {
                    let _ = tx.send(BrowserFrame::Close).await;
                }
            }
            TunnelFrame::WsError { stream_id, message } => {
                warn!(stream_id, message, "daemon reported ws_error");
                instance.browser_ws.lock().await.remove(&stream_id);
            }
            other => {
                warn!("unexpected frame from daemon: {other:?}");
            }
        }
    }
}
