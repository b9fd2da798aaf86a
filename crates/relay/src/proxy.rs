//! `/{event_code}/{subpath}`: forwards non-upgrade HTTP requests over the
//! matched tunnel and bridges upgrade requests as a nested WebSocket.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequest, FromRequestParts, Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use matchbox_protocol::tunnel::TunnelFrame;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::instance::{self, BrowserFrame, PendingOutcome};
use crate::AppState;

const HTTP_PROXY_TIMEOUT: Duration = Duration::from_secs(30);

const HOP_BY_HOP: &[&str] = &["host", "connection", "upgrade", "transfer-encoding"];

pub async fn handler(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let (mut parts, body) = req.into_parts();
    let Ok(Path((event_code, subpath))) =
        Path::<(String, String)>::from_request_parts(&mut parts, &state).await
    else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let method = parts.method.clone();
    let headers = parts.headers.clone();
    let ws = WebSocketUpgrade::from_request_parts(&mut parts, &state)
        .await
        .ok();
    let body = match Bytes::from_request(Request::from_parts(parts, body), &state).await {
        Ok(body) => body,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let Some(instance) = instance::get(&state.registry, &event_code).await else {
        return (StatusCode::BAD_GATEWAY, "no instance registered for this event").into_response();
    };

    if let Some(ws) = ws {
        let subprotocols: Vec<String> = headers
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();
        let ws = subprotocols
            .iter()
            .fold(ws, |ws, proto| ws.protocols([proto.clone()]));
        return ws.on_upgrade(move |socket| bridge_ws(socket, instance, subpath));
    }

    let stream_id = instance.alloc_stream_id();
    let (tx, rx) = oneshot::channel();
    instance.pending_http.lock().await.insert(stream_id, tx);

    let forward_headers: Vec<(String, String)> = headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str().to_ascii_lowercase().as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let frame = TunnelFrame::HttpRequest {
        stream_id,
        method: method.to_string(),
        path: format!("/{subpath}"),
        headers: forward_headers,
        body: BASE64.encode(&body),
    };

    if instance.send_frame(&frame).await.is_err() {
        instance.pending_http.lock().await.remove(&stream_id);
        return (StatusCode::BAD_GATEWAY, "tunnel write failed").into_response();
    }

    match tokio::time::timeout(HTTP_PROXY_TIMEOUT, rx).await {
        Ok(Ok(PendingOutcome::Response(TunnelFrame::HttpResponse {
            status,
            headers,
            body,
            ..
        }))) => {
            let decoded = BASE64.decode(&body).unwrap_or_default();
            let mut response = Response::builder().status(status);
            for (name, value) in headers {
                let lower = name.to_ascii_lowercase();
                if lower == "transfer-encoding" || lower == "content-length" || lower == "connection" {
                    continue;
                }
                response = response.header(name, value);
            }
            response.body(axum::body::Body::from(decoded)).unwrap()
        }
        Ok(Ok(PendingOutcome::Response(_))) => {
            (StatusCode::BAD_GATEWAY, "malformed tunnel response").into_response()
        }
        Ok(Ok(PendingOutcome::Cancelled)) => {
            (StatusCode::BAD_GATEWAY, "tunnel instance replaced").into_response()
        }
        Ok(Err(_)) => (StatusCode::BAD_GATEWAY, "tunnel closed").into_response(),
        Err(_) => (StatusCode::GATEWAY_TIMEOUT, "tunnel response timed out").into_response(),
    }
}

/// Registers the bridge in `browser_ws` *before* sending `ws_open`, so a
/// `ws_data` arriving immediately after the daemon opens its local
/// upgrade can never race ahead of the map entry existing.
async fn bridge_ws(mut socket: WebSocket, instance: Arc<crate::instance::TunnelInstance>, subpath: String) {
    let stream_id = instance.alloc_stream_id();
    let (tx, mut rx) = mpsc::channel(64);
    instance.browser_ws.lock().await.insert(stream_id, tx);

    let open = TunnelFrame::WsOpen {
        stream_id,
        path: format!("/{subpath}"),
    };
    if instance.send_frame(&open).await.is_err() {
        instance.browser_ws.lock().await.remove(&stream_id);
        return;
    }

    loop {
        tokio::select! {
            from_browser = socket.recv() => {
                match from_browser {
                    Some(Ok(Message::Text(text))) => {
                        let frame = TunnelFrame::WsData { stream_id, data: BASE64.encode(text.as_bytes()) };
                        if instance.send_frame(&frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let frame = TunnelFrame::WsData { stream_id, data: BASE64.encode(&data) };
                        if instance.send_frame(&frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = instance.send_frame(&TunnelFrame::WsClose { stream_id }).await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("bridge browser ws error: {e}");
                        break;
                    }
                }
            }
            from_tunnel = rx.recv() => {
                match from_tunnel {
                    Some(BrowserFrame::Data(data)) => {
                        let Ok(bytes) = BASE64.decode(&data) else { continue };
                        if socket.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(BrowserFrame::Close) | None => {
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame {
                                code: 4010,
                                reason: "tunnel closed".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
        }
    }

    instance.browser_ws.lock().await.remove(&stream_id);
}
