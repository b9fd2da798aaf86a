//! C8: maintains one outbound WebSocket to the relay, registering this
//! instance and multiplexing HTTP/WebSocket traffic the relay forwards
//! back over it to the daemon's own local web server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use matchbox_protocol::tunnel::TunnelFrame;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::core::Core;

type TunnelSocket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;
type TunnelSink = futures_util::stream::SplitSink<TunnelSocket, Message>;

/// Frames queued for a nested WebSocket's local-upgrade task, keyed by
/// `stream_id`. Draining the relay's `WsData`/`WsClose` frames into a
/// channel (rather than a direct local socket handle) lets the registration
/// loop keep processing other stream ids while a given upgrade is pending.
type NestedWsSenders = Arc<Mutex<HashMap<u64, mpsc::Sender<NestedWsInbound>>>>;

enum NestedWsInbound {
    Data(String),
    Close,
}

/// Normalize a configured relay URL (which may be `http(s)://`,
/// `ws(s)://`, or bare host[:port]) into a `ws(s)://.../tunnel` endpoint.
pub fn normalize_relay_url(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('/');
    let (scheme_stripped, secure) = if let Some(rest) = trimmed.strip_prefix("https://") {
        (rest, true)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        (rest, false)
    } else if let Some(rest) = trimmed.strip_prefix("wss://") {
        (rest, true)
    } else if let Some(rest) = trimmed.strip_prefix("ws://") {
        (rest, false)
    } else {
        (trimmed, false)
    };
    let scheme = if secure { "wss" } else { "ws" };
    format!("{scheme}://{scheme_stripped}/tunnel")
}

pub async fn run(core: Arc<Core>) {
    let mut backoff = Duration::from_secs(5);
    let max_backoff = Duration::from_secs(60);
    loop {
        let config = core.config_snapshot().await;
        if !core.tunnel_enabled() || config.tunnel_relay_url.is_empty() {
            core.set_tunnel_connected(false).await;
            tokio::time::sleep(Duration::from_secs(30)).await;
            continue;
        }

        match connect_and_serve(&core, &config.tunnel_relay_url).await {
            Ok(()) => {
                info!("tunnel connection closed cleanly");
                backoff = Duration::from_secs(5);
            }
            Err(e) => {
                warn!("tunnel connection error: {e:#}");
            }
        }
        core.set_tunnel_connected(false).await;
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

async fn connect_and_serve(core: &Arc<Core>, relay_url: &str) -> anyhow::Result<()> {
    let config = core.config_snapshot().await;
    let url = normalize_relay_url(relay_url);
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .context("tunnel websocket connect failed")?;
    let (mut tx, mut rx) = ws.split();

    let register = TunnelFrame::Register {
        event_code: config.event_code.clone(),
        token: config.tunnel_token.clone(),
        admin_hash: crate::session::admin_hash_hex(),
        admin_salt: crate::session::admin_salt_hex(),
        tunnel_password: config.tunnel_password.clone(),
    };
    tx.send(Message::Text(serde_json::to_string(&register)?.into()))
        .await?;

    match rx.next().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<TunnelFrame>(&text) {
            Ok(TunnelFrame::Registered { instance_id }) => {
                info!(instance_id, "registered with relay");
                core.set_tunnel_connected(true).await;
            }
            Ok(TunnelFrame::Error { message }) => {
                anyhow::bail!("relay rejected registration: {message}")
            }
            other => anyhow::bail!("unexpected frame awaiting registration: {other:?}"),
        },
        other => anyhow::bail!("connection dropped awaiting registration: {other:?}"),
    }

    let web_port = config.web_port;
    let http_client = reqwest::Client::new();
    let tx = Arc::new(Mutex::new(tx));
    let nested_ws: NestedWsSenders = Arc::new(Mutex::new(HashMap::new()));

    loop {
        if !core.tunnel_enabled() {
            return Ok(());
        }
        let frame = match rx.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<TunnelFrame>(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("unparseable tunnel frame: {e}");
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Err(e)) => return Err(e.into()),
            _ => continue,
        };

        match frame {
            TunnelFrame::HttpRequest { .. } => {
                let tx = Arc::clone(&tx);
                let client = http_client.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_http_request(client, tx, web_port, frame).await {
                        error!("tunnel http_request handling failed: {e:#}");
                    }
                });
            }
            TunnelFrame::WsOpen { stream_id, path } => {
                let (inbound_tx, inbound_rx) = mpsc::channel(32);
                nested_ws.lock().await.insert(stream_id, inbound_tx);
                let outbound = Arc::clone(&tx);
                let senders = Arc::clone(&nested_ws);
                tokio::spawn(async move {
                    handle_ws_open(outbound, senders, web_port, stream_id, path, inbound_rx).await;
                });
            }
            TunnelFrame::WsData { stream_id, data } => {
                if let Some(sender) = nested_ws.lock().await.get(&stream_id) {
                    let _ = sender.send(NestedWsInbound::Data(data)).await;
                }
            }
            TunnelFrame::WsClose { stream_id } => {
                if let Some(sender) = nested_ws.lock().await.remove(&stream_id) {
                    let _ = sender.send(NestedWsInbound::Close).await;
                }
            }
            TunnelFrame::Register { .. } | TunnelFrame::Registered { .. } | TunnelFrame::Error { .. }
            | TunnelFrame::HttpResponse { .. } | TunnelFrame::WsOpened { .. } | TunnelFrame::WsError { .. } => {
                warn!("unexpected tunnel frame from relay: {frame:?}");
            }
        }
    }
}

/// Opens a WebSocket to the daemon's own local web server for a browser
/// connection the relay is bridging in, then shuttles frames both ways
/// until either side closes.
async fn handle_ws_open(
    outbound: Arc<Mutex<TunnelSink>>,
    senders: NestedWsSenders,
    web_port: u16,
    stream_id: u64,
    path: String,
    mut inbound_rx: mpsc::Receiver<NestedWsInbound>,
) {
    let url = format!("ws://127.0.0.1:{web_port}{path}");
    let local = match tokio_tungstenite::connect_async(&url).await {
        Ok((socket, _)) => socket,
        Err(e) => {
            let err = TunnelFrame::WsError { stream_id, message: e.to_string() };
            let _ = send_frame(&outbound, &err).await;
            senders.lock().await.remove(&stream_id);
            return;
        }
    };
    let (mut local_tx, mut local_rx) = local.split();
    let _ = send_frame(&outbound, &TunnelFrame::WsOpened { stream_id }).await;

    loop {
        tokio::select! {
            inbound = inbound_rx.recv() => {
                match inbound {
                    Some(NestedWsInbound::Data(data)) => {
                        let Ok(bytes) = BASE64.decode(&data) else { continue };
                        if local_tx.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(NestedWsInbound::Close) | None => break,
                }
            }
            local_msg = local_rx.next() => {
                match local_msg {
                    Some(Ok(Message::Binary(data))) => {
                        let frame = TunnelFrame::WsData { stream_id, data: BASE64.encode(data) };
                        if send_frame(&outbound, &frame).await.is_err() { break; }
                    }
                    Some(Ok(Message::Text(text))) => {
                        let frame = TunnelFrame::WsData { stream_id, data: BASE64.encode(text.as_bytes()) };
                        if send_frame(&outbound, &frame).await.is_err() { break; }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => continue,
                }
            }
        }
    }

    let _ = send_frame(&outbound, &TunnelFrame::WsClose { stream_id }).await;
    senders.lock().await.remove(&stream_id);
}

async fn send_frame(tx: &Arc<Mutex<TunnelSink>>, frame: &TunnelFrame) -> anyhow::Result<()> {
    let text = serde_json::to_string(frame)?;
    tx.lock().await.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn handle_http_request(
    client: reqwest::Client,
    tx: Arc<Mutex<TunnelSink>>,
    web_port: u16,
    frame: TunnelFrame,
) -> anyhow::Result<()> {
    let TunnelFrame::HttpRequest { stream_id, method, path, headers, body } = frame else {
        return Ok(());
    };

    let url = format!("http://127.0.0.1:{web_port}{path}");
    let method = reqwest::Method::from_bytes(method.as_bytes())?;
    let mut builder = client.request(method, &url);
    for (k, v) in &headers {
        builder = builder.header(k, v);
    }
    if !body.is_empty() {
        builder = builder.body(BASE64.decode(&body)?);
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let resp_headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();
    let resp_body = response.bytes().await?;

    let out = TunnelFrame::HttpResponse {
        stream_id,
        status,
        headers: resp_headers,
        body: BASE64.encode(resp_body),
    };
    tx.lock()
        .await
        .send(Message::Text(serde_json::to_string(&out)?.into()))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bare_host() {
        assert_eq!(
            normalize_relay_url("relay.example.com:8080"),
            "ws://relay.example.com:8080/tunnel"
        );
    }

    #[test]
    fn normalize_https_becomes_wss() {
        assert_eq!(
            normalize_relay_url("https://relay.example.com"),
            "wss://relay.example.com/tunnel"
        );
    }

    #[test]
    fn normalize_http_becomes_ws() {
        assert_eq!(
            normalize_relay_url("http://relay.example.com/"),
            "ws://relay.example.com/tunnel"
        );
    }

    #[test]
    fn normalize_ws_passthrough() {
        assert_eq!(
            normalize_relay_url("ws://relay.example.com"),
            "ws://relay.example.com/tunnel"
        );
    }
}
