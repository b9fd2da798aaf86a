//! C7: proxies a browser's WebSocket connection straight through to the
//! switcher, so the scoring overlay (or an operator's browser) can talk
//! OBS-WebSocket without a direct line to the venue's video hardware.

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tracing::warn;

/// Close code sent to the browser when the upstream switcher connection
/// fails or drops, per spec §4.7.
const UPSTREAM_FAILURE_CLOSE_CODE: u16 = 4002;

type UpstreamSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Dials the switcher, carrying the browser's requested subprotocols
/// unchanged on the upstream handshake, and returns whichever one the
/// switcher selected (if any) so the caller can report it back to the
/// browser before completing its own upgrade.
pub async fn connect_upstream(
    switcher_host: &str,
    switcher_port: u16,
    requested_protocols: &[String],
) -> Result<(UpstreamSocket, Option<String>), tokio_tungstenite::tungstenite::Error> {
    let url = format!("ws://{switcher_host}:{switcher_port}");
    let mut request = url.into_client_request()?;
    if !requested_protocols.is_empty() {
        let value = requested_protocols.join(", ");
        if let Ok(header_value) = value.parse() {
            request
                .headers_mut()
                .insert("sec-websocket-protocol", header_value);
        }
    }

    let (socket, response) = tokio_tungstenite::connect_async(request).await?;
    let selected = response
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    Ok((socket, selected))
}

/// Sends a close frame to `browser_ws` for a switcher connection that
/// could never be established.
pub async fn reject_unreachable(mut browser_ws: WebSocket) {
    let _ = browser_ws
        .send(AxumMessage::Close(Some(axum::extract::ws::CloseFrame {
            code: UPSTREAM_FAILURE_CLOSE_CODE,
            reason: "switcher unreachable".into(),
        })))
        .await;
}

/// Forwards frames bidirectionally between an already-upgraded browser
/// socket and an already-connected upstream socket until either side
/// closes or errors.
pub async fn proxy_connected(mut browser_ws: WebSocket, upstream: UpstreamSocket) {
    let (mut up_tx, mut up_rx) = upstream.split();

    loop {
        tokio::select! {
            from_browser = browser_ws.recv() => {
                match from_browser {
                    Some(Ok(AxumMessage::Text(text))) => {
                        if up_tx.send(TungsteniteMessage::Text(text.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(AxumMessage::Binary(data))) => {
                        if up_tx.send(TungsteniteMessage::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(AxumMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("obs proxy: browser ws error: {e}");
                        break;
                    }
                }
            }
            from_upstream = up_rx.next() => {
                match from_upstream {
                    Some(Ok(TungsteniteMessage::Text(text))) => {
                        if browser_ws.send(AxumMessage::Text(text.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(TungsteniteMessage::Binary(data))) => {
                        if browser_ws.send(AxumMessage::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(TungsteniteMessage::Close(_))) | None => {
                        let _ = browser_ws
                            .send(AxumMessage::Close(Some(axum::extract::ws::CloseFrame {
                                code: UPSTREAM_FAILURE_CLOSE_CODE,
                                reason: "switcher closed".into(),
                            })))
                            .await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("obs proxy: upstream ws error: {e}");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn close_code_matches_spec_constant() {
        assert_eq!(super::UPSTREAM_FAILURE_CLOSE_CODE, 4002);
    }
}
