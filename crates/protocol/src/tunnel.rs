//! Multiplexing frames exchanged between the daemon (C8) and the relay
//! (C9) over a single outbound WebSocket, letting the relay forward both
//! HTTP requests and nested WebSocket traffic for a registered instance
//! through one connection.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelFrame {
    /// Sent once by the daemon on connect. `token` authenticates against
    /// the relay's own `--token`; `tunnel_password` is a separate,
    /// per-instance secret the relay never checks itself.
    Register {
        event_code: String,
        token: String,
        admin_hash: String,
        admin_salt: String,
        tunnel_password: String,
    },
    /// Relay's ack that `Register` succeeded.
    Registered { instance_id: String },
    /// Relay's rejection of `Register`, or a fatal protocol error.
    Error { message: String },

    /// Relay → daemon: forward this HTTP request to the daemon's local
    /// web server.
    HttpRequest {
        stream_id: u64,
        method: String,
        path: String,
        headers: Vec<(String, String)>,
        /// Base64-encoded body, since frames are JSON text.
        body: String,
    },
    /// Daemon → relay: the local web server's response to `HttpRequest`.
    HttpResponse {
        stream_id: u64,
        status: u16,
        headers: Vec<(String, String)>,
        body: String,
    },

    /// Relay → daemon: a browser opened a WebSocket through the tunnel.
    WsOpen { stream_id: u64, path: String },
    /// Daemon → relay: the local upgrade succeeded.
    WsOpened { stream_id: u64 },
    /// Daemon → relay (or vice versa): the local upgrade failed.
    WsError { stream_id: u64, message: String },
    /// Either direction: a WebSocket data frame, base64-encoded.
    WsData { stream_id: u64, data: String },
    /// Either direction: the nested WebSocket closed.
    WsClose { stream_id: u64 },
}

impl TunnelFrame {
    pub fn stream_id(&self) -> Option<u64> {
        match self {
            TunnelFrame::HttpRequest { stream_id, .. }
            | TunnelFrame::HttpResponse { stream_id, .. }
            | TunnelFrame::WsOpen { stream_id, .. }
            | TunnelFrame::WsOpened { stream_id }
            | TunnelFrame::WsError { stream_id, .. }
            | TunnelFrame::WsData { stream_id, .. }
            | TunnelFrame::WsClose { stream_id } => Some(*stream_id),
            TunnelFrame::Register { .. }
            | TunnelFrame::Registered { .. }
            | TunnelFrame::Error { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_roundtrip() {
        let frame = TunnelFrame::Register {
            event_code: "q1evt".to_string(),
            token: "shared-token".to_string(),
            admin_hash: "abc".to_string(),
            admin_salt: "def".to_string(),
            tunnel_password: "secret".to_string(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"register""#));
        let parsed: TunnelFrame = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, TunnelFrame::Register { .. }));
    }

    #[test]
    fn http_request_stream_id_accessor() {
        let frame = TunnelFrame::HttpRequest {
            stream_id: 7,
            method: "GET".to_string(),
            path: "/api/status".to_string(),
            headers: vec![],
            body: String::new(),
        };
        assert_eq!(frame.stream_id(), Some(7));
    }

    #[test]
    fn register_and_error_have_no_stream_id() {
        assert_eq!(
            TunnelFrame::Error {
                message: "bad token".to_string()
            }
            .stream_id(),
            None
        );
        assert_eq!(
            TunnelFrame::Registered {
                instance_id: "q1evt".to_string()
            }
            .stream_id(),
            None
        );
    }

    #[test]
    fn ws_data_tag_is_snake_case() {
        let frame = TunnelFrame::WsData {
            stream_id: 1,
            data: "aGVsbG8=".to_string(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"ws_data""#));
    }
}
