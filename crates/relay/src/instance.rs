//! C9's registry of live tunnel instances, keyed by `event_code`
//! (doubling as `instance_id` — the source keys `TunnelInstance` by the
//! event code itself, so no separate id-minting step exists here).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::SplitSink;
use matchbox_protocol::tunnel::TunnelFrame;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use axum::extract::ws::{Message, WebSocket};

pub type TunnelSink = SplitSink<WebSocket, Message>;

/// A pending HTTP request's eventual `http_response`, or the signal that
/// its owning instance was evicted before a response arrived.
pub enum PendingOutcome {
    Response(TunnelFrame),
    Cancelled,
}

/// A browser WebSocket frame bridged in from the tunnel (`ws_data`) or a
/// closure signal (`ws_close`) for an open `/{event_code}/{subpath}` upgrade.
pub enum BrowserFrame {
    Data(String),
    Close,
}

pub struct TunnelInstance {
    pub event_code: String,
    pub sink: Mutex<TunnelSink>,
    pub pending_http: Mutex<HashMap<u64, oneshot::Sender<PendingOutcome>>>,
    pub browser_ws: Mutex<HashMap<u64, mpsc::Sender<BrowserFrame>>>,
    pub admin_hash: String,
    pub admin_salt: String,
    pub registered_at: Instant,
    next_stream_id: AtomicU64,
}

impl TunnelInstance {
    pub fn new(event_code: String, sink: TunnelSink, admin_hash: String, admin_salt: String) -> Self {
        Self {
            event_code,
            sink: Mutex::new(sink),
            pending_http: Mutex::new(HashMap::new()),
            browser_ws: Mutex::new(HashMap::new()),
            admin_hash,
            admin_salt,
            registered_at: Instant::now(),
            next_stream_id: AtomicU64::new(1),
        }
    }

    pub async fn send_frame(&self, frame: &TunnelFrame) -> anyhow::Result<()> {
        use futures_util::SinkExt;
        let text = serde_json::to_string(frame)?;
        self.sink.lock().await.send(Message::Text(text.into())).await?;
        Ok(())
    }

    pub fn alloc_stream_id(&self) -> u64 {
        self.next_stream_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.registered_at.elapsed().as_secs()
    }
}

pub type Registry = Arc<RwLock<HashMap<String, Arc<TunnelInstance>>>>;

pub fn new_registry() -> Registry {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Evicts any existing instance for `event_code` in the exact order the
/// source relies on: drop it from the map first, close its browser
/// sockets, cancel its pending HTTP futures, then close its tunnel
/// socket with code 4010 — all strictly before the caller installs the
/// new instance and replies `registered`.
pub async fn evict_if_present(registry: &Registry, event_code: &str) {
    let old = { registry.write().await.remove(event_code) };
    let Some(old) = old else { return };

    {
        let mut browsers = old.browser_ws.lock().await;
        for (_, tx) in browsers.drain() {
            let _ = tx.send(BrowserFrame::Close).await;
        }
    }
    {
        let mut pending = old.pending_http.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(PendingOutcome::Cancelled);
        }
    }

    use futures_util::SinkExt;
    let close = Message::Close(Some(axum::extract::ws::CloseFrame {
        code: 4010,
        reason: "replaced by a new registration for this event".into(),
    }));
    let _ = old.sink.lock().await.send(close).await;
}

pub async fn install(registry: &Registry, instance: Arc<TunnelInstance>) {
    registry
        .write()
        .await
        .insert(instance.event_code.clone(), instance);
}

pub async fn get(registry: &Registry, event_code: &str) -> Option<Arc<TunnelInstance>> {
    registry.read().await.get(event_code).cloned()
}

pub async fn remove(registry: &Registry, event_code: &str) {
    registry.write().await.remove(event_code);
}

pub async fn snapshot(registry: &Registry) -> Vec<(String, u64)> {
    registry
        .read()
        .await
        .values()
        .map(|i| (i.event_code.clone(), i.uptime_secs()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_starts_empty() {
        let registry = new_registry();
        assert!(get(&registry, "q1evt").await.is_none());
    }

    #[tokio::test]
    async fn evict_on_absent_event_code_is_a_no_op() {
        let registry = new_registry();
        evict_if_present(&registry, "nope").await;
        assert!(get(&registry, "nope").await.is_none());
    }
}
