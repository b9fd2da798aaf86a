//! C4: connects to the upstream scoring system's display-command
//! WebSocket and drives scene switching and clip jobs from its events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use matchbox_protocol::config::CLIP_JOB_SAFETY_MARGIN_SECONDS;
use matchbox_protocol::scoring::{MatchInfo, ScoringEnvelope, ScoringEvent};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::core::Core;

const BACKLOG_DRAIN: Duration = Duration::from_secs(5);
const BACKLOG_POLL: Duration = Duration::from_millis(500);
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Orchestrator {
    pub running: AtomicBool,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
        }
    }

    /// Connects to `ws://{scoring_host}:{scoring_port}/stream/display/command/?code={event_code}`,
    /// drains the initial backlog for 5 seconds, then dispatches events
    /// until the connection drops or the daemon is shutting down.
    pub async fn run(&self, core: Arc<Core>) {
        let mut backoff = Duration::from_secs(2);
        let max_backoff = Duration::from_secs(60);
        loop {
            if !core.orchestrator_enabled() {
                self.running.store(false, Ordering::Relaxed);
                sleep(Duration::from_secs(1)).await;
                continue;
            }
            self.running.store(true, Ordering::Relaxed);
            core.notify_status_changed().await;
            match self.connect_and_monitor(&core).await {
                Ok(()) => info!("orchestrator connection closed cleanly"),
                Err(e) => warn!("orchestrator connection error: {e:#}"),
            }
            self.running.store(false, Ordering::Relaxed);
            core.notify_status_changed().await;
            sleep(backoff).await;
            backoff = (backoff * 2).min(max_backoff);
        }
    }

    async fn connect_and_monitor(&self, core: &Arc<Core>) -> anyhow::Result<()> {
        let config = core.config_snapshot().await;
        let url = format!(
            "ws://{}:{}/stream/display/command/?code={}",
            config.scoring_host, config.scoring_port, config.event_code
        );
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .context("scoring websocket connect failed")?;
        info!(url, "connected to scoring system");
        let (_tx, mut rx) = ws.split();

        let deadline = Instant::now() + BACKLOG_DRAIN;
        let mut drained = 0;
        while Instant::now() < deadline {
            match tokio::time::timeout(BACKLOG_POLL, rx.next()).await {
                Ok(Some(Ok(_))) => drained += 1,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => return Ok(()),
                Err(_) => continue,
            }
        }
        info!(drained, "drained scoring system backlog");

        loop {
            if !core.orchestrator_enabled() {
                return Ok(());
            }
            match tokio::time::timeout(RECV_TIMEOUT, rx.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    self.handle_message(core, &text).await;
                }
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return Ok(()),
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => {
                    if self.running.load(Ordering::Relaxed) {
                        return Err(e.into());
                    }
                    return Ok(());
                }
                Err(_) => continue, // recv timeout, loop again
            }
        }
    }

    async fn handle_message(&self, core: &Arc<Core>, text: &str) {
        if text == "pong" {
            return;
        }
        let envelope: ScoringEnvelope = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(e) => {
                error!("failed to parse scoring message: {e}");
                return;
            }
        };

        match envelope.event() {
            ScoringEvent::ShowPreview { field } | ScoringEvent::ShowMatch { field } => {
                if let Some(field) = field {
                    self.maybe_switch(core, field).await;
                }
            }
            ScoringEvent::StartMatch { info } => {
                self.start_match(core, info).await;
            }
            ScoringEvent::Unknown(kind) => {
                tracing::debug!(kind, "ignoring unrecognized scoring event");
            }
        }
    }

    async fn maybe_switch(&self, core: &Arc<Core>, field: u32) {
        if let Err(e) = core.switch_scene_if_changed(field).await {
            error!(field, "scene switch failed: {e}");
        }
    }

    async fn start_match(&self, core: &Arc<Core>, mut info: MatchInfo) {
        if info.resolved_start_timestamp().is_none() {
            info.start_timestamp = Some(now_unix());
        }
        let config = core.config_snapshot().await;
        let total_wait = Duration::from_secs_f64(
            config.match_duration_seconds as f64
                + config.post_match_buffer_seconds as f64
                + CLIP_JOB_SAFETY_MARGIN_SECONDS as f64,
        );
        let core = Arc::clone(core);
        tokio::spawn(async move {
            sleep(total_wait).await;
            core.generate_match_clip(info).await;
        });
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_orchestrator_is_not_running() {
        let orch = Orchestrator::new();
        assert!(!orch.running.load(Ordering::Relaxed));
    }
}
