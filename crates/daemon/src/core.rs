//! Glues the daemon's components (C1-C4, C6, C10) behind one shared state
//! struct, resolving spec §9's cyclic-reference note: the web layer (C5)
//! needs to call into the orchestrator/switcher, and the orchestrator needs
//! to publish status back through the bus, so both hold an `Arc<Core>`
//! rather than holding each other directly.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use matchbox_protocol::scoring::MatchInfo;
use matchbox_protocol::status::{RecordingInfo, StatusSnapshot};
use matchbox_protocol::MatchBoxConfig;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::bus::Bus;
use crate::clip_extractor::{self, chrono_like::Timestamp};
use crate::recording_monitor::RecordingMonitor;
use crate::switcher_client::SwitcherClient;

pub struct Core {
    config: RwLock<MatchBoxConfig>,
    pub config_path: PathBuf,
    pub switcher: Arc<SwitcherClient>,
    pub recording_monitor: Arc<RecordingMonitor>,
    pub bus: Bus,
    clips: RwLock<Vec<PathBuf>>,
    sync_running: AtomicBool,
    tunnel_connected: AtomicBool,
    upstream_connected: AtomicBool,
    current_field: AtomicU32,
    has_current_field: AtomicBool,
    started_at: Instant,
    orchestrator_enabled: AtomicBool,
    tunnel_enabled: AtomicBool,
}

impl Core {
    pub fn new(config: MatchBoxConfig, config_path: PathBuf, bus: Bus) -> Arc<Self> {
        let switcher = Arc::new(SwitcherClient::new(
            config.switcher_host.clone(),
            config.switcher_port,
            config.switcher_password.clone(),
        ));
        let tunnel_enabled = !config.tunnel_relay_url.is_empty();
        Arc::new(Self {
            config: RwLock::new(config),
            config_path,
            switcher,
            recording_monitor: Arc::new(RecordingMonitor::new()),
            bus,
            clips: RwLock::new(Vec::new()),
            sync_running: AtomicBool::new(false),
            tunnel_connected: AtomicBool::new(false),
            upstream_connected: AtomicBool::new(false),
            current_field: AtomicU32::new(0),
            has_current_field: AtomicBool::new(false),
            started_at: Instant::now(),
            orchestrator_enabled: AtomicBool::new(true),
            tunnel_enabled: AtomicBool::new(tunnel_enabled),
        })
    }

    pub fn orchestrator_enabled(&self) -> bool {
        self.orchestrator_enabled.load(Ordering::Relaxed)
    }

    pub async fn set_orchestrator_enabled(&self, enabled: bool) {
        self.orchestrator_enabled.store(enabled, Ordering::Relaxed);
        self.notify_status_changed().await;
    }

    pub fn tunnel_enabled(&self) -> bool {
        self.tunnel_enabled.load(Ordering::Relaxed)
    }

    pub async fn set_tunnel_enabled(&self, enabled: bool) {
        self.tunnel_enabled.store(enabled, Ordering::Relaxed);
        self.notify_status_changed().await;
    }

    pub fn current_field(&self) -> Option<u32> {
        self.has_current_field
            .load(Ordering::Relaxed)
            .then(|| self.current_field.load(Ordering::Relaxed))
    }

    /// Switches to `field`'s scene iff it differs from the current field,
    /// per spec §4.4: `current_field` only advances when the switch itself
    /// succeeds.
    pub async fn switch_scene_if_changed(&self, field: u32) -> anyhow::Result<bool> {
        if self.current_field() == Some(field) {
            return Ok(false);
        }
        self.switch_scene(field).await?;
        self.current_field.store(field, Ordering::Relaxed);
        self.has_current_field.store(true, Ordering::Relaxed);
        self.notify_status_changed().await;
        Ok(true)
    }

    pub async fn config_snapshot(&self) -> MatchBoxConfig {
        self.config.read().await.clone()
    }

    pub async fn update_config(&self, new_config: MatchBoxConfig) -> anyhow::Result<()> {
        *self.config.write().await = new_config.clone();
        crate::config::save_config(&self.config_path, &new_config)?;
        self.notify_status_changed().await;
        Ok(())
    }

    pub async fn set_upstream_connected(&self, connected: bool) {
        self.upstream_connected.store(connected, Ordering::Relaxed);
        self.notify_status_changed().await;
    }

    pub async fn set_tunnel_connected(&self, connected: bool) {
        self.tunnel_connected.store(connected, Ordering::Relaxed);
        self.notify_status_changed().await;
    }

    pub async fn set_sync_running(&self, running: bool) {
        self.sync_running.store(running, Ordering::Relaxed);
        self.notify_status_changed().await;
    }

    pub async fn switch_scene(&self, field: u32) -> anyhow::Result<()> {
        let config = self.config_snapshot().await;
        let scene_name = config
            .field_scene_mapping
            .get(&field)
            .ok_or_else(|| anyhow::anyhow!("no scene mapped for field {field}"))?;
        self.switcher.switch_scene(scene_name).await?;
        Ok(())
    }

    pub async fn configure_scenes(&self, overlay_url: &str) -> anyhow::Result<()> {
        let config = self.config_snapshot().await;
        self.switcher
            .configure_scenes(&config.field_scene_mapping, overlay_url)
            .await?;
        Ok(())
    }

    /// Fires `CLIP_JOB_SAFETY_MARGIN_SECONDS` after a match's expected end:
    /// re-reads the current recording state (it may have restarted between
    /// matches) before computing clip offsets and extracting.
    pub async fn generate_match_clip(&self, info: MatchInfo) {
        let config = self.config_snapshot().await;
        let Some(recording) = self.switcher.get_recording_info().await else {
            error!("no active recording; cannot extract clip for {}", info.match_name);
            return;
        };
        let recording_path = PathBuf::from(&recording.path);

        let wallclock_start = info.resolved_start_timestamp().unwrap_or_else(now_unix);
        let offset = (wallclock_start - recording.start_wallclock).max(0.0);
        let clip_start = (offset - config.pre_match_buffer_seconds as f64).max(0.0);
        let clip_duration = config.pre_match_buffer_seconds as f64
            + config.match_duration_seconds as f64
            + config.post_match_buffer_seconds as f64;

        let output_dir = config.clips_dir();
        match clip_extractor::extract_clip(
            &recording_path,
            &output_dir,
            info.trimmed_match_name(),
            info.field,
            clip_start,
            clip_duration,
            Timestamp::now(),
        )
        .await
        {
            Ok(path) => {
                info!(path = %path.display(), "clip extracted");
                self.clips.write().await.push(path);
                self.notify_status_changed().await;
                if let Err(e) = crate::web::regenerate_index(&output_dir).await {
                    error!("failed to regenerate clip index: {e:#}");
                }
            }
            Err(e) => error!("clip extraction failed: {e:#}"),
        }
    }

    pub async fn scan_clips(&self) -> anyhow::Result<()> {
        let config = self.config_snapshot().await;
        let dir = config.clips_dir();
        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => {
                *self.clips.write().await = found;
                return Ok(());
            }
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if matchbox_protocol::config::VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
                found.push(path);
            }
        }
        found.sort();
        *self.clips.write().await = found;
        self.notify_status_changed().await;
        crate::web::regenerate_index(&dir).await?;
        Ok(())
    }

    pub async fn clips(&self) -> Vec<PathBuf> {
        self.clips.read().await.clone()
    }

    pub async fn status(&self) -> StatusSnapshot {
        let config = self.config_snapshot().await;
        StatusSnapshot {
            running: self.orchestrator_enabled(),
            switcher_connected: self.switcher.is_connected(),
            upstream_connected: self.upstream_connected.load(Ordering::Relaxed),
            current_field: self.current_field(),
            clips_count: self.clips.read().await.len(),
            recording_info: RecordingInfo {
                available: self.recording_monitor.is_recording_available().await,
                path: self
                    .recording_monitor
                    .current_path()
                    .await
                    .map(|p| p.display().to_string()),
                duration_seconds: self.recording_monitor.duration_seconds().await,
            },
            event_code: config.event_code,
            sync_running: self.sync_running.load(Ordering::Relaxed),
            tunnel_connected: self.tunnel_connected.load(Ordering::Relaxed),
        }
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    pub async fn notify_status_changed(&self) {
        let snapshot = self.status().await;
        self.bus.publish_status(snapshot);
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

    fn test_config() -> MatchBoxConfig {
        let mut cfg = MatchBoxConfig::default();
        cfg.event_code = "q1evt".to_string();
        cfg
    }

    #[tokio::test]
    async fn fresh_core_has_no_current_field() {
        let core = Core::new(test_config(), PathBuf::from("/tmp/mb-test-config.json"), Bus::new());
        assert_eq!(core.current_field(), None);
    }

    #[tokio::test]
    async fn switch_scene_if_changed_rejects_unmapped_field() {
        let core = Core::new(test_config(), PathBuf::from("/tmp/mb-test-config.json"), Bus::new());
        let err = core.switch_scene_if_changed(99).await.unwrap_err();
        assert!(err.to_string().contains("field 99"));
    }

    #[tokio::test]
    async fn status_reflects_event_code() {
        let core = Core::new(test_config(), PathBuf::from("/tmp/mb-test-config.json"), Bus::new());
        let status = core.status().await;
        assert_eq!(status.event_code, "q1evt");
        assert!(!status.switcher_connected);
        assert_eq!(status.clips_count, 0);
    }
}
