//! C2: polls the switcher's active recording file to decide whether a
//! clip can currently be extracted from it.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::debug;

use crate::switcher_client::SwitcherClient;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const GROWTH_WINDOW: Duration = Duration::from_secs(30);

/// Tracks whether a recording file is actively growing, by sampling its
/// size every 5 seconds and keeping a 30-second window of growth events.
pub struct RecordingMonitor {
    path: Mutex<Option<PathBuf>>,
    growth_timestamps: Mutex<VecDeque<Instant>>,
    last_size: Mutex<u64>,
}

impl RecordingMonitor {
    pub fn new() -> Self {
        Self {
            path: Mutex::new(None),
            growth_timestamps: Mutex::new(VecDeque::new()),
            last_size: Mutex::new(0),
        }
    }

    pub async fn set_path(&self, path: Option<PathBuf>) {
        *self.path.lock().await = path;
        *self.last_size.lock().await = 0;
        self.growth_timestamps.lock().await.clear();
    }

    /// Runs forever, refreshing which file the switcher is currently
    /// recording to and sampling its size every `POLL_INTERVAL`, recording
    /// a growth event whenever the size increased since the last sample.
    pub async fn run(&self, switcher: Arc<SwitcherClient>) {
        loop {
            sleep(POLL_INTERVAL).await;
            self.refresh_path(&switcher).await;
            self.sample().await;
        }
    }

    /// Asks the switcher for its current recording path (if any) and
    /// adopts it, but only when it actually changed, so an unchanged path
    /// doesn't reset the 30-second growth window on every poll.
    async fn refresh_path(&self, switcher: &SwitcherClient) {
        let new_path = switcher.get_recording_info().await.map(|info| PathBuf::from(info.path));
        if *self.path.lock().await != new_path {
            self.set_path(new_path).await;
        }
    }

    async fn sample(&self) {
        let path = self.path.lock().await.clone();
        let Some(path) = path else { return };

        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => return,
        };

        let mut last = self.last_size.lock().await;
        if size > *last {
            let mut timestamps = self.growth_timestamps.lock().await;
            timestamps.push_back(Instant::now());
            prune(&mut timestamps);
            debug!(path = %path.display(), size, "recording file grew");
        }
        *last = size;
    }

    /// True iff a growth event was observed within the last 30 seconds.
    pub async fn is_recording_available(&self) -> bool {
        let mut timestamps = self.growth_timestamps.lock().await;
        prune(&mut timestamps);
        !timestamps.is_empty()
    }

    pub async fn current_path(&self) -> Option<PathBuf> {
        self.path.lock().await.clone()
    }

    /// Probe the current recording's duration via `ffprobe`, or `None` if
    /// there is no current path or the probe fails.
    pub async fn duration_seconds(&self) -> Option<f64> {
        let path = self.current_path().await?;
        crate::clip_extractor::probe_duration_seconds(&path).await
    }
}

impl Default for RecordingMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn prune(timestamps: &mut VecDeque<Instant>) {
    let cutoff = Instant::now().checked_sub(GROWTH_WINDOW).unwrap_or_else(Instant::now);
    while let Some(front) = timestamps.front() {
        if *front < cutoff {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_growth_means_not_available() {
        let monitor = RecordingMonitor::new();
        assert!(!monitor.is_recording_available().await);
    }

    #[tokio::test]
    async fn recent_growth_event_is_available() {
        let monitor = RecordingMonitor::new();
        monitor.growth_timestamps.lock().await.push_back(Instant::now());
        assert!(monitor.is_recording_available().await);
    }

    #[tokio::test]
    async fn stale_growth_event_is_pruned() {
        let monitor = RecordingMonitor::new();
        let stale = Instant::now() - Duration::from_secs(31);
        monitor.growth_timestamps.lock().await.push_back(stale);
        assert!(!monitor.is_recording_available().await);
    }

    #[tokio::test]
    async fn refresh_path_stays_none_when_switcher_unreachable() {
        let monitor = RecordingMonitor::new();
        let switcher = SwitcherClient::new("localhost".to_string(), 4455, String::new());
        monitor.refresh_path(&switcher).await;
        assert_eq!(monitor.current_path().await, None);
    }

    #[tokio::test]
    async fn sample_detects_size_increase() {
        let monitor = RecordingMonitor::new();
        let path = std::env::temp_dir().join(format!("mb-rec-test-{}.bin", std::process::id()));
        tokio::fs::write(&path, vec![0u8; 10]).await.unwrap();
        monitor.set_path(Some(path.clone())).await;
        monitor.sample().await;
        tokio::fs::write(&path, vec![0u8; 20]).await.unwrap();
        monitor.sample().await;
        assert!(monitor.is_recording_available().await);
        let _ = tokio::fs::remove_file(&path).await;
    }
}
