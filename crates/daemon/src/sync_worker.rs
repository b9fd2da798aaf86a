//! C10: periodically mirrors extracted clips to an rsync server. Runs
//! in-process as a background task rather than a separate binary, since
//! nothing else in the daemon needs to reach it over IPC.

use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{error, info, warn};

use crate::core::Core;

const CYCLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const SHUTDOWN_POLL: Duration = Duration::from_secs(1);

/// Runs until `shutdown` is set, re-reading config every cycle so a
/// config change (e.g. turning rsync on) takes effect without a restart.
pub async fn run(core: Arc<Core>, shutdown: Arc<std::sync::atomic::AtomicBool>) {
    loop {
        let config = core.config_snapshot().await;
        if !config.rsync_enabled {
            if !wait_or_shutdown(config.rsync_interval_seconds.max(1), &shutdown).await {
                return;
            }
            continue;
        }

        match run_cycle(&core, &config).await {
            Ok(synced) => {
                if synced {
                    info!("sync cycle completed");
                } else {
                    info!("nothing to sync yet");
                }
            }
            Err(e) => error!("sync cycle failed: {e:#}"),
        }

        if !wait_or_shutdown(config.rsync_interval_seconds.max(1), &shutdown).await {
            return;
        }
    }
}

/// Sleeps up to `seconds`, polling `shutdown` every second so a shutdown
/// request is honored promptly instead of after a full interval. Returns
/// `false` if shutdown was observed.
async fn wait_or_shutdown(seconds: u32, shutdown: &Arc<std::sync::atomic::AtomicBool>) -> bool {
    for _ in 0..seconds {
        if shutdown.load(std::sync::atomic::Ordering::Relaxed) {
            return false;
        }
        tokio::time::sleep(SHUTDOWN_POLL).await;
    }
    !shutdown.load(std::sync::atomic::Ordering::Relaxed)
}

/// Returns `Ok(true)` if rsync ran and reported success, `Ok(false)` if
/// the clips directory doesn't exist yet (nothing to sync is success, not
/// an error).
async fn run_cycle(
    core: &Arc<Core>,
    config: &matchbox_protocol::MatchBoxConfig,
) -> anyhow::Result<bool> {
    if config.rsync_host.is_empty() || config.rsync_module.is_empty() {
        anyhow::bail!("rsync_enabled but rsync_host/rsync_module not set");
    }

    let clips_dir = config.clips_dir();
    if !tokio::fs::try_exists(&clips_dir).await.unwrap_or(false) {
        core.set_sync_running(false).await;
        return Ok(false);
    }
    core.set_sync_running(true).await;

    let auth = if config.rsync_username.is_empty() {
        String::new()
    } else {
        format!("{}@", config.rsync_username)
    };
    let destination = format!(
        "rsync://{auth}{}::{}",
        config.rsync_host, config.rsync_module
    );

    let mut command = Command::new("rsync");
    command
        .arg("-avz")
        .arg("--checksum")
        .arg(format!("{}/", clips_dir.display()))
        .arg(&destination);
    if !config.rsync_password.is_empty() {
        command.env("RSYNC_PASSWORD", &config.rsync_password);
    }

    let status = tokio::time::timeout(CYCLE_TIMEOUT, command.status()).await;
    core.set_sync_running(false).await;

    match status {
        Ok(Ok(status)) if status.success() => Ok(true),
        Ok(Ok(status)) => anyhow::bail!("rsync exited with status {status}"),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            warn!("rsync cycle timed out after {:?}", CYCLE_TIMEOUT);
            anyhow::bail!("rsync cycle timed out")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_host_and_module_is_error() {
        let mut config = matchbox_protocol::MatchBoxConfig::default();
        config.rsync_enabled = true;
        let core = Core::new(config.clone(), std::path::PathBuf::from("/tmp/mb-sync-test.json"), crate::bus::Bus::new());
        let err = run_cycle(&core, &config).await.unwrap_err();
        assert!(err.to_string().contains("rsync_host"));
    }

    #[tokio::test]
    async fn missing_clips_dir_is_success_not_error() {
        let mut config = matchbox_protocol::MatchBoxConfig::default();
        config.rsync_enabled = true;
        config.rsync_host = "mirror.example.com".to_string();
        config.rsync_module = "clips".to_string();
        config.output_dir = "/nonexistent/matchbox-test-dir".to_string();
        config.event_code = "q1evt".to_string();
        let core = Core::new(config.clone(), std::path::PathBuf::from("/tmp/mb-sync-test.json"), crate::bus::Bus::new());
        let synced = run_cycle(&core, &config).await.unwrap();
        assert!(!synced);
    }
}
