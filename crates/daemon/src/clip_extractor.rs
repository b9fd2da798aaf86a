//! C1: extracts a match clip from a continuous recording with `ffmpeg`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ClipExtractError {
    #[error("ffmpeg not found on PATH")]
    EncoderMissing,
    #[error("ffmpeg exited with status {0}")]
    EncoderNonZeroExit(i32),
    #[error("ffmpeg produced no output file at {0}")]
    OutputNotCreated(PathBuf),
    #[error("failed to run ffmpeg: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Extract `[start, start + duration)` of `source` into a new file under
/// `output_dir`, named `{match_name} - Field {field} - {YYYYMMDD HHMMSS}.mp4`.
/// If that name already exists, `_1`, `_2`, … is appended until a filename
/// that doesn't yet exist is found (spec §3/§8 property 1's create-new-file
/// uniqueness rule — it never overwrites a prior clip).
pub async fn extract_clip(
    source: &Path,
    output_dir: &Path,
    match_name: &str,
    field_number: u32,
    start_seconds: f64,
    duration_seconds: f64,
    now: chrono_like::Timestamp,
) -> Result<PathBuf, ClipExtractError> {
    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(ClipExtractError::Spawn)?;

    let dest = unique_destination(output_dir, match_name, field_number, now).await;
    let clamped_start = start_seconds.max(0.0);

    let status = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(source)
        .arg("-ss")
        .arg(format!("{clamped_start}"))
        .arg("-t")
        .arg(format!("{duration_seconds}"))
        .arg("-c")
        .arg("copy")
        .arg("-avoid_negative_ts")
        .arg("make_zero")
        .arg(&dest)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .status()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ClipExtractError::EncoderMissing
            } else {
                ClipExtractError::Spawn(e)
            }
        })?;

    if !status.success() {
        warn!(?status, "ffmpeg exited non-zero extracting clip");
        return Err(ClipExtractError::EncoderNonZeroExit(
            status.code().unwrap_or(-1),
        ));
    }

    if !tokio::fs::try_exists(&dest).await.unwrap_or(false) {
        return Err(ClipExtractError::OutputNotCreated(dest));
    }

    info!(path = %dest.display(), "extracted match clip");
    Ok(dest)
}

async fn unique_destination(
    output_dir: &Path,
    match_name: &str,
    field_number: u32,
    now: chrono_like::Timestamp,
) -> PathBuf {
    let base = format!(
        "{} - Field {} - {}",
        match_name.trim(),
        field_number,
        now.format_compact()
    );
    let mut candidate = output_dir.join(format!("{base}.mp4"));
    let mut n = 1;
    while tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        candidate = output_dir.join(format!("{base}_{n}.mp4"));
        n += 1;
    }
    candidate
}

/// Probe a recording's duration with `ffprobe`; `None` on any failure
/// (missing binary, non-UTF8 output, parse failure, or the 10s timeout
/// expiring), matching the original's "duration unavailable" behavior.
pub async fn probe_duration_seconds(path: &Path) -> Option<f64> {
    let run = Command::new("ffprobe")
        .arg("-v")
        .arg("quiet")
        .arg("-print_format")
        .arg("json")
        .arg("-show_entries")
        .arg("format=duration")
        .arg(path)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output();

    let output = match tokio::time::timeout(Duration::from_secs(10), run).await {
        Ok(Ok(out)) if out.status.success() => out,
        _ => return None,
    };

    let text = String::from_utf8(output.stdout).ok()?;
    let value: serde_json::Value = serde_json::from_str(&text).ok()?;
    value
        .get("format")?
        .get("duration")?
        .as_str()?
        .parse::<f64>()
        .ok()
}

/// A tiny wall-clock timestamp abstraction so this module doesn't pull in a
/// date/time crate the teacher never used; callers format the value they
/// already have (from `std::time::SystemTime`) when building a clip's name.
pub mod chrono_like {
    use std::time::{SystemTime, UNIX_EPOCH};

    #[derive(Debug, Clone, Copy)]
    pub struct Timestamp(pub SystemTime);

    impl Timestamp {
        pub fn now() -> Self {
            Self(SystemTime::now())
        }

        /// `YYYYMMDD HHMMSS`, UTC, matching `strftime("%Y%m%d %H%M%S")`.
        pub fn format_compact(&self) -> String {
            let secs = self
                .0
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let days = secs / 86_400;
            let time_of_day = secs % 86_400;
            let (y, m, d) = civil_from_days(days as i64);
            let (hh, mm, ss) = (time_of_day / 3600, (time_of_day / 60) % 60, time_of_day % 60);
            format!("{y:04}{m:02}{d:02} {hh:02}{mm:02}{ss:02}")
        }
    }

    /// Howard Hinnant's civil_from_days algorithm, days-since-epoch to (y, m, d).
    fn civil_from_days(z: i64) -> (i64, u32, u32) {
        let z = z + 719_468;
        let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
        let doe = (z - era * 146_097) as u64;
        let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
        let y = yoe as i64 + era * 400;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
        let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
        (if m <= 2 { y + 1 } else { y }, m, d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_from_days_known_date() {
        let ts = chrono_like::Timestamp(std::time::UNIX_EPOCH);
        assert_eq!(ts.format_compact(), "19700101 000000");
    }

    #[tokio::test]
    async fn unique_destination_appends_suffix_on_collision() {
        let dir = tempdir();
        let now = chrono_like::Timestamp(std::time::UNIX_EPOCH);
        let first = unique_destination(&dir, "Qualification 1", 1, now).await;
        tokio::fs::write(&first, b"x").await.unwrap();
        let second = unique_destination(&dir, "Qualification 1", 1, now).await;
        assert_ne!(first, second);
        assert!(second.to_string_lossy().contains("_1"));

        tokio::fs::write(&second, b"x").await.unwrap();
        let third = unique_destination(&dir, "Qualification 1", 1, now).await;
        assert!(third.to_string_lossy().contains("_2"));
    }

    #[tokio::test]
    async fn probe_duration_returns_none_for_missing_file() {
        let dir = tempdir();
        let missing = dir.join("nope.mp4");
        assert_eq!(probe_duration_seconds(&missing).await, None);
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "matchbox-clip-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
