//! Status snapshot and log record shapes shared between the daemon's core
//! state, its `/api/status` handler, and the C6 status/log bus.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecordingInfo {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub running: bool,
    pub switcher_connected: bool,
    pub upstream_connected: bool,
    pub current_field: Option<u32>,
    pub clips_count: usize,
    pub recording_info: RecordingInfo,
    pub event_code: String,
    pub sync_running: bool,
    pub tunnel_connected: bool,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            running: false,
            switcher_connected: false,
            upstream_connected: false,
            current_field: None,
            clips_count: 0,
            recording_info: RecordingInfo::default(),
            event_code: String::new(),
            sync_running: false,
            tunnel_connected: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// A single formatted log line, as republished on `/ws/logs` by the
/// tracing layer described in SPEC_FULL.md's ambient logging section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    /// Unix epoch seconds, fractional.
    pub timestamp: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_snapshot_is_all_false_empty() {
        let snap = StatusSnapshot::default();
        assert!(!snap.running);
        assert!(!snap.switcher_connected);
        assert_eq!(snap.clips_count, 0);
        assert_eq!(snap.current_field, None);
    }

    #[test]
    fn recording_info_skips_absent_fields_in_json() {
        let info = RecordingInfo {
            available: false,
            path: None,
            duration_seconds: None,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("path"));
        assert!(!json.contains("duration_seconds"));
    }

    #[test]
    fn log_level_serializes_lowercase() {
        let json = serde_json::to_string(&LogLevel::Warn).unwrap();
        assert_eq!(json, "\"warn\"");
    }

    #[test]
    fn status_snapshot_roundtrip() {
        let snap = StatusSnapshot {
            running: true,
            switcher_connected: true,
            upstream_connected: false,
            current_field: Some(2),
            clips_count: 5,
            recording_info: RecordingInfo {
                available: true,
                path: Some("/tmp/rec.mp4".to_string()),
                duration_seconds: Some(42.5),
            },
            event_code: "q1evt".to_string(),
            sync_running: false,
            tunnel_connected: true,
        };
        let json = serde_json::to_string(&snap).unwrap();
        let parsed: StatusSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snap, parsed);
    }
}
