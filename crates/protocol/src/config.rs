//! Process-wide configuration, as described in spec §3.
//!
//! Every field has a default so that a config file can specify only the
//! fields it cares about; [`MatchBoxConfig::validate`] collects
//! `ERROR:`/`WARNING:` prefixed strings the way a config loader would
//! surface them to an operator before a component is allowed to start.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_scoring_host() -> String {
    "localhost".to_string()
}

fn default_scoring_port() -> u16 {
    80
}

fn default_switcher_host() -> String {
    "localhost".to_string()
}

fn default_switcher_port() -> u16 {
    4455
}

fn default_output_dir() -> String {
    "./match_clips".to_string()
}

fn default_web_port() -> u16 {
    80
}

fn default_mdns_name() -> String {
    "ftcvideo.local".to_string()
}

fn default_field_scene_mapping() -> HashMap<u32, String> {
    let mut m = HashMap::new();
    m.insert(1, "Field 1".to_string());
    m.insert(2, "Field 2".to_string());
    m
}

fn default_pre_match_buffer_seconds() -> u32 {
    10
}

fn default_post_match_buffer_seconds() -> u32 {
    10
}

fn default_match_duration_seconds() -> u32 {
    158
}

fn default_rsync_interval_seconds() -> u32 {
    60
}

fn default_true() -> bool {
    true
}

/// Safety margin added to `match_duration + post_match_buffer` before a
/// ClipJob fires, per spec §4.4.
pub const CLIP_JOB_SAFETY_MARGIN_SECONDS: u32 = 8;

/// Size of the bounded in-memory log ring C6 replays on `/ws/logs` connect.
pub const LOG_RING_CAPACITY: usize = 500;

/// Video extensions the index scanner and clip listing recognize, per spec §4.5.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "wmv", "flv", "webm"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchBoxConfig {
    #[serde(default)]
    pub event_code: String,

    #[serde(default = "default_scoring_host")]
    pub scoring_host: String,
    #[serde(default = "default_scoring_port")]
    pub scoring_port: u16,

    #[serde(default = "default_switcher_host")]
    pub switcher_host: String,
    #[serde(default = "default_switcher_port")]
    pub switcher_port: u16,
    #[serde(default)]
    pub switcher_password: String,

    #[serde(default = "default_field_scene_mapping")]
    pub field_scene_mapping: HashMap<u32, String>,

    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    #[serde(default = "default_mdns_name")]
    pub mdns_name: String,

    #[serde(default = "default_pre_match_buffer_seconds")]
    pub pre_match_buffer_seconds: u32,
    #[serde(default = "default_post_match_buffer_seconds")]
    pub post_match_buffer_seconds: u32,
    #[serde(default = "default_match_duration_seconds")]
    pub match_duration_seconds: u32,

    #[serde(default)]
    pub rsync_enabled: bool,
    #[serde(default)]
    pub rsync_host: String,
    #[serde(default)]
    pub rsync_module: String,
    #[serde(default)]
    pub rsync_username: String,
    #[serde(default)]
    pub rsync_password: String,
    #[serde(default = "default_rsync_interval_seconds")]
    pub rsync_interval_seconds: u32,

    #[serde(default)]
    pub tunnel_relay_url: String,
    #[serde(default)]
    pub tunnel_token: String,
    #[serde(default)]
    pub tunnel_password: String,
    #[serde(default = "default_true")]
    pub tunnel_allow_admin: bool,
}

impl Default for MatchBoxConfig {
    fn default() -> Self {
        Self {
            event_code: String::new(),
            scoring_host: default_scoring_host(),
            scoring_port: default_scoring_port(),
            switcher_host: default_switcher_host(),
            switcher_port: default_switcher_port(),
            switcher_password: String::new(),
            field_scene_mapping: default_field_scene_mapping(),
            output_dir: default_output_dir(),
            web_port: default_web_port(),
            mdns_name: default_mdns_name(),
            pre_match_buffer_seconds: default_pre_match_buffer_seconds(),
            post_match_buffer_seconds: default_post_match_buffer_seconds(),
            match_duration_seconds: default_match_duration_seconds(),
            rsync_enabled: false,
            rsync_host: String::new(),
            rsync_module: String::new(),
            rsync_username: String::new(),
            rsync_password: String::new(),
            rsync_interval_seconds: default_rsync_interval_seconds(),
            tunnel_relay_url: String::new(),
            tunnel_token: String::new(),
            tunnel_password: String::new(),
            tunnel_allow_admin: true,
        }
    }
}

impl MatchBoxConfig {
    /// Parse from a JSON string, falling back to defaults for any field the
    /// document omits (spec §6: "Configuration file. JSON, on disk").
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Where on disk the per-event clips live, per spec §3's invariant
    /// `output_dir / event_code`.
    pub fn clips_dir(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.output_dir).join(&self.event_code)
    }

    /// Collect `ERROR:`/`WARNING:` strings describing why this config is
    /// unfit to run, or fine to run with caveats. `Ok(())` iff there are no
    /// errors (warnings alone do not block startup).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let (errors, warnings) = self.validate_report();
        if !errors.is_empty() {
            let mut all = errors;
            all.extend(warnings);
            return Err(all);
        }
        Ok(())
    }

    /// Collect errors and warnings separately, regardless of outcome, for
    /// callers (e.g. `/api/config`) that want to surface warnings even on a
    /// config with no errors.
    pub fn validate_report(&self) -> (Vec<String>, Vec<String>) {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.web_port == 0 {
            errors.push("ERROR: web_port must be nonzero".to_string());
        } else if self.web_port == u16::MAX {
            errors.push(
                "ERROR: web_port must leave room for the status/log bus on web_port+1"
                    .to_string(),
            );
        }

        if self.scoring_port == 0 {
            warnings.push("WARNING: scoring_port is zero".to_string());
        }
        if self.switcher_port == 0 {
            warnings.push("WARNING: switcher_port is zero".to_string());
        }

        if self.field_scene_mapping.is_empty() {
            errors.push("ERROR: field_scene_mapping must have at least one entry".to_string());
        } else {
            let n = self.field_scene_mapping.len() as u32;
            for field in 1..=n {
                if !self.field_scene_mapping.contains_key(&field) {
                    errors.push(format!(
                        "ERROR: field_scene_mapping must be dense 1..{n}, missing field {field}"
                    ));
                }
            }
        }

        if self.pre_match_buffer_seconds > 120 {
            warnings.push("WARNING: pre_match_buffer_seconds is unusually large (>120s)".to_string());
        }
        if self.post_match_buffer_seconds > 120 {
            warnings.push("WARNING: post_match_buffer_seconds is unusually large (>120s)".to_string());
        }
        if self.match_duration_seconds == 0 {
            errors.push("ERROR: match_duration_seconds must be nonzero".to_string());
        } else if self.match_duration_seconds > 600 {
            warnings.push("WARNING: match_duration_seconds is unusually large (>600s)".to_string());
        }

        if self.rsync_enabled {
            if self.rsync_host.is_empty() {
                errors.push("ERROR: rsync_enabled requires rsync_host".to_string());
            }
            if self.rsync_module.is_empty() {
                errors.push("ERROR: rsync_enabled requires rsync_module".to_string());
            }
            if self.rsync_interval_seconds == 0 {
                errors.push(
                    "ERROR: rsync_interval_seconds must be nonzero when rsync is enabled"
                        .to_string(),
                );
            }
        }

        if !self.mdns_name.ends_with(".local") {
            warnings.push(format!(
                "WARNING: mdns_name '{}' does not end in .local",
                self.mdns_name
            ));
        }

        if !self.tunnel_relay_url.is_empty() {
            let lower = self.tunnel_relay_url.to_ascii_lowercase();
            let known_scheme = ["http://", "https://", "ws://", "wss://"]
                .iter()
                .any(|s| lower.starts_with(s));
            if !known_scheme {
                warnings.push(format!(
                    "WARNING: tunnel_relay_url '{}' has no recognized scheme",
                    self.tunnel_relay_url
                ));
            }
        }

        (errors, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_object() {
        let cfg = MatchBoxConfig::from_json("{}").unwrap();
        assert_eq!(cfg, MatchBoxConfig::default());
    }

    #[test]
    fn partial_config_only_web_port() {
        let cfg = MatchBoxConfig::from_json(r#"{"web_port": 8080}"#).unwrap();
        assert_eq!(cfg.web_port, 8080);
        assert_eq!(cfg.scoring_host, "localhost");
    }

    #[test]
    fn field_scene_mapping_keys_are_strings_in_json_but_ints_in_memory() {
        let cfg = MatchBoxConfig::from_json(r#"{"field_scene_mapping": {"1": "A", "2": "B"}}"#)
            .unwrap();
        assert_eq!(cfg.field_scene_mapping.get(&1), Some(&"A".to_string()));
        assert_eq!(cfg.field_scene_mapping.get(&2), Some(&"B".to_string()));
    }

    #[test]
    fn custom_values_override_defaults() {
        let cfg = MatchBoxConfig::from_json(
            r#"{"event_code": "q1evt", "web_port": 9000, "rsync_enabled": true}"#,
        )
        .unwrap();
        assert_eq!(cfg.event_code, "q1evt");
        assert_eq!(cfg.web_port, 9000);
        assert!(cfg.rsync_enabled);
    }

    #[test]
    fn default_trait_produces_valid_config() {
        assert!(MatchBoxConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_web_port_zero_is_error() {
        let mut cfg = MatchBoxConfig::default();
        cfg.web_port = 0;
        let errs = cfg.validate().unwrap_err();
        assert!(errs.iter().any(|e| e.contains("web_port")));
    }

    #[test]
    fn validate_web_port_max_is_error() {
        let mut cfg = MatchBoxConfig::default();
        cfg.web_port = u16::MAX;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_empty_field_scene_mapping_is_error() {
        let mut cfg = MatchBoxConfig::default();
        cfg.field_scene_mapping.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_sparse_field_scene_mapping_is_error() {
        let mut cfg = MatchBoxConfig::default();
        cfg.field_scene_mapping.clear();
        cfg.field_scene_mapping.insert(1, "Field 1".to_string());
        cfg.field_scene_mapping.insert(3, "Field 3".to_string());
        let errs = cfg.validate().unwrap_err();
        assert!(errs.iter().any(|e| e.contains("field 2")));
    }

    #[test]
    fn validate_dense_field_scene_mapping_of_three_is_ok() {
        let mut cfg = MatchBoxConfig::default();
        cfg.field_scene_mapping.clear();
        for i in 1..=3 {
            cfg.field_scene_mapping.insert(i, format!("Field {i}"));
        }
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_match_duration_zero_is_error() {
        let mut cfg = MatchBoxConfig::default();
        cfg.match_duration_seconds = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rsync_enabled_without_host_is_error() {
        let mut cfg = MatchBoxConfig::default();
        cfg.rsync_enabled = true;
        let errs = cfg.validate().unwrap_err();
        assert!(errs.iter().any(|e| e.contains("rsync_host")));
        assert!(errs.iter().any(|e| e.contains("rsync_module")));
    }

    #[test]
    fn validate_rsync_enabled_with_host_and_module_is_ok() {
        let mut cfg = MatchBoxConfig::default();
        cfg.rsync_enabled = true;
        cfg.rsync_host = "mirror.example.com".to_string();
        cfg.rsync_module = "clips".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_multiple_errors_collected() {
        let mut cfg = MatchBoxConfig::default();
        cfg.web_port = 0;
        cfg.match_duration_seconds = 0;
        let errs = cfg.validate().unwrap_err();
        assert!(errs.len() >= 2);
    }

    #[test]
    fn validate_warnings_only_is_ok() {
        let mut cfg = MatchBoxConfig::default();
        cfg.mdns_name = "not-dot-local".to_string();
        assert!(cfg.validate().is_ok());
        let (errors, warnings) = cfg.validate_report();
        assert!(errors.is_empty());
        assert!(!warnings.is_empty());
    }

    #[test]
    fn validate_unknown_tunnel_scheme_is_warning_not_error() {
        let mut cfg = MatchBoxConfig::default();
        cfg.tunnel_relay_url = "ftp://relay.example.com".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn clips_dir_joins_output_dir_and_event_code() {
        let mut cfg = MatchBoxConfig::default();
        cfg.output_dir = "/data/clips".to_string();
        cfg.event_code = "q1evt".to_string();
        assert_eq!(
            cfg.clips_dir(),
            std::path::PathBuf::from("/data/clips/q1evt")
        );
    }

    #[test]
    fn roundtrip_to_json_and_back() {
        let cfg = MatchBoxConfig::default();
        let json = cfg.to_json_pretty().unwrap();
        let parsed = MatchBoxConfig::from_json(&json).unwrap();
        assert_eq!(cfg, parsed);
    }
}
