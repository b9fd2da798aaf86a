//! Events pushed by the upstream scoring system over its display-command
//! WebSocket (spec §4.4). Unknown `type` values are ignored by the
//! orchestrator rather than rejected, so this enum is deliberately loose:
//! anything it doesn't recognize falls through to [`ScoringEvent::Unknown`].

use serde::{Deserialize, Serialize};

/// `field` is sometimes sent at the top level and sometimes nested under
/// `params`; callers should check both per spec §4.4's field-extraction note.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoringEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub field: Option<u32>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

impl ScoringEnvelope {
    /// Field number from the top-level `field`, falling back to
    /// `params.field`.
    pub fn resolved_field(&self) -> Option<u32> {
        self.field.or_else(|| {
            self.params
                .as_ref()
                .and_then(|p| p.get("field"))
                .and_then(|v| v.as_u64())
                .map(|v| v as u32)
        })
    }

    pub fn event(&self) -> ScoringEvent {
        match self.kind.as_str() {
            "SHOW_PREVIEW" => ScoringEvent::ShowPreview {
                field: self.resolved_field(),
            },
            "SHOW_MATCH" => ScoringEvent::ShowMatch {
                field: self.resolved_field(),
            },
            "START_MATCH" => match &self.params {
                Some(params) => match serde_json::from_value::<MatchInfo>(params.clone()) {
                    Ok(info) => ScoringEvent::StartMatch { info },
                    Err(_) => ScoringEvent::Unknown(self.kind.clone()),
                },
                None => ScoringEvent::Unknown(self.kind.clone()),
            },
            other => ScoringEvent::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScoringEvent {
    ShowPreview { field: Option<u32> },
    ShowMatch { field: Option<u32> },
    StartMatch { info: MatchInfo },
    Unknown(String),
}

/// Match metadata carried by a `START_MATCH` event's `params`, per spec §4.4.
/// `start_timestamp` is stamped by the orchestrator on receipt, not parsed
/// from the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchInfo {
    #[serde(rename = "matchName")]
    pub match_name: String,
    pub field: u32,
    #[serde(default)]
    pub start_timestamp: Option<f64>,
    /// Legacy alias for `start_timestamp` some upstream versions still send.
    #[serde(default)]
    pub timestamp: Option<f64>,
}

impl MatchInfo {
    /// Resolve a start time: `start_timestamp`, then legacy `timestamp`,
    /// else `None` (caller should stamp wall-clock "now" in that case).
    pub fn resolved_start_timestamp(&self) -> Option<f64> {
        self.start_timestamp.or(self.timestamp)
    }

    /// Trim whitespace from `matchName`, matching the upstream behavior of
    /// stripping operator-entered match names before using them in a
    /// filename.
    pub fn trimmed_match_name(&self) -> &str {
        self.match_name.trim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn show_preview_field_at_top_level() {
        let env: ScoringEnvelope =
            serde_json::from_str(r#"{"type": "SHOW_PREVIEW", "field": 2}"#).unwrap();
        assert_eq!(env.resolved_field(), Some(2));
        assert_eq!(env.event(), ScoringEvent::ShowPreview { field: Some(2) });
    }

    #[test]
    fn show_match_field_nested_in_params() {
        let env: ScoringEnvelope =
            serde_json::from_str(r#"{"type": "SHOW_MATCH", "params": {"field": 3}}"#).unwrap();
        assert_eq!(env.resolved_field(), Some(3));
        assert_eq!(env.event(), ScoringEvent::ShowMatch { field: Some(3) });
    }

    #[test]
    fn top_level_field_wins_over_nested() {
        let env: ScoringEnvelope = serde_json::from_str(
            r#"{"type": "SHOW_PREVIEW", "field": 1, "params": {"field": 9}}"#,
        )
        .unwrap();
        assert_eq!(env.resolved_field(), Some(1));
    }

    #[test]
    fn start_match_parses_match_info() {
        let env: ScoringEnvelope = serde_json::from_str(
            r#"{"type": "START_MATCH", "params": {"matchName": "  Qualification 12  ", "field": 1}}"#,
        )
        .unwrap();
        match env.event() {
            ScoringEvent::StartMatch { info } => {
                assert_eq!(info.trimmed_match_name(), "Qualification 12");
                assert_eq!(info.field, 1);
                assert_eq!(info.resolved_start_timestamp(), None);
            }
            other => panic!("expected StartMatch, got {:?}", other),
        }
    }

    #[test]
    fn start_match_legacy_timestamp_field() {
        let info: MatchInfo = serde_json::from_str(
            r#"{"matchName": "Final 1", "field": 2, "timestamp": 1700000000.0}"#,
        )
        .unwrap();
        assert_eq!(info.resolved_start_timestamp(), Some(1700000000.0));
    }

    #[test]
    fn unknown_type_is_ignored_not_rejected() {
        let env: ScoringEnvelope =
            serde_json::from_str(r#"{"type": "MATCH_ABORT"}"#).unwrap();
        assert_eq!(env.event(), ScoringEvent::Unknown("MATCH_ABORT".to_string()));
    }

    #[test]
    fn missing_field_resolves_to_none() {
        let env: ScoringEnvelope = serde_json::from_str(r#"{"type": "SHOW_PREVIEW"}"#).unwrap();
        assert_eq!(env.resolved_field(), None);
    }
}
