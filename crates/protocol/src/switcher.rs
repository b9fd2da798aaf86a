//! Request/response envelope for the switcher's (OBS-compatible)
//! WebSocket API, per spec §4.3. Each in-flight request is correlated to
//! its response by `id`; the daemon keeps a map of pending requests keyed
//! the same way.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct SwitcherRequest {
    #[serde(rename = "requestType")]
    pub request_type: String,
    #[serde(rename = "requestId")]
    pub request_id: Uuid,
    #[serde(rename = "requestData", skip_serializing_if = "Option::is_none")]
    pub request_data: Option<serde_json::Value>,
}

impl SwitcherRequest {
    pub fn new(request_type: impl Into<String>, request_data: Option<serde_json::Value>) -> Self {
        Self {
            request_type: request_type.into(),
            request_id: Uuid::new_v4(),
            request_data,
        }
    }
}

/// Mirrors the OBS WebSocket response shape: `status` reports whether the
/// call succeeded, `datain` carries the return payload, `error` is set iff
/// `status` is false.
#[derive(Debug, Clone, Deserialize)]
pub struct SwitcherResponse {
    #[serde(rename = "requestId")]
    pub request_id: Uuid,
    pub status: bool,
    #[serde(default)]
    pub datain: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SwitcherResponse {
    pub fn into_result(self) -> Result<serde_json::Value, String> {
        if self.status {
            Ok(self.datain.unwrap_or(serde_json::Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| "unknown switcher error".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_with_fresh_id() {
        let req = SwitcherRequest::new("SetCurrentProgramScene", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("SetCurrentProgramScene"));
        assert!(json.contains("requestId"));
    }

    #[test]
    fn success_response_into_result_ok() {
        let resp = SwitcherResponse {
            request_id: Uuid::nil(),
            status: true,
            datain: Some(serde_json::json!({"sceneName": "Field 1"})),
            error: None,
        };
        let value = resp.into_result().unwrap();
        assert_eq!(value["sceneName"], "Field 1");
    }

    #[test]
    fn failure_response_into_result_err() {
        let resp = SwitcherResponse {
            request_id: Uuid::nil(),
            status: false,
            datain: None,
            error: Some("scene not found".to_string()),
        };
        assert_eq!(resp.into_result().unwrap_err(), "scene not found");
    }

    #[test]
    fn failure_response_without_error_message_has_fallback() {
        let resp = SwitcherResponse {
            request_id: Uuid::nil(),
            status: false,
            datain: None,
            error: None,
        };
        assert!(!resp.into_result().unwrap_err().is_empty());
    }
}
