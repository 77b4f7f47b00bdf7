//! Worker I/O Contract
//!
//! Types for the JSON frame exchanged with the in-sandbox runtime over
//! stdio. No interpreter implementing this contract ships in this crate;
//! the worker image is an external build artifact referenced only by name.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct EventPayload {
    pub data: Value,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextPayload {
    #[serde(rename = "executionId")]
    pub execution_id: String,
    #[serde(rename = "environmentId")]
    pub environment_id: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
}

/// The frame written to the worker's stdin.
#[derive(Debug, Clone, Serialize)]
pub struct InputFrame {
    pub event: EventPayload,
    pub context: ContextPayload,
    #[serde(rename = "mainModule")]
    pub main_module: String,
}

/// The frame expected on the worker's stdout. Parse failure is handled by
/// the caller, not here: the contract fails open when the worker produces
/// something that isn't valid JSON matching this shape.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputFrame {
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub stack: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_frame_serializes_expected_shape() {
        let frame = InputFrame {
            event: EventPayload {
                data: serde_json::json!({"a": 5}),
                env: HashMap::new(),
            },
            context: ContextPayload {
                execution_id: "exec-1".to_string(),
                environment_id: "env-1".to_string(),
                request_id: "exec-1".to_string(),
            },
            main_module: "main.ts".to_string(),
        };

        let value: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["mainModule"], "main.ts");
        assert_eq!(value["context"]["executionId"], "exec-1");
        assert_eq!(value["event"]["data"]["a"], 5);
    }

    #[test]
    fn test_output_frame_success() {
        let raw = r#"{"success":true,"result":{"sum":8}}"#;
        let frame: OutputFrame = serde_json::from_str(raw).unwrap();
        assert!(frame.success);
        assert_eq!(frame.result.unwrap()["sum"], 8);
    }

    #[test]
    fn test_output_frame_failure() {
        let raw = r#"{"success":false,"error":"nope"}"#;
        let frame: OutputFrame = serde_json::from_str(raw).unwrap();
        assert!(!frame.success);
        assert_eq!(frame.error.unwrap(), "nope");
    }
}
