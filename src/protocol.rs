//! Wire protocol: event envelopes and their JSON codec.
//!
//! Every message on the wire is a UTF-8 text frame carrying exactly one
//! JSON object of the form `{"type": "<EVENT>", "data": <any JSON>}`.
//! Bulk binary data travels out-of-band: a metadata envelope announces the
//! payload and the immediately following binary frame carries it.
//!
//! Event types are namespaced by the registration key of the sync unit
//! they belong to, e.g. `NOTES:SET` or `NOTES:ACTION:RENAME`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum accepted size for a single binary payload (16MB)
pub const MAX_BINARY_SIZE: u64 = 16 * 1024 * 1024;

/// Reserved event for transient client notifications.
pub const TOAST_EVENT: &str = "_TOAST";

/// Errors in the framing layer
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),

    #[error("invalid registration key {0:?}: keys are non-empty, uppercase letters, digits and underscores")]
    InvalidKey(String),

    #[error("binary frame without preceding metadata")]
    UnpairedBinary,

    #[error("text frame {0:?} received while awaiting a binary payload")]
    InterleavedText(String),

    #[error("duplicate binary metadata for field {0:?} before its payload arrived")]
    DuplicateBinaryMeta(String),

    #[error("binary payload too large: {0} bytes (max: {1})")]
    PayloadTooLarge(u64, u64),

    #[error("binary payload size mismatch: announced {announced} bytes, received {received}")]
    SizeMismatch { announced: u64, received: u64 },
}

/// One protocol message: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Serialize to the single-object text frame format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

// ===== Event type helpers =====

/// Wholesale state assignment, `S→C` and `C→S`.
pub fn set_event(key: &str) -> String {
    format!("{key}:SET")
}

/// Request for an immediate full `SET`, `C→S`.
pub fn get_event(key: &str) -> String {
    format!("{key}:GET")
}

/// JSON Patch delta, `S→C` and `C→S`.
pub fn patch_event(key: &str) -> String {
    format!("{key}:PATCH")
}

/// Action invocation, `C→S` (or server-dispatched to the client).
pub fn action_event(key: &str, name: &str) -> String {
    format!("{key}:ACTION:{name}")
}

pub fn task_start_event(key: &str, name: &str) -> String {
    format!("{key}:TASK_START:{name}")
}

pub fn task_cancel_event(key: &str, name: &str) -> String {
    format!("{key}:TASK_CANCEL:{name}")
}

pub fn task_done_event(key: &str, name: &str) -> String {
    format!("{key}:TASK_DONE:{name}")
}

/// Announces that the next binary frame belongs to `field`.
pub fn bin_meta_event(key: &str, field: &str) -> String {
    format!("{key}:BIN_META:{field}")
}

/// Handler or validation failure report. `name` is the action/task the
/// failure belongs to, when there is one.
pub fn error_event(key: &str, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("{key}:ERROR:{name}"),
        None => format!("{key}:ERROR"),
    }
}

/// Validate a registration key: non-empty, uppercase letters, digits and
/// underscores only.
pub fn validate_key(key: &str) -> Result<(), ProtocolError> {
    let ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ProtocolError::InvalidKey(key.to_string()))
    }
}

/// Metadata announcing a binary payload on the next frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryMeta {
    /// Payload length in bytes
    pub size: u64,
    /// Content type, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

/// Terminal classification of a task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Payload of a `{K}:TASK_DONE:{NAME}` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDone {
    pub outcome: TaskOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Failure classes reported to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    Handler,
    Projection,
    Protocol,
}

/// Payload of a `{K}:ERROR` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: ErrorCode,
    pub message: String,
    /// RFC 6901 pointer to the offending field, when the failure is tied
    /// to one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Severity of a toast notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastLevel {
    Default,
    Info,
    Success,
    Warning,
    Error,
}

/// Payload of a `_TOAST` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Toast {
    #[serde(rename = "type")]
    pub level: ToastLevel,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_roundtrip() {
        let env = Envelope::new("NOTES:SET", json!({"title": "N", "notes": []}));
        let text = env.encode().unwrap();
        let decoded = Envelope::decode(&text).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_envelope_data_defaults_to_null() {
        let decoded = Envelope::decode(r#"{"type": "NOTES:GET"}"#).unwrap();
        assert_eq!(decoded.event, "NOTES:GET");
        assert_eq!(decoded.data, Value::Null);
    }

    #[test]
    fn test_envelope_rejects_non_object() {
        assert!(Envelope::decode("[1, 2, 3]").is_err());
        assert!(Envelope::decode("not json").is_err());
    }

    #[test]
    fn test_event_builders() {
        assert_eq!(set_event("NOTES"), "NOTES:SET");
        assert_eq!(get_event("NOTES"), "NOTES:GET");
        assert_eq!(patch_event("NOTES"), "NOTES:PATCH");
        assert_eq!(action_event("NOTES", "RENAME"), "NOTES:ACTION:RENAME");
        assert_eq!(task_start_event("NOTES", "INC"), "NOTES:TASK_START:INC");
        assert_eq!(task_cancel_event("NOTES", "INC"), "NOTES:TASK_CANCEL:INC");
        assert_eq!(task_done_event("NOTES", "INC"), "NOTES:TASK_DONE:INC");
        assert_eq!(bin_meta_event("NOTES", "avatar"), "NOTES:BIN_META:avatar");
        assert_eq!(error_event("NOTES", Some("RENAME")), "NOTES:ERROR:RENAME");
        assert_eq!(error_event("NOTES", None), "NOTES:ERROR");
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("NOTES").is_ok());
        assert!(validate_key("TASK_MANAGER_2").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("notes").is_err());
        assert!(validate_key("NO TES").is_err());
        assert!(validate_key("NOTES:SET").is_err());
    }

    #[test]
    fn test_binary_meta_optional_mime() {
        let meta = BinaryMeta {
            size: 42,
            mime: None,
        };
        let v = serde_json::to_value(&meta).unwrap();
        assert_eq!(v, json!({"size": 42}));

        let parsed: BinaryMeta =
            serde_json::from_value(json!({"size": 7, "mime": "image/png"})).unwrap();
        assert_eq!(parsed.mime.as_deref(), Some("image/png"));
    }

    #[test]
    fn test_task_done_serialization() {
        let done = TaskDone {
            outcome: TaskOutcome::Cancelled,
            error: None,
        };
        assert_eq!(
            serde_json::to_value(&done).unwrap(),
            json!({"outcome": "cancelled"})
        );
    }
}
