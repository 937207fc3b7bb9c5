//! Inbound frame decoding.
//!
//! Frames are UTF-8 JSON objects tagged by a `type` field. Known shapes
//! decode into typed variants; any other object is kept as
//! [`Message::Unknown`] so listeners still see it. Only frames that are not
//! JSON objects at all fail to decode.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Decoded inbound message, as handed to listeners.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Server keepalive.
    Ping,
    /// Reply to a client ping.
    Pong,
    /// A job definition changed.
    JobUpdate(JobUpdate),
    /// A job run changed state or produced output.
    JobRunUpdate(JobRunUpdate),
    /// A daemon reported its status.
    DaemonStatus(DaemonStatus),
    /// Server-side error notice.
    Error {
        /// Human-readable error.
        message: String,
    },
    /// Any other JSON object, verbatim.
    #[serde(skip_deserializing)]
    Unknown(Value),
}

/// Payload of [`Message::JobUpdate`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobUpdate {
    /// Job identifier (string or number on the wire).
    #[serde(deserialize_with = "id_string")]
    pub job_id: String,
    /// New job status (e.g. `"enabled"`, `"paused"`).
    pub status: String,
    /// Next scheduled run, if the server computed one.
    #[serde(default)]
    pub next_run_at: Option<String>,
}

/// Payload of [`Message::JobRunUpdate`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobRunUpdate {
    /// Job identifier.
    #[serde(deserialize_with = "id_string")]
    pub job_id: String,
    /// Run identifier.
    #[serde(deserialize_with = "id_string")]
    pub run_id: String,
    /// Run status (e.g. `"running"`, `"succeeded"`, `"failed"`).
    pub status: String,
    /// Output produced since the previous update.
    #[serde(default)]
    pub output: Option<String>,
    /// Process exit code once finished.
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Payload of [`Message::DaemonStatus`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DaemonStatus {
    /// Daemon name.
    pub name: String,
    /// Reported status (e.g. `"running"`, `"stopped"`).
    pub status: String,
    /// Process id while running.
    #[serde(default)]
    pub pid: Option<u32>,
}

impl Message {
    /// The frame's `type` tag, when it has one.
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::Ping => Some("ping"),
            Self::Pong => Some("pong"),
            Self::JobUpdate(_) => Some("job_update"),
            Self::JobRunUpdate(_) => Some("job_run_update"),
            Self::DaemonStatus(_) => Some("daemon_status"),
            Self::Error { .. } => Some("error"),
            Self::Unknown(value) => value.get("type").and_then(Value::as_str),
        }
    }
}

/// Why an inbound frame could not be decoded.
#[derive(Debug)]
pub enum DecodeError {
    /// Frame is not valid JSON.
    InvalidJson(serde_json::Error),
    /// Frame is valid JSON but not an object.
    NotAnObject,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson(e) => write!(f, "Invalid JSON frame: {e}"),
            Self::NotAnObject => write!(f, "Frame is not a JSON object"),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidJson(e) => Some(e),
            Self::NotAnObject => None,
        }
    }
}

/// Decode one inbound text frame.
///
/// # Errors
///
/// Returns [`DecodeError`] when the frame is not a JSON object.
pub fn decode(frame: &str) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_str(frame).map_err(DecodeError::InvalidJson)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }

    match Message::deserialize(&value) {
        Ok(message) => Ok(message),
        Err(e) => {
            log::trace!("[Mux] Keeping frame as unknown: {}", e);
            Ok(Message::Unknown(value))
        }
    }
}

/// Accept ids sent either as strings or as numbers.
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_ping() {
        assert_eq!(decode(r#"{"type":"ping"}"#).unwrap(), Message::Ping);
    }

    #[test]
    fn test_decode_unit_variant_ignores_extra_fields() {
        assert_eq!(decode(r#"{"type":"pong","ts":12}"#).unwrap(), Message::Pong);
    }

    #[test]
    fn test_decode_job_update_with_numeric_id() {
        let message = decode(r#"{"type":"job_update","job_id":42,"status":"paused"}"#).unwrap();
        assert_eq!(
            message,
            Message::JobUpdate(JobUpdate {
                job_id: "42".to_string(),
                status: "paused".to_string(),
                next_run_at: None,
            })
        );
    }

    #[test]
    fn test_decode_job_run_update() {
        let frame = json!({
            "type": "job_run_update",
            "job_id": "backup",
            "run_id": 7,
            "status": "failed",
            "output": "disk full\n",
            "exit_code": 1
        })
        .to_string();
        let Message::JobRunUpdate(run) = decode(&frame).unwrap() else {
            panic!("expected job run update");
        };
        assert_eq!(run.run_id, "7");
        assert_eq!(run.exit_code, Some(1));
        assert_eq!(run.output.as_deref(), Some("disk full\n"));
    }

    #[test]
    fn test_decode_daemon_status() {
        let message = decode(r#"{"type":"daemon_status","name":"worker","status":"running","pid":311}"#)
            .unwrap();
        assert_eq!(message.kind(), Some("daemon_status"));
        let Message::DaemonStatus(status) = message else {
            panic!("expected daemon status");
        };
        assert_eq!(status.pid, Some(311));
    }

    #[test]
    fn test_decode_error_notice() {
        assert_eq!(
            decode(r#"{"type":"error","message":"nope"}"#).unwrap(),
            Message::Error {
                message: "nope".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_type_is_kept() {
        let message = decode(r#"{"type":"log_line","line":"hi"}"#).unwrap();
        assert_eq!(message.kind(), Some("log_line"));
        assert_eq!(message, Message::Unknown(json!({"type":"log_line","line":"hi"})));
    }

    #[test]
    fn test_missing_type_is_unknown() {
        let message = decode(r#"{"hello":"world"}"#).unwrap();
        assert_eq!(message.kind(), None);
        assert!(matches!(message, Message::Unknown(_)));
    }

    #[test]
    fn test_known_type_with_wrong_shape_is_unknown() {
        let message = decode(r#"{"type":"job_update","status":5}"#).unwrap();
        assert!(matches!(message, Message::Unknown(_)));
        assert_eq!(message.kind(), Some("job_update"));
    }

    #[test]
    fn test_invalid_json_fails() {
        let err = decode("{not json").unwrap_err();
        assert!(matches!(err, DecodeError::InvalidJson(_)));
        assert!(err.to_string().starts_with("Invalid JSON frame"));
    }

    #[test]
    fn test_non_object_fails() {
        assert!(matches!(decode("[1,2]"), Err(DecodeError::NotAnObject)));
        assert!(matches!(decode("\"ping\""), Err(DecodeError::NotAnObject)));
    }
}
