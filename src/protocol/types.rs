//! Wire types for the line-delimited JSON protocol (component C1): one
//! object per line on stdin, one object per line on stdout, field names
//! matched exactly to what the protocol expects.

use serde::{Deserialize, Serialize};

pub const KNOWN_COMMANDS: &[&str] = &["get", "put", "close"];

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "Command")]
    pub command: String,
    #[serde(rename = "ActionID", default)]
    pub action_id: Option<String>,
    #[serde(rename = "OutputID", default)]
    pub output_id: Option<String>,
    #[serde(rename = "BodySize", default)]
    pub body_size: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Response {
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "Err", skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(rename = "KnownCommands", skip_serializing_if = "Option::is_none")]
    pub known_commands: Option<Vec<String>>,
    #[serde(rename = "Miss", skip_serializing_if = "Option::is_none")]
    pub miss: Option<bool>,
    #[serde(rename = "OutputID", skip_serializing_if = "Option::is_none")]
    pub output_id: Option<String>,
    #[serde(rename = "Size", skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(rename = "TimeNanos", skip_serializing_if = "Option::is_none")]
    pub time_nanos: Option<i64>,
    #[serde(rename = "DiskPath", skip_serializing_if = "Option::is_none")]
    pub disk_path: Option<String>,
}

impl Response {
    pub fn handshake() -> Response {
        Response {
            id: 0,
            known_commands: Some(KNOWN_COMMANDS.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Response {
        Response {
            id,
            err: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn miss(id: u64) -> Response {
        Response {
            id,
            miss: Some(true),
            ..Default::default()
        }
    }

    pub fn hit(id: u64, output_id: &str, size: u64, time_nanos: i64, disk_path: String) -> Response {
        Response {
            id,
            output_id: Some(output_id.to_string()),
            size: Some(size as i64),
            time_nanos: Some(time_nanos),
            disk_path: Some(disk_path),
            ..Default::default()
        }
    }

    pub fn put_ack(id: u64) -> Response {
        Response {
            id,
            ..Default::default()
        }
    }

    pub fn close_ack(id: u64) -> Response {
        Response {
            id,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_serializes_known_commands() {
        let json = serde_json::to_string(&Response::handshake()).unwrap();
        assert!(json.contains("\"KnownCommands\":[\"get\",\"put\",\"close\"]"));
        assert!(!json.contains("Miss"));
    }

    #[test]
    fn request_deserializes_minimal_get() {
        let req: Request = serde_json::from_str(r#"{"ID":7,"Command":"get","ActionID":"A"}"#).unwrap();
        assert_eq!(req.id, 7);
        assert_eq!(req.command, "get");
        assert_eq!(req.action_id.as_deref(), Some("A"));
        assert_eq!(req.body_size, 0);
    }
}
