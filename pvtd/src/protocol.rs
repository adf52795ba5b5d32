//! Control API: one JSON request line, one JSON response line.

use serde::{Deserialize, Serialize};

/// Default control socket path.
pub const DEFAULT_SOCKET: &str = "/tmp/pvtd.sock";

/// Longest accepted request line.
pub const MAX_REQUEST_LINE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Put { address: String, value: String },
    PutArray { address: String, source: String },
    Get { address: String },
    GetArray { address: String },
    Status,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn value(value: impl Into<String>) -> Self {
        Self {
            ok: true,
            value: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn values(values: Vec<String>) -> Self {
        Self {
            ok: true,
            value: values.last().cloned(),
            values: Some(values),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Daemon state reported by [`Request::Status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub pid: u32,
    pub version: String,
    pub properties: usize,
    pub get_counter: u64,
    pub set_counter: u64,
    pub observations_sent: u64,
    pub rendezvous: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let request = Request::Put {
            address: "A/B/C/D".to_string(),
            value: "10".to_string(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"op":"put","address":"A/B/C/D","value":"10"}"#);

        let parsed: Request =
            serde_json::from_str(r#"{"op":"get_array","address":"A/B/C/D"}"#).unwrap();
        assert_eq!(
            parsed,
            Request::GetArray {
                address: "A/B/C/D".to_string()
            }
        );
    }

    #[test]
    fn test_error_response_omits_values() {
        let json = serde_json::to_string(&Response::error("unknown property")).unwrap();
        assert_eq!(json, r#"{"ok":false,"error":"unknown property"}"#);
    }

    #[test]
    fn test_values_response_carries_last() {
        let response = Response::values(vec!["1".into(), "5".into()]);
        assert_eq!(response.value.as_deref(), Some("5"));
    }
}
