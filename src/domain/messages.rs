//! Wire envelope shared by both directions of the socket.
//!
//! Clients send `{"type": "render", "message": "<html>…</html>"}`; the server
//! answers with `type` set to either `rendered` or `error`. Missing fields
//! decode as empty strings; only malformed JSON is a decode failure.

use serde::{Deserialize, Serialize};

pub const KIND_RENDER: &str = "render";
pub const KIND_RENDERED: &str = "rendered";
pub const KIND_ERROR: &str = "error";

/// URL prefix under which rendered output files are publicly served.
pub const STORAGE_URL_PREFIX: &str = "/storage";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl Envelope {
    pub fn rendered(message: impl Into<String>) -> Self {
        Self {
            kind: KIND_RENDERED.to_string(),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: KIND_ERROR.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_render_request() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"type":"render","message":"<html>hi</html>"}"#)
                .expect("valid payload");
        assert_eq!(envelope.kind, KIND_RENDER);
        assert_eq!(envelope.message, "<html>hi</html>");
    }

    #[test]
    fn missing_fields_decode_as_empty() {
        let envelope: Envelope = serde_json::from_str(r#"{"type":"render"}"#).expect("valid json");
        assert_eq!(envelope.kind, KIND_RENDER);
        assert_eq!(envelope.message, "");

        let envelope: Envelope = serde_json::from_str("{}").expect("valid json");
        assert_eq!(envelope.kind, "");
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        assert!(serde_json::from_str::<Envelope>("not json").is_err());
    }

    #[test]
    fn replies_serialize_with_type_field() {
        let json = serde_json::to_string(&Envelope::error("boom")).expect("serializable");
        assert_eq!(json, r#"{"type":"error","message":"boom"}"#);
    }
}
