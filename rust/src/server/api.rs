use serde::Serialize;
use serde_json::Value;

use super::error::ApiError;
use crate::bridge::PoolStats;
use crate::model::ChatMessage;

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize, Debug)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Serialize, Debug)]
pub struct InferenceResponse {
    pub data: String,
}

#[derive(Serialize, Debug)]
pub struct HealthCheck {
    pub status: &'static str,
    pub timestamp: String,
    pub version: &'static str,
    pub workers: PoolStats,
}

#[derive(Debug)]
pub struct TextGenRequest {
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    /// The whole body; sampling overrides are read from it leniently.
    pub payload: Value,
}

/// Validates the request shape. Nothing is dispatched for a rejected body.
pub fn parse_request(body: &[u8]) -> Result<TextGenRequest, ApiError> {
    let payload: Value =
        serde_json::from_slice(body).map_err(|_| ApiError::InvalidJson)?;
    let messages = payload
        .get("messages")
        .filter(|m| m.as_array().map_or(false, |a| !a.is_empty()))
        .ok_or(ApiError::InvalidMessages)?;
    let messages: Vec<ChatMessage> = serde_json::from_value(messages.clone())
        .map_err(|_| ApiError::InvalidMessages)?;
    let stream = payload.get("stream").and_then(Value::as_bool).unwrap_or(false);
    Ok(TextGenRequest { messages, stream, payload })
}

/// One server-sent event carrying a JSON-encoded fragment.
pub fn sse_frame(fragment: &str) -> String {
    format!("data: {}\n\n", Value::String(fragment.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_messages_with_overrides() {
        let body = br#"{"messages":[{"role":"user","content":"Hi"}],"temperature":0.2,"stream":true}"#;
        let req = parse_request(body).unwrap();
        assert_eq!(req.messages, vec![ChatMessage::new("user", "Hi")]);
        assert!(req.stream);
        assert_eq!(req.payload["temperature"], 0.2);
    }

    #[test]
    fn non_boolean_stream_means_unary() {
        let body = br#"{"messages":[{"role":"user","content":"Hi"}],"stream":"yes"}"#;
        assert!(!parse_request(body).unwrap().stream);
    }

    #[test]
    fn rejects_bad_bodies() {
        let cases: [&[u8]; 8] = [
            b"{not json",
            b"",
            br#"{"max_new_tokens": 4}"#,
            br#"{"messages": []}"#,
            br#"{"messages": "Hi"}"#,
            br#"{"messages": [{"role": "user"}]}"#,
            br#"{"messages": [{"content": "Hi"}]}"#,
            br#"[{"role": "user", "content": "Hi"}]"#,
        ];
        for body in cases {
            let err = parse_request(body).unwrap_err();
            assert!(
                matches!(err, ApiError::InvalidJson | ApiError::InvalidMessages),
                "{:?}",
                String::from_utf8_lossy(body)
            );
        }
        assert!(matches!(
            parse_request(b"{not json").unwrap_err(),
            ApiError::InvalidJson
        ));
    }

    #[test]
    fn frames_are_json_encoded() {
        assert_eq!(sse_frame("Hi \"there\"\n"), "data: \"Hi \\\"there\\\"\\n\"\n\n");
    }
}
