use serde::{Deserialize, Serialize};

/// One inbound frame submission. The `image` field is base64, optionally
/// carrying a `data:image/...;base64,` prefix as sent by browser canvases.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameRequest {
    pub correlation_id: String,
    pub image: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class_label: String,
    pub confidence: f32,
    pub category: String,
    /// `[x, y, width, height]` in pixels of the original image.
    pub bbox: [f32; 4],
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ServerMessage {
    Detections {
        #[serde(rename = "requestId")]
        request_id: String,
        detections: Vec<Detection>,
    },
    Error {
        error: String,
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    pub fn error(error: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            error: error.into(),
            request_id,
        }
    }
}

/// Best-effort recovery of the correlation id from a message that failed
/// to parse as a `FrameRequest`.
pub fn correlation_id_hint(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    value
        .get("correlationId")
        .and_then(|id| id.as_str())
        .map(|id| id.to_string())
}
