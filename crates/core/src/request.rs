//! Provider-agnostic LLM request/response contract.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Free-form correlation data.
///
/// Slices put whatever they need here to re-identify a domain record when
/// results come back as a flat list; clients echo it onto the response.
pub type Metadata = serde_json::Map<String, JsonValue>;

/// A single completion request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub user_prompt: String,
    #[serde(default)]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
    /// Optional JSON schema the provider should constrain its output to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: Metadata,
}

impl LlmRequest {
    pub fn new(system_prompt: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Outcome of a single request.
///
/// A response is either successful (`success == true`, `content` set) or a
/// failure record (`success == false`, `error` set, `content` empty).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: Metadata,
}

impl LlmResponse {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Error text for a failed response; empty string when none was recorded.
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_optional_fields_are_omitted() {
        let req = LlmRequest::new("sys", "user");
        let json = serde_json::to_value(&req).unwrap();

        assert!(json.get("metadata").is_none());
        assert!(json.get("stop_sequences").is_none());
        assert!(json.get("response_schema").is_none());
    }

    #[test]
    fn request_tolerates_missing_fields() {
        let req: LlmRequest = serde_json::from_str(r#"{"user_prompt":"hi"}"#).unwrap();
        assert_eq!(req.user_prompt, "hi");
        assert_eq!(req.max_tokens, 0);
        assert!(req.metadata.is_empty());
    }

    #[test]
    fn failure_response_carries_error() {
        let resp = LlmResponse::failure("boom");
        assert!(!resp.success);
        assert!(resp.content.is_empty());
        assert_eq!(resp.error_message(), "boom");
    }

    #[test]
    fn metadata_survives_serialization() {
        let req = LlmRequest::new("", "q").with_metadata("record_id", "NPC_001");
        let json = serde_json::to_string(&req).unwrap();
        let back: LlmRequest = serde_json::from_str(&json).unwrap();

        assert_eq!(back.metadata.get("record_id"), Some(&JsonValue::from("NPC_001")));
    }
}
