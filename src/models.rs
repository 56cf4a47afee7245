//! Wire types for the two JSON dialects the gateway translates between.
//!
//! The OpenAI side is typed because we normalize and inspect it; unknown
//! fields are preserved in a flattened passthrough map. The Gemini request
//! side is typed because we build it; Gemini *responses* are handled as
//! `serde_json::Value` in the translator, since only a handful of paths are
//! read out of them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─────────────────────────────────────────────────────────────────────────────
// OpenAI chat completions
// ─────────────────────────────────────────────────────────────────────────────

/// Image URL wrapper for vision content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Content part for multimodal messages (text or image).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

/// Message content - either simple text or multimodal parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Whether the content carries anything worth forwarding.
    pub fn is_effectively_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.trim().is_empty(),
            MessageContent::Parts(parts) => !parts.iter().any(|p| match p {
                ContentPart::Text { text } => !text.trim().is_empty(),
                ContentPart::ImageUrl { image_url } => !image_url.url.is_empty(),
            }),
        }
    }

    /// The plain text, when the content is a simple string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(s) => Some(s),
            MessageContent::Parts(_) => None,
        }
    }
}

/// A message in an OpenAI-format conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// `stop` accepts a single string or a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StopSequences::One(s) => vec![s],
            StopSequences::Many(v) => v,
        }
    }
}

/// OpenAI-format chat completion request.
///
/// Fields we never inspect stay in `extra` and ride along unharmed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Model listings
// ─────────────────────────────────────────────────────────────────────────────

/// Entry in the OpenAI-shaped `/v1/models` listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub object: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    pub owned_by: String,
}

impl Model {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: "model".to_string(),
            created: None,
            owned_by: "google".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<Model>,
}

impl ModelList {
    pub fn new(data: Vec<Model>) -> Self {
        Self {
            object: "list".to_string(),
            data,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Gemini request payload
// ─────────────────────────────────────────────────────────────────────────────

/// A generated or prompted content part.
///
/// The wire format distinguishes variants by which key is present; field
/// name aliases cover both camelCase and snake_case producers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GeminiPart {
    InlineData {
        #[serde(rename = "inlineData", alias = "inline_data")]
        inline_data: InlineData,
    },
    FileData {
        #[serde(rename = "fileData", alias = "file_data")]
        file_data: FileData,
    },
    FunctionCall {
        #[serde(rename = "functionCall", alias = "function_call")]
        function_call: FunctionCall,
    },
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought: Option<bool>,
    },
}

impl GeminiPart {
    pub fn text(text: impl Into<String>) -> Self {
        GeminiPart::Text {
            text: text.into(),
            thought: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineData {
    #[serde(rename = "mimeType", alias = "mime_type")]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileData {
    #[serde(rename = "fileUri", alias = "file_uri")]
    pub file_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiContent {
    pub role: String,
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInstruction {
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "thinkingBudget")]
    pub thinking_budget: i64,
    #[serde(rename = "includeThoughts")]
    pub include_thoughts: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(rename = "topP", skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(rename = "topK", skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
    #[serde(rename = "stopSequences", skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(rename = "frequencyPenalty", skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(rename = "presencePenalty", skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(rename = "candidateCount", skip_serializing_if = "Option::is_none")]
    pub candidate_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(rename = "responseMimeType", skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    #[serde(rename = "thinkingConfig", skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetySetting {
    pub category: String,
    pub threshold: String,
}

/// Inner request of the backend payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiRequest {
    pub contents: Vec<GeminiContent>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<SystemInstruction>,
    #[serde(rename = "generationConfig")]
    pub generation_config: GenerationConfig,
    #[serde(rename = "safetySettings")]
    pub safety_settings: Vec<SafetySetting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
}

/// Full backend payload: the model, an optional project binding, and the
/// request body. The project is filled in by the backend client from the
/// selected credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiPayload {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub request: GeminiRequest,
}

// ─────────────────────────────────────────────────────────────────────────────
// Credential records
// ─────────────────────────────────────────────────────────────────────────────

/// Gateway-managed state attached to a credential record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialState {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub error_codes: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default)]
    pub model_cooldowns: HashMap<String, f64>,
}

impl Default for CredentialState {
    fn default() -> Self {
        Self {
            disabled: false,
            error_codes: Vec::new(),
            last_success: None,
            user_email: None,
            model_cooldowns: HashMap::new(),
        }
    }
}

impl CredentialState {
    /// Drop cooldown entries whose deadline has passed.
    pub fn prune_cooldowns(&mut self, now: f64) {
        self.model_cooldowns.retain(|_, until| *until > now);
    }
}

/// Partial state update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub disabled: Option<bool>,
    pub error_codes: Option<Vec<i64>>,
    pub last_success: Option<f64>,
    pub user_email: Option<Option<String>>,
    pub model_cooldowns: Option<HashMap<String, f64>>,
}

/// An enabled credential as returned to the pool for selection.
#[derive(Debug, Clone)]
pub struct EnabledCredential {
    pub filename: String,
    pub credential_data: Value,
    pub model_cooldowns: HashMap<String, f64>,
}

/// One row of the credentials summary listing.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSummary {
    pub filename: String,
    pub disabled: bool,
    pub error_codes: Vec<i64>,
    pub last_success: Option<f64>,
    pub user_email: Option<String>,
    pub rotation_order: i64,
    pub call_count: i64,
    pub model_cooldowns: HashMap<String, f64>,
}

/// Aggregate stats over a credential namespace.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CredentialStats {
    pub total: usize,
    pub normal: usize,
    pub disabled: usize,
}

/// Paged, filtered summary of a credential namespace.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialsSummary {
    pub items: Vec<CredentialSummary>,
    pub total: usize,
    pub offset: usize,
    pub limit: Option<usize>,
    pub stats: CredentialStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_content_accepts_string_and_parts() {
        let m: ChatMessage = serde_json::from_value(serde_json::json!({
            "role": "user",
            "content": "hello"
        }))
        .unwrap();
        assert_eq!(m.content.unwrap().as_text(), Some("hello"));

        let m: ChatMessage = serde_json::from_value(serde_json::json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "look"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
            ]
        }))
        .unwrap();
        match m.content.unwrap() {
            MessageContent::Parts(parts) => assert_eq!(parts.len(), 2),
            MessageContent::Text(_) => panic!("expected parts"),
        }
    }

    #[test]
    fn request_preserves_unknown_fields() {
        let req: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "gemini-2.5-pro",
            "messages": [{"role": "user", "content": "hi"}],
            "logit_bias": {"50256": -100}
        }))
        .unwrap();
        assert!(req.extra.contains_key("logit_bias"));
        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back["logit_bias"]["50256"], -100);
    }

    #[test]
    fn gemini_part_variants_round_trip() {
        let part: GeminiPart =
            serde_json::from_value(serde_json::json!({"text": "thinking...", "thought": true}))
                .unwrap();
        assert!(matches!(
            part,
            GeminiPart::Text {
                thought: Some(true),
                ..
            }
        ));

        let part: GeminiPart = serde_json::from_value(serde_json::json!({
            "inlineData": {"mimeType": "image/png", "data": "AAAA"}
        }))
        .unwrap();
        assert!(matches!(part, GeminiPart::InlineData { .. }));

        let part: GeminiPart = serde_json::from_value(serde_json::json!({
            "functionCall": {"name": "search", "args": {"q": "rust"}}
        }))
        .unwrap();
        match part {
            GeminiPart::FunctionCall { function_call } => {
                assert_eq!(function_call.name, "search");
            }
            _ => panic!("expected function call"),
        }
    }

    #[test]
    fn generation_config_uses_camel_case() {
        let cfg = GenerationConfig {
            top_p: Some(0.9),
            max_output_tokens: Some(100),
            top_k: Some(64),
            ..Default::default()
        };
        let v = serde_json::to_value(&cfg).unwrap();
        assert_eq!(v["topP"], 0.9);
        assert_eq!(v["topK"], 64);
        assert_eq!(v["maxOutputTokens"], 100);
        assert!(v.get("temperature").is_none());
    }
}
