//! Bidirectional translation between the OpenAI and Gemini wire formats.
//!
//! Request translation consumes the typed [`ChatCompletionRequest`] and
//! produces a typed [`GeminiPayload`]. Response translation works on
//! `serde_json::Value` — only a few paths are read out of backend responses,
//! and unknown candidate fields must not break a stream. All functions here
//! are pure; they build new values per message and never mutate shared state.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::features::ModelFeatures;
use crate::images::parse_data_uri;
use crate::models::{
    ChatCompletionRequest, ContentPart, GeminiContent, GeminiPart, GeminiPayload, GeminiRequest,
    GenerationConfig, InlineData, MessageContent, SafetySetting, SystemInstruction, ThinkingConfig,
};

/// Hard ceiling on requested output tokens.
pub const MAX_OUTPUT_TOKENS: u64 = 65535;

/// `topK` is pinned for the Code Assist backend.
pub const FORCED_TOP_K: u32 = 64;

/// User part injected when every inbound message was a system message.
const SYSTEM_ONLY_PLACEHOLDER: &str = "请根据系统指令回答。";

// ─────────────────────────────────────────────────────────────────────────────
// Request: OpenAI → Gemini
// ─────────────────────────────────────────────────────────────────────────────

/// Convert an OpenAI chat completion request into the backend payload.
///
/// Leading consecutive `system` messages fold into `systemInstruction`;
/// later ones demote to `user`. With `compatibility_mode` every `system`
/// message becomes `user` and no `systemInstruction` is emitted.
pub fn openai_to_gemini(
    req: &ChatCompletionRequest,
    features: &ModelFeatures,
    compatibility_mode: bool,
    safety_settings: Vec<SafetySetting>,
) -> GeminiPayload {
    let mut contents: Vec<GeminiContent> = Vec::new();
    let mut system_instructions: Vec<String> = Vec::new();
    let mut collecting_system = !compatibility_mode;

    for message in &req.messages {
        let mut role = message.role.as_str();

        if role == "system" {
            if compatibility_mode {
                role = "user";
            } else if collecting_system {
                match &message.content {
                    Some(MessageContent::Text(text)) => system_instructions.push(text.clone()),
                    Some(MessageContent::Parts(parts)) => {
                        for part in parts {
                            if let ContentPart::Text { text } = part {
                                if !text.is_empty() {
                                    system_instructions.push(text.clone());
                                }
                            }
                        }
                    }
                    None => {}
                }
                continue;
            } else {
                role = "user";
            }
        } else {
            collecting_system = false;
        }

        let role = if role == "assistant" { "model" } else { role };

        let parts = match &message.content {
            Some(MessageContent::Text(text)) if !text.is_empty() => {
                vec![GeminiPart::text(text.clone())]
            }
            Some(MessageContent::Parts(message_parts)) => {
                convert_content_parts(message_parts)
            }
            _ => Vec::new(),
        };
        if parts.is_empty() {
            continue;
        }
        contents.push(GeminiContent {
            role: role.to_string(),
            parts,
        });
    }

    // The backend rejects empty contents, which happens when the request was
    // all system messages.
    if contents.is_empty() {
        contents.push(GeminiContent {
            role: "user".to_string(),
            parts: vec![GeminiPart::text(SYSTEM_ONLY_PLACEHOLDER)],
        });
    }

    let system_instruction = if !system_instructions.is_empty() && !compatibility_mode {
        Some(SystemInstruction {
            parts: vec![GeminiPart::text(system_instructions.join("\n\n"))],
        })
    } else {
        None
    };

    let generation_config = build_generation_config(req, features);

    let tools = if features.search {
        Some(vec![json!({ "googleSearch": {} })])
    } else {
        None
    };

    GeminiPayload {
        model: features.base_model.clone(),
        project: None,
        request: GeminiRequest {
            contents,
            system_instruction,
            generation_config,
            safety_settings,
            tools,
        },
    }
}

fn convert_content_parts(parts: &[ContentPart]) -> Vec<GeminiPart> {
    let mut out = Vec::new();
    for part in parts {
        match part {
            ContentPart::Text { text } => out.push(GeminiPart::text(text.clone())),
            ContentPart::ImageUrl { image_url } => {
                // Only base64 data URIs can be forwarded inline; malformed
                // ones are dropped rather than failing the request.
                if let Some((mime, b64)) = parse_data_uri(&image_url.url) {
                    out.push(GeminiPart::InlineData {
                        inline_data: InlineData {
                            mime_type: mime,
                            data: b64,
                        },
                    });
                }
            }
        }
    }
    out
}

fn build_generation_config(
    req: &ChatCompletionRequest,
    features: &ModelFeatures,
) -> GenerationConfig {
    let mut config = GenerationConfig {
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: Some(FORCED_TOP_K),
        max_output_tokens: req.max_tokens.map(|t| t.min(MAX_OUTPUT_TOKENS)),
        stop_sequences: req.stop.clone().map(|s| s.into_vec()),
        frequency_penalty: req.frequency_penalty,
        presence_penalty: req.presence_penalty,
        candidate_count: req.n,
        seed: req.seed,
        response_mime_type: None,
        thinking_config: None,
    };

    if let Some(format) = &req.response_format {
        if format.get("type").and_then(|v| v.as_str()) == Some("json_object") {
            config.response_mime_type = Some("application/json".to_string());
        }
    }

    if let Some(budget) = features.thinking_budget {
        config.thinking_config = Some(ThinkingConfig {
            thinking_budget: budget,
            include_thoughts: features.include_thoughts,
        });
    }

    config
}

// ─────────────────────────────────────────────────────────────────────────────
// Response: Gemini → OpenAI
// ─────────────────────────────────────────────────────────────────────────────

/// Some backend frames nest the payload under `"response"`.
pub fn unwrap_response_envelope(value: &Value) -> &Value {
    value.get("response").unwrap_or(value)
}

/// Split candidate parts into visible content and reasoning content,
/// ignoring non-text parts.
pub fn extract_content_and_reasoning(parts: &[Value]) -> (String, String) {
    let mut content = String::new();
    let mut reasoning = String::new();
    for part in parts {
        if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
            if part.get("thought").and_then(|v| v.as_bool()).unwrap_or(false) {
                reasoning.push_str(text);
            } else {
                content.push_str(text);
            }
        }
    }
    (content, reasoning)
}

/// Markdown for the first inline or file image among the parts, or empty.
pub fn extract_first_image_markdown(parts: &[Value]) -> String {
    for part in parts {
        let inline = part.get("inlineData").or_else(|| part.get("inline_data"));
        if let Some(inline) = inline.and_then(|v| v.as_object()) {
            if let Some(b64) = inline.get("data").and_then(|v| v.as_str()) {
                let mime = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("image/png");
                return format!("\n\n![image](data:{mime};base64,{b64})");
            }
        }
        let file = part.get("fileData").or_else(|| part.get("file_data"));
        if let Some(file) = file.and_then(|v| v.as_object()) {
            if let Some(uri) = file
                .get("fileUri")
                .or_else(|| file.get("file_uri"))
                .and_then(|v| v.as_str())
            {
                return format!("\n\n![image]({uri})");
            }
        }
    }
    String::new()
}

/// Map a Gemini finish reason onto the OpenAI vocabulary.
pub fn map_finish_reason(gemini_reason: Option<&str>) -> Option<&'static str> {
    match gemini_reason? {
        "STOP" => Some("stop"),
        "MAX_TOKENS" => Some("length"),
        "SAFETY" | "RECITATION" => Some("content_filter"),
        _ => None,
    }
}

/// Collect `functionCall` parts as OpenAI tool-call entries.
pub fn extract_tool_calls(parts: &[Value]) -> Vec<Value> {
    let mut calls = Vec::new();
    for part in parts {
        let fc = part
            .get("functionCall")
            .or_else(|| part.get("function_call"));
        let Some(fc) = fc.and_then(|v| v.as_object()) else {
            continue;
        };
        let Some(name) = fc.get("name").and_then(|v| v.as_str()) else {
            continue;
        };
        let args = fc
            .get("args")
            .or_else(|| fc.get("arguments"))
            .cloned()
            .unwrap_or_else(|| json!({}));
        let args_str = serde_json::to_string(&args).unwrap_or_else(|_| "{}".to_string());
        calls.push(json!({
            "id": tool_call_id(),
            "type": "function",
            "function": { "name": name, "arguments": args_str }
        }));
    }
    calls
}

fn tool_call_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("call_{}", &id[..8])
}

fn candidate_parts(candidate: &Value) -> Vec<Value> {
    candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default()
}

fn candidate_role(candidate: &Value) -> &str {
    let role = candidate
        .get("content")
        .and_then(|c| c.get("role"))
        .and_then(|v| v.as_str())
        .unwrap_or("assistant");
    if role == "model" {
        "assistant"
    } else {
        role
    }
}

/// Convert a unary Gemini response into an OpenAI chat completion.
pub fn gemini_response_to_openai(gemini_response: &Value, model: &str) -> Value {
    let response = unwrap_response_envelope(gemini_response);
    let mut choices = Vec::new();

    for (i, candidate) in response
        .get("candidates")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .enumerate()
    {
        let parts = candidate_parts(candidate);
        let (mut content, reasoning) = extract_content_and_reasoning(&parts);
        content.push_str(&extract_first_image_markdown(&parts));

        let mut message = json!({
            "role": candidate_role(candidate),
            "content": content,
        });
        if !reasoning.is_empty() {
            message["reasoning_content"] = json!(reasoning);
        }
        let tool_calls = extract_tool_calls(&parts);
        if !tool_calls.is_empty() {
            message["tool_calls"] = Value::Array(tool_calls);
        }

        let index = candidate
            .get("index")
            .and_then(|v| v.as_u64())
            .unwrap_or(i as u64);
        choices.push(json!({
            "index": index,
            "message": message,
            "finish_reason": map_finish_reason(
                candidate.get("finishReason").and_then(|v| v.as_str()),
            ),
        }));
    }

    json!({
        "id": Uuid::new_v4().to_string(),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": choices,
    })
}

/// Convert one Gemini stream frame into an OpenAI chunk.
///
/// Also returns the raw Gemini finish reason, which the anti-truncation
/// pipeline matches against its configured trigger set.
pub fn gemini_chunk_to_openai(
    gemini_chunk: &Value,
    model: &str,
    response_id: &str,
) -> (Value, Option<String>) {
    let chunk = unwrap_response_envelope(gemini_chunk);
    let mut choices = Vec::new();
    let mut gemini_finish = None;

    for (i, candidate) in chunk
        .get("candidates")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .enumerate()
    {
        let parts = candidate_parts(candidate);
        let (mut content, reasoning) = extract_content_and_reasoning(&parts);
        content.push_str(&extract_first_image_markdown(&parts));

        let mut delta = json!({});
        if !content.is_empty() {
            delta["content"] = json!(content);
        }
        if !reasoning.is_empty() {
            delta["reasoning_content"] = json!(reasoning);
        }
        let tool_calls = extract_tool_calls(&parts);
        if !tool_calls.is_empty() {
            delta["tool_calls"] = Value::Array(tool_calls);
        }

        let finish = candidate.get("finishReason").and_then(|v| v.as_str());
        if let Some(f) = finish {
            gemini_finish = Some(f.to_string());
        }

        let index = candidate
            .get("index")
            .and_then(|v| v.as_u64())
            .unwrap_or(i as u64);
        choices.push(json!({
            "index": index,
            "delta": delta,
            "finish_reason": map_finish_reason(finish),
        }));
    }

    let chunk = json!({
        "id": response_id,
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": choices,
    });
    (chunk, gemini_finish)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features;
    use crate::models::ChatMessage;

    fn request_with_messages(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        serde_json::from_value(json!({
            "model": "gemini-2.5-pro",
            "messages": serde_json::to_value(messages).unwrap(),
        }))
        .unwrap()
    }

    fn msg(role: &str, content: &str) -> ChatMessage {
        serde_json::from_value(json!({ "role": role, "content": content })).unwrap()
    }

    #[test]
    fn leading_system_messages_fold_into_system_instruction() {
        let req = request_with_messages(vec![
            msg("system", "S1"),
            msg("system", "S2"),
            msg("user", "U"),
        ]);
        let features = features::decode("gemini-2.5-pro");
        let payload = openai_to_gemini(&req, &features, false, Vec::new());

        let si = payload.request.system_instruction.expect("systemInstruction");
        match &si.parts[0] {
            GeminiPart::Text { text, .. } => assert_eq!(text, "S1\n\nS2"),
            _ => panic!("expected text part"),
        }
        assert_eq!(payload.request.contents.len(), 1);
        assert_eq!(payload.request.contents[0].role, "user");
    }

    #[test]
    fn compatibility_mode_demotes_all_system_messages() {
        let req = request_with_messages(vec![
            msg("system", "S1"),
            msg("system", "S2"),
            msg("user", "U"),
        ]);
        let features = features::decode("gemini-2.5-pro");
        let payload = openai_to_gemini(&req, &features, true, Vec::new());

        assert!(payload.request.system_instruction.is_none());
        assert_eq!(payload.request.contents.len(), 3);
        assert!(payload.request.contents.iter().all(|c| c.role == "user"));
    }

    #[test]
    fn trailing_system_message_becomes_user() {
        let req = request_with_messages(vec![
            msg("user", "U"),
            msg("system", "late instructions"),
        ]);
        let features = features::decode("gemini-2.5-pro");
        let payload = openai_to_gemini(&req, &features, false, Vec::new());

        assert!(payload.request.system_instruction.is_none());
        assert_eq!(payload.request.contents.len(), 2);
        assert_eq!(payload.request.contents[1].role, "user");
    }

    #[test]
    fn assistant_maps_to_model_role() {
        let req = request_with_messages(vec![msg("user", "hi"), msg("assistant", "hello")]);
        let features = features::decode("gemini-2.5-pro");
        let payload = openai_to_gemini(&req, &features, false, Vec::new());
        assert_eq!(payload.request.contents[1].role, "model");
    }

    #[test]
    fn system_only_request_gets_placeholder_user_part() {
        let req = request_with_messages(vec![msg("system", "S")]);
        let features = features::decode("gemini-2.5-pro");
        let payload = openai_to_gemini(&req, &features, false, Vec::new());

        assert_eq!(payload.request.contents.len(), 1);
        assert_eq!(payload.request.contents[0].role, "user");
        match &payload.request.contents[0].parts[0] {
            GeminiPart::Text { text, .. } => assert_eq!(text, SYSTEM_ONLY_PLACEHOLDER),
            _ => panic!("expected text part"),
        }
    }

    #[test]
    fn data_uri_image_becomes_inline_data() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gemini-2.5-pro",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,AAAA"}},
                    {"type": "image_url", "image_url": {"url": "https://not.a/data/uri.png"}}
                ]
            }]
        }))
        .unwrap();
        let features = features::decode("gemini-2.5-pro");
        let payload = openai_to_gemini(&req, &features, false, Vec::new());

        let parts = &payload.request.contents[0].parts;
        assert_eq!(parts.len(), 2, "malformed image URI should be dropped");
        match &parts[1] {
            GeminiPart::InlineData { inline_data } => {
                assert_eq!(inline_data.mime_type, "image/jpeg");
                assert_eq!(inline_data.data, "AAAA");
            }
            _ => panic!("expected inline data"),
        }
    }

    #[test]
    fn generation_parameters_map_and_clamp() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gemini-2.5-pro",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.7,
            "top_p": 0.9,
            "max_tokens": 1_000_000,
            "stop": "END",
            "frequency_penalty": 0.1,
            "presence_penalty": -0.2,
            "n": 2,
            "seed": 42,
            "response_format": {"type": "json_object"}
        }))
        .unwrap();
        let features = features::decode("gemini-2.5-pro-thinking-1024");
        let payload = openai_to_gemini(&req, &features, false, Vec::new());

        let cfg = &payload.request.generation_config;
        assert_eq!(cfg.temperature, Some(0.7));
        assert_eq!(cfg.top_p, Some(0.9));
        assert_eq!(cfg.top_k, Some(FORCED_TOP_K));
        assert_eq!(cfg.max_output_tokens, Some(MAX_OUTPUT_TOKENS));
        assert_eq!(cfg.stop_sequences.as_deref(), Some(&["END".to_string()][..]));
        assert_eq!(cfg.candidate_count, Some(2));
        assert_eq!(cfg.seed, Some(42));
        assert_eq!(cfg.response_mime_type.as_deref(), Some("application/json"));
        let thinking = cfg.thinking_config.as_ref().unwrap();
        assert_eq!(thinking.thinking_budget, 1024);
        assert!(thinking.include_thoughts);
    }

    #[test]
    fn search_feature_adds_google_search_tool() {
        let req = request_with_messages(vec![msg("user", "hi")]);
        let features = features::decode("gemini-2.5-pro-search");
        let payload = openai_to_gemini(&req, &features, false, Vec::new());
        let tools = payload.request.tools.unwrap();
        assert!(tools[0].get("googleSearch").is_some());
    }

    #[test]
    fn finish_reasons_map_per_table() {
        assert_eq!(map_finish_reason(Some("STOP")), Some("stop"));
        assert_eq!(map_finish_reason(Some("MAX_TOKENS")), Some("length"));
        assert_eq!(map_finish_reason(Some("SAFETY")), Some("content_filter"));
        assert_eq!(map_finish_reason(Some("RECITATION")), Some("content_filter"));
        assert_eq!(map_finish_reason(Some("OTHER")), None);
        assert_eq!(map_finish_reason(None), None);
    }

    #[test]
    fn unary_response_splits_reasoning_and_content() {
        let resp = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "let me think", "thought": true},
                        {"text": "Hello!"}
                    ]
                },
                "finishReason": "STOP",
                "index": 0
            }]
        });
        let out = gemini_response_to_openai(&resp, "gemini-2.5-pro");
        let message = &out["choices"][0]["message"];
        assert_eq!(message["role"], "assistant");
        assert_eq!(message["content"], "Hello!");
        assert_eq!(message["reasoning_content"], "let me think");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn role_survives_a_round_trip() {
        let req = request_with_messages(vec![msg("assistant", "earlier reply")]);
        let features = features::decode("gemini-2.5-pro");
        let payload = openai_to_gemini(&req, &features, false, Vec::new());
        assert_eq!(payload.request.contents[0].role, "model");

        let resp = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "next"}]},
                "finishReason": "STOP"
            }]
        });
        let out = gemini_response_to_openai(&resp, "gemini-2.5-pro");
        assert_eq!(out["choices"][0]["message"]["role"], "assistant");
    }

    #[test]
    fn function_calls_become_tool_calls() {
        let resp = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"functionCall": {"name": "get_weather", "args": {"city": "Tokyo"}}}
                    ]
                },
                "finishReason": "STOP"
            }]
        });
        let out = gemini_response_to_openai(&resp, "gemini-2.5-pro");
        let calls = out["choices"][0]["message"]["tool_calls"].as_array().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["type"], "function");
        assert_eq!(calls[0]["function"]["name"], "get_weather");
        let args: Value =
            serde_json::from_str(calls[0]["function"]["arguments"].as_str().unwrap()).unwrap();
        assert_eq!(args["city"], "Tokyo");
        assert!(calls[0]["id"].as_str().unwrap().starts_with("call_"));
    }

    #[test]
    fn inline_image_appends_markdown_once() {
        let parts = vec![
            json!({"text": "here you go"}),
            json!({"inlineData": {"mimeType": "image/png", "data": "AAAA"}}),
            json!({"inlineData": {"mimeType": "image/png", "data": "BBBB"}}),
        ];
        let md = extract_first_image_markdown(&parts);
        assert_eq!(md, "\n\n![image](data:image/png;base64,AAAA)");
    }

    #[test]
    fn file_data_appends_uri_markdown() {
        let parts = vec![json!({"fileData": {"fileUri": "https://files/x.png"}})];
        assert_eq!(
            extract_first_image_markdown(&parts),
            "\n\n![image](https://files/x.png)"
        );
    }

    #[test]
    fn stream_chunk_carries_delta_and_finish() {
        let frame = json!({
            "response": {
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "Hel"}]},
                    "finishReason": "MAX_TOKENS"
                }]
            }
        });
        let (chunk, finish) = gemini_chunk_to_openai(&frame, "gemini-2.5-pro", "resp-1");
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert_eq!(chunk["id"], "resp-1");
        assert_eq!(chunk["choices"][0]["delta"]["content"], "Hel");
        assert_eq!(chunk["choices"][0]["finish_reason"], "length");
        assert_eq!(finish.as_deref(), Some("MAX_TOKENS"));
    }
}
