//! Gemini chat provider.
//!
//! Maps the neutral message shape to `generateContent` contents. Tool calls
//! carry an opaque `thoughtSignature` that must be replayed on the next
//! request; historical calls that lost their signature (e.g. after a
//! durable-store reconstruction) are downgraded to plain text so the API
//! keeps accepting the conversation.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, warn};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use super::{ChatMessage, ChatProvider, ChatRequest, ChatResponse, ChatRole, ProviderError, ToolCall, Usage};
use crate::shared::utils::estimate_token_count;

const CHAT_TIMEOUT: Duration = Duration::from_secs(120);
const CACHE_CREATE_TIMEOUT: Duration = Duration::from_secs(15);
const CACHE_TOKEN_THRESHOLD: usize = 4096;
const CACHE_TTL_SECS: i64 = 3600;
const CACHE_MIN_REMAINING_SECS: i64 = 60;

#[derive(Debug, Clone)]
struct CacheEntry {
    name: String,
    expires_at: DateTime<Utc>,
}

pub struct GeminiProvider {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    cache_registry: Mutex<HashMap<(String, String), CacheEntry>>,
}

impl GeminiProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            client: reqwest::Client::builder()
                .timeout(CHAT_TIMEOUT)
                .build()
                .unwrap_or_default(),
            cache_registry: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    fn cache_key(system_prompt: &str, tools_json: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(system_prompt.as_bytes());
        hasher.update(tools_json.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn function_declarations(request: &ChatRequest) -> Vec<Value> {
        request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect()
    }

    /// Create or reuse a named cache entry for the system prompt + tool
    /// definitions. Returns None when the prompt is below the threshold or
    /// the cache service rejected the creation.
    async fn ensure_cached_content(&self, request: &ChatRequest, system_prompt: &str) -> Option<String> {
        let declarations = Self::function_declarations(request);
        let tools_json = serde_json::to_string(&declarations).unwrap_or_default();
        if estimate_token_count(system_prompt) + estimate_token_count(&tools_json)
            <= CACHE_TOKEN_THRESHOLD
        {
            return None;
        }

        let key = (request.model.clone(), Self::cache_key(system_prompt, &tools_json));
        {
            let registry = self.cache_registry.lock().ok()?;
            if let Some(entry) = registry.get(&key) {
                let remaining = entry.expires_at - Utc::now();
                if remaining.num_seconds() >= CACHE_MIN_REMAINING_SECS {
                    debug!("Reusing Gemini cached content {}", entry.name);
                    return Some(entry.name.clone());
                }
            }
        }

        let mut body = json!({
            "model": format!("models/{}", request.model),
            "systemInstruction": {"parts": [{"text": system_prompt}]},
            "ttl": format!("{}s", CACHE_TTL_SECS),
        });
        if !declarations.is_empty() {
            body["tools"] = json!([{"functionDeclarations": declarations}]);
        }

        let url = format!("{}/v1beta/cachedContents?key={}", self.base_url, self.api_key);
        let response = match self
            .client
            .post(&url)
            .timeout(CACHE_CREATE_TIMEOUT)
            .json(&body)
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!("Gemini cache creation rejected: {}", r.status());
                return None;
            }
            Err(e) => {
                warn!("Gemini cache creation failed: {}", e);
                return None;
            }
        };

        let parsed: Value = response.json().await.ok()?;
        let name = parsed.get("name")?.as_str()?.to_string();
        if let Ok(mut registry) = self.cache_registry.lock() {
            registry.insert(
                key,
                CacheEntry {
                    name: name.clone(),
                    expires_at: Utc::now() + ChronoDuration::seconds(CACHE_TTL_SECS),
                },
            );
        }
        debug!("Created Gemini cached content {}", name);
        Some(name)
    }

    /// Build the `generateContent` body. `cached_content` replaces the
    /// inline system instruction and tool definitions when present.
    fn build_request_body(request: &ChatRequest, cached_content: Option<&str>) -> Value {
        let mut contents: Vec<Value> = Vec::new();
        let mut system_instruction: Option<Value> = None;
        // Calls downgraded to text; their paired tool turns collapse too.
        let mut downgraded: HashSet<String> = HashSet::new();

        for msg in &request.messages {
            match msg.role {
                ChatRole::System => {
                    if let Some(content) = &msg.content {
                        system_instruction = Some(json!({"parts": [{"text": content}]}));
                    }
                }
                ChatRole::User => {
                    contents.push(json!({
                        "role": "user",
                        "parts": [{"text": msg.content.clone().unwrap_or_default()}],
                    }));
                }
                ChatRole::Assistant => {
                    let mut parts: Vec<Value> = Vec::new();
                    if let Some(content) = &msg.content {
                        if !content.is_empty() {
                            parts.push(json!({"text": content}));
                        }
                    }
                    for call in &msg.tool_calls {
                        match &call.thought_signature {
                            Some(signature) => parts.push(json!({
                                "functionCall": {"name": call.name, "args": call.arguments},
                                "thoughtSignature": signature,
                            })),
                            None => {
                                // Unsigned historical call: the API would
                                // reject a bare functionCall on replay.
                                downgraded.insert(call.id.clone());
                                parts.push(json!({
                                    "text": format!("[Tool call: {}({})]", call.name, call.arguments),
                                }));
                            }
                        }
                    }
                    if parts.is_empty() {
                        parts.push(json!({"text": ""}));
                    }
                    contents.push(json!({"role": "model", "parts": parts}));
                }
                ChatRole::Tool => {
                    let call_id = msg.tool_call_id.clone().unwrap_or_default();
                    let name = msg.name.clone().unwrap_or_default();
                    let content = msg.content.clone().unwrap_or_default();
                    if downgraded.contains(&call_id) {
                        contents.push(json!({
                            "role": "model",
                            "parts": [{"text": format!("[Previous tool: {} → {}]", name, content)}],
                        }));
                    } else {
                        contents.push(json!({
                            "role": "user",
                            "parts": [{
                                "functionResponse": {
                                    "name": name,
                                    "response": {"content": content},
                                }
                            }],
                        }));
                    }
                }
            }
        }

        let mut body = json!({"contents": contents, "generationConfig": {}});
        if let Some(temp) = request.temperature {
            body["generationConfig"]["temperature"] = json!(temp);
        }

        match cached_content {
            Some(name) => {
                body["cachedContent"] = json!(name);
            }
            None => {
                if let Some(system) = system_instruction {
                    body["systemInstruction"] = system;
                }
                let declarations = Self::function_declarations(request);
                if !declarations.is_empty() {
                    body["tools"] = json!([{"functionDeclarations": declarations}]);
                }
            }
        }

        body
    }

    fn parse_response(parsed: &Value) -> ChatResponse {
        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();

        if let Some(parts) = parsed
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    content.push_str(text);
                }
                if let Some(fc) = part.get("functionCall") {
                    let name = fc
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let args = fc.get("args").cloned().unwrap_or_else(|| json!({}));
                    let mut call =
                        ToolCall::new(format!("call_{}", tool_calls.len()), name, args);
                    call.thought_signature = part
                        .get("thoughtSignature")
                        .and_then(Value::as_str)
                        .map(|s| s.to_string());
                    tool_calls.push(call);
                }
            }
        }

        let usage = parsed.get("usageMetadata").map(|meta| Usage {
            input_tokens: meta
                .get("promptTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            output_tokens: meta
                .get("candidatesTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        });

        ChatResponse {
            content: if content.is_empty() { None } else { Some(content) },
            tool_calls,
            usage,
        }
    }
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    fn name(&self) -> &str {
        super::PROVIDER_GEMINI
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let system_prompt = request
            .messages
            .iter()
            .find(|m| m.role == ChatRole::System)
            .and_then(|m| m.content.clone());

        let cached_content = match &system_prompt {
            Some(prompt) => self.ensure_cached_content(request, prompt).await,
            None => None,
        };

        let body = Self::build_request_body(request, cached_content.as_deref());
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, request.model, self.api_key
        );

        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(format!("Gemini API error {}: {}", status, text).into());
        }

        let parsed: Value = response.json().await?;
        if let Some(error) = parsed.get("error") {
            return Err(format!("Gemini API error: {}", error).into());
        }

        Ok(Self::parse_response(&parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            model: "gemini-2.0-flash".to_string(),
            messages,
            tools: Vec::new(),
            temperature: None,
        }
    }

    #[test]
    fn signed_tool_calls_keep_function_call_parts() {
        let mut call = ToolCall::new("call_0", "assign_label", json!({"label": "VIP"}));
        call.thought_signature = Some("sig-abc".to_string());
        let request = request_with(vec![
            ChatMessage::user("hola"),
            ChatMessage::assistant(None, vec![call]),
            ChatMessage::tool("call_0", "assign_label", "ok"),
        ]);

        let body = GeminiProvider::build_request_body(&request, None);
        let contents = body["contents"].as_array().unwrap();

        assert_eq!(contents[1]["role"], "model");
        assert_eq!(
            contents[1]["parts"][0]["functionCall"]["name"],
            "assign_label"
        );
        assert_eq!(contents[1]["parts"][0]["thoughtSignature"], "sig-abc");
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"]["name"],
            "assign_label"
        );
    }

    #[test]
    fn unsigned_tool_calls_are_downgraded_with_their_tool_turn() {
        let call = ToolCall::new("call_0", "get_labels", json!({}));
        let request = request_with(vec![
            ChatMessage::user("hola"),
            ChatMessage::assistant(None, vec![call]),
            ChatMessage::tool("call_0", "get_labels", "VIP, FOLLOWUP"),
            ChatMessage::user("gracias"),
        ]);

        let body = GeminiProvider::build_request_body(&request, None);
        let contents = body["contents"].as_array().unwrap();

        let assistant_text = contents[1]["parts"][0]["text"].as_str().unwrap();
        assert!(assistant_text.starts_with("[Tool call: get_labels"));
        assert!(contents[1]["parts"][0].get("functionCall").is_none());

        assert_eq!(contents[2]["role"], "model");
        let tool_text = contents[2]["parts"][0]["text"].as_str().unwrap();
        assert_eq!(tool_text, "[Previous tool: get_labels → VIP, FOLLOWUP]");
    }

    #[test]
    fn cached_content_replaces_system_and_tools() {
        let mut request = request_with(vec![
            ChatMessage::system("eres un asistente"),
            ChatMessage::user("hola"),
        ]);
        request.tools.push(super::super::ToolDef {
            name: "get_labels".to_string(),
            description: "List labels".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        });

        let body = GeminiProvider::build_request_body(&request, Some("cachedContents/x1"));
        assert_eq!(body["cachedContent"], "cachedContents/x1");
        assert!(body.get("systemInstruction").is_none());
        assert!(body.get("tools").is_none());

        let inline = GeminiProvider::build_request_body(&request, None);
        assert!(inline.get("systemInstruction").is_some());
        assert!(inline.get("tools").is_some());
    }

    #[test]
    fn parse_response_extracts_text_calls_and_usage() {
        let parsed = json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "claro, "},
                    {"text": "ya lo reviso"},
                    {"functionCall": {"name": "get_labels", "args": {}}, "thoughtSignature": "sig-1"},
                ]},
                "finishReason": "STOP",
            }],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 7},
        });

        let response = GeminiProvider::parse_response(&parsed);
        assert_eq!(response.content.as_deref(), Some("claro, ya lo reviso"));
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].id, "call_0");
        assert_eq!(
            response.tool_calls[0].thought_signature.as_deref(),
            Some("sig-1")
        );
        assert_eq!(response.usage.unwrap().total_tokens(), 19);
    }

    #[test]
    fn cache_key_is_stable_and_input_sensitive() {
        let a = GeminiProvider::cache_key("prompt", "[]");
        let b = GeminiProvider::cache_key("prompt", "[]");
        let c = GeminiProvider::cache_key("prompt2", "[]");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
