//! OpenAI chat provider.
//!
//! Tool calls travel natively on `/v1/chat/completions`; no thought
//! signatures are involved.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use super::{ChatMessage, ChatProvider, ChatRequest, ChatResponse, ChatRole, ProviderError, ToolCall, Usage};

const CHAT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct OpenAiProvider {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            base_url: "https://api.openai.com".to_string(),
            client: reqwest::Client::builder()
                .timeout(CHAT_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    fn map_message(msg: &ChatMessage) -> Value {
        match msg.role {
            ChatRole::System => json!({
                "role": "system",
                "content": msg.content.clone().unwrap_or_default(),
            }),
            ChatRole::User => json!({
                "role": "user",
                "content": msg.content.clone().unwrap_or_default(),
            }),
            ChatRole::Assistant => {
                let mut out = json!({"role": "assistant"});
                out["content"] = match &msg.content {
                    Some(content) if !content.is_empty() => json!(content),
                    _ => Value::Null,
                };
                if !msg.tool_calls.is_empty() {
                    let calls: Vec<Value> = msg
                        .tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": call.arguments.to_string(),
                                },
                            })
                        })
                        .collect();
                    out["tool_calls"] = json!(calls);
                }
                out
            }
            ChatRole::Tool => json!({
                "role": "tool",
                "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
                "content": msg.content.clone().unwrap_or_default(),
            }),
        }
    }

    fn build_request_body(request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(Self::map_message).collect();
        let mut body = json!({"model": request.model, "messages": messages});
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        },
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        body
    }

    fn parse_response(parsed: &Value) -> ChatResponse {
        let message = &parsed["choices"][0]["message"];
        let content = message
            .get("content")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(|c| c.to_string());

        let tool_calls: Vec<ToolCall> = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .map(|calls| {
                calls
                    .iter()
                    .map(|call| {
                        let arguments = call
                            .pointer("/function/arguments")
                            .and_then(Value::as_str)
                            .and_then(|raw| serde_json::from_str(raw).ok())
                            .unwrap_or_else(|| json!({}));
                        ToolCall::new(
                            call.get("id").and_then(Value::as_str).unwrap_or_default(),
                            call.pointer("/function/name")
                                .and_then(Value::as_str)
                                .unwrap_or_default(),
                            arguments,
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        let usage = parsed.get("usage").map(|u| Usage {
            input_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
            output_tokens: u
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        });

        ChatResponse {
            content,
            tool_calls,
            usage,
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        super::PROVIDER_OPENAI
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = Self::build_request_body(request);
        let url = format!("{}/v1/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(format!("OpenAI API error {}: {}", status, text).into());
        }

        let parsed: Value = response.json().await?;
        Ok(Self::parse_response(&parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_tool_calls_serialize_arguments_as_strings() {
        let call = ToolCall::new("call_0", "reply_to_message", json!({"message_id": "e1"}));
        let request = ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![
                ChatMessage::user("hola"),
                ChatMessage::assistant(None, vec![call]),
                ChatMessage::tool("call_0", "reply_to_message", "sent"),
            ],
            tools: Vec::new(),
            temperature: Some(0.4),
        };

        let body = OpenAiProvider::build_request_body(&request);
        assert_eq!(body["temperature"], json!(0.4f32));
        let messages = body["messages"].as_array().unwrap();
        let args = messages[1]["tool_calls"][0]["function"]["arguments"]
            .as_str()
            .unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(args).unwrap(),
            json!({"message_id": "e1"})
        );
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["tool_call_id"], "call_0");
    }

    #[test]
    fn tools_are_wrapped_as_functions() {
        let request = ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![ChatMessage::user("hola")],
            tools: vec![super::super::ToolDef {
                name: "get_current_time".to_string(),
                description: "Current time".to_string(),
                parameters: json!({"type": "object", "properties": {}}),
            }],
            temperature: None,
        };

        let body = OpenAiProvider::build_request_body(&request);
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "get_current_time");
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn parse_response_handles_tool_calls_and_usage() {
        let parsed = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "get_labels", "arguments": "{\"x\":1}"},
                    }],
                },
            }],
            "usage": {"prompt_tokens": 20, "completion_tokens": 5},
        });

        let response = OpenAiProvider::parse_response(&parsed);
        assert!(response.content.is_none());
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].id, "call_abc");
        assert_eq!(response.tool_calls[0].arguments, json!({"x": 1}));
        assert_eq!(response.usage.unwrap().input_tokens, 20);
    }

    #[test]
    fn parse_response_plain_content() {
        let parsed = json!({
            "choices": [{"message": {"content": "hola!"}}],
        });
        let response = OpenAiProvider::parse_response(&parsed);
        assert_eq!(response.content.as_deref(), Some("hola!"));
        assert!(response.tool_calls.is_empty());
    }
}
