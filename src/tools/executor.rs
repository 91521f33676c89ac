//! Tool-call dispatch.
//!
//! Every failure is converted into a `{success:false, data}` outcome the
//! model can read and recover from; nothing propagates into the AI loop.

use anyhow::{anyhow, Result};
use chrono_tz::Tz;
use log::{error, info, warn};
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::conversation::ConversationStore;
use crate::repo::Repository;
use crate::shared::models::{Bot, Session, Tool, ToolAction};
use crate::transport::{OutgoingPayload, Transport};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub success: bool,
    pub data: String,
}

impl ToolOutcome {
    pub fn ok(data: impl Into<String>) -> Self {
        Self {
            success: true,
            data: data.into(),
        }
    }

    pub fn fail(data: impl Into<String>) -> Self {
        Self {
            success: false,
            data: data.into(),
        }
    }
}

/// Replace every `{{key}}` with the stringified argument value.
pub fn substitute_placeholders(content: &str, arguments: &Value) -> String {
    let pattern = Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("static placeholder regex");
    pattern
        .replace_all(content, |caps: &regex::Captures<'_>| {
            match arguments.get(&caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

pub struct ToolExecutor {
    pub(crate) repo: Arc<dyn Repository>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) store: ConversationStore,
    pub(crate) http: reqwest::Client,
    pub(crate) timezone: Tz,
}

impl ToolExecutor {
    pub fn new(
        repo: Arc<dyn Repository>,
        transport: Arc<dyn Transport>,
        store: ConversationStore,
        timezone: Tz,
    ) -> Self {
        Self {
            repo,
            transport,
            store,
            http: reqwest::Client::new(),
            timezone,
        }
    }

    pub async fn execute(
        &self,
        bot: &Bot,
        session: &Session,
        name: &str,
        arguments: &Value,
    ) -> ToolOutcome {
        match self.try_execute(bot, session, name, arguments).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Tool {} failed for session {}: {}", name, session.id, e);
                ToolOutcome::fail(e.to_string())
            }
        }
    }

    async fn try_execute(
        &self,
        bot: &Bot,
        session: &Session,
        name: &str,
        arguments: &Value,
    ) -> Result<ToolOutcome> {
        // Built-ins dispatch without a DB lookup and shadow DB rows.
        if super::is_builtin(name) {
            return self.run_builtin(bot, session, name, arguments).await;
        }

        let Some(tool) = self.repo.find_active_tool(bot.id, name).await? else {
            return Ok(ToolOutcome::fail("tool not found or disabled"));
        };

        match ToolAction::parse(&tool.action_type) {
            Some(ToolAction::Flow) => self.run_flow(bot, session, &tool, arguments).await,
            Some(ToolAction::Webhook) => self.run_webhook(session, &tool, arguments).await,
            Some(ToolAction::Builtin) => {
                let target = tool
                    .action_config
                    .get("tool")
                    .and_then(Value::as_str)
                    .unwrap_or(&tool.name)
                    .to_string();
                self.run_builtin(bot, session, &target, arguments).await
            }
            None => Ok(ToolOutcome::fail(format!(
                "unknown action type: {}",
                tool.action_type
            ))),
        }
    }

    async fn run_flow(
        &self,
        bot: &Bot,
        session: &Session,
        tool: &Tool,
        arguments: &Value,
    ) -> Result<ToolOutcome> {
        let flow_id = tool
            .flow_id
            .or_else(|| {
                tool.action_config
                    .get("flowId")
                    .or_else(|| tool.action_config.get("flow_id"))
                    .and_then(Value::as_str)
                    .and_then(|raw| Uuid::parse_str(raw).ok())
            })
            .ok_or_else(|| anyhow!("tool {} has no flow configured", tool.name))?;

        let Some(flow) = self.repo.flow(flow_id).await? else {
            return Ok(ToolOutcome::fail("flow not found"));
        };
        let steps = self.repo.flow_steps(flow_id).await?;

        info!(
            "Running flow '{}' ({} steps) for session {}",
            flow.name,
            steps.len(),
            session.id
        );

        let mut sent = 0usize;
        for step in &steps {
            let content = step
                .content
                .as_deref()
                .map(|c| substitute_placeholders(c, arguments));

            let payload = match step.step_type.as_str() {
                "TEXT" => content.map(|text| OutgoingPayload::Text { text }),
                "IMAGE" => step.media_url.clone().map(|url| OutgoingPayload::Image {
                    url,
                    caption: content,
                }),
                "AUDIO" => step
                    .media_url
                    .clone()
                    .map(|url| OutgoingPayload::Audio { url, ptt: false }),
                "PTT" => step
                    .media_url
                    .clone()
                    .map(|url| OutgoingPayload::Audio { url, ptt: true }),
                other => {
                    warn!("Step {} has unsupported type {}", step.id, other);
                    None
                }
            };

            if let Some(payload) = payload {
                match self
                    .transport
                    .send_message(bot.id, &session.identifier, payload)
                    .await
                {
                    Ok(()) => sent += 1,
                    // Transport hiccups skip the step, not the flow.
                    Err(e) => warn!("Flow step {} send failed: {}", step.id, e),
                }
            }

            if step.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(step.delay_ms as u64)).await;
            }
        }

        Ok(ToolOutcome::ok(format!(
            "Flow '{}' executed: {} of {} steps sent to the chat.",
            flow.name,
            sent,
            steps.len()
        )))
    }

    async fn run_webhook(
        &self,
        session: &Session,
        tool: &Tool,
        arguments: &Value,
    ) -> Result<ToolOutcome> {
        let config = &tool.action_config;
        let url = config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("webhook tool {} has no url", tool.name))?;
        let method = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST")
            .to_uppercase();

        let mut request = match method.as_str() {
            "GET" => self.http.get(url),
            "PUT" => self.http.put(url),
            "PATCH" => self.http.patch(url),
            "DELETE" => self.http.delete(url),
            _ => self.http.post(url),
        }
        .timeout(WEBHOOK_TIMEOUT)
        .header("Content-Type", "application/json");

        if let Some(headers) = config.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key, value);
                }
            }
        }

        if method != "GET" {
            let mut body = match arguments {
                Value::Object(map) => map.clone(),
                _ => serde_json::Map::new(),
            };
            body.insert("sessionId".to_string(), Value::String(session.id.to_string()));
            body.insert(
                "identifier".to_string(),
                Value::String(session.identifier.clone()),
            );
            request = request.json(&Value::Object(body));
        }

        let response = request.send().await?;
        let success = response.status().is_success();
        let text = response.text().await.unwrap_or_default();
        let data = match serde_json::from_str::<Value>(&text) {
            Ok(parsed) => parsed.to_string(),
            Err(_) => text,
        };

        Ok(ToolOutcome { success, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn placeholders_substitute_stringified_arguments() {
        let args = json!({"nombre": "Ana", "monto": 1500, "listo": true});
        assert_eq!(
            substitute_placeholders("Hola {{nombre}}, debes {{monto}} ({{listo}})", &args),
            "Hola Ana, debes 1500 (true)"
        );
    }

    #[test]
    fn unknown_placeholders_are_left_alone() {
        let args = json!({"nombre": "Ana"});
        assert_eq!(
            substitute_placeholders("Hola {{nombre}} {{apellido}}", &args),
            "Hola Ana {{apellido}}"
        );
    }

    #[test]
    fn placeholders_tolerate_inner_spacing() {
        let args = json!({"folio": "F-22"});
        assert_eq!(
            substitute_placeholders("Folio: {{ folio }}", &args),
            "Folio: F-22"
        );
    }
}
