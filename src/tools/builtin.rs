//! Built-in tool primitives.
//!
//! Always available to every bot regardless of its tool rows; names in
//! [`super::BUILTIN_TOOL_NAMES`] are reserved.

use anyhow::Result;
use chrono::Utc;
use chrono_tz::Tz;
use log::info;
use serde_json::{json, Value};

use super::executor::{ToolExecutor, ToolOutcome};
use crate::shared::models::{Bot, Label, NewClient, NewMessage, Session};
use crate::shared::utils::{is_valid_curp, is_valid_email, is_valid_phone};
use crate::transport::OutgoingPayload;

fn arg_str<'a>(arguments: &'a Value, key: &str) -> Option<&'a str> {
    arguments.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

impl ToolExecutor {
    pub(crate) async fn run_builtin(
        &self,
        bot: &Bot,
        session: &Session,
        name: &str,
        arguments: &Value,
    ) -> Result<ToolOutcome> {
        match name {
            "get_current_time" => self.get_current_time(arguments),
            "clear_conversation" => self.clear_conversation(session).await,
            "get_labels" => self.get_labels(bot).await,
            "assign_label" => self.assign_label(bot, session, arguments).await,
            "remove_label" => self.remove_label(bot, session, arguments).await,
            "get_sessions_by_label" => self.get_sessions_by_label(bot, arguments).await,
            "reply_to_message" => self.reply_to_message(bot, session, arguments).await,
            "send_followup_message" => self.send_followup(bot, session, arguments).await,
            "lookup_client" => self.lookup_client(bot, arguments).await,
            "register_client" => self.register_client(bot, arguments).await,
            "save_credentials" => self.save_credentials(bot, arguments).await,
            other => Ok(ToolOutcome::fail(format!("unknown built-in tool: {}", other))),
        }
    }

    fn get_current_time(&self, arguments: &Value) -> Result<ToolOutcome> {
        let tz: Tz = match arg_str(arguments, "timezone") {
            Some(name) => match name.parse() {
                Ok(tz) => tz,
                Err(_) => return Ok(ToolOutcome::fail(format!("unknown timezone: {}", name))),
            },
            None => self.timezone,
        };
        let now = Utc::now().with_timezone(&tz);
        Ok(ToolOutcome::ok(format!(
            "{} ({})",
            now.format("%d/%m/%Y %H:%M:%S %A"),
            tz.name()
        )))
    }

    async fn clear_conversation(&self, session: &Session) -> Result<ToolOutcome> {
        self.store.clear(session.id).await?;
        info!("Conversation cleared for session {}", session.id);
        Ok(ToolOutcome::ok("Conversation history cleared."))
    }

    async fn find_label(&self, bot: &Bot, name: &str) -> Result<Option<Label>> {
        let labels = self.repo.labels_for_bot(bot.id).await?;
        Ok(labels
            .into_iter()
            .find(|l| l.name.eq_ignore_ascii_case(name)))
    }

    async fn get_labels(&self, bot: &Bot) -> Result<ToolOutcome> {
        let labels = self.repo.labels_for_bot(bot.id).await?;
        if labels.is_empty() {
            return Ok(ToolOutcome::ok("No labels configured for this bot."));
        }
        let mut entries = Vec::with_capacity(labels.len());
        for label in &labels {
            let count = self.repo.session_label_count(label.id).await.unwrap_or(0);
            entries.push(json!({"name": label.name, "sessions": count}));
        }
        Ok(ToolOutcome::ok(Value::Array(entries).to_string()))
    }

    async fn assign_label(
        &self,
        bot: &Bot,
        session: &Session,
        arguments: &Value,
    ) -> Result<ToolOutcome> {
        let Some(name) = arg_str(arguments, "label") else {
            return Ok(ToolOutcome::fail("missing 'label' argument"));
        };
        let Some(label) = self.find_label(bot, name).await? else {
            return Ok(ToolOutcome::fail(format!("label '{}' not found", name)));
        };
        self.transport
            .add_chat_label(bot.id, &session.identifier, &label.wa_label_id)
            .await?;
        self.repo.add_session_label(session.id, label.id).await?;
        Ok(ToolOutcome::ok(format!(
            "Label '{}' assigned to this chat.",
            label.name
        )))
    }

    async fn remove_label(
        &self,
        bot: &Bot,
        session: &Session,
        arguments: &Value,
    ) -> Result<ToolOutcome> {
        let Some(name) = arg_str(arguments, "label") else {
            return Ok(ToolOutcome::fail("missing 'label' argument"));
        };
        let Some(label) = self.find_label(bot, name).await? else {
            return Ok(ToolOutcome::fail(format!("label '{}' not found", name)));
        };
        self.transport
            .remove_chat_label(bot.id, &session.identifier, &label.wa_label_id)
            .await?;
        self.repo.remove_session_label(session.id, label.id).await?;
        Ok(ToolOutcome::ok(format!(
            "Label '{}' removed from this chat.",
            label.name
        )))
    }

    async fn get_sessions_by_label(&self, bot: &Bot, arguments: &Value) -> Result<ToolOutcome> {
        let Some(name) = arg_str(arguments, "label") else {
            return Ok(ToolOutcome::fail("missing 'label' argument"));
        };
        let limit = arguments
            .get("message_limit")
            .and_then(Value::as_i64)
            .unwrap_or(5)
            .clamp(1, 20);
        let Some(label) = self.find_label(bot, name).await? else {
            return Ok(ToolOutcome::fail(format!("label '{}' not found", name)));
        };

        let sessions = self.repo.sessions_with_label(bot.id, label.id).await?;
        let mut entries = Vec::with_capacity(sessions.len());
        for session in &sessions {
            let messages = self.repo.recent_messages(session.id, limit).await?;
            let lines: Vec<Value> = messages
                .iter()
                .map(|m| {
                    json!({
                        "from_me": m.from_me,
                        "content": m.content,
                        "at": m.created_at.to_rfc3339(),
                    })
                })
                .collect();
            entries.push(json!({
                "identifier": session.identifier,
                "name": session.name,
                "messages": lines,
            }));
        }
        Ok(ToolOutcome::ok(Value::Array(entries).to_string()))
    }

    async fn reply_to_message(
        &self,
        bot: &Bot,
        session: &Session,
        arguments: &Value,
    ) -> Result<ToolOutcome> {
        let Some(message_id) = arg_str(arguments, "message_id") else {
            return Ok(ToolOutcome::fail("missing 'message_id' argument"));
        };
        let Some(text) = arg_str(arguments, "text") else {
            return Ok(ToolOutcome::fail("missing 'text' argument"));
        };

        // The quoted message must belong to this bot.
        let Some(quoted) = self.repo.message_by_external_id(bot.id, message_id).await? else {
            return Ok(ToolOutcome::fail(format!(
                "message '{}' not found for this bot",
                message_id
            )));
        };

        self.transport
            .send_message(
                bot.id,
                &session.identifier,
                OutgoingPayload::Quote {
                    text: text.to_string(),
                    stanza_id: message_id.to_string(),
                    participant: quoted.sender.clone(),
                    quoted_text: quoted.content.clone(),
                },
            )
            .await?;

        Ok(ToolOutcome::ok(format!(
            "Reply sent quoting message {}.",
            message_id
        )))
    }

    async fn send_followup(
        &self,
        bot: &Bot,
        session: &Session,
        arguments: &Value,
    ) -> Result<ToolOutcome> {
        let Some(identifier) = arg_str(arguments, "identifier") else {
            return Ok(ToolOutcome::fail("missing 'identifier' argument"));
        };
        let Some(message) = arg_str(arguments, "message") else {
            return Ok(ToolOutcome::fail("missing 'message' argument"));
        };
        if identifier == session.identifier {
            return Ok(ToolOutcome::fail(
                "use a normal reply for the current chat; send_followup_message targets other chats",
            ));
        }

        let Some(target) = self.repo.session_by_identifier(bot.id, identifier).await? else {
            return Ok(ToolOutcome::fail(format!(
                "no session '{}' for this bot",
                identifier
            )));
        };

        self.transport
            .send_message(bot.id, identifier, OutgoingPayload::text(message))
            .await?;
        self.repo
            .insert_message(NewMessage::outbound(target.id, "bot", message))
            .await?;

        Ok(ToolOutcome::ok(format!("Message sent to {}.", identifier)))
    }

    async fn lookup_client(&self, bot: &Bot, arguments: &Value) -> Result<ToolOutcome> {
        let Some(phone) = arg_str(arguments, "phone") else {
            return Ok(ToolOutcome::fail("missing 'phone' argument"));
        };
        if !is_valid_phone(phone) {
            return Ok(ToolOutcome::fail("phone must be 10 to 15 digits"));
        }
        match self.repo.find_client_by_phone(bot.id, phone).await? {
            Some(client) => Ok(ToolOutcome::ok(
                json!({
                    "full_name": client.full_name,
                    "phone": client.phone,
                    "curp": client.curp,
                    "email": client.email,
                    "has_credentials": client.credentials.is_some(),
                })
                .to_string(),
            )),
            None => Ok(ToolOutcome::ok(format!(
                "No client registered with phone {}.",
                phone
            ))),
        }
    }

    async fn register_client(&self, bot: &Bot, arguments: &Value) -> Result<ToolOutcome> {
        let Some(phone) = arg_str(arguments, "phone") else {
            return Ok(ToolOutcome::fail("missing 'phone' argument"));
        };
        let Some(full_name) = arg_str(arguments, "full_name") else {
            return Ok(ToolOutcome::fail("missing 'full_name' argument"));
        };
        if !is_valid_phone(phone) {
            return Ok(ToolOutcome::fail("phone must be 10 to 15 digits"));
        }
        let curp = arg_str(arguments, "curp");
        if let Some(curp) = curp {
            if !is_valid_curp(curp) {
                return Ok(ToolOutcome::fail("CURP must be 18 alphanumeric characters"));
            }
        }
        let email = arg_str(arguments, "email");
        if let Some(email) = email {
            if !is_valid_email(email) {
                return Ok(ToolOutcome::fail("email address is not valid"));
            }
        }
        if self.repo.find_client_by_phone(bot.id, phone).await?.is_some() {
            return Ok(ToolOutcome::fail(format!(
                "a client with phone {} is already registered",
                phone
            )));
        }

        let now = Utc::now();
        let client = self
            .repo
            .create_client(NewClient {
                id: uuid::Uuid::new_v4(),
                bot_id: bot.id,
                phone: phone.to_string(),
                full_name: full_name.to_string(),
                curp: curp.map(|s| s.to_uppercase()),
                email: email.map(|s| s.to_string()),
                credentials: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        Ok(ToolOutcome::ok(format!(
            "Client {} registered with phone {}.",
            client.full_name, client.phone
        )))
    }

    async fn save_credentials(&self, bot: &Bot, arguments: &Value) -> Result<ToolOutcome> {
        let Some(phone) = arg_str(arguments, "phone") else {
            return Ok(ToolOutcome::fail("missing 'phone' argument"));
        };
        let Some(username) = arg_str(arguments, "username") else {
            return Ok(ToolOutcome::fail("missing 'username' argument"));
        };
        let Some(password) = arg_str(arguments, "password") else {
            return Ok(ToolOutcome::fail("missing 'password' argument"));
        };
        let Some(client) = self.repo.find_client_by_phone(bot.id, phone).await? else {
            return Ok(ToolOutcome::fail(format!(
                "no client registered with phone {}",
                phone
            )));
        };

        self.repo
            .set_client_credentials(client.id, json!({"username": username, "password": password}))
            .await?;

        Ok(ToolOutcome::ok(format!(
            "Credentials saved for {}.",
            client.full_name
        )))
    }
}
