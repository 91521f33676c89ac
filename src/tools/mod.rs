//! Tool enumeration for the AI loop.
//!
//! A bot's tool list is its ACTIVE database rows followed by the built-in
//! primitives whose names they do not shadow. Built-in names are reserved:
//! creating a DB tool under one fails the way a duplicate row would.

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::llm::ToolDef;
use crate::repo::Repository;

pub mod builtin;
pub mod executor;

pub use executor::{ToolExecutor, ToolOutcome};

pub const BUILTIN_TOOL_NAMES: &[&str] = &[
    "get_current_time",
    "clear_conversation",
    "get_labels",
    "assign_label",
    "remove_label",
    "get_sessions_by_label",
    "reply_to_message",
    "send_followup_message",
    "lookup_client",
    "register_client",
    "save_credentials",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTIN_TOOL_NAMES.contains(&name)
}

/// Lowercase, collapse anything outside `[a-z0-9_]` into underscores, trim
/// the edges. The result always matches `^[a-z0-9_]+$` (or is empty).
pub fn sanitize_tool_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_underscore = false;
    for c in raw.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    out.trim_matches('_').to_string()
}

#[derive(Debug, PartialEq, Eq)]
pub enum ToolNameError {
    /// Nothing survives sanitisation.
    Empty,
    /// The name collides with a reserved built-in (ALREADY_EXISTS).
    Reserved(String),
}

impl std::fmt::Display for ToolNameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "tool name is empty after sanitisation"),
            Self::Reserved(name) => write!(f, "tool name '{}' already exists (built-in)", name),
        }
    }
}

impl std::error::Error for ToolNameError {}

/// Sanitise and validate a tool name for insertion.
pub fn validate_tool_name(raw: &str) -> Result<String, ToolNameError> {
    let name = sanitize_tool_name(raw);
    if name.is_empty() {
        return Err(ToolNameError::Empty);
    }
    if is_builtin(&name) {
        return Err(ToolNameError::Reserved(name));
    }
    Ok(name)
}

fn no_params() -> serde_json::Value {
    json!({"type": "object", "properties": {}})
}

/// Definitions for the fixed built-in set.
pub fn builtin_tool_defs() -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: "get_current_time".to_string(),
            description: "Get the current local date and time.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "timezone": {"type": "string", "description": "IANA timezone name; defaults to the bot timezone."}
                }
            }),
        },
        ToolDef {
            name: "clear_conversation".to_string(),
            description: "Erase the conversation history for this chat.".to_string(),
            parameters: no_params(),
        },
        ToolDef {
            name: "get_labels".to_string(),
            description: "List the labels configured for this bot with the number of chats under each.".to_string(),
            parameters: no_params(),
        },
        ToolDef {
            name: "assign_label".to_string(),
            description: "Attach a label to the current chat.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"label": {"type": "string", "description": "Label name (case-insensitive)."}},
                "required": ["label"]
            }),
        },
        ToolDef {
            name: "remove_label".to_string(),
            description: "Remove a label from the current chat.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"label": {"type": "string"}},
                "required": ["label"]
            }),
        },
        ToolDef {
            name: "get_sessions_by_label".to_string(),
            description: "List chats holding a label, each with its most recent messages.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "label": {"type": "string"},
                    "message_limit": {"type": "integer", "description": "Messages per chat, default 5."}
                },
                "required": ["label"]
            }),
        },
        ToolDef {
            name: "reply_to_message".to_string(),
            description: "Quote-reply to a specific earlier message in this chat.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "message_id": {"type": "string", "description": "The [msg:...] id of the message being answered."},
                    "text": {"type": "string"}
                },
                "required": ["message_id", "text"]
            }),
        },
        ToolDef {
            name: "send_followup_message".to_string(),
            description: "Send a text message to a different chat of this bot.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "identifier": {"type": "string", "description": "Target chat identifier."},
                    "message": {"type": "string"}
                },
                "required": ["identifier", "message"]
            }),
        },
        ToolDef {
            name: "lookup_client".to_string(),
            description: "Look up a registered client by phone number.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"phone": {"type": "string"}},
                "required": ["phone"]
            }),
        },
        ToolDef {
            name: "register_client".to_string(),
            description: "Register a new client record.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "phone": {"type": "string"},
                    "full_name": {"type": "string"},
                    "curp": {"type": "string", "description": "18-character CURP."},
                    "email": {"type": "string"}
                },
                "required": ["phone", "full_name"]
            }),
        },
        ToolDef {
            name: "save_credentials".to_string(),
            description: "Store portal credentials for a registered client.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "phone": {"type": "string"},
                    "username": {"type": "string"},
                    "password": {"type": "string"}
                },
                "required": ["phone", "username", "password"]
            }),
        },
    ]
}

pub struct ToolRegistry {
    repo: Arc<dyn Repository>,
}

impl ToolRegistry {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// ACTIVE rows for the bot first, then unshadowed built-ins.
    pub async fn tools_for_bot(&self, bot_id: Uuid) -> Result<Vec<ToolDef>> {
        let rows = self.repo.active_tools(bot_id).await?;
        let mut defs: Vec<ToolDef> = rows
            .iter()
            .map(|t| ToolDef {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            })
            .collect();

        for builtin in builtin_tool_defs() {
            if !defs.iter().any(|d| d.name == builtin.name) {
                defs.push(builtin);
            }
        }
        Ok(defs)
    }
}
