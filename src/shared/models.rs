//! Database models and domain enums.
//!
//! Diesel ORM models for the orchestrator tables plus the string-backed
//! enums used across the pipeline (message kinds, tool actions, trigger
//! matching, execution status).

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use super::schema;
pub use super::schema::{
    automations, bots, clients, conversation_logs, executions, flows, labels, messages,
    session_labels, sessions, steps, tools, triggers,
};

/// Inbound/outbound message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Document,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Image => "IMAGE",
            Self::Audio => "AUDIO",
            Self::Document => "DOCUMENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TEXT" => Some(Self::Text),
            "IMAGE" => Some(Self::Image),
            "AUDIO" => Some(Self::Audio),
            "DOCUMENT" => Some(Self::Document),
            _ => None,
        }
    }

    /// Guess the kind from a media URL suffix. Bare text has no media.
    pub fn from_media_url(url: Option<&str>) -> Self {
        let Some(url) = url else {
            return Self::Text;
        };
        let lower = url.to_lowercase();
        if lower.ends_with(".jpg")
            || lower.ends_with(".jpeg")
            || lower.ends_with(".png")
            || lower.ends_with(".webp")
        {
            Self::Image
        } else if lower.ends_with(".ogg")
            || lower.ends_with(".opus")
            || lower.ends_with(".mp3")
            || lower.ends_with(".m4a")
        {
            Self::Audio
        } else if lower.ends_with(".pdf") || lower.ends_with(".doc") || lower.ends_with(".docx") {
            Self::Document
        } else {
            Self::Text
        }
    }
}

/// Tool action dispatch targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolAction {
    Flow,
    Webhook,
    Builtin,
}

impl ToolAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FLOW" => Some(Self::Flow),
            "WEBHOOK" => Some(Self::Webhook),
            "BUILTIN" => Some(Self::Builtin),
            _ => None,
        }
    }
}

/// Trigger keyword match strategies, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Equals,
    StartsWith,
    Contains,
    Regex,
}

impl MatchKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EQUALS" => Some(Self::Equals),
            "STARTS_WITH" => Some(Self::StartsWith),
            "CONTAINS" => Some(Self::Contains),
            "REGEX" => Some(Self::Regex),
            _ => None,
        }
    }
}

pub const EXECUTION_RUNNING: &str = "RUNNING";
pub const EXECUTION_COMPLETED: &str = "COMPLETED";
pub const EXECUTION_FAILED: &str = "FAILED";

pub const TOOL_STATUS_ACTIVE: &str = "ACTIVE";

/// Tenant record.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = bots)]
pub struct Bot {
    pub id: Uuid,
    pub name: String,
    pub ai_provider: String,
    pub ai_model: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub message_delay_ms: i32,
    pub ignored_labels: Vec<String>,
    pub ignore_groups: bool,
    pub ai_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A (bot, external identifier) conversation thread.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = sessions)]
pub struct Session {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub identifier: String,
    pub name: Option<String>,
    pub platform: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = messages)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    pub external_id: Option<String>,
    pub sender: String,
    pub from_me: bool,
    pub content: String,
    pub message_type: String,
    pub media_url: Option<String>,
    pub is_processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = messages)]
pub struct NewMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub external_id: Option<String>,
    pub sender: String,
    pub from_me: bool,
    pub content: String,
    pub message_type: String,
    pub media_url: Option<String>,
    pub is_processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn inbound(
        session_id: Uuid,
        external_id: Option<String>,
        sender: &str,
        content: &str,
        kind: MessageKind,
        media_url: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_id,
            external_id,
            sender: sender.to_string(),
            from_me: false,
            content: content.to_string(),
            message_type: kind.as_str().to_string(),
            media_url,
            is_processed: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn outbound(session_id: Uuid, sender: &str, content: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_id,
            external_id: None,
            sender: sender.to_string(),
            from_me: true,
            content: content.to_string(),
            message_type: MessageKind::Text.as_str().to_string(),
            media_url: None,
            is_processed: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A named, schema-typed function the model may invoke.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = tools)]
pub struct Tool {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub action_type: String,
    pub action_config: serde_json::Value,
    pub status: String,
    pub flow_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = flows)]
pub struct Flow {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub cooldown_ms: i32,
    pub usage_limit: i32,
    pub excludes_flows: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = steps)]
pub struct Step {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub step_type: String,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub delay_ms: i32,
    pub jitter_pct: i32,
    pub step_order: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = triggers)]
pub struct Trigger {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub flow_id: Uuid,
    pub keyword: String,
    pub match_type: String,
    pub scope: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = labels)]
pub struct Label {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub wa_label_id: String,
    pub name: String,
    pub color: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = session_labels)]
pub struct SessionLabel {
    pub id: Uuid,
    pub session_id: Uuid,
    pub label_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Inactivity automation rule.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = automations)]
pub struct Automation {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub event: String,
    pub label_name: Option<String>,
    pub timeout_ms: i64,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable record of one conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = conversation_logs)]
pub struct ConversationLog {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: String,
    pub content: Option<String>,
    pub tool_name: Option<String>,
    pub tool_args: Option<serde_json::Value>,
    pub tool_call_ref: Option<String>,
    pub model: Option<String>,
    pub tokens_used: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = conversation_logs)]
pub struct NewConversationLog {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: String,
    pub content: Option<String>,
    pub tool_name: Option<String>,
    pub tool_args: Option<serde_json::Value>,
    pub tool_call_ref: Option<String>,
    pub model: Option<String>,
    pub tokens_used: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = executions)]
pub struct Execution {
    pub id: Uuid,
    pub session_id: Uuid,
    pub flow_id: Uuid,
    pub status: String,
    pub current_step: i32,
    pub error: Option<String>,
    pub trigger_keyword: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = executions)]
pub struct NewExecution {
    pub id: Uuid,
    pub session_id: Uuid,
    pub flow_id: Uuid,
    pub status: String,
    pub current_step: i32,
    pub error: Option<String>,
    pub trigger_keyword: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NewExecution {
    pub fn running(session_id: Uuid, flow_id: Uuid, trigger_keyword: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_id,
            flow_id,
            status: EXECUTION_RUNNING.to_string(),
            current_step: 0,
            error: None,
            trigger_keyword: trigger_keyword.map(|s| s.to_string()),
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn failed(
        session_id: Uuid,
        flow_id: Uuid,
        trigger_keyword: Option<&str>,
        error: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_id,
            flow_id,
            status: EXECUTION_FAILED.to_string(),
            current_step: 0,
            error: Some(error.to_string()),
            trigger_keyword: trigger_keyword.map(|s| s.to_string()),
            started_at: now,
            updated_at: now,
            completed_at: Some(now),
        }
    }
}

/// Tenant-CRM client record backing the lookup/register built-ins.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = clients)]
pub struct Client {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub phone: String,
    pub full_name: String,
    pub curp: Option<String>,
    pub email: Option<String>,
    pub credentials: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = clients)]
pub struct NewClient {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub phone: String,
    pub full_name: String,
    pub curp: Option<String>,
    pub email: Option<String>,
    pub credentials: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kind_round_trip() {
        for kind in [
            MessageKind::Text,
            MessageKind::Image,
            MessageKind::Audio,
            MessageKind::Document,
        ] {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageKind::parse("VIDEO"), None);
    }

    #[test]
    fn message_kind_from_media_url() {
        assert_eq!(MessageKind::from_media_url(None), MessageKind::Text);
        assert_eq!(
            MessageKind::from_media_url(Some("https://cdn/a.jpg")),
            MessageKind::Image
        );
        assert_eq!(
            MessageKind::from_media_url(Some("/tmp/voice.ogg")),
            MessageKind::Audio
        );
        assert_eq!(
            MessageKind::from_media_url(Some("https://cdn/doc.pdf")),
            MessageKind::Document
        );
        assert_eq!(
            MessageKind::from_media_url(Some("https://cdn/file.bin")),
            MessageKind::Text
        );
    }
}
