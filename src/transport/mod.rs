//! WhatsApp transport seam.
//!
//! The orchestrator never speaks the WhatsApp protocol itself; it hands
//! outbound work to whatever owns the socket. In production that is the
//! Node gateway, reached through the `agentic:queue:outgoing` stream.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use serde_json::{json, Value};
use uuid::Uuid;

pub const OUTGOING_STREAM: &str = "agentic:queue:outgoing";
const STREAM_MAXLEN: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Composing,
    Paused,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Composing => "composing",
            Self::Paused => "paused",
        }
    }
}

/// One outbound unit, mirroring the gateway payload union.
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingPayload {
    Text {
        text: String,
    },
    Image {
        url: String,
        caption: Option<String>,
    },
    Audio {
        url: String,
        ptt: bool,
    },
    /// Quote-reply: text plus the context of the quoted message.
    Quote {
        text: String,
        stanza_id: String,
        participant: String,
        quoted_text: String,
    },
}

impl OutgoingPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn to_wire(&self) -> Value {
        match self {
            Self::Text { text } => json!({"text": text}),
            Self::Image { url, caption } => json!({"image": {"url": url}, "caption": caption}),
            Self::Audio { url, ptt } => json!({"audio": {"url": url}, "ptt": ptt}),
            Self::Quote {
                text,
                stanza_id,
                participant,
                quoted_text,
            } => json!({
                "text": text,
                "contextInfo": {
                    "stanzaId": stanza_id,
                    "participant": participant,
                    "quotedMessage": {"conversation": quoted_text},
                },
            }),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn start_session(&self, bot_id: Uuid) -> Result<()>;
    async fn stop_session(&self, bot_id: Uuid) -> Result<()>;

    async fn send_message(
        &self,
        bot_id: Uuid,
        identifier: &str,
        payload: OutgoingPayload,
    ) -> Result<()>;

    /// Flow-step send carrying the execution reference for gateway-side
    /// delivery tracking.
    async fn send_step(
        &self,
        bot_id: Uuid,
        identifier: &str,
        payload: OutgoingPayload,
        execution_id: Uuid,
        step_order: i32,
    ) -> Result<()>;

    async fn mark_read(&self, bot_id: Uuid, identifier: &str, external_ids: &[String])
        -> Result<()>;
    async fn send_presence(&self, bot_id: Uuid, identifier: &str, presence: Presence)
        -> Result<()>;

    async fn add_chat_label(&self, bot_id: Uuid, identifier: &str, wa_label_id: &str)
        -> Result<()>;
    async fn remove_chat_label(
        &self,
        bot_id: Uuid,
        identifier: &str,
        wa_label_id: &str,
    ) -> Result<()>;
    async fn sync_labels(&self, bot_id: Uuid) -> Result<()>;

    async fn shutdown_all(&self) -> Result<()>;
}

/// Transport backed by the outgoing Redis stream consumed by the gateway.
pub struct StreamTransport {
    conn: redis::aio::MultiplexedConnection,
}

impl StreamTransport {
    pub fn new(conn: redis::aio::MultiplexedConnection) -> Self {
        Self { conn }
    }

    async fn xadd(&self, entry: Value) -> Result<()> {
        let payload = serde_json::to_string(&entry)?;
        let id: String = redis::cmd("XADD")
            .arg(OUTGOING_STREAM)
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAXLEN)
            .arg("*")
            .arg("payload")
            .arg(&payload)
            .query_async(&mut self.conn.clone())
            .await?;
        debug!("XADD {} -> {}", OUTGOING_STREAM, id);
        Ok(())
    }

    fn envelope(
        bot_id: Uuid,
        target: &str,
        payload: &OutgoingPayload,
        execution_id: Option<Uuid>,
        step_order: Option<i32>,
    ) -> Value {
        json!({
            "bot_id": bot_id,
            "target": target,
            "execution_id": execution_id,
            "step_order": step_order,
            "payload": payload.to_wire(),
        })
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn start_session(&self, bot_id: Uuid) -> Result<()> {
        self.xadd(json!({"bot_id": bot_id, "command": "START_SESSION"}))
            .await
    }

    async fn stop_session(&self, bot_id: Uuid) -> Result<()> {
        self.xadd(json!({"bot_id": bot_id, "command": "STOP_SESSION"}))
            .await
    }

    async fn send_message(
        &self,
        bot_id: Uuid,
        identifier: &str,
        payload: OutgoingPayload,
    ) -> Result<()> {
        self.xadd(Self::envelope(bot_id, identifier, &payload, None, None))
            .await
    }

    async fn send_step(
        &self,
        bot_id: Uuid,
        identifier: &str,
        payload: OutgoingPayload,
        execution_id: Uuid,
        step_order: i32,
    ) -> Result<()> {
        self.xadd(Self::envelope(
            bot_id,
            identifier,
            &payload,
            Some(execution_id),
            Some(step_order),
        ))
        .await
    }

    async fn mark_read(
        &self,
        bot_id: Uuid,
        identifier: &str,
        external_ids: &[String],
    ) -> Result<()> {
        self.xadd(json!({
            "bot_id": bot_id,
            "target": identifier,
            "command": "MARK_READ",
            "message_ids": external_ids,
        }))
        .await
    }

    async fn send_presence(
        &self,
        bot_id: Uuid,
        identifier: &str,
        presence: Presence,
    ) -> Result<()> {
        self.xadd(json!({
            "bot_id": bot_id,
            "target": identifier,
            "command": "PRESENCE",
            "presence": presence.as_str(),
        }))
        .await
    }

    async fn add_chat_label(
        &self,
        bot_id: Uuid,
        identifier: &str,
        wa_label_id: &str,
    ) -> Result<()> {
        self.xadd(json!({
            "bot_id": bot_id,
            "target": identifier,
            "command": "ADD_LABEL",
            "label_id": wa_label_id,
        }))
        .await
    }

    async fn remove_chat_label(
        &self,
        bot_id: Uuid,
        identifier: &str,
        wa_label_id: &str,
    ) -> Result<()> {
        self.xadd(json!({
            "bot_id": bot_id,
            "target": identifier,
            "command": "REMOVE_LABEL",
            "label_id": wa_label_id,
        }))
        .await
    }

    async fn sync_labels(&self, bot_id: Uuid) -> Result<()> {
        self.xadd(json!({"bot_id": bot_id, "command": "SYNC_LABELS"}))
            .await
    }

    async fn shutdown_all(&self) -> Result<()> {
        info!("Requesting gateway shutdown of all sessions");
        self.xadd(json!({"command": "SHUTDOWN_ALL"})).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_payload_wire_shape() {
        let wire = OutgoingPayload::text("hola!").to_wire();
        assert_eq!(wire, json!({"text": "hola!"}));
    }

    #[test]
    fn quote_payload_carries_context_info() {
        let wire = OutgoingPayload::Quote {
            text: "claro".to_string(),
            stanza_id: "e1".to_string(),
            participant: "5215512345678@s.whatsapp.net".to_string(),
            quoted_text: "hola".to_string(),
        }
        .to_wire();

        assert_eq!(wire["text"], "claro");
        assert_eq!(wire["contextInfo"]["stanzaId"], "e1");
        assert_eq!(wire["contextInfo"]["quotedMessage"]["conversation"], "hola");
    }

    #[test]
    fn audio_payload_keeps_ptt_flag() {
        let wire = OutgoingPayload::Audio {
            url: "https://cdn/a.ogg".to_string(),
            ptt: true,
        }
        .to_wire();
        assert_eq!(wire["audio"]["url"], "https://cdn/a.ogg");
        assert_eq!(wire["ptt"], true);
    }
}
