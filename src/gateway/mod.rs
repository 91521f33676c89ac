//! Inbound stream consumer.
//!
//! Reads `NEW_MESSAGE` payloads from the gateway's incoming stream through
//! a consumer group, persists them with the external-id upsert, and routes
//! created rows into the accumulator / AI engine (inbound) or the flow
//! engine (outgoing scope). Every delivery is ACKed, poison pills included.

use anyhow::Result;
use log::{error, info, warn};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::accumulator::Accumulator;
use crate::engine::AiEngine;
use crate::events::{Event, EventBus};
use crate::flow::FlowEngine;
use crate::repo::Repository;
use crate::shared::models::{MessageKind, NewMessage};

pub const INCOMING_STREAM: &str = "agentic:queue:incoming";
pub const CONSUMER_GROUP: &str = "agentic_core_group";
const CONSUMER_NAME: &str = "core_worker_1";

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum IncomingEvent {
    #[serde(rename = "NEW_MESSAGE")]
    NewMessage {
        bot_id: String,
        #[serde(default)]
        session_id: Option<String>,
        identifier: String,
        #[serde(default)]
        platform: Option<String>,
        from_me: bool,
        sender: String,
        message: IncomingBody,
    },
}

#[derive(Debug, Deserialize)]
struct IncomingBody {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "mediaUrl")]
    media_url: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    timestamp: Option<i64>,
}

pub struct GatewayConsumer {
    conn: redis::aio::MultiplexedConnection,
    repo: Arc<dyn Repository>,
    engine: Arc<AiEngine>,
    flow: Arc<FlowEngine>,
    accumulator: Arc<Accumulator>,
    events: EventBus,
}

impl GatewayConsumer {
    pub fn new(
        conn: redis::aio::MultiplexedConnection,
        repo: Arc<dyn Repository>,
        engine: Arc<AiEngine>,
        flow: Arc<FlowEngine>,
        accumulator: Arc<Accumulator>,
        events: EventBus,
    ) -> Self {
        Self {
            conn,
            repo,
            engine,
            flow,
            accumulator,
            events,
        }
    }

    /// Create the consumer group, tolerating BUSYGROUP on restart.
    pub async fn ensure_group(&self) {
        let _ = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(INCOMING_STREAM)
            .arg(CONSUMER_GROUP)
            .arg("$")
            .arg("MKSTREAM")
            .query_async::<()>(&mut self.conn.clone())
            .await;
    }

    pub async fn run(self) {
        self.ensure_group().await;
        info!("Listening on {} (group {})", INCOMING_STREAM, CONSUMER_GROUP);

        loop {
            let opts = StreamReadOptions::default()
                .group(CONSUMER_GROUP, CONSUMER_NAME)
                .block(5000)
                .count(10);

            let reply: redis::RedisResult<StreamReadReply> = self
                .conn
                .clone()
                .xread_options(&[INCOMING_STREAM], &[">"], &opts)
                .await;

            match reply {
                Ok(reply) => {
                    for stream in reply.keys {
                        for entry in stream.ids {
                            let entry_id = entry.id.clone();
                            if let Some(value) = entry.map.get("payload") {
                                if let Ok(payload) = redis::from_redis_value::<String>(value) {
                                    if let Err(e) = self.handle_payload(&entry_id, &payload).await {
                                        error!("Failed to process entry {}: {}", entry_id, e);
                                    }
                                }
                            }
                            // ACK everything, poison pills included.
                            let _: redis::RedisResult<i64> = self
                                .conn
                                .clone()
                                .xack(&stream.key, CONSUMER_GROUP, &[&entry_id])
                                .await;
                        }
                    }
                }
                Err(e) => {
                    error!("Error reading {}: {}", INCOMING_STREAM, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_payload(&self, entry_id: &str, payload: &str) -> Result<()> {
        let event: IncomingEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Unparseable payload on {}: {}", entry_id, e);
                return Ok(());
            }
        };
        let IncomingEvent::NewMessage {
            bot_id,
            session_id,
            identifier,
            platform,
            from_me,
            sender,
            message,
        } = event;

        let Ok(bot_id) = Uuid::parse_str(&bot_id) else {
            warn!("Invalid bot_id {:?} on entry {}", bot_id, entry_id);
            return Ok(());
        };
        let Some(bot) = self.repo.bot(bot_id).await? else {
            warn!("Unknown bot {} on entry {}", bot_id, entry_id);
            return Ok(());
        };
        if bot.ignore_groups && identifier.ends_with("@g.us") {
            return Ok(());
        }

        // Prefer the gateway's session id; fall back to lazy creation.
        let session = match session_id.as_deref().and_then(|raw| Uuid::parse_str(raw).ok()) {
            Some(id) => self.repo.session(id).await?,
            None => None,
        };
        let session = match session {
            Some(session) => session,
            None => {
                let (session, created) = self
                    .repo
                    .find_or_create_session(
                        bot.id,
                        &identifier,
                        None,
                        platform.as_deref().unwrap_or("WHATSAPP"),
                    )
                    .await?;
                if created {
                    self.events.emit(Event::SessionCreated {
                        bot_id: bot.id,
                        session_id: session.id,
                        identifier: identifier.clone(),
                    });
                }
                session
            }
        };

        let content = message.text.unwrap_or_default();
        let kind = MessageKind::from_media_url(message.media_url.as_deref());
        // The stream entry id is globally unique and stands in when the
        // gateway did not forward a message id.
        let external_id = message
            .id
            .clone()
            .unwrap_or_else(|| format!("stream:{}", entry_id));

        let mut new_message = NewMessage::inbound(
            session.id,
            Some(external_id),
            &sender,
            &content,
            kind,
            message.media_url.clone(),
        );
        new_message.from_me = from_me;

        let (row, created) = self.repo.upsert_message(new_message).await?;
        if !created {
            // Duplicate externalId: already handled downstream.
            return Ok(());
        }

        self.events.emit(Event::MessageReceived {
            bot_id: bot.id,
            session_id: session.id,
            content: row.content.clone(),
        });

        if from_me {
            // Outgoing messages only drive OUTGOING/BOTH triggers.
            return self
                .flow
                .evaluate_message(&bot, &session, &row.content, true)
                .await;
        }

        let delay_ms = bot.message_delay_ms.max(0) as u64;
        if delay_ms > 0 {
            let engine = Arc::clone(&self.engine);
            self.accumulator.accumulate(
                session.id,
                row,
                Duration::from_millis(delay_ms),
                move |session_id, batch| async move {
                    if let Err(e) = engine.process_messages(session_id, batch).await {
                        error!("AI processing failed for {}: {}", session_id, e);
                    }
                },
            );
        } else {
            self.engine.process_messages(session.id, vec![row]).await?;
        }

        Ok(())
    }
}
