//! The AI turn orchestrator.
//!
//! One serialised turn per session: a KV mutex gates the turn, arrivals
//! during a held lock queue as pending batches, and the drain after release
//! feeds them back through the same path. Inside a turn: media
//! preprocessing, the bounded tool loop with `reply_to_message` dedup, and
//! cross-provider failover pinned for the remainder of the turn.

use anyhow::{anyhow, Result};
use log::{error, info, warn};
use serde_json::Value;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::conversation::ConversationStore;
use crate::events::{Event, EventBus};
use crate::flow::FlowEngine;
use crate::kv::KvStore;
use crate::llm::{ChatMessage, ChatRequest, FailoverRouter, ToolCall};
use crate::media::{MediaProcessor, PDF_TEXT_LIMIT};
use crate::repo::Repository;
use crate::shared::models::{Bot, Message, MessageKind, Session};
use crate::shared::utils::truncate_chars;
use crate::tools::{ToolExecutor, ToolRegistry};
use crate::transport::{OutgoingPayload, Presence, Transport};

pub const APOLOGY_MESSAGE: &str =
    "Lo siento, ocurrió un error al procesar tu mensaje. Por favor intenta de nuevo en unos momentos.";

pub const DUPLICATE_REPLY_NOTICE: &str =
    "Ya respondiste a este mensaje. No llames reply_to_message de nuevo con este message_id; no hace falta ninguna acción adicional.";

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub lock_ttl: Duration,
    pub max_tool_iterations: usize,
    pub max_pending_retries: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(60),
            max_tool_iterations: 10,
            max_pending_retries: 3,
        }
    }
}

pub struct AiEngine {
    repo: Arc<dyn Repository>,
    kv: Arc<dyn KvStore>,
    transport: Arc<dyn Transport>,
    media: Arc<dyn MediaProcessor>,
    store: ConversationStore,
    registry: ToolRegistry,
    executor: ToolExecutor,
    router: FailoverRouter,
    flow: Arc<FlowEngine>,
    events: EventBus,
    settings: EngineSettings,
}

type BoxFut<'a> = Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

impl AiEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn Repository>,
        kv: Arc<dyn KvStore>,
        transport: Arc<dyn Transport>,
        media: Arc<dyn MediaProcessor>,
        store: ConversationStore,
        registry: ToolRegistry,
        executor: ToolExecutor,
        router: FailoverRouter,
        flow: Arc<FlowEngine>,
        events: EventBus,
        settings: EngineSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            kv,
            transport,
            media,
            store,
            registry,
            executor,
            router,
            flow,
            events,
            settings,
        })
    }

    fn lock_key(session_id: Uuid) -> String {
        format!("ai:lock:{}", session_id)
    }

    fn pending_key(session_id: Uuid) -> String {
        format!("ai:pending:{}", session_id)
    }

    pub async fn process_message(&self, session_id: Uuid, message: Message) -> Result<()> {
        self.process_messages(session_id, vec![message]).await
    }

    pub async fn process_messages(&self, session_id: Uuid, messages: Vec<Message>) -> Result<()> {
        self.process_inner(session_id, messages, 0).await
    }

    fn process_inner(
        &self,
        session_id: Uuid,
        messages: Vec<Message>,
        depth: usize,
    ) -> BoxFut<'_> {
        Box::pin(async move {
            if messages.is_empty() {
                return Ok(());
            }

            let Some(session) = self.repo.session(session_id).await? else {
                warn!("Session {} not found, dropping batch", session_id);
                return Ok(());
            };
            let Some(bot) = self.repo.bot(session.bot_id).await? else {
                warn!("Bot {} not found for session {}", session.bot_id, session_id);
                return Ok(());
            };

            if !bot.ai_enabled {
                // AI disabled: the messages still drive flow triggers.
                for message in &messages {
                    if let Err(e) = self
                        .flow
                        .evaluate_message(&bot, &session, &message.content, message.from_me)
                        .await
                    {
                        warn!("Flow evaluation failed for {}: {}", session_id, e);
                    }
                }
                return Ok(());
            }

            let lock_key = Self::lock_key(session_id);
            if !self.kv.set_nx(&lock_key, "1", self.settings.lock_ttl).await? {
                // Mid-turn arrival: park the batch on the pending queue.
                let ids: Vec<String> = messages.iter().map(|m| m.id.to_string()).collect();
                let entry = serde_json::to_string(&ids)?;
                self.kv
                    .rpush(
                        &Self::pending_key(session_id),
                        &entry,
                        self.settings.lock_ttl + Duration::from_secs(30),
                    )
                    .await?;
                info!(
                    "AI lock held for {}, queued {} pending message(s)",
                    session_id,
                    messages.len()
                );
                return Ok(());
            }

            let result = self.run_turn(&bot, &session, &messages).await;
            if let Err(e) = &result {
                error!("AI turn failed for session {}: {}", session_id, e);
                let _ = self
                    .transport
                    .send_message(
                        bot.id,
                        &session.identifier,
                        OutgoingPayload::text(APOLOGY_MESSAGE),
                    )
                    .await;
            }

            // The mutex is released on every path; the TTL is only the
            // crash backstop.
            if let Err(e) = self.kv.del(&lock_key).await {
                warn!("Failed to release AI lock for {}: {}", session_id, e);
            }

            if depth < self.settings.max_pending_retries {
                if let Err(e) = self.drain_pending(session_id, depth).await {
                    warn!("Pending drain failed for {}: {}", session_id, e);
                }
            }

            result
        })
    }

    /// One LPOP: at most one queued batch continues into a new turn.
    async fn drain_pending(&self, session_id: Uuid, depth: usize) -> Result<()> {
        let Some(entry) = self.kv.lpop(&Self::pending_key(session_id)).await? else {
            return Ok(());
        };
        let ids: Vec<Uuid> = serde_json::from_str::<Vec<String>>(&entry)?
            .iter()
            .filter_map(|raw| Uuid::parse_str(raw).ok())
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        let messages = self.repo.messages_by_ids(&ids).await?;
        if messages.is_empty() {
            return Ok(());
        }
        info!(
            "Draining {} pending message(s) for session {}",
            messages.len(),
            session_id
        );
        self.process_inner(session_id, messages, depth + 1).await
    }

    async fn run_turn(&self, bot: &Bot, session: &Session, messages: &[Message]) -> Result<()> {
        let external_ids: Vec<String> = messages
            .iter()
            .filter_map(|m| m.external_id.clone())
            .collect();
        if !external_ids.is_empty() {
            if let Err(e) = self
                .transport
                .mark_read(bot.id, &session.identifier, &external_ids)
                .await
            {
                warn!("mark_read failed for {}: {}", session.id, e);
            }
        }
        if let Err(e) = self
            .transport
            .send_presence(bot.id, &session.identifier, Presence::Composing)
            .await
        {
            warn!("composing presence failed for {}: {}", session.id, e);
        }

        let mut parts = Vec::with_capacity(messages.len());
        for message in messages {
            let text = self.preprocess_media(message).await;
            match &message.external_id {
                Some(id) => parts.push(format!("[msg:{}] {}", id, text)),
                None => parts.push(text),
            }
        }
        let user_turn = ChatMessage::user(parts.join("\n"));
        self.store.append(session.id, &user_turn).await?;

        let tools = self.registry.tools_for_bot(bot.id).await?;

        let mut provider = bot.ai_provider.clone();
        let mut request = ChatRequest {
            model: bot.ai_model.clone(),
            messages: self.build_messages(bot, session.id).await?,
            tools,
            temperature: bot.temperature.map(|t| t as f32),
        };

        let mut routed = self
            .router
            .chat(&provider, &request)
            .await
            .map_err(|e| anyhow!("{}", e))?;
        if routed.fell_back {
            // Pin the fallback pair for the remainder of this turn.
            provider = routed.provider.clone();
            request.model = routed.model.clone();
        }

        let mut total_tokens: u64 = routed
            .response
            .usage
            .map(|u| u.total_tokens())
            .unwrap_or(0);
        let mut replied_ids: HashSet<String> = HashSet::new();
        let mut reply_sent = false;
        let mut iterations = 0usize;

        while !routed.response.tool_calls.is_empty()
            && iterations < self.settings.max_tool_iterations
        {
            iterations += 1;

            let assistant = ChatMessage::assistant(
                routed.response.content.clone(),
                routed.response.tool_calls.clone(),
            );
            let mut turn_records = vec![assistant];
            let mut all_deduplicated = true;

            for call in &routed.response.tool_calls {
                if let Some(result) =
                    self.deduplicate_reply(call, &mut replied_ids)
                {
                    turn_records.push(result);
                    continue;
                }
                all_deduplicated = false;

                let outcome = self
                    .executor
                    .execute(bot, session, &call.name, &call.arguments)
                    .await;
                if call.name == "reply_to_message" && outcome.success {
                    reply_sent = true;
                }
                turn_records.push(ChatMessage::tool(
                    call.id.clone(),
                    call.name.clone(),
                    outcome.data,
                ));
            }

            self.store.append_many(session.id, &turn_records).await?;

            if all_deduplicated {
                // The model is looping on duplicates; stop feeding it.
                break;
            }

            request.messages = self.build_messages(bot, session.id).await?;
            routed = self
                .router
                .chat(&provider, &request)
                .await
                .map_err(|e| anyhow!("{}", e))?;
            if routed.fell_back {
                provider = routed.provider.clone();
                request.model = routed.model.clone();
            }
            total_tokens += routed
                .response
                .usage
                .map(|u| u.total_tokens())
                .unwrap_or(0);
        }

        if let Err(e) = self
            .transport
            .send_presence(bot.id, &session.identifier, Presence::Paused)
            .await
        {
            warn!("paused presence failed for {}: {}", session.id, e);
        }

        if let Some(content) = routed
            .response
            .content
            .clone()
            .filter(|c| !c.trim().is_empty())
        {
            if reply_sent {
                // The quote-reply already reached the chat this turn.
                info!(
                    "Suppressing direct send for {}: reply_to_message already answered",
                    session.id
                );
            } else {
                match self
                    .transport
                    .send_message(
                        bot.id,
                        &session.identifier,
                        OutgoingPayload::text(content.as_str()),
                    )
                    .await
                {
                    Ok(()) => self.events.emit(Event::MessageSent {
                        bot_id: bot.id,
                        session_id: session.id,
                        content: content.clone(),
                    }),
                    Err(e) => warn!("send failed for {}: {}", session.id, e),
                }
            }
            self.store
                .append(session.id, &ChatMessage::assistant(Some(content), Vec::new()))
                .await?;
        }

        let message_ids: Vec<Uuid> = messages.iter().map(|m| m.id).collect();
        if let Err(e) = self.repo.mark_messages_processed(&message_ids).await {
            warn!("mark_messages_processed failed for {}: {}", session.id, e);
        }

        if total_tokens > 0 {
            if let Err(e) = self
                .repo
                .tag_assistant_logs(session.id, &request.model, total_tokens as i32, 5)
                .await
            {
                warn!("assistant log tagging failed for {}: {}", session.id, e);
            }
        }

        Ok(())
    }

    /// Short-circuit a repeated `reply_to_message` against the same
    /// message_id within one turn.
    fn deduplicate_reply(
        &self,
        call: &ToolCall,
        replied_ids: &mut HashSet<String>,
    ) -> Option<ChatMessage> {
        if call.name != "reply_to_message" {
            return None;
        }
        let message_id = call
            .arguments
            .get("message_id")
            .and_then(Value::as_str)?
            .to_string();
        if replied_ids.insert(message_id) {
            return None;
        }
        Some(ChatMessage::tool(
            call.id.clone(),
            call.name.clone(),
            DUPLICATE_REPLY_NOTICE,
        ))
    }

    async fn build_messages(&self, bot: &Bot, session_id: Uuid) -> Result<Vec<ChatMessage>> {
        let history = self.store.history(session_id).await?;
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(system_prompt) = &bot.system_prompt {
            if !system_prompt.is_empty() {
                messages.push(ChatMessage::system(system_prompt.clone()));
            }
        }
        messages.extend(history);
        Ok(messages)
    }

    /// Replace media content with text the model can read. Failures fall
    /// back to neutral placeholders and never abort the turn.
    async fn preprocess_media(&self, message: &Message) -> String {
        let kind = MessageKind::parse(&message.message_type).unwrap_or(MessageKind::Text);
        let location = message.media_url.as_deref();

        let text = match (kind, location) {
            (MessageKind::Audio, Some(url)) => match self.media.transcribe_audio(url).await {
                Ok(transcript) => format!("[Audio transcription]: {}", transcript),
                Err(e) => {
                    warn!("Audio transcription failed for {}: {}", message.id, e);
                    "[Audio message]".to_string()
                }
            },
            (MessageKind::Image, Some(url)) => match self.media.describe_image(url).await {
                Ok(description) => {
                    if message.content.is_empty() {
                        format!("[Image description]: {}", description)
                    } else {
                        format!("{}\n[Image description]: {}", message.content, description)
                    }
                }
                Err(e) => {
                    warn!("Image description failed for {}: {}", message.id, e);
                    "[Image]".to_string()
                }
            },
            (MessageKind::Document, Some(url)) if url.to_lowercase().ends_with(".pdf") => {
                match self.media.extract_pdf_text(url).await {
                    Ok(body) => {
                        format!("[PDF content]: {}", truncate_chars(&body, PDF_TEXT_LIMIT))
                    }
                    Err(e) => {
                        warn!("PDF extraction failed for {}: {}", message.id, e);
                        "[Document]".to_string()
                    }
                }
            }
            (MessageKind::Document, Some(_)) => "[Document]".to_string(),
            _ => message.content.clone(),
        };

        // Local temp files are single-use; drop them once processed.
        if let Some(path) = location.filter(|l| !l.starts_with("http")) {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to delete media file {}: {}", path, e);
                }
            }
        }

        text
    }
}
