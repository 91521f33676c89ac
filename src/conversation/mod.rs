//! Conversation-history store: fast cache over a durable log.
//!
//! The cache (a redis list per session) serves every AI turn; the durable
//! `conversation_logs` table survives restarts and rebuilds the cache after
//! eviction. Durable write failures never block the cache write.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::kv::KvStore;
use crate::llm::{ChatMessage, ChatRole};
use crate::repo::Repository;
use crate::shared::models::NewConversationLog;

fn role_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    }
}

#[derive(Clone)]
pub struct ConversationStore {
    kv: Arc<dyn KvStore>,
    repo: Arc<dyn Repository>,
    ttl: Duration,
    max_messages: usize,
    history_days: i64,
}

impl ConversationStore {
    pub fn new(
        kv: Arc<dyn KvStore>,
        repo: Arc<dyn Repository>,
        ttl: Duration,
        max_messages: usize,
        history_days: i64,
    ) -> Self {
        Self {
            kv,
            repo,
            ttl,
            max_messages,
            history_days,
        }
    }

    fn cache_key(session_id: Uuid) -> String {
        format!("conv:{}", session_id)
    }

    fn durable_record(session_id: Uuid, turn: &ChatMessage) -> NewConversationLog {
        NewConversationLog {
            id: Uuid::new_v4(),
            session_id,
            role: role_str(turn.role).to_string(),
            content: turn.content.clone(),
            tool_name: turn.name.clone(),
            tool_args: if turn.tool_calls.is_empty() {
                None
            } else {
                serde_json::to_value(&turn.tool_calls).ok()
            },
            tool_call_ref: turn.tool_call_id.clone(),
            model: None,
            tokens_used: None,
            created_at: Utc::now(),
        }
    }

    pub async fn append(&self, session_id: Uuid, turn: &ChatMessage) -> Result<()> {
        self.append_many(session_id, std::slice::from_ref(turn)).await
    }

    /// Push turns onto the fast cache (one pipeline) and mirror them into
    /// the durable log. The durable write is best-effort.
    pub async fn append_many(&self, session_id: Uuid, turns: &[ChatMessage]) -> Result<()> {
        if turns.is_empty() {
            return Ok(());
        }
        let encoded: Vec<String> = turns
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<_, _>>()?;
        self.kv
            .rpush_trim(
                &Self::cache_key(session_id),
                &encoded,
                self.max_messages as i64,
                self.ttl,
            )
            .await?;

        for turn in turns {
            if let Err(e) = self
                .repo
                .append_conversation_log(Self::durable_record(session_id, turn))
                .await
            {
                warn!("Durable conversation write failed for {}: {}", session_id, e);
            }
        }
        Ok(())
    }

    /// Full history, oldest first. An empty cache is rebuilt from the
    /// durable log; tool rows collapse into assistant text so no dangling
    /// tool-call references survive the rebuild.
    pub async fn history(&self, session_id: Uuid) -> Result<Vec<ChatMessage>> {
        let key = Self::cache_key(session_id);
        let cached = self.kv.lrange(&key, 0, -1).await?;
        if !cached.is_empty() {
            let turns = cached
                .iter()
                .filter_map(|raw| serde_json::from_str(raw).ok())
                .collect();
            return Ok(turns);
        }

        let since = Utc::now() - ChronoDuration::days(self.history_days);
        let rows = self
            .repo
            .conversation_logs_since(session_id, since, self.max_messages as i64)
            .await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut turns: Vec<ChatMessage> = Vec::with_capacity(rows.len());
        for row in &rows {
            let turn = match row.role.as_str() {
                "tool" => ChatMessage::assistant(
                    Some(format!(
                        "[Previous tool: {} → {}]",
                        row.tool_name.as_deref().unwrap_or("unknown"),
                        row.content.as_deref().unwrap_or_default(),
                    )),
                    Vec::new(),
                ),
                "assistant" => {
                    let Some(content) = row.content.clone().filter(|c| !c.is_empty()) else {
                        continue;
                    };
                    ChatMessage::assistant(Some(content), Vec::new())
                }
                "user" => ChatMessage::user(row.content.clone().unwrap_or_default()),
                "system" => ChatMessage::system(row.content.clone().unwrap_or_default()),
                other => {
                    debug!("Skipping unknown conversation role {:?}", other);
                    continue;
                }
            };
            turns.push(turn);
        }

        if turns.len() > self.max_messages {
            turns.drain(..turns.len() - self.max_messages);
        }

        // Rehydrate the cache with the reconstructed view.
        let encoded: Vec<String> = turns
            .iter()
            .filter_map(|t| serde_json::to_string(t).ok())
            .collect();
        if let Err(e) = self
            .kv
            .rpush_trim(&key, &encoded, self.max_messages as i64, self.ttl)
            .await
        {
            warn!("Cache rehydration failed for {}: {}", session_id, e);
        }

        Ok(turns)
    }

    /// Purge both tiers.
    pub async fn clear(&self, session_id: Uuid) -> Result<()> {
        self.kv.del(&Self::cache_key(session_id)).await?;
        self.repo.delete_conversation_logs(session_id).await?;
        Ok(())
    }

    /// Fast-cache presence only.
    pub async fn has(&self, session_id: Uuid) -> Result<bool> {
        Ok(self.kv.llen(&Self::cache_key(session_id)).await? > 0)
    }
}
