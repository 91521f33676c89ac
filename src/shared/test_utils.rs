//! In-memory fakes for exercising the orchestration pipeline without
//! Postgres, Redis or a live gateway.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::kv::KvStore;
use crate::llm::{ChatProvider, ChatRequest, ChatResponse, ProviderError, ToolCall};
use crate::media::MediaProcessor;
use crate::repo::Repository;
use crate::shared::models::*;
use crate::transport::{OutgoingPayload, Presence, Transport};

// ---------------------------------------------------------------------------
// KV
// ---------------------------------------------------------------------------

enum KvValue {
    Str(String),
    List(VecDeque<String>),
}

struct KvEntry {
    value: KvValue,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory [`KvStore`] with TTL semantics.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, KvEntry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge(entries: &mut HashMap<String, KvEntry>, key: &str) {
        if entries.get(key).is_some_and(KvEntry::expired) {
            entries.remove(key);
        }
    }

    /// Test hook: force a key to expire immediately.
    pub fn force_expire(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        Self::purge(&mut entries, key);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            KvEntry {
                value: KvValue::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().unwrap();
        Self::purge(&mut entries, key);
        Ok(entries.get(key).and_then(|e| match &e.value {
            KvValue::Str(s) => Some(s.clone()),
            KvValue::List(_) => None,
        }))
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        Self::purge(&mut entries, key);
        let entry = entries.entry(key.to_string()).or_insert_with(|| KvEntry {
            value: KvValue::List(VecDeque::new()),
            expires_at: None,
        });
        if let KvValue::List(list) = &mut entry.value {
            list.push_back(value.to_string());
        }
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().unwrap();
        Self::purge(&mut entries, key);
        Ok(entries.get_mut(key).and_then(|e| match &mut e.value {
            KvValue::List(list) => list.pop_front(),
            KvValue::Str(_) => None,
        }))
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        let mut entries = self.entries.lock().unwrap();
        Self::purge(&mut entries, key);
        Ok(entries
            .get(key)
            .map(|e| match &e.value {
                KvValue::List(list) => list.len() as i64,
                KvValue::Str(_) => 0,
            })
            .unwrap_or(0))
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut entries = self.entries.lock().unwrap();
        Self::purge(&mut entries, key);
        let Some(entry) = entries.get(key) else {
            return Ok(Vec::new());
        };
        let KvValue::List(list) = &entry.value else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        let norm = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len - 1)
            }
        };
        if len == 0 {
            return Ok(Vec::new());
        }
        let (start, stop) = (norm(start), norm(stop));
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn rpush_trim(
        &self,
        key: &str,
        values: &[String],
        max_len: i64,
        ttl: Duration,
    ) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        Self::purge(&mut entries, key);
        let entry = entries.entry(key.to_string()).or_insert_with(|| KvEntry {
            value: KvValue::List(VecDeque::new()),
            expires_at: None,
        });
        if let KvValue::List(list) = &mut entry.value {
            for value in values {
                list.push_back(value.clone());
            }
            while list.len() as i64 > max_len {
                list.pop_front();
            }
        }
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RepoInner {
    bots: Vec<Bot>,
    sessions: Vec<Session>,
    messages: Vec<Message>,
    tools: Vec<Tool>,
    flows: Vec<Flow>,
    steps: Vec<Step>,
    triggers: Vec<Trigger>,
    labels: Vec<Label>,
    session_labels: Vec<SessionLabel>,
    automations: Vec<Automation>,
    logs: Vec<ConversationLog>,
    executions: Vec<Execution>,
    clients: Vec<Client>,
}

fn message_from_new(new: NewMessage) -> Message {
    Message {
        id: new.id,
        session_id: new.session_id,
        external_id: new.external_id,
        sender: new.sender,
        from_me: new.from_me,
        content: new.content,
        message_type: new.message_type,
        media_url: new.media_url,
        is_processed: new.is_processed,
        created_at: new.created_at,
        updated_at: new.updated_at,
    }
}

/// In-memory [`Repository`].
#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<RepoInner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_bot(&self, bot: Bot) {
        self.inner.lock().unwrap().bots.push(bot);
    }

    pub fn insert_session(&self, session: Session) {
        self.inner.lock().unwrap().sessions.push(session);
    }

    pub fn insert_message_row(&self, message: Message) {
        self.inner.lock().unwrap().messages.push(message);
    }

    pub fn insert_tool(&self, tool: Tool) {
        self.inner.lock().unwrap().tools.push(tool);
    }

    pub fn insert_flow(&self, flow: Flow) {
        self.inner.lock().unwrap().flows.push(flow);
    }

    pub fn insert_step(&self, step: Step) {
        self.inner.lock().unwrap().steps.push(step);
    }

    pub fn insert_trigger(&self, trigger: Trigger) {
        self.inner.lock().unwrap().triggers.push(trigger);
    }

    pub fn insert_label(&self, label: Label) {
        self.inner.lock().unwrap().labels.push(label);
    }

    pub fn insert_session_label(&self, session_label: SessionLabel) {
        self.inner.lock().unwrap().session_labels.push(session_label);
    }

    pub fn insert_automation(&self, automation: Automation) {
        self.inner.lock().unwrap().automations.push(automation);
    }

    pub fn insert_log(&self, log: ConversationLog) {
        self.inner.lock().unwrap().logs.push(log);
    }

    pub fn logs_snapshot(&self) -> Vec<ConversationLog> {
        self.inner.lock().unwrap().logs.clone()
    }

    pub fn messages_snapshot(&self) -> Vec<Message> {
        self.inner.lock().unwrap().messages.clone()
    }

    pub fn executions_snapshot(&self) -> Vec<Execution> {
        self.inner.lock().unwrap().executions.clone()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn bot(&self, bot_id: Uuid) -> Result<Option<Bot>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .bots
            .iter()
            .find(|b| b.id == bot_id)
            .cloned())
    }

    async fn session(&self, session_id: Uuid) -> Result<Option<Session>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .cloned())
    }

    async fn session_by_identifier(
        &self,
        bot_id: Uuid,
        identifier: &str,
    ) -> Result<Option<Session>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sessions
            .iter()
            .find(|s| s.bot_id == bot_id && s.identifier == identifier)
            .cloned())
    }

    async fn find_or_create_session(
        &self,
        bot_id: Uuid,
        identifier: &str,
        name: Option<&str>,
        platform: &str,
    ) -> Result<(Session, bool)> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner
            .sessions
            .iter()
            .find(|s| s.bot_id == bot_id && s.identifier == identifier)
        {
            return Ok((existing.clone(), false));
        }
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            bot_id,
            identifier: identifier.to_string(),
            name: name.map(|s| s.to_string()),
            platform: platform.to_string(),
            status: "CONNECTED".to_string(),
            created_at: now,
            updated_at: now,
        };
        inner.sessions.push(session.clone());
        Ok((session, true))
    }

    async fn upsert_message(&self, msg: NewMessage) -> Result<(Message, bool)> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(external_id) = &msg.external_id {
            if let Some(existing) = inner
                .messages
                .iter()
                .find(|m| m.external_id.as_ref() == Some(external_id))
            {
                return Ok((existing.clone(), false));
            }
        }
        let row = message_from_new(msg);
        inner.messages.push(row.clone());
        Ok((row, true))
    }

    async fn insert_message(&self, msg: NewMessage) -> Result<Message> {
        let row = message_from_new(msg);
        self.inner.lock().unwrap().messages.push(row.clone());
        Ok(row)
    }

    async fn messages_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Message>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| ids.contains(&m.id))
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.created_at);
        Ok(rows)
    }

    async fn message_by_external_id(
        &self,
        bot_id: Uuid,
        external_id: &str,
    ) -> Result<Option<Message>> {
        let inner = self.inner.lock().unwrap();
        let session_ids: Vec<Uuid> = inner
            .sessions
            .iter()
            .filter(|s| s.bot_id == bot_id)
            .map(|s| s.id)
            .collect();
        Ok(inner
            .messages
            .iter()
            .find(|m| {
                m.external_id.as_deref() == Some(external_id)
                    && session_ids.contains(&m.session_id)
            })
            .cloned())
    }

    async fn last_inbound_message(&self, session_id: Uuid) -> Result<Option<Message>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.session_id == session_id && !m.from_me)
            .max_by_key(|m| m.created_at)
            .cloned())
    }

    async fn recent_messages(&self, session_id: Uuid, limit: i64) -> Result<Vec<Message>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.created_at);
        let skip = rows.len().saturating_sub(limit as usize);
        Ok(rows.into_iter().skip(skip).collect())
    }

    async fn mark_messages_processed(&self, ids: &[Uuid]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for message in inner.messages.iter_mut() {
            if ids.contains(&message.id) {
                message.is_processed = true;
            }
        }
        Ok(())
    }

    async fn active_tools(&self, bot_id: Uuid) -> Result<Vec<Tool>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<Tool> = inner
            .tools
            .iter()
            .filter(|t| t.bot_id == bot_id && t.status == TOOL_STATUS_ACTIVE)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    async fn find_active_tool(&self, bot_id: Uuid, name: &str) -> Result<Option<Tool>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .tools
            .iter()
            .find(|t| t.bot_id == bot_id && t.name == name && t.status == TOOL_STATUS_ACTIVE)
            .cloned())
    }

    async fn flow(&self, flow_id: Uuid) -> Result<Option<Flow>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .flows
            .iter()
            .find(|f| f.id == flow_id)
            .cloned())
    }

    async fn flow_steps(&self, flow_id: Uuid) -> Result<Vec<Step>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<Step> = inner
            .steps
            .iter()
            .filter(|s| s.flow_id == flow_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.step_order);
        Ok(rows)
    }

    async fn active_triggers(&self, bot_id: Uuid, scopes: &[&str]) -> Result<Vec<Trigger>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .triggers
            .iter()
            .filter(|t| t.bot_id == bot_id && t.is_active && scopes.contains(&t.scope.as_str()))
            .cloned()
            .collect())
    }

    async fn create_execution(&self, exec: NewExecution) -> Result<Execution> {
        let execution = Execution {
            id: exec.id,
            session_id: exec.session_id,
            flow_id: exec.flow_id,
            status: exec.status,
            current_step: exec.current_step,
            error: exec.error,
            trigger_keyword: exec.trigger_keyword,
            started_at: exec.started_at,
            updated_at: exec.updated_at,
            completed_at: exec.completed_at,
        };
        self.inner.lock().unwrap().executions.push(execution.clone());
        Ok(execution)
    }

    async fn execution(&self, id: Uuid) -> Result<Option<Execution>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .executions
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn running_executions(&self) -> Result<Vec<Execution>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .executions
            .iter()
            .filter(|e| e.status == EXECUTION_RUNNING)
            .cloned()
            .collect())
    }

    async fn update_execution_step(&self, id: Uuid, step: i32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(execution) = inner.executions.iter_mut().find(|e| e.id == id) {
            execution.current_step = step;
            execution.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_execution_error(&self, id: Uuid, error: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(execution) = inner.executions.iter_mut().find(|e| e.id == id) {
            execution.error = Some(error.to_string());
            execution.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn finish_execution(&self, id: Uuid, status: &str, error: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(execution) = inner.executions.iter_mut().find(|e| e.id == id) {
            execution.status = status.to_string();
            execution.error = error.map(|e| e.to_string());
            execution.completed_at = Some(Utc::now());
            execution.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn latest_execution(
        &self,
        session_id: Uuid,
        flow_id: Uuid,
    ) -> Result<Option<Execution>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .executions
            .iter()
            .filter(|e| e.session_id == session_id && e.flow_id == flow_id)
            .max_by_key(|e| e.started_at)
            .cloned())
    }

    async fn execution_count(&self, session_id: Uuid, flow_id: Uuid) -> Result<i64> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .executions
            .iter()
            .filter(|e| e.session_id == session_id && e.flow_id == flow_id)
            .count() as i64)
    }

    async fn execution_count_for_flows(
        &self,
        session_id: Uuid,
        flow_ids: &[Uuid],
    ) -> Result<i64> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .executions
            .iter()
            .filter(|e| e.session_id == session_id && flow_ids.contains(&e.flow_id))
            .count() as i64)
    }

    async fn labels_for_bot(&self, bot_id: Uuid) -> Result<Vec<Label>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .labels
            .iter()
            .filter(|l| l.bot_id == bot_id)
            .cloned()
            .collect())
    }

    async fn labels_for_session(&self, session_id: Uuid) -> Result<Vec<Label>> {
        let inner = self.inner.lock().unwrap();
        let label_ids: Vec<Uuid> = inner
            .session_labels
            .iter()
            .filter(|sl| sl.session_id == session_id)
            .map(|sl| sl.label_id)
            .collect();
        Ok(inner
            .labels
            .iter()
            .filter(|l| label_ids.contains(&l.id))
            .cloned()
            .collect())
    }

    async fn session_label_count(&self, label_id: Uuid) -> Result<i64> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .session_labels
            .iter()
            .filter(|sl| sl.label_id == label_id)
            .count() as i64)
    }

    async fn sessions_with_label(&self, bot_id: Uuid, label_id: Uuid) -> Result<Vec<Session>> {
        let inner = self.inner.lock().unwrap();
        let session_ids: Vec<Uuid> = inner
            .session_labels
            .iter()
            .filter(|sl| sl.label_id == label_id)
            .map(|sl| sl.session_id)
            .collect();
        Ok(inner
            .sessions
            .iter()
            .filter(|s| s.bot_id == bot_id && session_ids.contains(&s.id))
            .cloned()
            .collect())
    }

    async fn sessions_without_labels(&self, bot_id: Uuid) -> Result<Vec<Session>> {
        let inner = self.inner.lock().unwrap();
        let labelled: Vec<Uuid> = inner.session_labels.iter().map(|sl| sl.session_id).collect();
        Ok(inner
            .sessions
            .iter()
            .filter(|s| s.bot_id == bot_id && !labelled.contains(&s.id))
            .cloned()
            .collect())
    }

    async fn add_session_label(&self, session_id: Uuid, label_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let exists = inner
            .session_labels
            .iter()
            .any(|sl| sl.session_id == session_id && sl.label_id == label_id);
        if !exists {
            inner.session_labels.push(SessionLabel {
                id: Uuid::new_v4(),
                session_id,
                label_id,
                created_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn remove_session_label(&self, session_id: Uuid, label_id: Uuid) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .session_labels
            .retain(|sl| !(sl.session_id == session_id && sl.label_id == label_id));
        Ok(())
    }

    async fn enabled_automations(&self) -> Result<Vec<Automation>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .automations
            .iter()
            .filter(|a| a.enabled)
            .cloned()
            .collect())
    }

    async fn append_conversation_log(&self, log: NewConversationLog) -> Result<()> {
        self.inner.lock().unwrap().logs.push(ConversationLog {
            id: log.id,
            session_id: log.session_id,
            role: log.role,
            content: log.content,
            tool_name: log.tool_name,
            tool_args: log.tool_args,
            tool_call_ref: log.tool_call_ref,
            model: log.model,
            tokens_used: log.tokens_used,
            created_at: log.created_at,
        });
        Ok(())
    }

    async fn conversation_logs_since(
        &self,
        session_id: Uuid,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ConversationLog>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<ConversationLog> = inner
            .logs
            .iter()
            .filter(|l| l.session_id == session_id && l.created_at >= since)
            .cloned()
            .collect();
        rows.sort_by_key(|l| l.created_at);
        let skip = rows.len().saturating_sub(limit as usize);
        Ok(rows.into_iter().skip(skip).collect())
    }

    async fn delete_conversation_logs(&self, session_id: Uuid) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .logs
            .retain(|l| l.session_id != session_id);
        Ok(())
    }

    async fn tag_assistant_logs(
        &self,
        session_id: Uuid,
        model: &str,
        tokens: i32,
        limit: i64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut ids: Vec<(DateTime<Utc>, Uuid)> = inner
            .logs
            .iter()
            .filter(|l| l.session_id == session_id && l.role == "assistant")
            .map(|l| (l.created_at, l.id))
            .collect();
        ids.sort_by_key(|(at, _)| std::cmp::Reverse(*at));
        let chosen: Vec<Uuid> = ids.into_iter().take(limit as usize).map(|(_, id)| id).collect();
        for log in inner.logs.iter_mut() {
            if chosen.contains(&log.id) {
                log.model = Some(model.to_string());
                log.tokens_used = Some(tokens);
            }
        }
        Ok(())
    }

    async fn find_client_by_phone(&self, bot_id: Uuid, phone: &str) -> Result<Option<Client>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .clients
            .iter()
            .find(|c| c.bot_id == bot_id && c.phone == phone)
            .cloned())
    }

    async fn create_client(&self, client: NewClient) -> Result<Client> {
        let row = Client {
            id: client.id,
            bot_id: client.bot_id,
            phone: client.phone,
            full_name: client.full_name,
            curp: client.curp,
            email: client.email,
            credentials: client.credentials,
            created_at: client.created_at,
            updated_at: client.updated_at,
        };
        self.inner.lock().unwrap().clients.push(row.clone());
        Ok(row)
    }

    async fn set_client_credentials(
        &self,
        client_id: Uuid,
        credentials: serde_json::Value,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(client) = inner.clients.iter_mut().find(|c| c.id == client_id) {
            client.credentials = Some(credentials);
            client.updated_at = Utc::now();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Send {
        bot_id: Uuid,
        identifier: String,
        payload: OutgoingPayload,
    },
    Step {
        bot_id: Uuid,
        identifier: String,
        payload: OutgoingPayload,
        execution_id: Uuid,
        step_order: i32,
    },
    MarkRead {
        identifier: String,
        external_ids: Vec<String>,
    },
    Presence {
        identifier: String,
        presence: Presence,
    },
    AddLabel {
        identifier: String,
        wa_label_id: String,
    },
    RemoveLabel {
        identifier: String,
        wa_label_id: String,
    },
    SyncLabels {
        bot_id: Uuid,
    },
    StartSession {
        bot_id: Uuid,
    },
    StopSession {
        bot_id: Uuid,
    },
    Shutdown,
}

/// Transport fake recording every call in order.
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<TransportCall>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Send {
                    payload: OutgoingPayload::Text { text },
                    ..
                } => Some(text),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn start_session(&self, bot_id: Uuid) -> Result<()> {
        self.record(TransportCall::StartSession { bot_id });
        Ok(())
    }

    async fn stop_session(&self, bot_id: Uuid) -> Result<()> {
        self.record(TransportCall::StopSession { bot_id });
        Ok(())
    }

    async fn send_message(
        &self,
        bot_id: Uuid,
        identifier: &str,
        payload: OutgoingPayload,
    ) -> Result<()> {
        self.record(TransportCall::Send {
            bot_id,
            identifier: identifier.to_string(),
            payload,
        });
        Ok(())
    }

    async fn send_step(
        &self,
        bot_id: Uuid,
        identifier: &str,
        payload: OutgoingPayload,
        execution_id: Uuid,
        step_order: i32,
    ) -> Result<()> {
        self.record(TransportCall::Step {
            bot_id,
            identifier: identifier.to_string(),
            payload,
            execution_id,
            step_order,
        });
        Ok(())
    }

    async fn mark_read(
        &self,
        _bot_id: Uuid,
        identifier: &str,
        external_ids: &[String],
    ) -> Result<()> {
        self.record(TransportCall::MarkRead {
            identifier: identifier.to_string(),
            external_ids: external_ids.to_vec(),
        });
        Ok(())
    }

    async fn send_presence(
        &self,
        _bot_id: Uuid,
        identifier: &str,
        presence: Presence,
    ) -> Result<()> {
        self.record(TransportCall::Presence {
            identifier: identifier.to_string(),
            presence,
        });
        Ok(())
    }

    async fn add_chat_label(
        &self,
        _bot_id: Uuid,
        identifier: &str,
        wa_label_id: &str,
    ) -> Result<()> {
        self.record(TransportCall::AddLabel {
            identifier: identifier.to_string(),
            wa_label_id: wa_label_id.to_string(),
        });
        Ok(())
    }

    async fn remove_chat_label(
        &self,
        _bot_id: Uuid,
        identifier: &str,
        wa_label_id: &str,
    ) -> Result<()> {
        self.record(TransportCall::RemoveLabel {
            identifier: identifier.to_string(),
            wa_label_id: wa_label_id.to_string(),
        });
        Ok(())
    }

    async fn sync_labels(&self, bot_id: Uuid) -> Result<()> {
        self.record(TransportCall::SyncLabels { bot_id });
        Ok(())
    }

    async fn shutdown_all(&self) -> Result<()> {
        self.record(TransportCall::Shutdown);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Provider fake that replays a scripted queue of responses and records
/// every request it saw.
pub struct ScriptedProvider {
    name: String,
    responses: Mutex<VecDeque<Result<ChatResponse, String>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_text(&self, content: &str) {
        self.responses.lock().unwrap().push_back(Ok(ChatResponse {
            content: Some(content.to_string()),
            ..Default::default()
        }));
    }

    pub fn push_tool_calls(&self, content: Option<&str>, calls: Vec<ToolCall>) {
        self.responses.lock().unwrap().push_back(Ok(ChatResponse {
            content: content.map(|c| c.to_string()),
            tool_calls: calls,
            usage: None,
        }));
    }

    pub fn push_error(&self, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(message.into()),
            None => Ok(ChatResponse::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

/// Media fake returning fixed text per modality.
pub struct FakeMedia {
    pub transcript: String,
    pub description: String,
    pub pdf_text: String,
}

impl Default for FakeMedia {
    fn default() -> Self {
        Self {
            transcript: "hola desde audio".to_string(),
            description: "una foto de un recibo".to_string(),
            pdf_text: "contenido del documento".to_string(),
        }
    }
}

#[async_trait]
impl MediaProcessor for FakeMedia {
    async fn transcribe_audio(&self, _location: &str) -> Result<String> {
        Ok(self.transcript.clone())
    }

    async fn describe_image(&self, _location: &str) -> Result<String> {
        Ok(self.description.clone())
    }

    async fn extract_pdf_text(&self, _location: &str) -> Result<String> {
        Ok(self.pdf_text.clone())
    }
}

// ---------------------------------------------------------------------------
// Model builders
// ---------------------------------------------------------------------------

pub fn sample_bot() -> Bot {
    let now = Utc::now();
    Bot {
        id: Uuid::new_v4(),
        name: "Bot de pruebas".to_string(),
        ai_provider: "GEMINI".to_string(),
        ai_model: "gemini-2.0-flash".to_string(),
        system_prompt: None,
        temperature: None,
        message_delay_ms: 0,
        ignored_labels: Vec::new(),
        ignore_groups: false,
        ai_enabled: true,
        created_at: now,
        updated_at: now,
    }
}

pub fn sample_session(bot: &Bot) -> Session {
    let now = Utc::now();
    Session {
        id: Uuid::new_v4(),
        bot_id: bot.id,
        identifier: "5215512345678@s.whatsapp.net".to_string(),
        name: Some("Cliente".to_string()),
        platform: "WHATSAPP".to_string(),
        status: "CONNECTED".to_string(),
        created_at: now,
        updated_at: now,
    }
}

pub fn inbound_message(session: &Session, external_id: Option<&str>, content: &str) -> Message {
    let mut new = NewMessage::inbound(
        session.id,
        external_id.map(|s| s.to_string()),
        "5215512345678@s.whatsapp.net",
        content,
        MessageKind::Text,
        None,
    );
    new.is_processed = false;
    message_from_new(new)
}
