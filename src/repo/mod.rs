//! Persistent storage seam.
//!
//! The pipeline consumes storage through the [`Repository`] trait;
//! [`PgRepository`] is the diesel/Postgres implementation. Blocking diesel
//! work runs on the blocking pool.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use uuid::Uuid;

use crate::shared::models::*;
use crate::shared::utils::DbPool;

#[async_trait]
pub trait Repository: Send + Sync {
    async fn bot(&self, bot_id: Uuid) -> Result<Option<Bot>>;

    async fn session(&self, session_id: Uuid) -> Result<Option<Session>>;
    async fn session_by_identifier(&self, bot_id: Uuid, identifier: &str)
        -> Result<Option<Session>>;
    /// Get-or-create under the `(bot_id, identifier)` unique key. A loser of
    /// the create race re-reads and returns the existing row. The bool is
    /// true when this call created the session.
    async fn find_or_create_session(
        &self,
        bot_id: Uuid,
        identifier: &str,
        name: Option<&str>,
        platform: &str,
    ) -> Result<(Session, bool)>;

    /// Atomic upsert on `external_id`. The bool is true when the row was
    /// created by this call; a duplicate external id resolves to the
    /// existing row with false.
    async fn upsert_message(&self, msg: NewMessage) -> Result<(Message, bool)>;
    async fn insert_message(&self, msg: NewMessage) -> Result<Message>;
    async fn messages_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Message>>;
    async fn message_by_external_id(
        &self,
        bot_id: Uuid,
        external_id: &str,
    ) -> Result<Option<Message>>;
    async fn last_inbound_message(&self, session_id: Uuid) -> Result<Option<Message>>;
    async fn recent_messages(&self, session_id: Uuid, limit: i64) -> Result<Vec<Message>>;
    async fn mark_messages_processed(&self, ids: &[Uuid]) -> Result<()>;

    async fn active_tools(&self, bot_id: Uuid) -> Result<Vec<Tool>>;
    async fn find_active_tool(&self, bot_id: Uuid, name: &str) -> Result<Option<Tool>>;

    async fn flow(&self, flow_id: Uuid) -> Result<Option<Flow>>;
    async fn flow_steps(&self, flow_id: Uuid) -> Result<Vec<Step>>;
    async fn active_triggers(&self, bot_id: Uuid, scopes: &[&str]) -> Result<Vec<Trigger>>;

    async fn create_execution(&self, exec: NewExecution) -> Result<Execution>;
    async fn execution(&self, id: Uuid) -> Result<Option<Execution>>;
    async fn running_executions(&self) -> Result<Vec<Execution>>;
    async fn update_execution_step(&self, id: Uuid, step: i32) -> Result<()>;
    async fn record_execution_error(&self, id: Uuid, error: &str) -> Result<()>;
    async fn finish_execution(&self, id: Uuid, status: &str, error: Option<&str>) -> Result<()>;
    async fn latest_execution(&self, session_id: Uuid, flow_id: Uuid)
        -> Result<Option<Execution>>;
    async fn execution_count(&self, session_id: Uuid, flow_id: Uuid) -> Result<i64>;
    /// Executions the session already ran for any of the given flows.
    async fn execution_count_for_flows(&self, session_id: Uuid, flow_ids: &[Uuid])
        -> Result<i64>;

    async fn labels_for_bot(&self, bot_id: Uuid) -> Result<Vec<Label>>;
    async fn labels_for_session(&self, session_id: Uuid) -> Result<Vec<Label>>;
    async fn session_label_count(&self, label_id: Uuid) -> Result<i64>;
    async fn sessions_with_label(&self, bot_id: Uuid, label_id: Uuid) -> Result<Vec<Session>>;
    async fn sessions_without_labels(&self, bot_id: Uuid) -> Result<Vec<Session>>;
    async fn add_session_label(&self, session_id: Uuid, label_id: Uuid) -> Result<()>;
    async fn remove_session_label(&self, session_id: Uuid, label_id: Uuid) -> Result<()>;

    async fn enabled_automations(&self) -> Result<Vec<Automation>>;

    async fn append_conversation_log(&self, log: NewConversationLog) -> Result<()>;
    async fn conversation_logs_since(
        &self,
        session_id: Uuid,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ConversationLog>>;
    async fn delete_conversation_logs(&self, session_id: Uuid) -> Result<()>;
    /// Tag the newest `limit` assistant log rows with the model and token
    /// count of the turn that produced them.
    async fn tag_assistant_logs(
        &self,
        session_id: Uuid,
        model: &str,
        tokens: i32,
        limit: i64,
    ) -> Result<()>;

    async fn find_client_by_phone(&self, bot_id: Uuid, phone: &str) -> Result<Option<Client>>;
    async fn create_client(&self, client: NewClient) -> Result<Client>;
    async fn set_client_credentials(
        &self,
        client_id: Uuid,
        credentials: serde_json::Value,
    ) -> Result<()>;
}

pub struct PgRepository {
    pool: DbPool,
}

impl PgRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

fn is_unique_violation(e: &diesel::result::Error) -> bool {
    matches!(
        e,
        diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)
    )
}

#[async_trait]
impl Repository for PgRepository {
    async fn bot(&self, bot_id: Uuid) -> Result<Option<Bot>> {
        self.blocking(move |conn| {
            Ok(bots::table
                .find(bot_id)
                .select(Bot::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn session(&self, session_id: Uuid) -> Result<Option<Session>> {
        self.blocking(move |conn| {
            Ok(sessions::table
                .find(session_id)
                .select(Session::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn session_by_identifier(
        &self,
        bot_id: Uuid,
        identifier: &str,
    ) -> Result<Option<Session>> {
        let identifier = identifier.to_string();
        self.blocking(move |conn| {
            Ok(sessions::table
                .filter(sessions::bot_id.eq(bot_id))
                .filter(sessions::identifier.eq(identifier))
                .select(Session::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn find_or_create_session(
        &self,
        bot_id: Uuid,
        identifier: &str,
        name: Option<&str>,
        platform: &str,
    ) -> Result<(Session, bool)> {
        let identifier = identifier.to_string();
        let name = name.map(|s| s.to_string());
        let platform = platform.to_string();
        self.blocking(move |conn| {
            if let Some(existing) = sessions::table
                .filter(sessions::bot_id.eq(bot_id))
                .filter(sessions::identifier.eq(&identifier))
                .select(Session::as_select())
                .first(conn)
                .optional()?
            {
                return Ok((existing, false));
            }

            let now = Utc::now();
            let inserted = diesel::insert_into(sessions::table)
                .values((
                    sessions::id.eq(Uuid::new_v4()),
                    sessions::bot_id.eq(bot_id),
                    sessions::identifier.eq(&identifier),
                    sessions::name.eq(&name),
                    sessions::platform.eq(&platform),
                    sessions::status.eq("CONNECTED"),
                    sessions::created_at.eq(now),
                    sessions::updated_at.eq(now),
                ))
                .returning(Session::as_returning())
                .get_result(conn);

            match inserted {
                Ok(session) => Ok((session, true)),
                // Lost the create race: re-read and use the winner's row.
                Err(e) if is_unique_violation(&e) => {
                    let existing = sessions::table
                        .filter(sessions::bot_id.eq(bot_id))
                        .filter(sessions::identifier.eq(&identifier))
                        .select(Session::as_select())
                        .first(conn)?;
                    Ok((existing, false))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn upsert_message(&self, msg: NewMessage) -> Result<(Message, bool)> {
        self.blocking(move |conn| {
            let inserted_at = msg.created_at;
            let row: Message = diesel::insert_into(messages::table)
                .values(&msg)
                .on_conflict(messages::external_id)
                .do_update()
                .set(messages::updated_at.eq(msg.updated_at))
                .returning(Message::as_returning())
                .get_result(conn)?;
            let created = row.created_at == inserted_at;
            Ok((row, created))
        })
        .await
    }

    async fn insert_message(&self, msg: NewMessage) -> Result<Message> {
        self.blocking(move |conn| {
            Ok(diesel::insert_into(messages::table)
                .values(&msg)
                .returning(Message::as_returning())
                .get_result(conn)?)
        })
        .await
    }

    async fn messages_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Message>> {
        let ids = ids.to_vec();
        self.blocking(move |conn| {
            Ok(messages::table
                .filter(messages::id.eq_any(ids))
                .order(messages::created_at.asc())
                .select(Message::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn message_by_external_id(
        &self,
        bot_id: Uuid,
        external_id: &str,
    ) -> Result<Option<Message>> {
        let external_id = external_id.to_string();
        self.blocking(move |conn| {
            Ok(messages::table
                .inner_join(sessions::table)
                .filter(sessions::bot_id.eq(bot_id))
                .filter(messages::external_id.eq(external_id))
                .select(Message::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn last_inbound_message(&self, session_id: Uuid) -> Result<Option<Message>> {
        self.blocking(move |conn| {
            Ok(messages::table
                .filter(messages::session_id.eq(session_id))
                .filter(messages::from_me.eq(false))
                .order(messages::created_at.desc())
                .select(Message::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn recent_messages(&self, session_id: Uuid, limit: i64) -> Result<Vec<Message>> {
        self.blocking(move |conn| {
            let mut rows: Vec<Message> = messages::table
                .filter(messages::session_id.eq(session_id))
                .order(messages::created_at.desc())
                .limit(limit)
                .select(Message::as_select())
                .load(conn)?;
            rows.reverse();
            Ok(rows)
        })
        .await
    }

    async fn mark_messages_processed(&self, ids: &[Uuid]) -> Result<()> {
        let ids = ids.to_vec();
        self.blocking(move |conn| {
            diesel::update(messages::table.filter(messages::id.eq_any(ids)))
                .set((
                    messages::is_processed.eq(true),
                    messages::updated_at.eq(Utc::now()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn active_tools(&self, bot_id: Uuid) -> Result<Vec<Tool>> {
        self.blocking(move |conn| {
            Ok(tools::table
                .filter(tools::bot_id.eq(bot_id))
                .filter(tools::status.eq(TOOL_STATUS_ACTIVE))
                .order(tools::name.asc())
                .select(Tool::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn find_active_tool(&self, bot_id: Uuid, name: &str) -> Result<Option<Tool>> {
        let name = name.to_string();
        self.blocking(move |conn| {
            Ok(tools::table
                .filter(tools::bot_id.eq(bot_id))
                .filter(tools::name.eq(name))
                .filter(tools::status.eq(TOOL_STATUS_ACTIVE))
                .select(Tool::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn flow(&self, flow_id: Uuid) -> Result<Option<Flow>> {
        self.blocking(move |conn| {
            Ok(flows::table
                .find(flow_id)
                .select(Flow::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn flow_steps(&self, flow_id: Uuid) -> Result<Vec<Step>> {
        self.blocking(move |conn| {
            Ok(steps::table
                .filter(steps::flow_id.eq(flow_id))
                .order(steps::step_order.asc())
                .select(Step::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn active_triggers(&self, bot_id: Uuid, scopes: &[&str]) -> Result<Vec<Trigger>> {
        let scopes: Vec<String> = scopes.iter().map(|s| s.to_string()).collect();
        self.blocking(move |conn| {
            Ok(triggers::table
                .filter(triggers::bot_id.eq(bot_id))
                .filter(triggers::is_active.eq(true))
                .filter(triggers::scope.eq_any(scopes))
                .select(Trigger::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn create_execution(&self, exec: NewExecution) -> Result<Execution> {
        self.blocking(move |conn| {
            Ok(diesel::insert_into(executions::table)
                .values(&exec)
                .returning(Execution::as_returning())
                .get_result(conn)?)
        })
        .await
    }

    async fn execution(&self, id: Uuid) -> Result<Option<Execution>> {
        self.blocking(move |conn| {
            Ok(executions::table
                .find(id)
                .select(Execution::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn running_executions(&self) -> Result<Vec<Execution>> {
        self.blocking(move |conn| {
            Ok(executions::table
                .filter(executions::status.eq(EXECUTION_RUNNING))
                .select(Execution::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn update_execution_step(&self, id: Uuid, step: i32) -> Result<()> {
        self.blocking(move |conn| {
            diesel::update(executions::table.find(id))
                .set((
                    executions::current_step.eq(step),
                    executions::updated_at.eq(Utc::now()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn record_execution_error(&self, id: Uuid, error: &str) -> Result<()> {
        let error = error.to_string();
        self.blocking(move |conn| {
            diesel::update(executions::table.find(id))
                .set((
                    executions::error.eq(error),
                    executions::updated_at.eq(Utc::now()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn finish_execution(&self, id: Uuid, status: &str, error: Option<&str>) -> Result<()> {
        let status = status.to_string();
        let error = error.map(|e| e.to_string());
        self.blocking(move |conn| {
            let now = Utc::now();
            diesel::update(executions::table.find(id))
                .set((
                    executions::status.eq(status),
                    executions::error.eq(error),
                    executions::updated_at.eq(now),
                    executions::completed_at.eq(Some(now)),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn latest_execution(
        &self,
        session_id: Uuid,
        flow_id: Uuid,
    ) -> Result<Option<Execution>> {
        self.blocking(move |conn| {
            Ok(executions::table
                .filter(executions::session_id.eq(session_id))
                .filter(executions::flow_id.eq(flow_id))
                .order(executions::started_at.desc())
                .select(Execution::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn execution_count(&self, session_id: Uuid, flow_id: Uuid) -> Result<i64> {
        self.blocking(move |conn| {
            Ok(executions::table
                .filter(executions::session_id.eq(session_id))
                .filter(executions::flow_id.eq(flow_id))
                .count()
                .get_result(conn)?)
        })
        .await
    }

    async fn execution_count_for_flows(
        &self,
        session_id: Uuid,
        flow_ids: &[Uuid],
    ) -> Result<i64> {
        let flow_ids = flow_ids.to_vec();
        self.blocking(move |conn| {
            Ok(executions::table
                .filter(executions::session_id.eq(session_id))
                .filter(executions::flow_id.eq_any(flow_ids))
                .count()
                .get_result(conn)?)
        })
        .await
    }

    async fn labels_for_bot(&self, bot_id: Uuid) -> Result<Vec<Label>> {
        self.blocking(move |conn| {
            Ok(labels::table
                .filter(labels::bot_id.eq(bot_id))
                .order(labels::name.asc())
                .select(Label::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn labels_for_session(&self, session_id: Uuid) -> Result<Vec<Label>> {
        self.blocking(move |conn| {
            Ok(labels::table
                .inner_join(session_labels::table)
                .filter(session_labels::session_id.eq(session_id))
                .select(Label::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn session_label_count(&self, label_id: Uuid) -> Result<i64> {
        self.blocking(move |conn| {
            Ok(session_labels::table
                .filter(session_labels::label_id.eq(label_id))
                .count()
                .get_result(conn)?)
        })
        .await
    }

    async fn sessions_with_label(&self, bot_id: Uuid, label_id: Uuid) -> Result<Vec<Session>> {
        self.blocking(move |conn| {
            Ok(sessions::table
                .inner_join(session_labels::table)
                .filter(sessions::bot_id.eq(bot_id))
                .filter(session_labels::label_id.eq(label_id))
                .select(Session::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn sessions_without_labels(&self, bot_id: Uuid) -> Result<Vec<Session>> {
        use diesel::dsl::{exists, not};
        self.blocking(move |conn| {
            Ok(sessions::table
                .filter(sessions::bot_id.eq(bot_id))
                .filter(not(exists(
                    session_labels::table.filter(session_labels::session_id.eq(sessions::id)),
                )))
                .select(Session::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn add_session_label(&self, session_id: Uuid, label_id: Uuid) -> Result<()> {
        self.blocking(move |conn| {
            diesel::insert_into(session_labels::table)
                .values((
                    session_labels::id.eq(Uuid::new_v4()),
                    session_labels::session_id.eq(session_id),
                    session_labels::label_id.eq(label_id),
                    session_labels::created_at.eq(Utc::now()),
                ))
                .on_conflict((session_labels::session_id, session_labels::label_id))
                .do_nothing()
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn remove_session_label(&self, session_id: Uuid, label_id: Uuid) -> Result<()> {
        self.blocking(move |conn| {
            diesel::delete(
                session_labels::table
                    .filter(session_labels::session_id.eq(session_id))
                    .filter(session_labels::label_id.eq(label_id)),
            )
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn enabled_automations(&self) -> Result<Vec<Automation>> {
        self.blocking(move |conn| {
            Ok(automations::table
                .filter(automations::enabled.eq(true))
                .select(Automation::as_select())
                .load(conn)?)
        })
        .await
    }

    async fn append_conversation_log(&self, log: NewConversationLog) -> Result<()> {
        self.blocking(move |conn| {
            diesel::insert_into(conversation_logs::table)
                .values(&log)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn conversation_logs_since(
        &self,
        session_id: Uuid,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ConversationLog>> {
        self.blocking(move |conn| {
            let mut rows: Vec<ConversationLog> = conversation_logs::table
                .filter(conversation_logs::session_id.eq(session_id))
                .filter(conversation_logs::created_at.ge(since))
                .order(conversation_logs::created_at.desc())
                .limit(limit)
                .select(ConversationLog::as_select())
                .load(conn)?;
            rows.reverse();
            Ok(rows)
        })
        .await
    }

    async fn delete_conversation_logs(&self, session_id: Uuid) -> Result<()> {
        self.blocking(move |conn| {
            diesel::delete(
                conversation_logs::table.filter(conversation_logs::session_id.eq(session_id)),
            )
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn tag_assistant_logs(
        &self,
        session_id: Uuid,
        model: &str,
        tokens: i32,
        limit: i64,
    ) -> Result<()> {
        let model = model.to_string();
        self.blocking(move |conn| {
            let ids: Vec<Uuid> = conversation_logs::table
                .filter(conversation_logs::session_id.eq(session_id))
                .filter(conversation_logs::role.eq("assistant"))
                .order(conversation_logs::created_at.desc())
                .limit(limit)
                .select(conversation_logs::id)
                .load(conn)?;
            diesel::update(conversation_logs::table.filter(conversation_logs::id.eq_any(ids)))
                .set((
                    conversation_logs::model.eq(model),
                    conversation_logs::tokens_used.eq(tokens),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn find_client_by_phone(&self, bot_id: Uuid, phone: &str) -> Result<Option<Client>> {
        let phone = phone.to_string();
        self.blocking(move |conn| {
            Ok(clients::table
                .filter(clients::bot_id.eq(bot_id))
                .filter(clients::phone.eq(phone))
                .select(Client::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn create_client(&self, client: NewClient) -> Result<Client> {
        self.blocking(move |conn| {
            Ok(diesel::insert_into(clients::table)
                .values(&client)
                .returning(Client::as_returning())
                .get_result(conn)?)
        })
        .await
    }

    async fn set_client_credentials(
        &self,
        client_id: Uuid,
        credentials: serde_json::Value,
    ) -> Result<()> {
        self.blocking(move |conn| {
            diesel::update(clients::table.find(client_id))
                .set((
                    clients::credentials.eq(Some(credentials)),
                    clients::updated_at.eq(Utc::now()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }
}
