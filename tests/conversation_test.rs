//! ConversationStore round-trips, size cap and durable-log reconstruction.

mod common;

use agentserver::engine::EngineSettings;
use agentserver::kv::KvStore;
use agentserver::llm::{ChatMessage, ChatRole};
use agentserver::shared::models::ConversationLog;
use agentserver::shared::test_utils::{sample_bot, sample_session};
use chrono::{Duration as ChronoDuration, Utc};
use common::harness_with;
use uuid::Uuid;

fn log_row(
    session_id: Uuid,
    role: &str,
    content: Option<&str>,
    tool_name: Option<&str>,
    offset_secs: i64,
) -> ConversationLog {
    ConversationLog {
        id: Uuid::new_v4(),
        session_id,
        role: role.to_string(),
        content: content.map(|c| c.to_string()),
        tool_name: tool_name.map(|n| n.to_string()),
        tool_args: None,
        tool_call_ref: None,
        model: None,
        tokens_used: None,
        created_at: Utc::now() - ChronoDuration::seconds(600 - offset_secs),
    }
}

#[tokio::test]
async fn append_then_history_returns_turn_last() {
    let h = common::harness();
    let session_id = Uuid::new_v4();

    h.store
        .append(session_id, &ChatMessage::user("a"))
        .await
        .unwrap();
    h.store
        .append(session_id, &ChatMessage::assistant(Some("b".to_string()), Vec::new()))
        .await
        .unwrap();

    let history = h.store.history(session_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history.last().unwrap().content.as_deref(), Some("b"));

    // Durable log mirrored both turns.
    assert_eq!(h.repo.logs_snapshot().len(), 2);
}

#[tokio::test]
async fn clear_then_has_returns_false() {
    let h = common::harness();
    let session_id = Uuid::new_v4();

    h.store
        .append(session_id, &ChatMessage::user("hola"))
        .await
        .unwrap();
    assert!(h.store.has(session_id).await.unwrap());

    h.store.clear(session_id).await.unwrap();
    assert!(!h.store.has(session_id).await.unwrap());
    assert!(h.repo.logs_snapshot().is_empty());
    assert!(h.store.history(session_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn size_cap_trims_oldest_entries() {
    let h = harness_with(EngineSettings::default(), 5);
    let session_id = Uuid::new_v4();

    for i in 0..12 {
        h.store
            .append(session_id, &ChatMessage::user(format!("m{}", i)))
            .await
            .unwrap();
    }

    let history = h.store.history(session_id).await.unwrap();
    assert_eq!(history.len(), 5);
    // Newest entries survive, oldest are trimmed.
    assert_eq!(history[0].content.as_deref(), Some("m7"));
    assert_eq!(history[4].content.as_deref(), Some("m11"));
}

#[tokio::test]
async fn reconstruction_collapses_tool_rows_and_rehydrates_cache() {
    let h = common::harness();
    let bot = sample_bot();
    let session = sample_session(&bot);
    h.repo.insert_bot(bot);
    h.repo.insert_session(session.clone());

    // Durable log only; the fast cache is empty (evicted).
    h.repo.insert_log(log_row(session.id, "user", Some("a"), None, 0));
    h.repo.insert_log(log_row(session.id, "assistant", Some("b"), None, 1));
    h.repo.insert_log(log_row(session.id, "tool", Some("r"), Some("t"), 2));
    h.repo.insert_log(log_row(session.id, "user", Some("c"), None, 3));

    let history = h.store.history(session.id).await.unwrap();
    let rendered: Vec<(ChatRole, &str)> = history
        .iter()
        .map(|t| (t.role, t.content.as_deref().unwrap_or("")))
        .collect();
    assert_eq!(
        rendered,
        vec![
            (ChatRole::User, "a"),
            (ChatRole::Assistant, "b"),
            (ChatRole::Assistant, "[Previous tool: t → r]"),
            (ChatRole::User, "c"),
        ]
    );

    // Cache rehydrated with the same view.
    assert_eq!(
        h.kv.llen(&format!("conv:{}", session.id)).await.unwrap(),
        4
    );
    let again = h.store.history(session.id).await.unwrap();
    assert_eq!(again.len(), 4);
    assert_eq!(
        again[2].content.as_deref(),
        Some("[Previous tool: t → r]")
    );
}

#[tokio::test]
async fn reconstruction_ignores_rows_older_than_window() {
    let h = common::harness();
    let session_id = Uuid::new_v4();

    let mut stale = log_row(session_id, "user", Some("viejo"), None, 0);
    stale.created_at = Utc::now() - ChronoDuration::days(90);
    h.repo.insert_log(stale);
    h.repo.insert_log(log_row(session_id, "user", Some("reciente"), None, 1));

    let history = h.store.history(session_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content.as_deref(), Some("reciente"));
}
