//! Inactivity automation sweeps against the in-memory fakes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use agentserver::automation::AutomationSweeper;
use agentserver::kv::KvStore;
use agentserver::llm::ChatRole;
use agentserver::repo::Repository;
use agentserver::shared::models::{Automation, Label, SessionLabel};
use agentserver::shared::test_utils::{inbound_message, sample_bot, sample_session};
use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

fn automation(bot_id: Uuid, label_name: Option<&str>, timeout_ms: i64) -> Automation {
    let now = Utc::now();
    Automation {
        id: Uuid::new_v4(),
        bot_id,
        name: "seguimiento".to_string(),
        enabled: true,
        event: "INACTIVITY".to_string(),
        label_name: label_name.map(|s| s.to_string()),
        timeout_ms,
        prompt: "¿Sigues ahí?".to_string(),
        created_at: now,
        updated_at: now,
    }
}

fn label(bot_id: Uuid, name: &str) -> Label {
    let now = Utc::now();
    Label {
        id: Uuid::new_v4(),
        bot_id,
        wa_label_id: format!("wa-{}", name),
        name: name.to_string(),
        color: None,
        created_at: now,
        updated_at: now,
    }
}

fn sweeper(h: &common::Harness) -> AutomationSweeper {
    AutomationSweeper::new(
        h.repo.clone() as Arc<dyn Repository>,
        h.kv.clone() as Arc<dyn KvStore>,
        Arc::clone(&h.engine),
        Duration::from_secs(1800),
    )
}

#[tokio::test]
async fn stale_labelled_session_gets_one_nudge_per_window() {
    let h = common::harness();
    let bot = sample_bot();
    let session = sample_session(&bot);
    h.repo.insert_bot(bot.clone());
    h.repo.insert_session(session.clone());

    let followup = label(bot.id, "FOLLOWUP");
    h.repo.insert_label(followup.clone());
    h.repo.insert_session_label(SessionLabel {
        id: Uuid::new_v4(),
        session_id: session.id,
        label_id: followup.id,
        created_at: Utc::now(),
    });

    // Last inbound message two hours old; automation fires after one hour.
    let mut old = inbound_message(&session, Some("e-old"), "hola");
    old.created_at = Utc::now() - ChronoDuration::hours(2);
    h.repo.insert_message_row(old);

    let auto = automation(bot.id, Some("FOLLOWUP"), 3_600_000);
    h.repo.insert_automation(auto.clone());

    h.gemini.push_text("¡Hola! ¿Sigues ahí?");

    let sweeper = sweeper(&h);
    sweeper.run_once().await.unwrap();

    // Synthetic turn dispatched through the engine.
    assert_eq!(h.gemini.call_count(), 1);
    assert_eq!(
        h.transport.sent_texts(),
        vec!["¡Hola! ¿Sigues ahí?".to_string()]
    );

    // The model saw the synthetic automation prompt.
    let request = &h.gemini.requests()[0];
    let user_turn = request
        .messages
        .iter()
        .find(|m| m.role == ChatRole::User)
        .unwrap();
    assert_eq!(
        user_turn.content.as_deref(),
        Some("[Automation: seguimiento] ¿Sigues ahí?")
    );

    // Idempotency lease present; a second sweep inside the window skips.
    let lease = format!("automation:done:{}:{}", auto.id, session.id);
    assert!(h.kv.get(&lease).await.unwrap().is_some());

    sweeper.run_once().await.unwrap();
    assert_eq!(h.gemini.call_count(), 1);
}

#[tokio::test]
async fn fresh_sessions_and_disabled_bots_are_skipped() {
    let h = common::harness();
    let bot = sample_bot();
    let session = sample_session(&bot);
    h.repo.insert_bot(bot.clone());
    h.repo.insert_session(session.clone());

    let followup = label(bot.id, "FOLLOWUP");
    h.repo.insert_label(followup.clone());
    h.repo.insert_session_label(SessionLabel {
        id: Uuid::new_v4(),
        session_id: session.id,
        label_id: followup.id,
        created_at: Utc::now(),
    });

    // Recent inbound message: not stale yet.
    h.repo
        .insert_message_row(inbound_message(&session, Some("e-new"), "hola"));
    h.repo
        .insert_automation(automation(bot.id, Some("FOLLOWUP"), 3_600_000));

    sweeper(&h).run_once().await.unwrap();
    assert_eq!(h.gemini.call_count(), 0);
}

#[tokio::test]
async fn sessions_without_labels_match_unlabelled_automations() {
    let h = common::harness();
    let bot = sample_bot();
    let session = sample_session(&bot);
    h.repo.insert_bot(bot.clone());
    h.repo.insert_session(session.clone());

    let mut old = inbound_message(&session, Some("e-old"), "hola");
    old.created_at = Utc::now() - ChronoDuration::hours(3);
    h.repo.insert_message_row(old);

    h.repo.insert_automation(automation(bot.id, None, 3_600_000));
    h.gemini.push_text("seguimos aquí");

    sweeper(&h).run_once().await.unwrap();
    assert_eq!(h.gemini.call_count(), 1);
}

#[tokio::test]
async fn ignored_labels_exclude_sessions_from_sweeps() {
    let h = common::harness();
    let mut bot = sample_bot();
    bot.ignored_labels = vec!["NO_MOLESTAR".to_string()];
    let session = sample_session(&bot);
    h.repo.insert_bot(bot.clone());
    h.repo.insert_session(session.clone());

    let followup = label(bot.id, "FOLLOWUP");
    let muted = label(bot.id, "NO_MOLESTAR");
    h.repo.insert_label(followup.clone());
    h.repo.insert_label(muted.clone());
    for l in [&followup, &muted] {
        h.repo.insert_session_label(SessionLabel {
            id: Uuid::new_v4(),
            session_id: session.id,
            label_id: l.id,
            created_at: Utc::now(),
        });
    }

    let mut old = inbound_message(&session, Some("e-old"), "hola");
    old.created_at = Utc::now() - ChronoDuration::hours(3);
    h.repo.insert_message_row(old);

    h.repo
        .insert_automation(automation(bot.id, Some("FOLLOWUP"), 3_600_000));

    sweeper(&h).run_once().await.unwrap();
    assert_eq!(h.gemini.call_count(), 0);
}
