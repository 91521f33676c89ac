//! Tool executor dispatch: built-ins and database-defined flow tools.

mod common;

use agentserver::shared::models::{Flow, Label, Step, Tool};
use agentserver::shared::test_utils::{sample_bot, sample_session, TransportCall};
use agentserver::tools::ToolExecutor;
use agentserver::transport::OutgoingPayload;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn executor(h: &common::Harness) -> ToolExecutor {
    ToolExecutor::new(
        h.repo.clone() as Arc<dyn agentserver::repo::Repository>,
        h.transport.clone() as Arc<dyn agentserver::transport::Transport>,
        h.store.clone(),
        chrono_tz::America::Mexico_City,
    )
}

#[tokio::test]
async fn unknown_tool_reports_not_found() {
    let h = common::harness();
    let bot = sample_bot();
    let session = sample_session(&bot);
    h.repo.insert_bot(bot.clone());
    h.repo.insert_session(session.clone());

    let outcome = executor(&h)
        .execute(&bot, &session, "inexistente", &json!({}))
        .await;
    assert!(!outcome.success);
    assert_eq!(outcome.data, "tool not found or disabled");
}

#[tokio::test]
async fn flow_tool_substitutes_arguments_and_sends_steps() {
    let h = common::harness();
    let bot = sample_bot();
    let session = sample_session(&bot);
    h.repo.insert_bot(bot.clone());
    h.repo.insert_session(session.clone());

    let now = Utc::now();
    let flow_id = Uuid::new_v4();
    h.repo.insert_flow(Flow {
        id: flow_id,
        bot_id: bot.id,
        name: "bienvenida".to_string(),
        description: None,
        cooldown_ms: 0,
        usage_limit: 0,
        excludes_flows: Vec::new(),
        created_at: now,
        updated_at: now,
    });
    h.repo.insert_step(Step {
        id: Uuid::new_v4(),
        flow_id,
        step_type: "TEXT".to_string(),
        content: Some("Hola {{nombre}}, bienvenido".to_string()),
        media_url: None,
        metadata: None,
        delay_ms: 0,
        jitter_pct: 0,
        step_order: 0,
        created_at: now,
        updated_at: now,
    });
    h.repo.insert_step(Step {
        id: Uuid::new_v4(),
        flow_id,
        step_type: "IMAGE".to_string(),
        content: Some("tu folio: {{folio}}".to_string()),
        media_url: Some("https://cdn/banner.png".to_string()),
        metadata: None,
        delay_ms: 0,
        jitter_pct: 0,
        step_order: 1,
        created_at: now,
        updated_at: now,
    });
    h.repo.insert_tool(Tool {
        id: Uuid::new_v4(),
        bot_id: bot.id,
        name: "enviar_bienvenida".to_string(),
        description: "Envia la secuencia de bienvenida".to_string(),
        parameters: json!({"type": "object", "properties": {"nombre": {"type": "string"}}}),
        action_type: "FLOW".to_string(),
        action_config: json!({}),
        status: "ACTIVE".to_string(),
        flow_id: Some(flow_id),
        created_at: now,
        updated_at: now,
    });

    let outcome = executor(&h)
        .execute(
            &bot,
            &session,
            "enviar_bienvenida",
            &json!({"nombre": "Ana", "folio": 42}),
        )
        .await;

    assert!(outcome.success);
    assert!(outcome.data.contains("bienvenida"));

    let calls = h.transport.calls();
    assert!(calls.contains(&TransportCall::Send {
        bot_id: bot.id,
        identifier: session.identifier.clone(),
        payload: OutgoingPayload::Text {
            text: "Hola Ana, bienvenido".to_string()
        },
    }));
    assert!(calls.contains(&TransportCall::Send {
        bot_id: bot.id,
        identifier: session.identifier.clone(),
        payload: OutgoingPayload::Image {
            url: "https://cdn/banner.png".to_string(),
            caption: Some("tu folio: 42".to_string()),
        },
    }));
}

#[tokio::test]
async fn assign_and_remove_label_round_trip() {
    let h = common::harness();
    let bot = sample_bot();
    let session = sample_session(&bot);
    h.repo.insert_bot(bot.clone());
    h.repo.insert_session(session.clone());

    let now = Utc::now();
    let vip = Label {
        id: Uuid::new_v4(),
        bot_id: bot.id,
        wa_label_id: "wa-7".to_string(),
        name: "VIP".to_string(),
        color: Some(2),
        created_at: now,
        updated_at: now,
    };
    h.repo.insert_label(vip.clone());

    let exec = executor(&h);

    // Case-insensitive resolution.
    let outcome = exec
        .execute(&bot, &session, "assign_label", &json!({"label": "vip"}))
        .await;
    assert!(outcome.success, "{}", outcome.data);
    assert!(h.transport.calls().contains(&TransportCall::AddLabel {
        identifier: session.identifier.clone(),
        wa_label_id: "wa-7".to_string(),
    }));

    let outcome = exec
        .execute(&bot, &session, "remove_label", &json!({"label": "VIP"}))
        .await;
    assert!(outcome.success);

    let outcome = exec
        .execute(&bot, &session, "assign_label", &json!({"label": "desconocida"}))
        .await;
    assert!(!outcome.success);
}

#[tokio::test]
async fn reply_to_message_requires_a_message_of_this_bot() {
    let h = common::harness();
    let bot = sample_bot();
    let session = sample_session(&bot);
    h.repo.insert_bot(bot.clone());
    h.repo.insert_session(session.clone());

    // A message that belongs to a different bot must not be quotable.
    let other_bot = sample_bot();
    let mut other_session = sample_session(&other_bot);
    other_session.identifier = "5219998887766@s.whatsapp.net".to_string();
    h.repo.insert_bot(other_bot.clone());
    h.repo.insert_session(other_session.clone());
    h.repo.insert_message_row(
        agentserver::shared::test_utils::inbound_message(&other_session, Some("ajeno"), "hola"),
    );

    let exec = executor(&h);
    let outcome = exec
        .execute(
            &bot,
            &session,
            "reply_to_message",
            &json!({"message_id": "ajeno", "text": "no deberia salir"}),
        )
        .await;
    assert!(!outcome.success);

    // A proper message of this bot quotes fine.
    h.repo.insert_message_row(agentserver::shared::test_utils::inbound_message(
        &session,
        Some("e1"),
        "¿me ayudas?",
    ));
    let outcome = exec
        .execute(
            &bot,
            &session,
            "reply_to_message",
            &json!({"message_id": "e1", "text": "claro"}),
        )
        .await;
    assert!(outcome.success, "{}", outcome.data);

    let quoted = h.transport.calls().into_iter().any(|c| {
        matches!(
            c,
            TransportCall::Send {
                payload: OutgoingPayload::Quote { stanza_id, .. },
                ..
            } if stanza_id == "e1"
        )
    });
    assert!(quoted);
}

#[tokio::test]
async fn send_followup_persists_the_outbound_message() {
    let h = common::harness();
    let bot = sample_bot();
    let session = sample_session(&bot);
    let mut other = sample_session(&bot);
    other.identifier = "5215587654321@s.whatsapp.net".to_string();
    h.repo.insert_bot(bot.clone());
    h.repo.insert_session(session.clone());
    h.repo.insert_session(other.clone());

    let exec = executor(&h);
    let outcome = exec
        .execute(
            &bot,
            &session,
            "send_followup_message",
            &json!({"identifier": other.identifier, "message": "te esperamos mañana"}),
        )
        .await;
    assert!(outcome.success, "{}", outcome.data);

    let persisted = h
        .repo
        .messages_snapshot()
        .into_iter()
        .find(|m| m.session_id == other.id)
        .expect("outbound message persisted");
    assert!(persisted.from_me);
    assert_eq!(persisted.content, "te esperamos mañana");

    // Same-chat targets are rejected.
    let outcome = exec
        .execute(
            &bot,
            &session,
            "send_followup_message",
            &json!({"identifier": session.identifier, "message": "hola"}),
        )
        .await;
    assert!(!outcome.success);
}

#[tokio::test]
async fn client_registration_lifecycle() {
    let h = common::harness();
    let bot = sample_bot();
    let session = sample_session(&bot);
    h.repo.insert_bot(bot.clone());
    h.repo.insert_session(session.clone());

    let exec = executor(&h);

    // Validation failures first.
    let outcome = exec
        .execute(&bot, &session, "register_client", &json!({"phone": "123", "full_name": "Ana"}))
        .await;
    assert!(!outcome.success);
    let outcome = exec
        .execute(
            &bot,
            &session,
            "register_client",
            &json!({"phone": "5215512345678", "full_name": "Ana", "curp": "corta"}),
        )
        .await;
    assert!(!outcome.success);

    // Happy path.
    let outcome = exec
        .execute(
            &bot,
            &session,
            "register_client",
            &json!({
                "phone": "5215512345678",
                "full_name": "Ana García",
                "curp": "GARC800101HDFLRS09",
                "email": "ana@example.com",
            }),
        )
        .await;
    assert!(outcome.success, "{}", outcome.data);

    // Duplicate registration is refused.
    let outcome = exec
        .execute(
            &bot,
            &session,
            "register_client",
            &json!({"phone": "5215512345678", "full_name": "Ana García"}),
        )
        .await;
    assert!(!outcome.success);

    // Lookup sees the record, credentials attach to it.
    let outcome = exec
        .execute(&bot, &session, "lookup_client", &json!({"phone": "5215512345678"}))
        .await;
    assert!(outcome.success);
    assert!(outcome.data.contains("Ana García"));

    let outcome = exec
        .execute(
            &bot,
            &session,
            "save_credentials",
            &json!({"phone": "5215512345678", "username": "ana.g", "password": "s3creta"}),
        )
        .await;
    assert!(outcome.success, "{}", outcome.data);

    let outcome = exec
        .execute(&bot, &session, "lookup_client", &json!({"phone": "5215512345678"}))
        .await;
    assert!(outcome.data.contains("\"has_credentials\":true"));
}

#[tokio::test]
async fn get_current_time_honours_explicit_timezone() {
    let h = common::harness();
    let bot = sample_bot();
    let session = sample_session(&bot);
    h.repo.insert_bot(bot.clone());
    h.repo.insert_session(session.clone());

    let exec = executor(&h);
    let outcome = exec
        .execute(&bot, &session, "get_current_time", &json!({"timezone": "America/Bogota"}))
        .await;
    assert!(outcome.success);
    assert!(outcome.data.contains("America/Bogota"));

    let outcome = exec
        .execute(&bot, &session, "get_current_time", &json!({"timezone": "Marte/Olympus"}))
        .await;
    assert!(!outcome.success);

    let outcome = exec
        .execute(&bot, &session, "get_current_time", &json!({}))
        .await;
    assert!(outcome.data.contains("America/Mexico_City"));
}

#[tokio::test]
async fn clear_conversation_purges_the_store() {
    let h = common::harness();
    let bot = sample_bot();
    let session = sample_session(&bot);
    h.repo.insert_bot(bot.clone());
    h.repo.insert_session(session.clone());

    h.store
        .append(session.id, &agentserver::llm::ChatMessage::user("hola"))
        .await
        .unwrap();

    let exec = executor(&h);
    let outcome = exec
        .execute(&bot, &session, "clear_conversation", &json!({}))
        .await;
    assert!(outcome.success);
    assert!(!h.store.has(session.id).await.unwrap());
}
