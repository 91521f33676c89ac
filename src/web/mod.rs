//! HTTP surface: health probe and the SSE event stream.

use axum::{
    extract::{Query, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use futures_util::{future, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::shared::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/events", get(events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "accumulator_pending": state.accumulator.pending_count(),
        "event_subscribers": state.events.subscriber_count(),
    }))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    bot_id: Option<Uuid>,
}

/// Bridge the event bus into an SSE stream, optionally filtered by bot.
/// A lagged subscriber silently drops its backlog (broadcast semantics).
async fn events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let bot_filter = query.bot_id;
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(move |item| {
        let out = match item {
            Ok(event) => {
                let matches = bot_filter
                    .is_none_or(|want| event.bot_id().is_none_or(|got| got == want));
                if matches {
                    SseEvent::default()
                        .event(event.subject())
                        .json_data(&event)
                        .ok()
                        .map(Ok)
                } else {
                    None
                }
            }
            Err(_lagged) => None,
        };
        future::ready(out)
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
