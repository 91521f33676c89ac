//! In-process typed pub/sub used to notify SSE subscribers.
//!
//! Backed by a `tokio::sync::broadcast` channel: no persistence, no
//! backpressure beyond the channel capacity. Slow subscribers observe
//! `Lagged` and drop their own excess.

use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    BotQr {
        bot_id: Uuid,
        qr: String,
    },
    BotConnected {
        bot_id: Uuid,
    },
    BotDisconnected {
        bot_id: Uuid,
        reason: Option<String>,
    },
    MessageReceived {
        bot_id: Uuid,
        session_id: Uuid,
        content: String,
    },
    MessageSent {
        bot_id: Uuid,
        session_id: Uuid,
        content: String,
    },
    SessionCreated {
        bot_id: Uuid,
        session_id: Uuid,
        identifier: String,
    },
    SystemLog {
        message: String,
    },
}

impl Event {
    pub fn subject(&self) -> &'static str {
        match self {
            Self::BotQr { .. } => "bot:qr",
            Self::BotConnected { .. } => "bot:connected",
            Self::BotDisconnected { .. } => "bot:disconnected",
            Self::MessageReceived { .. } => "message:received",
            Self::MessageSent { .. } => "message:sent",
            Self::SessionCreated { .. } => "session:created",
            Self::SystemLog { .. } => "system:log",
        }
    }

    pub fn bot_id(&self) -> Option<Uuid> {
        match self {
            Self::BotQr { bot_id, .. }
            | Self::BotConnected { bot_id }
            | Self::BotDisconnected { bot_id, .. }
            | Self::MessageReceived { bot_id, .. }
            | Self::MessageSent { bot_id, .. }
            | Self::SessionCreated { bot_id, .. } => Some(*bot_id),
            Self::SystemLog { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: Event) {
        if let Err(e) = self.tx.send(event) {
            debug!("No subscribers for event: {}", e);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
