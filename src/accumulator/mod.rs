//! Per-session time-debounced batching of inbound messages.
//!
//! A burst of messages from one chat lands as a single batch: each arrival
//! re-arms the session timer, and only the task holding the latest
//! generation flushes. Callers with a zero delay must bypass this entirely.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::shared::models::Message;

struct SessionBuffer {
    messages: Vec<Message>,
    generation: u64,
}

#[derive(Default)]
pub struct Accumulator {
    buffers: Mutex<HashMap<Uuid, SessionBuffer>>,
}

impl Accumulator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append to the session buffer and (re)arm the debounce timer. When
    /// the timer fires with no newer arrival, the buffer is handed to
    /// `flush` in arrival order and cleared atomically.
    pub fn accumulate<F, Fut>(
        self: &Arc<Self>,
        session_id: Uuid,
        message: Message,
        delay: Duration,
        flush: F,
    ) where
        F: FnOnce(Uuid, Vec<Message>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let generation = {
            let mut buffers = self.buffers.lock().unwrap();
            let buffer = buffers.entry(session_id).or_insert_with(|| SessionBuffer {
                messages: Vec::new(),
                generation: 0,
            });
            buffer.messages.push(message);
            buffer.generation += 1;
            buffer.generation
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let batch = {
                let mut buffers = this.buffers.lock().unwrap();
                match buffers.get(&session_id) {
                    // A newer arrival re-armed the timer; let it flush.
                    Some(buffer) if buffer.generation != generation => return,
                    Some(_) => buffers.remove(&session_id).map(|b| b.messages),
                    None => return,
                }
            };
            if let Some(batch) = batch {
                flush(session_id, batch).await;
            }
        });
    }

    /// Forcibly drain every buffer (shutdown path).
    pub async fn flush_all<F, Fut>(&self, flush: F)
    where
        F: Fn(Uuid, Vec<Message>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let drained: Vec<(Uuid, Vec<Message>)> = {
            let mut buffers = self.buffers.lock().unwrap();
            buffers
                .drain()
                .map(|(id, buffer)| (id, buffer.messages))
                .collect()
        };
        for (session_id, messages) in drained {
            if !messages.is_empty() {
                flush(session_id, messages).await;
            }
        }
    }

    /// Number of buffers with outstanding messages.
    pub fn pending_count(&self) -> usize {
        self.buffers
            .lock()
            .unwrap()
            .values()
            .filter(|b| !b.messages.is_empty())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::{MessageKind, NewMessage};
    use tokio::sync::mpsc;

    fn message(session_id: Uuid, content: &str) -> Message {
        let new = NewMessage::inbound(session_id, None, "user", content, MessageKind::Text, None);
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

    #[tokio::test]
    async fn burst_within_window_yields_one_batch_in_order() {
        let accumulator = Accumulator::new();
        let session_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for content in ["uno", "dos", "tres"] {
            let tx = tx.clone();
            accumulator.accumulate(
                session_id,
                message(session_id, content),
                Duration::from_millis(40),
                move |_, batch| async move {
                    let _ = tx.send(batch);
                },
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let batch = rx.recv().await.unwrap();
        let contents: Vec<&str> = batch.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["uno", "dos", "tres"]);
        assert_eq!(accumulator.pending_count(), 0);

        // No second delivery for the same burst.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn new_arrival_resets_the_timer() {
        let accumulator = Accumulator::new();
        let session_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let tx1 = tx.clone();
        accumulator.accumulate(
            session_id,
            message(session_id, "uno"),
            Duration::from_millis(50),
            move |_, batch| async move {
                let _ = tx1.send(batch);
            },
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Still inside the window: the timer must re-arm.
        let tx2 = tx.clone();
        accumulator.accumulate(
            session_id,
            message(session_id, "dos"),
            Duration::from_millis(50),
            move |_, batch| async move {
                let _ = tx2.send(batch);
            },
        );

        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(rx.try_recv().is_err(), "flushed before re-armed deadline");

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn sessions_are_buffered_independently() {
        let accumulator = Accumulator::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for session_id in [a, b] {
            let tx = tx.clone();
            accumulator.accumulate(
                session_id,
                message(session_id, "hola"),
                Duration::from_millis(20),
                move |id, batch| async move {
                    let _ = tx.send((id, batch));
                },
            );
        }
        assert_eq!(accumulator.pending_count(), 2);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let mut ids = vec![first.0, second.0];
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn flush_all_drains_pending_buffers() {
        let accumulator = Accumulator::new();
        let session_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let tx_timer = tx.clone();
        accumulator.accumulate(
            session_id,
            message(session_id, "pendiente"),
            Duration::from_secs(3600),
            move |_, batch| async move {
                let _ = tx_timer.send(batch);
            },
        );

        accumulator
            .flush_all(|_, batch| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(batch);
                }
            })
            .await;

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch[0].content, "pendiente");
        assert_eq!(accumulator.pending_count(), 0);
    }
}
