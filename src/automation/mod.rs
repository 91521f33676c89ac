//! Label-driven inactivity automation sweeper.
//!
//! Periodically scans sessions that went quiet under a label filter and
//! injects a synthetic user turn. An idempotency lease in the KV store
//! bounds each (automation, session) pair to one nudge per timeout window.

use anyhow::Result;
use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::engine::AiEngine;
use crate::kv::KvStore;
use crate::repo::Repository;
use crate::shared::models::{Automation, Bot, Message, MessageKind, Session};

pub struct AutomationSweeper {
    repo: Arc<dyn Repository>,
    kv: Arc<dyn KvStore>,
    engine: Arc<AiEngine>,
    interval: Duration,
}

impl AutomationSweeper {
    pub fn new(
        repo: Arc<dyn Repository>,
        kv: Arc<dyn KvStore>,
        engine: Arc<AiEngine>,
        interval: Duration,
    ) -> Self {
        Self {
            repo,
            kv,
            engine,
            interval,
        }
    }

    pub async fn spawn(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once().await {
                error!("Automation sweep failed: {}", e);
            }
        }
    }

    pub async fn run_once(&self) -> Result<()> {
        let automations = self.repo.enabled_automations().await?;
        for automation in &automations {
            if automation.event != "INACTIVITY" {
                continue;
            }
            let Some(bot) = self.repo.bot(automation.bot_id).await? else {
                continue;
            };
            if !bot.ai_enabled {
                continue;
            }
            if let Err(e) = self.sweep_automation(&bot, automation).await {
                warn!("Automation '{}' sweep failed: {}", automation.name, e);
            }
        }
        Ok(())
    }

    async fn sweep_automation(&self, bot: &Bot, automation: &Automation) -> Result<()> {
        let candidates = match &automation.label_name {
            Some(label_name) => {
                let labels = self.repo.labels_for_bot(bot.id).await?;
                let Some(label) = labels
                    .iter()
                    .find(|l| l.name.eq_ignore_ascii_case(label_name))
                else {
                    warn!(
                        "Automation '{}' references unknown label '{}'",
                        automation.name, label_name
                    );
                    return Ok(());
                };
                let mut sessions = self.repo.sessions_with_label(bot.id, label.id).await?;
                // Sessions also carrying an ignored label are off-limits.
                if !bot.ignored_labels.is_empty() {
                    let mut kept = Vec::with_capacity(sessions.len());
                    for session in sessions {
                        let session_labels = self.repo.labels_for_session(session.id).await?;
                        let ignored = session_labels.iter().any(|l| {
                            bot.ignored_labels
                                .iter()
                                .any(|ignored| ignored.eq_ignore_ascii_case(&l.name))
                        });
                        if !ignored {
                            kept.push(session);
                        }
                    }
                    sessions = kept;
                }
                sessions
            }
            None => self.repo.sessions_without_labels(bot.id).await?,
        };

        let now = Utc::now();
        for session in &candidates {
            let Some(last_inbound) = self.repo.last_inbound_message(session.id).await? else {
                continue;
            };
            let idle_ms = now
                .signed_duration_since(last_inbound.created_at)
                .num_milliseconds();
            if idle_ms < automation.timeout_ms {
                continue;
            }

            // One synthetic turn per window per (automation, session).
            let lease_key = format!("automation:done:{}:{}", automation.id, session.id);
            let acquired = self
                .kv
                .set_nx(
                    &lease_key,
                    "1",
                    Duration::from_millis(automation.timeout_ms.max(0) as u64),
                )
                .await?;
            if !acquired {
                continue;
            }

            info!(
                "Automation '{}' nudging session {} (idle {}ms)",
                automation.name, session.id, idle_ms
            );
            let synthetic = Self::synthetic_message(automation, session);
            if let Err(e) = self
                .engine
                .process_messages(session.id, vec![synthetic])
                .await
            {
                warn!(
                    "Automation '{}' turn failed for session {}: {}",
                    automation.name, session.id, e
                );
            }
        }
        Ok(())
    }

    fn synthetic_message(automation: &Automation, session: &Session) -> Message {
        let now = Utc::now();
        Message {
            id: Uuid::new_v4(),
            session_id: session.id,
            external_id: None,
            sender: "automation".to_string(),
            from_me: false,
            content: format!("[Automation: {}] {}", automation.name, automation.prompt),
            message_type: MessageKind::Text.as_str().to_string(),
            media_url: None,
            is_processed: true,
            created_at: now,
            updated_at: now,
        }
    }
}
