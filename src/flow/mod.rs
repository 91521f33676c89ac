//! Scripted flow execution.
//!
//! Keyword triggers start an execution; each step is dispatched as a
//! deferred job that sends its payload and schedules the next step. A
//! session that disappears mid-flow fails the execution; a step that
//! merely errors is recorded and skipped.

use anyhow::Result;
use chrono::{Timelike, Utc};
use chrono_tz::Tz;
use log::{error, info, warn};
use rand::Rng;
use serde::Deserialize;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::kv::KvStore;
use crate::repo::Repository;
use crate::shared::models::{
    Bot, Execution, NewExecution, Session, Step, EXECUTION_COMPLETED, EXECUTION_FAILED,
    EXECUTION_RUNNING,
};
use crate::transport::{OutgoingPayload, Transport};

pub mod matcher;

type BoxFut = Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

const FLOW_LOCK_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TimeBranch {
    start_time: String,
    end_time: String,
    #[serde(rename = "type")]
    branch_type: String,
    content: Option<String>,
    media_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConditionalTimeMeta {
    branches: Vec<TimeBranch>,
    fallback: Option<TimeBranch>,
}

fn to_minutes(time: &str) -> Option<u32> {
    let (h, m) = time.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// Window check with midnight crossing (e.g. 22:00-06:00).
fn in_window(current: u32, start: u32, end: u32) -> bool {
    if start < end {
        current >= start && current < end
    } else {
        current >= start || current < end
    }
}

fn branch_payload(branch: &TimeBranch) -> Option<OutgoingPayload> {
    match branch.branch_type.as_str() {
        "TEXT" => branch
            .content
            .clone()
            .map(|text| OutgoingPayload::Text { text }),
        "IMAGE" => branch.media_url.clone().map(|url| OutgoingPayload::Image {
            url,
            caption: branch.content.clone(),
        }),
        "AUDIO" => branch
            .media_url
            .clone()
            .map(|url| OutgoingPayload::Audio { url, ptt: true }),
        _ => None,
    }
}

fn resolve_time_branch(meta: &ConditionalTimeMeta, current_minutes: u32) -> Option<OutgoingPayload> {
    for branch in &meta.branches {
        if let (Some(start), Some(end)) = (to_minutes(&branch.start_time), to_minutes(&branch.end_time)) {
            if in_window(current_minutes, start, end) {
                return branch_payload(branch);
            }
        }
    }
    meta.fallback.as_ref().and_then(branch_payload)
}

pub struct FlowEngine {
    repo: Arc<dyn Repository>,
    transport: Arc<dyn Transport>,
    kv: Arc<dyn KvStore>,
    timezone: Tz,
}

impl FlowEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        transport: Arc<dyn Transport>,
        kv: Arc<dyn KvStore>,
        timezone: Tz,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            transport,
            kv,
            timezone,
        })
    }

    /// Match the message against the bot's active triggers and start an
    /// execution on the first hit. `from_me` selects the trigger scopes.
    pub async fn evaluate_message(
        self: &Arc<Self>,
        bot: &Bot,
        session: &Session,
        content: &str,
        from_me: bool,
    ) -> Result<()> {
        if content.trim().is_empty() {
            return Ok(());
        }
        let scopes: [&str; 2] = if from_me {
            ["OUTGOING", "BOTH"]
        } else {
            ["INCOMING", "BOTH"]
        };
        let triggers = self.repo.active_triggers(bot.id, &scopes).await?;
        if triggers.is_empty() {
            return Ok(());
        }
        let Some(trigger) = matcher::find_match(content, &triggers) else {
            return Ok(());
        };
        let trigger = trigger.clone();

        let lock_key = format!("flow:lock:{}:{}", session.id, trigger.flow_id);
        if !self.kv.set_nx(&lock_key, "1", FLOW_LOCK_TTL).await? {
            info!(
                "Trigger '{}' ignored: concurrent execution in progress",
                trigger.keyword
            );
            return Ok(());
        }

        let result = self
            .start_execution(session, trigger.flow_id, &trigger.keyword)
            .await;
        let _ = self.kv.del(&lock_key).await;
        result
    }

    async fn start_execution(
        self: &Arc<Self>,
        session: &Session,
        flow_id: Uuid,
        keyword: &str,
    ) -> Result<()> {
        let Some(flow) = self.repo.flow(flow_id).await? else {
            warn!("Trigger '{}' points at a missing flow {}", keyword, flow_id);
            return Ok(());
        };

        if flow.cooldown_ms > 0 {
            if let Some(last) = self.repo.latest_execution(session.id, flow_id).await? {
                let elapsed = Utc::now()
                    .signed_duration_since(last.started_at)
                    .num_milliseconds();
                if elapsed < flow.cooldown_ms as i64 {
                    let reason = format!("Cooldown active ({}/{}ms)", elapsed, flow.cooldown_ms);
                    info!("Trigger '{}': {}", keyword, reason);
                    self.repo
                        .create_execution(NewExecution::failed(
                            session.id,
                            flow_id,
                            Some(keyword),
                            &reason,
                        ))
                        .await?;
                    return Ok(());
                }
            }
        }

        if flow.usage_limit > 0 {
            let count = self.repo.execution_count(session.id, flow_id).await?;
            if count >= flow.usage_limit as i64 {
                let reason = format!("Usage limit reached ({}/{})", count, flow.usage_limit);
                info!("Trigger '{}': {}", keyword, reason);
                self.repo
                    .create_execution(NewExecution::failed(
                        session.id,
                        flow_id,
                        Some(keyword),
                        &reason,
                    ))
                    .await?;
                return Ok(());
            }
        }

        if !flow.excludes_flows.is_empty() {
            let conflicts = self
                .repo
                .execution_count_for_flows(session.id, &flow.excludes_flows)
                .await?;
            if conflicts > 0 {
                let reason = "Mutually exclusive flow already executed";
                info!("Trigger '{}': {}", keyword, reason);
                self.repo
                    .create_execution(NewExecution::failed(
                        session.id,
                        flow_id,
                        Some(keyword),
                        reason,
                    ))
                    .await?;
                return Ok(());
            }
        }

        let execution = self
            .repo
            .create_execution(NewExecution::running(session.id, flow_id, Some(keyword)))
            .await?;
        info!(
            "Trigger '{}' matched -> execution {} of flow '{}'",
            keyword, execution.id, flow.name
        );

        Self::schedule_step(Arc::clone(self), execution.id, 0).await;
        Ok(())
    }

    /// Fetch the execution and flow steps, compute the jittered delay and
    /// spawn the deferred dispatch. Returns a boxed future to break the
    /// recursion cycle with `execute_and_advance`.
    pub fn schedule_step(engine: Arc<Self>, execution_id: Uuid, step_order: i32) -> BoxFut {
        Box::pin(async move {
            let execution = match engine.repo.execution(execution_id).await {
                Ok(Some(e)) => e,
                Ok(None) => {
                    warn!("Execution {} not found for scheduling", execution_id);
                    return;
                }
                Err(e) => {
                    error!("Failed to fetch execution {}: {}", execution_id, e);
                    return;
                }
            };
            if execution.status != EXECUTION_RUNNING {
                info!(
                    "Execution {} is {}, not scheduling further steps",
                    execution_id, execution.status
                );
                return;
            }

            let steps = match engine.repo.flow_steps(execution.flow_id).await {
                Ok(s) => s,
                Err(e) => {
                    error!("Failed to fetch steps for {}: {}", execution_id, e);
                    return;
                }
            };

            let Some(step) = steps.iter().find(|s| s.step_order == step_order).cloned() else {
                info!("Flow finished for execution {}", execution_id);
                let _ = engine
                    .repo
                    .finish_execution(execution_id, EXECUTION_COMPLETED, None)
                    .await;
                return;
            };

            let base = step.delay_ms as i64;
            let variance = (base * step.jitter_pct as i64) / 100;
            let jitter = if variance > 0 {
                rand::thread_rng().gen_range(-variance..=variance)
            } else {
                0
            };
            let delay = (base + jitter).max(0) as u64;

            info!(
                "Scheduling step {} of execution {} in {}ms",
                step_order, execution_id, delay
            );

            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Self::execute_and_advance(engine, execution_id, step).await;
            });
        })
    }

    fn execute_and_advance(engine: Arc<Self>, execution_id: Uuid, step: Step) -> BoxFut {
        Box::pin(async move {
            let execution = match engine.repo.execution(execution_id).await {
                Ok(Some(e)) if e.status == EXECUTION_RUNNING => e,
                _ => return,
            };

            let session = match engine.repo.session(execution.session_id).await {
                Ok(Some(s)) => s,
                _ => {
                    warn!(
                        "Session {} gone, failing execution {}",
                        execution.session_id, execution_id
                    );
                    let _ = engine
                        .repo
                        .finish_execution(execution_id, EXECUTION_FAILED, Some("session gone"))
                        .await;
                    return;
                }
            };

            let _ = engine
                .repo
                .update_execution_step(execution_id, step.step_order)
                .await;

            if let Err(e) = engine.dispatch_step(&execution, &session, &step).await {
                error!(
                    "Step {} of execution {} failed, continuing: {}",
                    step.step_order, execution_id, e
                );
                let _ = engine
                    .repo
                    .record_execution_error(
                        execution_id,
                        &format!("Step {} error: {}", step.step_order, e),
                    )
                    .await;
            }

            Self::schedule_step(engine, execution_id, step.step_order + 1).await;
        })
    }

    async fn dispatch_step(
        &self,
        execution: &Execution,
        session: &Session,
        step: &Step,
    ) -> Result<()> {
        let payload = match step.step_type.as_str() {
            "TEXT" => step
                .content
                .clone()
                .map(|text| OutgoingPayload::Text { text }),
            "IMAGE" => match &step.media_url {
                Some(url) => Some(OutgoingPayload::Image {
                    url: url.clone(),
                    caption: step.content.clone(),
                }),
                None => {
                    error!("IMAGE step {} has no media_url, skipping", step.id);
                    None
                }
            },
            "AUDIO" | "PTT" => match &step.media_url {
                Some(url) => Some(OutgoingPayload::Audio {
                    url: url.clone(),
                    ptt: step.step_type == "PTT",
                }),
                None => {
                    error!("{} step {} has no media_url, skipping", step.step_type, step.id);
                    None
                }
            },
            "CONDITIONAL_TIME" => {
                let meta = step
                    .metadata
                    .clone()
                    .and_then(|m| serde_json::from_value::<ConditionalTimeMeta>(m).ok());
                match meta {
                    Some(meta) => {
                        let now = Utc::now().with_timezone(&self.timezone);
                        let current_minutes = now.hour() * 60 + now.minute();
                        resolve_time_branch(&meta, current_minutes)
                    }
                    None => {
                        warn!("CONDITIONAL_TIME step {} has no usable metadata", step.id);
                        None
                    }
                }
            }
            other => {
                warn!("Unsupported step type {} on step {}", other, step.id);
                None
            }
        };

        if let Some(payload) = payload {
            self.transport
                .send_step(
                    session.bot_id,
                    &session.identifier,
                    payload,
                    execution.id,
                    step.step_order,
                )
                .await?;
        }
        Ok(())
    }

    /// Startup recovery: re-schedule executions interrupted mid-flight.
    pub async fn recover_running_executions(engine: Arc<Self>) {
        let executions = match engine.repo.running_executions().await {
            Ok(e) => e,
            Err(e) => {
                error!("Failed to query running executions for recovery: {}", e);
                return;
            }
        };
        if executions.is_empty() {
            return;
        }
        info!("Recovering {} running executions", executions.len());
        for execution in executions {
            Self::schedule_step(Arc::clone(&engine), execution.id, execution.current_step).await;
        }
    }
}
