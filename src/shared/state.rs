use std::sync::Arc;

use crate::accumulator::Accumulator;
use crate::config::AppConfig;
use crate::engine::AiEngine;
use crate::events::EventBus;
use crate::flow::FlowEngine;
use crate::kv::KvStore;
use crate::repo::Repository;
use crate::shared::utils::DbPool;
use crate::transport::Transport;

pub struct AppState {
    pub config: AppConfig,
    pub conn: DbPool,
    pub cache: Arc<redis::Client>,
    pub repo: Arc<dyn Repository>,
    pub kv: Arc<dyn KvStore>,
    pub transport: Arc<dyn Transport>,
    pub engine: Arc<AiEngine>,
    pub flow: Arc<FlowEngine>,
    pub accumulator: Arc<Accumulator>,
    pub events: EventBus,
}
