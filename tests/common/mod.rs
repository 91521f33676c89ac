//! Shared harness wiring the pipeline onto in-memory fakes.

// Not every test binary touches every handle or constructor.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use agentserver::conversation::ConversationStore;
use agentserver::engine::{AiEngine, EngineSettings};
use agentserver::events::EventBus;
use agentserver::flow::FlowEngine;
use agentserver::kv::KvStore;
use agentserver::llm::FailoverRouter;
use agentserver::repo::Repository;
use agentserver::shared::test_utils::{
    FakeMedia, MemoryKv, MemoryRepository, RecordingTransport, ScriptedProvider,
};
use agentserver::tools::{ToolExecutor, ToolRegistry};

pub struct Harness {
    pub repo: Arc<MemoryRepository>,
    pub kv: Arc<MemoryKv>,
    pub transport: Arc<RecordingTransport>,
    pub gemini: Arc<ScriptedProvider>,
    pub openai: Arc<ScriptedProvider>,
    pub events: EventBus,
    pub store: ConversationStore,
    pub flow: Arc<FlowEngine>,
    pub engine: Arc<AiEngine>,
}

pub fn harness() -> Harness {
    harness_with(EngineSettings::default(), 100)
}

pub fn harness_with(settings: EngineSettings, max_messages: usize) -> Harness {
    let repo = Arc::new(MemoryRepository::new());
    let kv = Arc::new(MemoryKv::new());
    let transport = Arc::new(RecordingTransport::new());
    let gemini = Arc::new(ScriptedProvider::new("GEMINI"));
    let openai = Arc::new(ScriptedProvider::new("OPENAI"));
    let events = EventBus::default();

    let repo_dyn: Arc<dyn Repository> = repo.clone();
    let kv_dyn: Arc<dyn KvStore> = kv.clone();

    let store = ConversationStore::new(
        kv_dyn.clone(),
        repo_dyn.clone(),
        Duration::from_secs(3600),
        max_messages,
        30,
    );

    let mut router = FailoverRouter::new();
    router.register(gemini.clone());
    router.register(openai.clone());
    router.set_route("GEMINI", "OPENAI", "gpt-4o-mini");

    let timezone = chrono_tz::America::Mexico_City;
    let flow = FlowEngine::new(
        repo_dyn.clone(),
        transport.clone(),
        kv_dyn.clone(),
        timezone,
    );
    let registry = ToolRegistry::new(repo_dyn.clone());
    let executor = ToolExecutor::new(
        repo_dyn.clone(),
        transport.clone(),
        store.clone(),
        timezone,
    );

    let engine = AiEngine::new(
        repo_dyn,
        kv_dyn,
        transport.clone(),
        Arc::new(FakeMedia::default()),
        store.clone(),
        registry,
        executor,
        router,
        Arc::clone(&flow),
        events.clone(),
        settings,
    );

    Harness {
        repo,
        kv,
        transport,
        gemini,
        openai,
        events,
        store,
        flow,
        engine,
    }
}
