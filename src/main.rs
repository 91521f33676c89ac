use anyhow::Context;
use chrono_tz::Tz;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use agentserver::accumulator::Accumulator;
use agentserver::automation::AutomationSweeper;
use agentserver::config::AppConfig;
use agentserver::conversation::ConversationStore;
use agentserver::engine::{AiEngine, EngineSettings};
use agentserver::events::EventBus;
use agentserver::flow::FlowEngine;
use agentserver::gateway::GatewayConsumer;
use agentserver::kv::{KvStore, RedisKv};
use agentserver::llm::{
    gemini::GeminiProvider, openai::OpenAiProvider, FailoverRouter, PROVIDER_GEMINI,
    PROVIDER_OPENAI,
};
use agentserver::media::HttpMediaProcessor;
use agentserver::repo::{PgRepository, Repository};
use agentserver::shared::state::AppState;
use agentserver::shared::utils::create_conn;
use agentserver::tools::{ToolExecutor, ToolRegistry};
use agentserver::transport::{StreamTransport, Transport};
use agentserver::web;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting agentserver {}...", env!("CARGO_PKG_VERSION"));

    let pool = create_conn(&config.database_url, config.database_max_connections)
        .context("Failed to build database pool")?;
    info!("Connected to Postgres.");

    let redis_client = Arc::new(redis::Client::open(config.redis_url.clone())?);
    let redis_conn = redis_client
        .get_multiplexed_async_connection()
        .await
        .context("Failed to connect to Redis")?;
    info!("Connected to Redis.");

    let repo: Arc<dyn Repository> = Arc::new(PgRepository::new(pool.clone()));
    let kv: Arc<dyn KvStore> = Arc::new(RedisKv::new(redis_conn.clone()));
    let transport: Arc<dyn Transport> = Arc::new(StreamTransport::new(redis_conn.clone()));
    let events = EventBus::default();

    let timezone: Tz = config.bot_timezone.parse().unwrap_or_else(|_| {
        warn!(
            "Invalid BOT_TIMEZONE {:?}, using America/Mexico_City",
            config.bot_timezone
        );
        chrono_tz::America::Mexico_City
    });

    let store = ConversationStore::new(
        Arc::clone(&kv),
        Arc::clone(&repo),
        Duration::from_secs(config.conv_ttl_secs),
        config.conv_max_messages,
        config.conv_pg_history_days,
    );

    let mut router = FailoverRouter::new();
    if let Some(key) = &config.gemini_api_key {
        router.register(Arc::new(GeminiProvider::new(key.clone())));
    }
    if let Some(key) = &config.openai_api_key {
        router.register(Arc::new(OpenAiProvider::new(key.clone())));
    }
    if !router.has_provider(PROVIDER_GEMINI) && !router.has_provider(PROVIDER_OPENAI) {
        warn!("No AI provider keys configured; AI turns will fail until one is set");
    }
    router.set_route(
        &config.primary_provider,
        &config.fallback_provider,
        &config.fallback_model,
    );

    let media = Arc::new(HttpMediaProcessor::new(
        config.transcription_url.clone(),
        config.vision_url.clone(),
    ));

    let flow = FlowEngine::new(
        Arc::clone(&repo),
        Arc::clone(&transport),
        Arc::clone(&kv),
        timezone,
    );

    let registry = ToolRegistry::new(Arc::clone(&repo));
    let executor = ToolExecutor::new(
        Arc::clone(&repo),
        Arc::clone(&transport),
        store.clone(),
        timezone,
    );

    let engine = AiEngine::new(
        Arc::clone(&repo),
        Arc::clone(&kv),
        Arc::clone(&transport),
        media,
        store,
        registry,
        executor,
        router,
        Arc::clone(&flow),
        events.clone(),
        EngineSettings {
            lock_ttl: Duration::from_secs(config.lock_ttl_secs),
            ..EngineSettings::default()
        },
    );

    let accumulator = Accumulator::new();

    // Re-schedule flow executions interrupted by the previous shutdown.
    FlowEngine::recover_running_executions(Arc::clone(&flow)).await;

    let consumer = GatewayConsumer::new(
        redis_conn.clone(),
        Arc::clone(&repo),
        Arc::clone(&engine),
        Arc::clone(&flow),
        Arc::clone(&accumulator),
        events.clone(),
    );
    tokio::spawn(consumer.run());

    let sweeper = AutomationSweeper::new(
        Arc::clone(&repo),
        Arc::clone(&kv),
        Arc::clone(&engine),
        Duration::from_millis(config.automation_check_interval_ms),
    );
    tokio::spawn(sweeper.spawn());

    let state = Arc::new(AppState {
        config: config.clone(),
        conn: pool,
        cache: redis_client,
        repo,
        kv,
        transport: Arc::clone(&transport),
        engine: Arc::clone(&engine),
        flow,
        accumulator: Arc::clone(&accumulator),
        events,
    });

    let app = web::router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("HTTP listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    // Drain buffered messages and ask the gateway to close sessions.
    accumulator
        .flush_all(|session_id, batch| {
            let engine = Arc::clone(&engine);
            async move {
                if let Err(e) = engine.process_messages(session_id, batch).await {
                    error!("Shutdown flush failed for {}: {}", session_id, e);
                }
            }
        })
        .await;
    if let Err(e) = transport.shutdown_all().await {
        warn!("shutdown_all failed: {}", e);
    }

    info!("agentserver stopped.");
    Ok(())
}
