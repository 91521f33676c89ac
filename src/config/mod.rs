use dotenvy::dotenv;
use std::env;

/// Process configuration, loaded once at startup from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: String,
    pub bind_addr: String,
    pub lock_ttl_secs: u64,
    pub conv_ttl_secs: u64,
    pub conv_max_messages: usize,
    pub conv_pg_history_days: i64,
    pub automation_check_interval_ms: u64,
    pub gemini_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub primary_provider: String,
    pub fallback_provider: String,
    pub fallback_model: String,
    pub bot_timezone: String,
    pub transcription_url: Option<String>,
    pub vision_url: Option<String>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        dotenv().ok();

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://agentic:@localhost:5432/agentic".to_string()),
            database_max_connections: env_or("DATABASE_MAX_CONNECTIONS", 20),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            lock_ttl_secs: env_or("LOCK_TTL", 60),
            conv_ttl_secs: env_or("CONV_TTL_SECONDS", 7 * 24 * 3600),
            conv_max_messages: env_or("CONV_MAX_MESSAGES", 100),
            conv_pg_history_days: env_or("CONV_PG_HISTORY_DAYS", 30),
            automation_check_interval_ms: env_or("AUTOMATION_CHECK_INTERVAL_MS", 30 * 60 * 1000),
            gemini_api_key: env::var("GEMINI_API_KEY").ok().filter(|k| !k.is_empty()),
            openai_api_key: env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            primary_provider: env::var("PRIMARY_PROVIDER").unwrap_or_else(|_| "GEMINI".to_string()),
            fallback_provider: env::var("FALLBACK_PROVIDER")
                .unwrap_or_else(|_| "OPENAI".to_string()),
            fallback_model: env::var("FALLBACK_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            bot_timezone: env::var("BOT_TIMEZONE")
                .unwrap_or_else(|_| "America/Mexico_City".to_string()),
            transcription_url: env::var("TRANSCRIPTION_URL").ok().filter(|u| !u.is_empty()),
            vision_url: env::var("VISION_URL").ok().filter(|u| !u.is_empty()),
        })
    }
}
