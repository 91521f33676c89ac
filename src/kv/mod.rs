//! Key-value / list store seam.
//!
//! The AI mutex, the pending-overflow queue and the automation leases all
//! live behind this trait so the orchestration pipeline can be exercised
//! against an in-memory store. Production uses Redis.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// SET NX with TTL. Returns true when the key was created.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn del(&self, key: &str) -> Result<()>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// RPUSH one element and refresh the list TTL (single pipeline).
    async fn rpush(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn lpop(&self, key: &str) -> Result<Option<String>>;

    async fn llen(&self, key: &str) -> Result<i64>;

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    /// RPUSH many elements, LTRIM the list to its newest `max_len` entries
    /// and refresh the TTL, all in one pipeline.
    async fn rpush_trim(&self, key: &str, values: &[String], max_len: i64, ttl: Duration)
        -> Result<()>;
}

pub struct RedisKv {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisKv {
    pub fn new(conn: redis::aio::MultiplexedConnection) -> Self {
        Self { conn }
    }

    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(conn))
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let created: bool = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut self.conn.clone())
            .await
            .unwrap_or(false);
        Ok(created)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> Result<()> {
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async::<()>(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        redis::pipe()
            .cmd("RPUSH")
            .arg(key)
            .arg(value)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .ignore()
            .query_async::<()>(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = redis::cmd("LPOP")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(value)
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        let len: i64 = redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(len)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let values: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(values)
    }

    async fn rpush_trim(
        &self,
        key: &str,
        values: &[String],
        max_len: i64,
        ttl: Duration,
    ) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        let mut push = pipe.cmd("RPUSH").arg(key);
        for value in values {
            push = push.arg(value);
        }
        push.ignore()
            .cmd("LTRIM")
            .arg(key)
            .arg(-max_len)
            .arg(-1)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .ignore()
            .query_async::<()>(&mut self.conn.clone())
            .await?;
        Ok(())
    }
}
