//! External media side effects: transcription, vision, PDF extraction.
//!
//! Each operation takes a URL or local path and returns text. Failures are
//! the caller's problem; the engine replaces them with neutral placeholders
//! and never aborts a turn over media.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

pub const PDF_TEXT_LIMIT: usize = 3000;

#[async_trait]
pub trait MediaProcessor: Send + Sync {
    async fn transcribe_audio(&self, location: &str) -> Result<String>;
    async fn describe_image(&self, location: &str) -> Result<String>;
    async fn extract_pdf_text(&self, location: &str) -> Result<String>;
}

/// HTTP-backed processor delegating to external services.
pub struct HttpMediaProcessor {
    client: reqwest::Client,
    transcription_url: Option<String>,
    vision_url: Option<String>,
}

impl HttpMediaProcessor {
    pub fn new(transcription_url: Option<String>, vision_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            transcription_url,
            vision_url,
        }
    }

    async fn post_media(&self, service_url: &str, location: &str) -> Result<String> {
        let response = self
            .client
            .post(service_url)
            .json(&json!({"url": location}))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("media service error: {}", response.status()));
        }
        let parsed: Value = response.json().await?;
        parsed
            .get("text")
            .and_then(Value::as_str)
            .map(|t| t.to_string())
            .ok_or_else(|| anyhow!("media service returned no text"))
    }
}

#[async_trait]
impl MediaProcessor for HttpMediaProcessor {
    async fn transcribe_audio(&self, location: &str) -> Result<String> {
        let url = self
            .transcription_url
            .as_deref()
            .ok_or_else(|| anyhow!("transcription service not configured"))?;
        self.post_media(url, location).await
    }

    async fn describe_image(&self, location: &str) -> Result<String> {
        let url = self
            .vision_url
            .as_deref()
            .ok_or_else(|| anyhow!("vision service not configured"))?;
        self.post_media(url, location).await
    }

    async fn extract_pdf_text(&self, location: &str) -> Result<String> {
        // PDF extraction rides the vision service; it accepts documents.
        let url = self
            .vision_url
            .as_deref()
            .ok_or_else(|| anyhow!("vision service not configured"))?;
        self.post_media(url, location).await
    }
}
