//! Cross-provider failover.
//!
//! A primary provider failure is retried once against the configured
//! fallback (provider, model) pair with the same messages and tools. When
//! the fallback also fails, the original error is raised.

use log::{error, warn};
use std::collections::HashMap;
use std::sync::Arc;

use super::{ChatProvider, ChatRequest, ChatResponse, ProviderError};

#[derive(Debug, Clone)]
pub struct FailoverRoute {
    pub provider: String,
    pub model: String,
}

/// The response plus the (provider, model) pair that actually produced it,
/// so the caller can pin the fallback for the rest of its turn.
#[derive(Debug)]
pub struct RoutedResponse {
    pub response: ChatResponse,
    pub provider: String,
    pub model: String,
    pub fell_back: bool,
}

#[derive(Default)]
pub struct FailoverRouter {
    providers: HashMap<String, Arc<dyn ChatProvider>>,
    routes: HashMap<String, FailoverRoute>,
}

impl FailoverRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn ChatProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn set_route(&mut self, primary: &str, fallback_provider: &str, fallback_model: &str) {
        self.routes.insert(
            primary.to_string(),
            FailoverRoute {
                provider: fallback_provider.to_string(),
                model: fallback_model.to_string(),
            },
        );
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub async fn chat(
        &self,
        provider_name: &str,
        request: &ChatRequest,
    ) -> Result<RoutedResponse, ProviderError> {
        let provider = self
            .providers
            .get(provider_name)
            .ok_or_else(|| format!("Unknown AI provider: {}", provider_name))?;

        let primary_error = match provider.chat(request).await {
            Ok(response) => {
                return Ok(RoutedResponse {
                    response,
                    provider: provider_name.to_string(),
                    model: request.model.clone(),
                    fell_back: false,
                })
            }
            Err(e) => e,
        };

        let Some(route) = self.routes.get(provider_name) else {
            return Err(primary_error);
        };
        let Some(fallback) = self.providers.get(&route.provider) else {
            error!(
                "Fallback provider {} for {} is not registered",
                route.provider, provider_name
            );
            return Err(primary_error);
        };

        warn!(
            "Provider {} failed ({}), retrying with {}/{}",
            provider_name, primary_error, route.provider, route.model
        );

        let mut fallback_request = request.clone();
        fallback_request.model = route.model.clone();

        match fallback.chat(&fallback_request).await {
            Ok(response) => Ok(RoutedResponse {
                response,
                provider: route.provider.clone(),
                model: route.model.clone(),
                fell_back: true,
            }),
            Err(fallback_error) => {
                error!(
                    "Fallback {}/{} also failed: {}",
                    route.provider, route.model, fallback_error
                );
                Err(primary_error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeProvider {
        name: &'static str,
        fail: bool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeProvider {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatProvider for FakeProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.calls.lock().unwrap().push(request.model.clone());
            if self.fail {
                return Err("rate_limited".into());
            }
            Ok(ChatResponse {
                content: Some("ok".to_string()),
                ..Default::default()
            })
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "gemini-2.0-flash".to_string(),
            messages: vec![ChatMessage::user("hola")],
            tools: Vec::new(),
            temperature: None,
        }
    }

    #[tokio::test]
    async fn primary_success_does_not_fall_back() {
        let primary = FakeProvider::new("GEMINI", false);
        let fallback = FakeProvider::new("OPENAI", false);
        let mut router = FailoverRouter::new();
        router.register(primary.clone());
        router.register(fallback.clone());
        router.set_route("GEMINI", "OPENAI", "gpt-4o-mini");

        let routed = router.chat("GEMINI", &request()).await.unwrap();
        assert!(!routed.fell_back);
        assert_eq!(routed.provider, "GEMINI");
        assert!(fallback.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn primary_failure_uses_fallback_model() {
        let primary = FakeProvider::new("GEMINI", true);
        let fallback = FakeProvider::new("OPENAI", false);
        let mut router = FailoverRouter::new();
        router.register(primary);
        router.register(fallback.clone());
        router.set_route("GEMINI", "OPENAI", "gpt-4o-mini");

        let routed = router.chat("GEMINI", &request()).await.unwrap();
        assert!(routed.fell_back);
        assert_eq!(routed.provider, "OPENAI");
        assert_eq!(routed.model, "gpt-4o-mini");
        assert_eq!(routed.response.content.as_deref(), Some("ok"));
        assert_eq!(
            fallback.calls.lock().unwrap().as_slice(),
            &["gpt-4o-mini".to_string()]
        );
    }

    #[tokio::test]
    async fn both_failing_raises_the_original_error() {
        let primary = FakeProvider::new("GEMINI", true);
        let fallback = FakeProvider::new("OPENAI", true);
        let mut router = FailoverRouter::new();
        router.register(primary);
        router.register(fallback);
        router.set_route("GEMINI", "OPENAI", "gpt-4o-mini");

        let err = router.chat("GEMINI", &request()).await.unwrap_err();
        assert_eq!(err.to_string(), "rate_limited");
    }

    #[tokio::test]
    async fn no_route_raises_primary_error() {
        let primary = FakeProvider::new("GEMINI", true);
        let mut router = FailoverRouter::new();
        router.register(primary);

        let err = router.chat("GEMINI", &request()).await.unwrap_err();
        assert_eq!(err.to_string(), "rate_limited");
    }
}
