use std::{sync::Arc, time::Duration};

use async_openai::types::CreateEmbeddingRequestArgs;
use async_trait::async_trait;
use moka::future::Cache;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{debug, warn};

use crate::{error::AppError, utils::config::AppConfig, utils::hash::create_sha256_hash};

/// Anything that can turn text into a fixed-dimension vector.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError>;
}

/// Embedding provider backed by the OpenAI embeddings API.
pub struct OpenAiEmbedder {
    client: async_openai::Client<async_openai::config::OpenAIConfig>,
    model: String,
    dimensions: u32,
}

impl OpenAiEmbedder {
    pub fn from_config(config: &AppConfig) -> Self {
        let client = async_openai::Client::with_config(
            async_openai::config::OpenAIConfig::new()
                .with_api_key(&config.openai_api_key)
                .with_api_base(&config.openai_base_url),
        );

        Self {
            client,
            model: config.embedding_model.clone(),
            dimensions: config.embedding_dimensions,
        }
    }

    async fn request(&self, input: &str) -> Result<Vec<f32>, AppError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .dimensions(self.dimensions)
            .input([input])
            .build()?;

        let response = self.client.embeddings().create(request).await?;

        let embedding = response
            .data
            .first()
            .ok_or_else(|| {
                AppError::InternalError("No embedding data received from API".into())
            })?
            .embedding
            .clone();

        debug!(
            dimensions = embedding.len(),
            text_size = input.len(),
            "Embedding was created"
        );

        Ok(embedding)
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let retry_strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);

        let embedding = Retry::spawn(retry_strategy, || self.request(text)).await?;

        if embedding.len() != self.dimensions as usize {
            return Err(AppError::InternalError(format!(
                "Generated embedding has incorrect dimension ({}). Expected {}",
                embedding.len(),
                self.dimensions
            )));
        }

        Ok(embedding)
    }
}

/// TTL-bounded memoization of vectorizer output, keyed by a stable hash of
/// the exact text.
///
/// Concurrent misses for one key coalesce into a single provider call, and
/// cache failures fall open to a direct provider call.
pub struct CachedEmbedder {
    backend: Arc<dyn EmbeddingBackend>,
    cache: Cache<String, Vec<f32>>,
}

impl CachedEmbedder {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .time_to_live(ttl)
            .max_capacity(10_000)
            .build();

        Self { backend, cache }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let key = format!("embedding:v1:{}", create_sha256_hash(text));

        let backend = Arc::clone(&self.backend);
        let input = text.to_string();
        let lookup = self
            .cache
            .try_get_with(key, async move { backend.embed(&input).await })
            .await;

        match lookup {
            Ok(embedding) => Ok(embedding),
            Err(err) => {
                warn!(error = %err, "Embedding cache lookup failed, bypassing cache");
                self.backend.embed(text).await
            }
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Deterministic in-memory backend for tests. Counts provider calls so
    /// coalescing behaviour can be asserted.
    pub struct StaticEmbedder {
        vectors: HashMap<String, Vec<f32>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl StaticEmbedder {
        pub fn new(vectors: HashMap<String, Vec<f32>>) -> Self {
            Self {
                vectors,
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(0),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingBackend for StaticEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.vectors
                .get(text)
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("no embedding stubbed for '{text}'")))
        }
    }
}
