//! Embedding providers: the built-in hash embedder, and an HTTP API embedder
//! that degrades to it.

use std::time::Duration;

use remem_core::{EmbeddingError, HashEmbedder, Signal, SignalEmbedder};
use remem_store::{EmbeddingSection, ProviderKind};

/// OpenAI- or Cohere-style embeddings endpoint.
pub struct ApiEmbedder {
    api_key: String,
    endpoint: String,
    model: String,
    dimensions: usize,
    client: reqwest::blocking::Client,
}

impl ApiEmbedder {
    pub fn new(
        api_key: String,
        endpoint: String,
        model: String,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| provider_error(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            api_key,
            endpoint,
            model,
            dimensions,
            client,
        })
    }
}

fn provider_error(message: String) -> EmbeddingError {
    EmbeddingError::Provider {
        provider: "api".to_string(),
        message,
    }
}

/// Pull the first embedding out of a response body.
///
/// Accepts `{"data": [{"embedding": [...]}]}` and `{"embeddings": [[...]]}`.
fn parse_embedding(body: &serde_json::Value) -> Result<Vec<f32>, String> {
    let values = if let Some(data) = body.get("data") {
        data.as_array()
            .and_then(|items| items.first())
            .and_then(|item| item.get("embedding"))
            .and_then(|e| e.as_array())
            .ok_or("malformed data[0].embedding")?
    } else if let Some(embeddings) = body.get("embeddings") {
        embeddings
            .as_array()
            .and_then(|items| items.first())
            .and_then(|e| e.as_array())
            .ok_or("malformed embeddings[0]")?
    } else {
        return Err("unknown response format".to_string());
    };

    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| format!("non-numeric embedding value {v}"))
        })
        .collect()
}

impl SignalEmbedder for ApiEmbedder {
    fn embed(&self, signal: &Signal) -> Result<Vec<f32>, EmbeddingError> {
        let request = serde_json::json!({
            "input": signal.joined(),
            "model": self.model,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .map_err(|e| provider_error(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(provider_error(format!("status {status}: {body}")));
        }

        let body: serde_json::Value = response
            .json()
            .map_err(|e| provider_error(format!("unreadable response: {e}")))?;
        let embedding = parse_embedding(&body).map_err(provider_error)?;
        if embedding.len() != self.dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimensions,
                actual: embedding.len(),
            });
        }
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "api"
    }
}

/// The configured embedder.
///
/// `Api` falls back to a same-width hash embedder whenever the remote call
/// fails, so a learn or recall only fails if both do.
pub enum Embedder {
    Hash(HashEmbedder),
    Api {
        primary: ApiEmbedder,
        fallback: HashEmbedder,
    },
}

impl Embedder {
    /// Build from config, reading the API key from `section.api_key_env`.
    pub fn from_section(section: &EmbeddingSection) -> Self {
        Self::from_section_with(section, |key| std::env::var(key).ok())
    }

    pub fn from_section_with(
        section: &EmbeddingSection,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let fallback = HashEmbedder::new(section.dimensions);
        if section.provider == ProviderKind::Hash {
            return Embedder::Hash(fallback);
        }

        let Some(api_key) = lookup(&section.api_key_env).filter(|k| !k.is_empty()) else {
            tracing::warn!(
                "{} is not set, using the hash embedder",
                section.api_key_env
            );
            return Embedder::Hash(fallback);
        };
        match ApiEmbedder::new(
            api_key,
            section.endpoint.clone(),
            section.model.clone(),
            section.dimensions,
            Duration::from_secs(section.timeout_secs),
        ) {
            Ok(primary) => Embedder::Api { primary, fallback },
            Err(e) => {
                tracing::warn!("{e}, using the hash embedder");
                Embedder::Hash(fallback)
            }
        }
    }
}

impl SignalEmbedder for Embedder {
    fn embed(&self, signal: &Signal) -> Result<Vec<f32>, EmbeddingError> {
        match self {
            Embedder::Hash(hash) => hash.embed(signal),
            Embedder::Api { primary, fallback } => primary.embed(signal).or_else(|e| {
                tracing::warn!("{e}; falling back to hash embedding");
                fallback.embed(signal)
            }),
        }
    }

    fn dimensions(&self) -> usize {
        match self {
            Embedder::Hash(hash) => hash.dimensions(),
            Embedder::Api { primary, .. } => primary.dimensions(),
        }
    }

    fn name(&self) -> &str {
        match self {
            Embedder::Hash(hash) => hash.name(),
            Embedder::Api { primary, .. } => primary.name(),
        }
    }
}
