//! Vertex AI embedding provider implementation
//!
//! Uses the Vertex AI text embedding `:predict` endpoint.
//! Supports authentication via:
//! - An explicit access token (GOOGLE_ACCESS_TOKEN)
//! - The GCP metadata server (Workload Identity on GKE, Cloud Run)
//!
//! Metadata server tokens are cached until shortly before they expire.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use core_config::{ConfigError, FromEnv, env_or_default};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{EmbeddingProvider, EmbeddingResult};
use crate::cache::TtlCache;
use crate::error::{VectorError, VectorResult};

const SERVICE: &str = "vertex-ai";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const TOKEN_CACHE_KEY: &str = "default";
/// Refresh this long before the metadata server says the token expires
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Shared access token cache
pub type TokenCache = TtlCache<String, String>;

/// Vertex AI provider configuration
#[derive(Debug, Clone)]
pub struct VertexAIConfig {
    /// GCP Project ID
    pub project_id: String,
    /// GCP Region (e.g., "us-central1")
    pub location: String,
    /// Access token; the metadata server is used when absent
    pub access_token: Option<String>,
    pub timeout_secs: u64,
    /// Requested embedding size, model default when absent
    pub output_dimensionality: Option<u32>,
}

impl VertexAIConfig {
    pub fn new(project_id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            location: location.into(),
            access_token: None,
            timeout_secs: 30,
            output_dimensionality: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_output_dimensionality(mut self, dimension: u32) -> Self {
        self.output_dimensionality = Some(dimension);
        self
    }

    /// Get the Vertex AI endpoint URL for the given model
    fn endpoint_url(&self, model: &str) -> String {
        format!(
            "https://{}-aiplatform.googleapis.com/v1/projects/{}/locations/{}/publishers/google/models/{}:predict",
            self.location, self.project_id, self.location, model
        )
    }
}

impl FromEnv for VertexAIConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let project_id = std::env::var("GOOGLE_CLOUD_PROJECT")
            .or_else(|_| std::env::var("GCP_PROJECT_ID"))
            .map_err(|_| ConfigError::MissingEnvVar("GOOGLE_CLOUD_PROJECT".to_string()))?;

        Ok(Self {
            project_id,
            location: env_or_default("VERTEX_AI_LOCATION", "us-central1"),
            access_token: std::env::var("GOOGLE_ACCESS_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
            timeout_secs: core_config::env_parse_or("VERTEX_AI_TIMEOUT_SECS", 30)?,
            output_dimensionality: None,
        })
    }
}

/// Vertex AI embeddings provider
pub struct VertexAIProvider {
    client: Client,
    config: VertexAIConfig,
    tokens: Arc<TokenCache>,
}

impl VertexAIProvider {
    pub fn new(config: VertexAIConfig, tokens: Arc<TokenCache>) -> VectorResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VectorError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            config,
            tokens,
        })
    }

    /// Get access token, refreshing from the metadata server if needed
    async fn access_token(&self) -> VectorResult<String> {
        if let Some(ref token) = self.config.access_token {
            return Ok(token.clone());
        }

        let key = TOKEN_CACHE_KEY.to_string();
        if let Some(token) = self.tokens.get(&key) {
            return Ok(token);
        }

        let (token, expires_in) = self.metadata_token().await?;
        let ttl = expires_in.saturating_sub(TOKEN_EXPIRY_MARGIN);
        self.tokens.insert_with_ttl(key, token.clone(), ttl);
        debug!(ttl_secs = ttl.as_secs(), "Cached metadata server token");
        Ok(token)
    }

    async fn metadata_token(&self) -> VectorResult<(String, Duration)> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            #[serde(default)]
            expires_in: u64,
        }

        let response = self
            .client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| {
                VectorError::Authentication(format!(
                    "Failed to get access token from metadata server: {}. \
                     Set GOOGLE_ACCESS_TOKEN for local development.",
                    e
                ))
            })?;

        if !response.status().is_success() {
            return Err(VectorError::Authentication(format!(
                "Metadata server returned {}. Set GOOGLE_ACCESS_TOKEN for local development.",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            VectorError::Authentication(format!("Failed to parse token response: {}", e))
        })?;

        Ok((token.access_token, Duration::from_secs(token.expires_in)))
    }

    fn status_error(&self, status: StatusCode, body: String) -> VectorError {
        match status {
            StatusCode::TOO_MANY_REQUESTS => VectorError::RateLimited(SERVICE.to_string()),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                VectorError::Timeout(format!("{} returned {}", SERVICE, status))
            }
            StatusCode::UNAUTHORIZED => {
                self.tokens.invalidate(&TOKEN_CACHE_KEY.to_string());
                VectorError::Authentication(format!("{} rejected the access token", SERVICE))
            }
            StatusCode::FORBIDDEN => VectorError::Authorization(body),
            StatusCode::BAD_REQUEST => VectorError::Validation(body),
            _ => VectorError::external(SERVICE, format!("API error ({}): {}", status, body)),
        }
    }
}

// Vertex AI request/response types

#[derive(Debug, Serialize)]
struct PredictRequest {
    instances: Vec<TextInstance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<PredictParameters>,
}

#[derive(Debug, Serialize)]
struct TextInstance {
    content: String,
    task_type: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictParameters {
    output_dimensionality: u32,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    embeddings: PredictionEmbeddings,
}

#[derive(Debug, Deserialize)]
struct PredictionEmbeddings {
    values: Vec<f32>,
    #[serde(default)]
    statistics: Option<EmbeddingStatistics>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingStatistics {
    #[serde(default)]
    token_count: f64,
}

impl From<Prediction> for EmbeddingResult {
    fn from(prediction: Prediction) -> Self {
        let values = prediction.embeddings.values;
        let tokens_used = prediction
            .embeddings
            .statistics
            .map(|s| s.token_count as u32)
            .unwrap_or(0);
        EmbeddingResult {
            dimension: values.len() as u32,
            values,
            tokens_used,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for VertexAIProvider {
    fn provider_name(&self) -> &'static str {
        SERVICE
    }

    async fn embed(&self, model: &str, text: &str) -> VectorResult<EmbeddingResult> {
        self.embed_batch(model, &[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| VectorError::external(SERVICE, "No predictions returned"))
    }

    #[instrument(skip(self, texts), fields(count = texts.len()))]
    async fn embed_batch(&self, model: &str, texts: &[String]) -> VectorResult<Vec<EmbeddingResult>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let access_token = self.access_token().await?;

        let request = PredictRequest {
            instances: texts
                .iter()
                .map(|text| TextInstance {
                    content: text.clone(),
                    task_type: "RETRIEVAL_DOCUMENT",
                })
                .collect(),
            parameters: self
                .config
                .output_dimensionality
                .map(|output_dimensionality| PredictParameters {
                    output_dimensionality,
                }),
        };

        let response = self
            .client
            .post(self.config.endpoint_url(model))
            .bearer_auth(access_token)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Vertex AI request failed");
            return Err(self.status_error(status, body));
        }

        let predictions = response.json::<PredictResponse>().await?.predictions;
        if predictions.is_empty() {
            return Err(VectorError::external(SERVICE, "No predictions returned"));
        }
        if predictions.len() != texts.len() {
            return Err(VectorError::external(
                SERVICE,
                format!(
                    "Expected {} predictions, got {}",
                    texts.len(),
                    predictions.len()
                ),
            ));
        }

        Ok(predictions.into_iter().map(EmbeddingResult::from).collect())
    }
}
