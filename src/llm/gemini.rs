use super::{
    Estimation, Estimator, LlmError, SYSTEM_PROMPT, TokenUsage, UsageStats, build_user_prompt,
    parse_estimates,
};
use crate::config::{Provider, env_opt, env_or};
use crate::http::build_client;
use crate::pipeline::PipelineError;
use crate::preprocess::ProductRecord;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{info, warn};

const STAGE: &str = "estimate";

/// Gemini is reachable two ways: the public Generative Language API with an
/// API key, or Vertex AI with a project, a region and an OAuth access token.
/// Vertex wins when all three are present.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub project_id: Option<String>,
    pub location: String,
    pub access_token: Option<String>,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

impl GeminiConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: env_opt("GEMINI_API_KEY").or_else(|| env_opt("GOOGLE_API_KEY")),
            base_url: env_or(
                "GEMINI_BASE_URL",
                "https://generativelanguage.googleapis.com",
            )
            .trim_end_matches('/')
            .to_string(),
            project_id: env_opt("GOOGLE_PROJECT_ID"),
            location: env_or("GOOGLE_LOCATION", "us-central1"),
            access_token: env_opt("GOOGLE_ACCESS_TOKEN"),
            max_output_tokens: 8000,
            temperature: 0.1,
        }
    }
}

enum Endpoint {
    ApiKey { url: String, key: String },
    Vertex { url: String, token: String },
}

pub struct GeminiClient {
    http: Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    fn endpoint(&self, model: &str) -> Result<Endpoint, LlmError> {
        let model = urlencoding::encode(model);
        if let (Some(project), Some(token)) = (&self.config.project_id, &self.config.access_token) {
            let location = &self.config.location;
            return Ok(Endpoint::Vertex {
                url: format!(
                    "https://{location}-aiplatform.googleapis.com/v1/projects/{project}/locations/{location}/publishers/google/models/{model}:generateContent"
                ),
                token: token.clone(),
            });
        }
        let key = self
            .config
            .api_key
            .clone()
            .ok_or(LlmError::NotConfigured("GEMINI_API_KEY"))?;
        Ok(Endpoint::ApiKey {
            url: format!("{}/v1beta/models/{model}:generateContent", self.config.base_url),
            key,
        })
    }

    async fn generate(&self, model: &str, prompt: String) -> Result<GenerateResponse, LlmError> {
        let body = GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part {
                    text: SYSTEM_PROMPT.to_string(),
                }],
            },
            contents: vec![Content {
                role: Some("user".into()),
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                max_output_tokens: self.config.max_output_tokens,
                response_mime_type: "application/json",
            },
        };

        let request = match self.endpoint(model)? {
            Endpoint::ApiKey { url, key } => self.http.post(url).header("x-goog-api-key", key),
            Endpoint::Vertex { url, token } => self.http.post(url).bearer_auth(token),
        };
        let response = request
            .json(&body)
            .send()
            .await
            .map_err(LlmError::transport)?;
        let status = response.status();
        let text = response.text().await.map_err(LlmError::transport)?;
        if !status.is_success() {
            return Err(LlmError::status(status, &text));
        }
        serde_json::from_str(&text).map_err(|err| LlmError::InvalidResponse(err.to_string()))
    }
}

#[async_trait]
impl Estimator for GeminiClient {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    fn is_configured(&self) -> bool {
        self.config.api_key.is_some()
            || (self.config.project_id.is_some() && self.config.access_token.is_some())
    }

    async fn estimate(
        &self,
        products: &[ProductRecord],
        model_name: &str,
    ) -> Result<Estimation, PipelineError> {
        let prompt = build_user_prompt(products).map_err(|err| err.into_pipeline(STAGE))?;
        let started = Instant::now();
        let response = self
            .generate(model_name, prompt)
            .await
            .map_err(|err| err.into_pipeline(STAGE))?;
        let elapsed = started.elapsed();

        let text = response
            .text()
            .ok_or_else(|| LlmError::InvalidResponse("no candidate text".into()))
            .map_err(|err| err.into_pipeline(STAGE))?;
        let estimated = parse_estimates(&text).map_err(|err| {
            warn!(target = "weightwise.llm", provider = "gemini", error = %err, "estimation_schema_mismatch");
            err.into_pipeline(STAGE)
        })?;

        let tokens = response.usage_metadata.map(TokenUsage::from).unwrap_or_default();
        let usage = UsageStats::single_call(model_name, tokens, elapsed);
        info!(
            target = "weightwise.llm",
            provider = "gemini",
            model = model_name,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            elapsed_s = usage.processing_time_seconds,
            "estimation_complete"
        );
        Ok(Estimation {
            products: estimated,
            usage,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    system_instruction: Content,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    response_mime_type: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

impl GenerateResponse {
    fn text(&self) -> Option<String> {
        let text: String = self
            .candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .iter()
            .map(|part| part.text.as_str())
            .collect();
        if text.trim().is_empty() { None } else { Some(text) }
    }
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

impl From<UsageMetadata> for TokenUsage {
    fn from(value: UsageMetadata) -> Self {
        TokenUsage {
            input_tokens: value.prompt_token_count,
            output_tokens: value.candidates_token_count,
        }
    }
}
