use super::{
    Estimation, Estimator, LlmError, SYSTEM_PROMPT, TokenUsage, UsageStats, build_user_prompt,
    parse_estimates,
};
use crate::batch::{
    BatchProvider, BatchRequest, BatchState, RequestCounts, VendorBatch, VendorOutcome, VendorResult,
};
use crate::config::{Provider, env_opt, env_or};
use crate::http::build_client;
use crate::pipeline::PipelineError;
use crate::preprocess::ProductRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::time::Instant;
use tracing::{info, warn};

const ESTIMATE_STAGE: &str = "estimate";
const BATCH_STAGE: &str = "batch_vendor";

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub version: String,
    pub max_tokens: u32,
    pub batch_max_tokens: u32,
    pub temperature: f32,
}

impl AnthropicConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: env_opt("ANTHROPIC_API_KEY"),
            base_url: env_or("ANTHROPIC_BASE_URL", "https://api.anthropic.com")
                .trim_end_matches('/')
                .to_string(),
            version: env_or("ANTHROPIC_VERSION", "2023-06-01"),
            max_tokens: 8000,
            batch_max_tokens: 20000,
            temperature: 0.1,
        }
    }
}

pub struct AnthropicClient {
    http: Client,
    config: AnthropicConfig,
}

impl AnthropicClient {
    pub fn new(config: AnthropicConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, LlmError> {
        let key = self
            .config
            .api_key
            .as_deref()
            .ok_or(LlmError::NotConfigured("ANTHROPIC_API_KEY"))?;
        Ok(self
            .http
            .request(method, format!("{}{path}", self.config.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", &self.config.version))
    }

    async fn send_raw(&self, request: RequestBuilder) -> Result<String, LlmError> {
        let response = request.send().await.map_err(LlmError::transport)?;
        let status = response.status();
        let body = response.text().await.map_err(LlmError::transport)?;
        if !status.is_success() {
            return Err(LlmError::status(status, &body));
        }
        Ok(body)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, LlmError> {
        let body = self.send_raw(request).await?;
        serde_json::from_str(&body).map_err(|err| LlmError::InvalidResponse(err.to_string()))
    }

    fn params(
        &self,
        model: &str,
        products: &[ProductRecord],
        max_tokens: u32,
    ) -> Result<MessageParams, LlmError> {
        Ok(MessageParams {
            model: model.to_string(),
            max_tokens,
            temperature: self.config.temperature,
            system: SYSTEM_PROMPT.to_string(),
            messages: vec![Message {
                role: "user".into(),
                content: build_user_prompt(products)?,
            }],
        })
    }

    pub async fn create_message(&self, params: &MessageParams) -> Result<MessageResponse, LlmError> {
        let request = self.request(Method::POST, "/v1/messages")?.json(params);
        self.send(request).await
    }

    pub async fn create_message_batch(&self, items: &[BatchItem]) -> Result<MessageBatch, LlmError> {
        let request = self
            .request(Method::POST, "/v1/messages/batches")?
            .json(&serde_json::json!({ "requests": items }));
        self.send(request).await
    }

    pub async fn retrieve_message_batch(&self, batch_id: &str) -> Result<MessageBatch, LlmError> {
        let path = format!("/v1/messages/batches/{}", urlencoding::encode(batch_id));
        let request = self.request(Method::GET, &path)?;
        self.send(request).await
    }

    /// Results are streamed back as JSON Lines, one entry per request.
    pub async fn message_batch_results(
        &self,
        batch_id: &str,
    ) -> Result<Vec<BatchResultLine>, LlmError> {
        let path = format!("/v1/messages/batches/{}/results", urlencoding::encode(batch_id));
        let body = self.send_raw(self.request(Method::GET, &path)?).await?;
        body.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                serde_json::from_str::<BatchResultLine>(line)
                    .map_err(|err| LlmError::InvalidResponse(format!("results line: {err}")))
            })
            .collect()
    }
}

#[async_trait]
impl Estimator for AnthropicClient {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn is_configured(&self) -> bool {
        self.config.api_key.is_some()
    }

    async fn estimate(
        &self,
        products: &[ProductRecord],
        model_name: &str,
    ) -> Result<Estimation, PipelineError> {
        let params = self
            .params(model_name, products, self.config.max_tokens)
            .map_err(|err| err.into_pipeline(ESTIMATE_STAGE))?;
        let started = Instant::now();
        let response = self
            .create_message(&params)
            .await
            .map_err(|err| err.into_pipeline(ESTIMATE_STAGE))?;
        let elapsed = started.elapsed();
        let text = response
            .text()
            .ok_or_else(|| LlmError::InvalidResponse("missing text content".into()))
            .map_err(|err| err.into_pipeline(ESTIMATE_STAGE))?;
        let estimated = parse_estimates(&text).map_err(|err| {
            warn!(target = "weightwise.llm", provider = "anthropic", error = %err, "estimation_schema_mismatch");
            err.into_pipeline(ESTIMATE_STAGE)
        })?;
        let usage = UsageStats::single_call(model_name, response.usage, elapsed);
        info!(
            target = "weightwise.llm",
            provider = "anthropic",
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

#[async_trait]
impl BatchProvider for AnthropicClient {
    fn is_configured(&self) -> bool {
        self.config.api_key.is_some()
    }

    async fn create_batch(
        &self,
        model_name: &str,
        requests: &[BatchRequest],
    ) -> Result<VendorBatch, PipelineError> {
        let items = requests
            .iter()
            .map(|req| -> Result<BatchItem, LlmError> {
                Ok(BatchItem {
                    custom_id: req.custom_id.clone(),
                    params: self.params(
                        model_name,
                        std::slice::from_ref(&req.product),
                        self.config.batch_max_tokens,
                    )?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| err.into_pipeline(BATCH_STAGE))?;
        let batch = self
            .create_message_batch(&items)
            .await
            .map_err(|err| err.into_pipeline(BATCH_STAGE))?;
        Ok(batch.into_vendor())
    }

    async fn retrieve_batch(&self, batch_id: &str) -> Result<VendorBatch, PipelineError> {
        let batch = self
            .retrieve_message_batch(batch_id)
            .await
            .map_err(|err| err.into_pipeline(BATCH_STAGE))?;
        Ok(batch.into_vendor())
    }

    async fn batch_results(&self, batch_id: &str) -> Result<Vec<VendorResult>, PipelineError> {
        let lines = self
            .message_batch_results(batch_id)
            .await
            .map_err(|err| err.into_pipeline(BATCH_STAGE))?;
        Ok(lines.into_iter().map(BatchResultLine::into_vendor).collect())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageParams {
    model: String,
    max_tokens: u32,
    temperature: f32,
    system: String,
    messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    custom_id: String,
    params: MessageParams,
}

#[derive(Debug, Deserialize)]
pub struct MessageResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: TokenUsage,
}

impl MessageResponse {
    fn text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(""))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessageBatch {
    id: String,
    processing_status: String,
    #[serde(default)]
    request_counts: RequestCounts,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

impl MessageBatch {
    fn into_vendor(self) -> VendorBatch {
        let state = BatchState::from_vendor(&self.processing_status).unwrap_or_else(|| {
            warn!(
                target = "weightwise.batch",
                batch_id = %self.id,
                status = %self.processing_status,
                "unknown_batch_status"
            );
            BatchState::InProgress
        });
        VendorBatch {
            id: self.id,
            state,
            request_counts: self.request_counts,
            created_at: self.created_at,
            ended_at: self.ended_at,
            expires_at: self.expires_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchResultLine {
    custom_id: String,
    result: BatchResultBody,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BatchResultBody {
    Succeeded { message: MessageResponse },
    Errored {
        #[serde(default)]
        error: Value,
    },
    Canceled,
    Expired,
}

impl BatchResultLine {
    fn into_vendor(self) -> VendorResult {
        let outcome = match self.result {
            BatchResultBody::Succeeded { message } => match message.text() {
                Some(text) => VendorOutcome::Succeeded {
                    text,
                    usage: message.usage,
                },
                None => VendorOutcome::Failed {
                    reason: "response carried no text content".into(),
                },
            },
            BatchResultBody::Errored { error } => VendorOutcome::Failed {
                reason: error
                    .pointer("/error/message")
                    .or_else(|| error.pointer("/message"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("errored: {error}")),
            },
            BatchResultBody::Canceled => VendorOutcome::Failed {
                reason: "request was canceled".into(),
            },
            BatchResultBody::Expired => VendorOutcome::Failed {
                reason: "request expired before processing".into(),
            },
        };
        VendorResult {
            custom_id: self.custom_id,
            outcome,
        }
    }
}
