mod anthropic;
mod gemini;

pub use anthropic::{AnthropicClient, AnthropicConfig};
pub use gemini::{GeminiClient, GeminiConfig};

use crate::config::Provider;
use crate::pipeline::PipelineError;
use crate::preprocess::{ProductRecord, ShippingInfo, SkuRecord};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub const SYSTEM_PROMPT: &str = r#"
You are an e-commerce logistics auditor. You receive a JSON list of products. Each product has a `name`,
a hierarchical `categories` list, product level `main_info` (dimensions and weight, often missing or wrong)
and a list of `skus` with `skuAttributes` and their own dimensions and weight of uneven quality.

For every product:
1. Use the name and the category hierarchy to decide the plausible physical envelope of the item
   (an accessory is not the device it fits).
2. Decide which SKU attributes change the physical item (model, size, capacity) and which are cosmetic
   (color, pattern). SKUs that differ only cosmetically share dimensions and weight.
3. Infer the units of the given numbers and flag values outside the plausible envelope.
4. Fill every missing or invalid value, preferring the average of valid SKUs in the same attribute cluster,
   then `main_info`, then the average of any valid SKU, and only then an estimate from name and category.

Convert everything to centimeters and grams. Never output null.

Return strict JSON only, no markdown, one object per input product, in input order:
[
  {
    "skus": [
      { "skuId": "<exactly as in input>", "length_cm": 0.0, "width_cm": 0.0, "height_cm": 0.0, "weight_g": 0.0 }
    ]
  }
]
"#;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{message}")]
    Status { message: String, transient: bool },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("response does not match the estimation schema: {0}")]
    Schema(String),
}

impl LlmError {
    pub(crate) fn transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Transport(format!("timed out: {err}"))
        } else {
            LlmError::Transport(err.to_string())
        }
    }

    pub(crate) fn status(status: reqwest::StatusCode, body: &str) -> Self {
        LlmError::Status {
            message: crate::http::vendor_message(status, body),
            transient: crate::http::is_transient(status),
        }
    }

    pub fn into_pipeline(self, stage: &'static str) -> PipelineError {
        match self {
            LlmError::NotConfigured(_) => PipelineError::internal(stage, self.to_string()),
            LlmError::Transport(_) => PipelineError::upstream_unavailable(stage, self.to_string()),
            LlmError::Status { transient: true, .. } => {
                PipelineError::upstream_unavailable(stage, self.to_string())
            }
            LlmError::Status { .. } | LlmError::InvalidResponse(_) | LlmError::Schema(_) => {
                PipelineError::upstream_protocol(stage, self.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkuEstimate {
    #[serde(rename = "skuId", deserialize_with = "string_or_number")]
    pub sku_id: String,
    pub length_cm: f64,
    pub width_cm: f64,
    pub height_cm: f64,
    pub weight_g: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatedProduct {
    pub skus: Vec<SkuEstimate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub api_calls_count: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub processing_time_seconds: f64,
    pub model_name: String,
}

impl UsageStats {
    pub fn single_call(model_name: &str, tokens: TokenUsage, elapsed: Duration) -> Self {
        Self {
            api_calls_count: 1,
            input_tokens: tokens.input_tokens,
            output_tokens: tokens.output_tokens,
            total_tokens: tokens.input_tokens + tokens.output_tokens,
            processing_time_seconds: round_two(elapsed.as_secs_f64()),
            model_name: model_name.to_string(),
        }
    }

    pub fn empty(model_name: &str) -> Self {
        Self {
            api_calls_count: 0,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            processing_time_seconds: 0.0,
            model_name: model_name.to_string(),
        }
    }

    /// Fold one per-request usage figure into a batch aggregate.
    pub fn absorb(&mut self, tokens: TokenUsage) {
        self.api_calls_count += 1;
        self.input_tokens += tokens.input_tokens;
        self.output_tokens += tokens.output_tokens;
        self.total_tokens += tokens.input_tokens + tokens.output_tokens;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct Estimation {
    pub products: Vec<EstimatedProduct>,
    pub usage: UsageStats,
}

/// A model vendor able to impute dimensions for a list of products in one
/// synchronous call.
#[async_trait]
pub trait Estimator: Send + Sync {
    fn provider(&self) -> Provider;

    fn is_configured(&self) -> bool;

    async fn estimate(
        &self,
        products: &[ProductRecord],
        model_name: &str,
    ) -> Result<Estimation, PipelineError>;
}

#[derive(Serialize)]
struct PromptProduct<'a> {
    name: &'a str,
    categories: &'a [Value],
    main_info: &'a ShippingInfo,
    skus: &'a [SkuRecord],
}

pub fn build_user_prompt(products: &[ProductRecord]) -> Result<String, LlmError> {
    let prepared: Vec<PromptProduct<'_>> = products
        .iter()
        .map(|product| PromptProduct {
            name: product.name.as_deref().unwrap_or("Unknown Product"),
            categories: &product.categories,
            main_info: &product.main_info,
            skus: &product.skus,
        })
        .collect();
    let body = serde_json::to_string_pretty(&prepared)
        .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
    Ok(format!(
        "Please process the following product data according to the system instructions:\n\n{body}\n\nReturn only the processed JSON array with the specified structure."
    ))
}

/// Parse and validate model output. The text may be wrapped in a markdown
/// code fence; the payload must be a JSON array of products whose SKUs all
/// carry finite, non-negative numbers.
pub fn parse_estimates(text: &str) -> Result<Vec<EstimatedProduct>, LlmError> {
    let cleaned = strip_markdown_fence(text);
    let products: Vec<EstimatedProduct> =
        serde_json::from_str(&cleaned).map_err(|err| LlmError::Schema(err.to_string()))?;
    for (index, product) in products.iter().enumerate() {
        for sku in &product.skus {
            let values = [sku.length_cm, sku.width_cm, sku.height_cm, sku.weight_g];
            if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(LlmError::Schema(format!(
                    "product {index}, sku {}: dimensions must be finite and non-negative",
                    sku.sku_id
                )));
            }
        }
    }
    Ok(products)
}

/// A request that carried one product must get exactly one back.
pub fn single_product(products: Vec<EstimatedProduct>) -> Result<EstimatedProduct, LlmError> {
    let count = products.len();
    let mut products = products.into_iter();
    match (products.next(), products.next()) {
        (Some(product), None) => Ok(product),
        _ => Err(LlmError::Schema(format!("expected 1 product, got {count}"))),
    }
}

pub fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

pub fn round_two(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "skuId must be a string or number, got {other}"
        ))),
    }
}
