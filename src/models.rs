use crate::llm::{EstimatedProduct, UsageStats};
use crate::preprocess::PreprocessStats;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct EstimateRequest {
    pub offer_id: String,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default = "default_true")]
    pub drop_similar_skus: bool,
}

/// Body of both the synchronous multi-offer estimate and batch submission.
#[derive(Debug, Clone, Deserialize)]
pub struct OfferBatchRequest {
    pub offer_ids: Vec<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default = "default_true")]
    pub drop_similar_skus: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeightEstimationResponse {
    pub success: bool,
    pub offer_id: String,
    pub skus_were_identical: bool,
    pub estimated_weights: Vec<EstimatedProduct>,
    pub preprocessing_stats: PreprocessStats,
    pub model_api_stats: UsageStats,
    pub raw_data_size_chars: usize,
    pub preprocessed_data_size_chars: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OfferFailure {
    pub success: bool,
    pub offer_id: String,
    pub error: String,
}

impl OfferFailure {
    pub fn new(offer_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            offer_id: offer_id.into(),
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OfferEstimate {
    Success(Box<WeightEstimationResponse>),
    Failure(OfferFailure),
}

impl OfferEstimate {
    pub fn is_success(&self) -> bool {
        matches!(self, OfferEstimate::Success(_))
    }
}

/// Several offers estimated in one synchronous model call. Every entry of
/// `results` shares the same `model_api_stats`.
#[derive(Debug, Clone, Serialize)]
pub struct MultiEstimateResponse {
    pub success: bool,
    pub total_offers: usize,
    pub successful_offers: usize,
    pub failed_offers: usize,
    pub results: Vec<OfferEstimate>,
    pub model_api_stats: UsageStats,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub detail: Option<String>,
    pub batch_id: Option<String>,
    pub status: Option<String>,
}

impl ApiError {
    pub fn new(error: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            detail: Some(detail.into()),
            batch_id: None,
            status: None,
        }
    }
}
