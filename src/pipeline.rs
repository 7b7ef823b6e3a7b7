use crate::batch::BatchState;
use crate::config::Provider;
use crate::llm::{Estimation, Estimator, UsageStats, single_product};
use crate::models::{
    EstimateRequest, MultiEstimateResponse, OfferBatchRequest, OfferEstimate, OfferFailure,
    WeightEstimationResponse,
};
use crate::preprocess::{PreprocessStats, ProductRecord, parse_product, preprocess};
use crate::store::ProductStore;
use std::{collections::HashSet, future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Synchronous estimation path: fetch one offer, clean it, ask the model,
/// assemble the response.
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn ProductStore>,
    estimator: Arc<dyn Estimator>,
    default_model: String,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ProductStore>,
        estimator: Arc<dyn Estimator>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            store,
            estimator,
            default_model: default_model.into(),
        }
    }

    pub fn store(&self) -> &dyn ProductStore {
        self.store.as_ref()
    }

    pub fn estimator(&self) -> &dyn Estimator {
        self.estimator.as_ref()
    }

    pub async fn run(
        &self,
        request: EstimateRequest,
    ) -> Result<WeightEstimationResponse, PipelineError> {
        let model = resolve_model(
            "estimate",
            request.model_name.as_deref(),
            &self.default_model,
            self.estimator.provider(),
        )?;

        let prepared = capture_stage(
            "prepare",
            prepare_offer(
                self.store.as_ref(),
                &request.offer_id,
                request.drop_similar_skus,
            ),
        )
        .await?;

        let estimation = capture_stage(
            "estimate",
            self.estimator
                .estimate(std::slice::from_ref(&prepared.product), &model),
        )
        .await?;
        let Estimation { products, usage } = estimation;
        let product = single_product(products).map_err(|err| err.into_pipeline("estimate"))?;

        info!(
            target = "weightwise.pipeline",
            offer_id = %prepared.offer_id,
            model = %model,
            skus_before = prepared.stats.total_skus_before,
            skus_after = prepared.stats.total_skus_after,
            "estimate_complete"
        );
        Ok(assemble_response(
            &prepared,
            Estimation {
                products: vec![product],
                usage,
            },
        ))
    }

    /// Estimate several offers with a single model call. Offers that cannot
    /// be fetched or preprocessed are reported individually; the model reply
    /// is matched to the surviving offers by position.
    pub async fn run_many(
        &self,
        request: OfferBatchRequest,
    ) -> Result<MultiEstimateResponse, PipelineError> {
        const STAGE: &str = "estimate_many";
        if request.offer_ids.is_empty() {
            return Err(PipelineError::invalid_argument(
                STAGE,
                "offer_ids must contain at least one offer id",
            ));
        }
        let model = resolve_model(
            STAGE,
            request.model_name.as_deref(),
            &self.default_model,
            self.estimator.provider(),
        )?;

        enum Entry {
            Failed(OfferFailure),
            Prepared(usize),
        }
        let mut entries = Vec::with_capacity(request.offer_ids.len());
        let mut prepared = Vec::new();
        let mut seen = HashSet::new();
        for offer_id in request.offer_ids {
            if !seen.insert(offer_id.trim().to_string()) {
                entries.push(Entry::Failed(OfferFailure::new(
                    offer_id,
                    "duplicate offer id in request",
                )));
                continue;
            }
            match prepare_offer(self.store.as_ref(), &offer_id, request.drop_similar_skus).await {
                Ok(offer) => {
                    entries.push(Entry::Prepared(prepared.len()));
                    prepared.push(offer);
                }
                Err(err) => {
                    warn!(
                        target = "weightwise.pipeline",
                        offer_id = %offer_id,
                        kind = err.kind().code(),
                        error = %err,
                        "offer_preparation_failed"
                    );
                    entries.push(Entry::Failed(OfferFailure::new(offer_id, err.detail())));
                }
            }
        }

        let mut estimated: Vec<Option<WeightEstimationResponse>> = Vec::new();
        let usage = if prepared.is_empty() {
            UsageStats::empty(&model)
        } else {
            let products: Vec<ProductRecord> =
                prepared.iter().map(|offer| offer.product.clone()).collect();
            let estimation =
                capture_stage("estimate", self.estimator.estimate(&products, &model)).await?;
            if estimation.products.len() != prepared.len() {
                return Err(PipelineError::upstream_protocol(
                    "estimate",
                    format!(
                        "model returned {} products for {} inputs",
                        estimation.products.len(),
                        prepared.len()
                    ),
                ));
            }
            for (offer, product) in prepared.iter().zip(estimation.products) {
                estimated.push(Some(assemble_response(
                    offer,
                    Estimation {
                        products: vec![product],
                        usage: estimation.usage.clone(),
                    },
                )));
            }
            estimation.usage
        };

        let results: Vec<OfferEstimate> = entries
            .into_iter()
            .filter_map(|entry| match entry {
                Entry::Failed(failure) => Some(OfferEstimate::Failure(failure)),
                Entry::Prepared(index) => estimated
                    .get_mut(index)
                    .and_then(Option::take)
                    .map(|response| OfferEstimate::Success(Box::new(response))),
            })
            .collect();
        let successful_offers = results.iter().filter(|entry| entry.is_success()).count();
        info!(
            target = "weightwise.pipeline",
            model = %model,
            offers = results.len(),
            successful = successful_offers,
            "estimate_many_complete"
        );
        Ok(MultiEstimateResponse {
            success: true,
            total_offers: results.len(),
            successful_offers,
            failed_offers: results.len() - successful_offers,
            results,
            model_api_stats: usage,
        })
    }
}

/// A fetched and preprocessed offer, ready to be sent to a model.
#[derive(Debug, Clone)]
pub struct PreparedOffer {
    pub offer_id: String,
    pub product: ProductRecord,
    pub stats: PreprocessStats,
    pub raw_size_chars: usize,
    pub preprocessed_size_chars: usize,
}

pub async fn prepare_offer(
    store: &dyn ProductStore,
    offer_id: &str,
    drop_similar: bool,
) -> Result<PreparedOffer, PipelineError> {
    let raw = store.fetch(offer_id).await?;
    let raw_size_chars = json_chars(&raw)?;
    let record = parse_product(&raw)
        .map_err(|err| PipelineError::invalid_argument("preprocess", err.to_string()))?;
    let (product, stats) = preprocess(record, drop_similar);
    let preprocessed_size_chars = json_chars(&product)?;
    Ok(PreparedOffer {
        offer_id: offer_id.trim().to_string(),
        product,
        stats,
        raw_size_chars,
        preprocessed_size_chars,
    })
}

fn json_chars<T: serde::Serialize>(value: &T) -> Result<usize, PipelineError> {
    serde_json::to_string(value)
        .map(|text| text.chars().count())
        .map_err(|err| PipelineError::internal("preprocess", err.to_string()))
}

pub fn assemble_response(
    prepared: &PreparedOffer,
    estimation: Estimation,
) -> WeightEstimationResponse {
    WeightEstimationResponse {
        success: true,
        offer_id: prepared.offer_id.clone(),
        skus_were_identical: prepared.stats.skus_were_identical(),
        estimated_weights: estimation.products,
        preprocessing_stats: prepared.stats,
        model_api_stats: estimation.usage,
        raw_data_size_chars: prepared.raw_size_chars,
        preprocessed_data_size_chars: prepared.preprocessed_size_chars,
    }
}

/// Pick the requested model (or the default) and make sure it belongs to
/// the vendor that will serve it.
pub fn resolve_model(
    stage: &'static str,
    requested: Option<&str>,
    default_model: &str,
    provider: Provider,
) -> Result<String, PipelineError> {
    let model = requested
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(default_model);
    if Provider::infer_from_model(model) != provider {
        return Err(PipelineError::invalid_argument(
            stage,
            format!(
                "model `{model}` is not served by the configured {} provider",
                provider.as_str()
            ),
        ));
    }
    Ok(model.to_string())
}

pub(crate) async fn capture_stage<T, Fut>(name: &'static str, fut: Fut) -> Result<T, PipelineError>
where
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let started = Instant::now();
    let outcome = fut.await;
    crate::metrics::stage_elapsed(name, started.elapsed().as_millis());
    if let Err(err) = &outcome {
        crate::metrics::stage_failed(name, err.kind().code());
    }
    outcome
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
    conflict: Option<ConflictInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidArgument,
    NotFound,
    Conflict,
    UpstreamUnavailable,
    UpstreamProtocolError,
    Internal,
}

impl PipelineErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineErrorKind::InvalidArgument => "invalid_argument",
            PipelineErrorKind::NotFound => "not_found",
            PipelineErrorKind::Conflict => "conflict",
            PipelineErrorKind::UpstreamUnavailable => "upstream_unavailable",
            PipelineErrorKind::UpstreamProtocolError => "upstream_protocol_error",
            PipelineErrorKind::Internal => "internal",
        }
    }
}

/// The live batch that blocked an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub batch_id: String,
    pub status: BatchState,
}

impl PipelineError {
    fn new(stage: &'static str, message: impl Into<String>, kind: PipelineErrorKind) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
            conflict: None,
        }
    }

    pub fn invalid_argument(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::InvalidArgument)
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::NotFound)
    }

    pub fn conflict(
        stage: &'static str,
        message: impl Into<String>,
        batch_id: impl Into<String>,
        status: BatchState,
    ) -> Self {
        Self {
            conflict: Some(ConflictInfo {
                batch_id: batch_id.into(),
                status,
            }),
            ..Self::new(stage, message, PipelineErrorKind::Conflict)
        }
    }

    pub fn upstream_unavailable(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::UpstreamUnavailable)
    }

    pub fn upstream_protocol(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::UpstreamProtocolError)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::Internal)
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }

    pub fn conflict_info(&self) -> Option<&ConflictInfo> {
        self.conflict.as_ref()
    }
}
