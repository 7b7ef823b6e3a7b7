//! Asynchronous batch estimation. Offers are fetched and preprocessed up
//! front, submitted as one vendor batch, and correlated back by `custom_id`
//! (the normalized offer id) once the vendor reports the batch as ended.
//!
//! Only one batch is live at a time; see [`crate::slot`].

use crate::config::Provider;
use crate::llm::{
    EstimatedProduct, TokenUsage, UsageStats, parse_estimates, round_two, single_product,
};
use crate::models::OfferBatchRequest;
use crate::pipeline::{PipelineError, capture_stage, prepare_offer, resolve_model};
use crate::preprocess::{PreprocessStats, ProductRecord};
use crate::slot::{LiveJob, SlotError, SlotStore, SubmittedOffer};
use crate::store::{ProductStore, parse_offer_id};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};

const SUBMIT: &str = "batch_submit";
const STATUS: &str = "batch_status";
const RESULTS: &str = "batch_results";
const DEFAULT_RESERVATION_TTL: TimeDelta = TimeDelta::minutes(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Queued,
    InProgress,
    Canceling,
    Ended,
    Errored,
    Expired,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Queued => "queued",
            BatchState::InProgress => "in_progress",
            BatchState::Canceling => "canceling",
            BatchState::Ended => "ended",
            BatchState::Errored => "errored",
            BatchState::Expired => "expired",
        }
    }

    pub fn from_vendor(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "queued" | "pending" => Some(BatchState::Queued),
            "in_progress" | "running" => Some(BatchState::InProgress),
            "canceling" | "cancelling" => Some(BatchState::Canceling),
            "ended" | "completed" => Some(BatchState::Ended),
            "errored" | "failed" => Some(BatchState::Errored),
            "expired" => Some(BatchState::Expired),
            _ => None,
        }
    }

    /// Terminal states that will never produce results.
    pub fn is_failed(&self) -> bool {
        matches!(self, BatchState::Errored | BatchState::Expired)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestCounts {
    pub processing: u64,
    pub succeeded: u64,
    pub errored: u64,
    pub canceled: u64,
    pub expired: u64,
}

/// Vendor view of a batch.
#[derive(Debug, Clone)]
pub struct VendorBatch {
    pub id: String,
    pub state: BatchState,
    pub request_counts: RequestCounts,
    pub created_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum VendorOutcome {
    Succeeded { text: String, usage: TokenUsage },
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct VendorResult {
    pub custom_id: String,
    pub outcome: VendorOutcome,
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub custom_id: String,
    pub product: ProductRecord,
}

#[async_trait]
pub trait BatchProvider: Send + Sync {
    fn is_configured(&self) -> bool;

    async fn create_batch(
        &self,
        model_name: &str,
        requests: &[BatchRequest],
    ) -> Result<VendorBatch, PipelineError>;

    async fn retrieve_batch(&self, batch_id: &str) -> Result<VendorBatch, PipelineError>;

    async fn batch_results(&self, batch_id: &str) -> Result<Vec<VendorResult>, PipelineError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedOffer {
    pub offer_id: String,
    pub error: String,
}

impl FailedOffer {
    fn new(offer_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            offer_id: offer_id.into(),
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSubmission {
    pub batch_id: String,
    pub status: BatchState,
    pub model_name: String,
    pub total_requests: usize,
    pub failed_offers_count: usize,
    pub failed_offers: Vec<FailedOffer>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub batch_id: String,
    pub status: BatchState,
    pub request_counts: RequestCounts,
    pub created_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<VendorBatch> for BatchStatus {
    fn from(value: VendorBatch) -> Self {
        Self {
            batch_id: value.id,
            status: value.state,
            request_counts: value.request_counts,
            created_at: value.created_at,
            ended_at: value.ended_at,
            expires_at: value.expires_at,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct OfferResult {
    pub offer_id: String,
    pub success: bool,
    pub skus_were_identical: bool,
    pub preprocessing_stats: PreprocessStats,
    pub estimated_weights: Option<Vec<EstimatedProduct>>,
    pub usage: Option<TokenUsage>,
    pub error: Option<String>,
}

impl OfferResult {
    fn new(offer: &SubmittedOffer) -> Self {
        Self {
            offer_id: offer.offer_id.clone(),
            success: false,
            skus_were_identical: offer.preprocessing_stats.skus_were_identical(),
            preprocessing_stats: offer.preprocessing_stats,
            estimated_weights: None,
            usage: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResults {
    pub batch_id: String,
    pub total_offers: usize,
    pub successful_offers: usize,
    pub failed_offers: usize,
    pub results: Vec<OfferResult>,
    pub usage: UsageStats,
}

#[derive(Clone)]
pub struct BatchManager {
    store: Arc<dyn ProductStore>,
    provider: Arc<dyn BatchProvider>,
    slot: Arc<dyn SlotStore>,
    default_model: String,
    reservation_ttl: TimeDelta,
}

impl BatchManager {
    pub fn new(
        store: Arc<dyn ProductStore>,
        provider: Arc<dyn BatchProvider>,
        slot: Arc<dyn SlotStore>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provider,
            slot,
            default_model: default_model.into(),
            reservation_ttl: DEFAULT_RESERVATION_TTL,
        }
    }

    /// How long an unfinished submit may hold the slot before another
    /// submit is allowed to take it over.
    pub fn with_reservation_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.reservation_ttl = TimeDelta::from_std(ttl).unwrap_or(DEFAULT_RESERVATION_TTL);
        self
    }

    pub fn slot_backend(&self) -> &'static str {
        self.slot.backend()
    }

    pub fn provider_configured(&self) -> bool {
        self.provider.is_configured()
    }

    pub async fn current(&self) -> Result<Option<LiveJob>, PipelineError> {
        self.slot.current().await.map_err(|err| slot_error("batch_slot", err))
    }

    pub async fn submit(
        &self,
        request: OfferBatchRequest,
    ) -> Result<BatchSubmission, PipelineError> {
        if request.offer_ids.is_empty() {
            return Err(PipelineError::invalid_argument(
                SUBMIT,
                "offer_ids must contain at least one offer id",
            ));
        }
        if !self.provider.is_configured() {
            return Err(PipelineError::internal(
                SUBMIT,
                "batch provider credentials are not configured",
            ));
        }
        let model = resolve_model(
            SUBMIT,
            request.model_name.as_deref(),
            &self.default_model,
            Provider::Anthropic,
        )?;

        // Runs detached: dropping the caller does not cancel the claim, the
        // vendor submit or the release.
        let manager = self.clone();
        tokio::spawn(async move { manager.claim_and_submit(model, request).await })
            .await
            .map_err(|err| PipelineError::internal(SUBMIT, format!("submit task failed: {err}")))?
    }

    async fn claim_and_submit(
        &self,
        model: String,
        request: OfferBatchRequest,
    ) -> Result<BatchSubmission, PipelineError> {
        let reservation = LiveJob::reservation(&model);
        let reservation_id = reservation.batch_id.clone();
        self.claim(reservation.clone()).await?;

        let outcome = self
            .submit_claimed(reservation, request.offer_ids, request.drop_similar_skus)
            .await;
        if outcome.is_err() {
            self.release(SUBMIT, &reservation_id).await.ok();
        }
        outcome
    }

    async fn claim(&self, reservation: LiveJob) -> Result<(), PipelineError> {
        match self.slot.claim(reservation.clone()).await {
            Ok(()) => Ok(()),
            Err(SlotError::Occupied(holder))
                if holder.is_stale_reservation(Utc::now(), self.reservation_ttl) =>
            {
                warn!(
                    target = "weightwise.batch",
                    batch_id = %holder.batch_id,
                    claimed_at = %holder.claimed_at,
                    "stale_reservation_taken_over"
                );
                self.release(SUBMIT, &holder.batch_id).await?;
                self.slot
                    .claim(reservation)
                    .await
                    .map_err(|err| slot_error(SUBMIT, err))
            }
            Err(err) => Err(slot_error(SUBMIT, err)),
        }
    }

    async fn submit_claimed(
        &self,
        reservation: LiveJob,
        offer_ids: Vec<String>,
        drop_similar: bool,
    ) -> Result<BatchSubmission, PipelineError> {
        let mut seen = HashSet::new();
        let mut requests = Vec::new();
        let mut offers = Vec::new();
        let mut failed = Vec::new();

        for offer_id in offer_ids {
            let custom_id = match parse_offer_id(&offer_id) {
                Ok(id) => id.to_string(),
                Err(err) => {
                    failed.push(FailedOffer::new(offer_id, err.to_string()));
                    continue;
                }
            };
            if !seen.insert(custom_id.clone()) {
                failed.push(FailedOffer::new(offer_id, "duplicate offer id in request"));
                continue;
            }
            match prepare_offer(self.store.as_ref(), &custom_id, drop_similar).await {
                Ok(prepared) => {
                    requests.push(BatchRequest {
                        custom_id: custom_id.clone(),
                        product: prepared.product,
                    });
                    offers.push(SubmittedOffer {
                        offer_id,
                        custom_id,
                        preprocessing_stats: prepared.stats,
                    });
                }
                Err(err) => {
                    warn!(
                        target = "weightwise.batch",
                        offer_id = %offer_id,
                        kind = err.kind().code(),
                        error = %err,
                        "offer_preparation_failed"
                    );
                    failed.push(FailedOffer::new(offer_id, err.detail()));
                }
            }
        }

        if requests.is_empty() {
            return Err(PipelineError::invalid_argument(
                SUBMIT,
                format!("none of the {} offers could be prepared", failed.len()),
            ));
        }

        let model = reservation.model_name.clone();
        let reservation_id = reservation.batch_id.clone();
        let vendor = capture_stage(
            "batch_create",
            self.provider.create_batch(&model, &requests),
        )
        .await?;

        let job = LiveJob {
            batch_id: vendor.id.clone(),
            submitted: true,
            status: vendor.state,
            offers,
            created_at: vendor.created_at,
            expires_at: vendor.expires_at,
            ..reservation
        };
        let tracked = self
            .slot
            .replace(&reservation_id, job)
            .await
            .map_err(|err| slot_error(SUBMIT, err))
            .inspect_err(|_| orphaned(&vendor.id))?;
        if !tracked {
            orphaned(&vendor.id);
            return Err(PipelineError::internal(
                SUBMIT,
                format!("slot reservation lost; vendor batch {} is untracked", vendor.id),
            ));
        }

        info!(
            target = "weightwise.batch",
            batch_id = %vendor.id,
            model = %model,
            requests = requests.len(),
            failed = failed.len(),
            "batch_submitted"
        );
        Ok(BatchSubmission {
            batch_id: vendor.id,
            status: vendor.state,
            model_name: model,
            total_requests: requests.len(),
            failed_offers_count: failed.len(),
            failed_offers: failed,
        })
    }

    pub async fn status(&self, batch_id: &str) -> Result<BatchStatus, PipelineError> {
        let job = self.live_job(STATUS, batch_id).await?;
        if !job.submitted {
            return Ok(BatchStatus {
                batch_id: job.batch_id,
                status: job.status,
                request_counts: RequestCounts::default(),
                created_at: None,
                ended_at: None,
                expires_at: None,
            });
        }
        let vendor = capture_stage("batch_poll", self.provider.retrieve_batch(batch_id)).await?;
        self.record_status(STATUS, &job, &vendor).await?;
        Ok(vendor.into())
    }

    pub async fn results(&self, batch_id: &str) -> Result<BatchResults, PipelineError> {
        let job = self.live_job(RESULTS, batch_id).await?;
        if !job.submitted {
            return Err(PipelineError::conflict(
                RESULTS,
                "batch is still being submitted",
                job.batch_id,
                job.status,
            ));
        }

        let vendor = capture_stage("batch_poll", self.provider.retrieve_batch(batch_id)).await?;
        if vendor.state != BatchState::Ended {
            self.record_status(RESULTS, &job, &vendor).await?;
            return Err(PipelineError::conflict(
                RESULTS,
                format!("batch is not finished yet (status: {})", vendor.state.as_str()),
                batch_id,
                vendor.state,
            ));
        }

        let lines = capture_stage(
            "batch_fetch_results",
            self.provider.batch_results(batch_id),
        )
        .await?;
        let results = collate(&job, &vendor, lines);
        self.release(RESULTS, batch_id).await?;

        info!(
            target = "weightwise.batch",
            batch_id = %batch_id,
            successful = results.successful_offers,
            failed = results.failed_offers,
            "batch_results_collected"
        );
        Ok(results)
    }

    async fn live_job(&self, stage: &'static str, batch_id: &str) -> Result<LiveJob, PipelineError> {
        match self.slot.current().await.map_err(|err| slot_error(stage, err))? {
            Some(job) if job.batch_id == batch_id => Ok(job),
            _ => Err(PipelineError::not_found(
                stage,
                format!("unknown batch id `{batch_id}`"),
            )),
        }
    }

    /// Cache the vendor status in the slot, or free the slot when the vendor
    /// reports a terminal failure.
    async fn record_status(
        &self,
        stage: &'static str,
        job: &LiveJob,
        vendor: &VendorBatch,
    ) -> Result<(), PipelineError> {
        if vendor.state.is_failed() {
            warn!(
                target = "weightwise.batch",
                batch_id = %job.batch_id,
                status = vendor.state.as_str(),
                "batch_failed_slot_released"
            );
            return self.release(stage, &job.batch_id).await;
        }
        if vendor.state != job.status {
            let updated = LiveJob {
                status: vendor.state,
                ..job.clone()
            };
            self.slot
                .replace(&job.batch_id, updated)
                .await
                .map_err(|err| slot_error(stage, err))?;
        }
        Ok(())
    }

    async fn release(&self, stage: &'static str, batch_id: &str) -> Result<(), PipelineError> {
        let released = self
            .slot
            .release(batch_id)
            .await
            .map_err(|err| slot_error(stage, err))
            .inspect_err(|err| {
                error!(target = "weightwise.batch", batch_id = %batch_id, error = %err, "slot_release_failed");
            })?;
        if !released {
            warn!(target = "weightwise.batch", batch_id = %batch_id, "slot_already_released");
        }
        Ok(())
    }
}

fn orphaned(batch_id: &str) {
    error!(
        target = "weightwise.batch",
        batch_id = %batch_id,
        "vendor_batch_untracked"
    );
}

fn slot_error(stage: &'static str, err: SlotError) -> PipelineError {
    match err {
        SlotError::Occupied(job) => PipelineError::conflict(
            stage,
            format!(
                "batch `{}` is still live; collect its results before submitting another",
                job.batch_id
            ),
            job.batch_id.clone(),
            job.status,
        ),
        SlotError::Backend(message) => PipelineError::upstream_unavailable(stage, message),
    }
}

/// Map vendor result lines back onto the submitted offers. Every submitted
/// offer yields exactly one entry; lines for unknown ids are dropped.
fn collate(job: &LiveJob, vendor: &VendorBatch, lines: Vec<VendorResult>) -> BatchResults {
    let mut by_id: HashMap<String, VendorOutcome> = HashMap::with_capacity(lines.len());
    for line in lines {
        if by_id.contains_key(&line.custom_id) {
            warn!(target = "weightwise.batch", custom_id = %line.custom_id, "duplicate_result_line");
            continue;
        }
        by_id.insert(line.custom_id, line.outcome);
    }

    let mut usage = UsageStats::empty(&job.model_name);
    let mut results = Vec::with_capacity(job.offers.len());
    for offer in &job.offers {
        let mut result = OfferResult::new(offer);
        match by_id.remove(&offer.custom_id) {
            Some(VendorOutcome::Succeeded { text, usage: tokens }) => {
                usage.absorb(tokens);
                result.usage = Some(tokens);
                match parse_estimates(&text).and_then(single_product) {
                    Ok(product) => {
                        result.success = true;
                        result.estimated_weights = Some(vec![product]);
                    }
                    Err(err) => result.error = Some(err.to_string()),
                }
            }
            Some(VendorOutcome::Failed { reason }) => result.error = Some(reason),
            None => result.error = Some("no result returned for this request".into()),
        }
        results.push(result);
    }
    for custom_id in by_id.keys() {
        warn!(target = "weightwise.batch", custom_id = %custom_id, "unexpected_result_line");
    }

    if let (Some(created), Some(ended)) = (vendor.created_at.or(job.created_at), vendor.ended_at) {
        usage.processing_time_seconds =
            round_two((ended - created).num_milliseconds().max(0) as f64 / 1000.0);
    }

    let successful_offers = results.iter().filter(|result| result.success).count();
    BatchResults {
        batch_id: job.batch_id.clone(),
        total_offers: results.len(),
        successful_offers,
        failed_offers: results.len() - successful_offers,
        results,
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineErrorKind;
    use crate::slot::MemorySlot;
    use crate::testing::{FakeBatchProvider, MemoryStore, product_document};
    use std::time::Duration;

    const OFFERS: [i64; 5] = [624730890959, 624730890960, 624730890961, 624730890962, 624730890963];

    fn store() -> MemoryStore {
        OFFERS.iter().enumerate().fold(MemoryStore::new(), |store, (index, id)| {
            store.with(*id, product_document(&format!("Product {index}"), 4, 2))
        })
    }

    fn manager(provider: Arc<FakeBatchProvider>) -> BatchManager {
        BatchManager::new(
            Arc::new(store()),
            provider,
            Arc::new(MemorySlot::new()),
            "claude-sonnet-4-5",
        )
    }

    fn submit_request(ids: &[&str]) -> OfferBatchRequest {
        OfferBatchRequest {
            offer_ids: ids.iter().map(|id| id.to_string()).collect(),
            model_name: None,
            drop_similar_skus: true,
        }
    }

    fn all_offers() -> Vec<String> {
        OFFERS.iter().map(i64::to_string).collect()
    }

    fn all_offers_request() -> OfferBatchRequest {
        OfferBatchRequest {
            offer_ids: all_offers(),
            model_name: None,
            drop_similar_skus: true,
        }
    }

    #[tokio::test]
    async fn second_submit_conflicts_with_live_batch() {
        let provider = Arc::new(FakeBatchProvider::new());
        let manager = manager(provider.clone());

        let first = manager.submit(all_offers_request()).await.expect("submit");
        assert_eq!(first.total_requests, 5);
        assert_eq!(first.failed_offers_count, 0);
        assert_eq!(first.status, BatchState::InProgress);

        let err = manager
            .submit(all_offers_request())
            .await
            .expect_err("slot taken");
        assert_eq!(err.kind(), PipelineErrorKind::Conflict);
        let info = err.conflict_info().expect("conflict info");
        assert_eq!(info.batch_id, first.batch_id);
        assert_eq!(info.status, BatchState::InProgress);
        assert_eq!(provider.created(), 1);
    }

    #[tokio::test]
    async fn status_follows_vendor_progress() {
        let provider = Arc::new(FakeBatchProvider::new());
        let manager = manager(provider.clone());
        let submitted = manager.submit(all_offers_request()).await.expect("submit");

        let status = manager.status(&submitted.batch_id).await.expect("status");
        assert_eq!(status.status, BatchState::InProgress);
        assert_eq!(status.request_counts.processing, 5);

        provider.set_state(&submitted.batch_id, BatchState::Ended);
        let status = manager.status(&submitted.batch_id).await.expect("status");
        assert_eq!(status.status, BatchState::Ended);
        assert_eq!(status.request_counts.succeeded, 5);
        assert_eq!(status.request_counts.errored, 0);
        assert!(status.ended_at.is_some());

        let cached = manager.current().await.expect("current").expect("live job");
        assert_eq!(cached.status, BatchState::Ended);
    }

    #[tokio::test]
    async fn results_wait_for_the_batch_to_end_then_free_the_slot() {
        let provider = Arc::new(FakeBatchProvider::new());
        let manager = manager(provider.clone());
        let submitted = manager.submit(all_offers_request()).await.expect("submit");

        let err = manager
            .results(&submitted.batch_id)
            .await
            .expect_err("not finished");
        assert_eq!(err.kind(), PipelineErrorKind::Conflict);
        assert!(err.detail().contains("not finished yet"));
        assert_eq!(
            err.conflict_info().map(|info| info.status),
            Some(BatchState::InProgress)
        );

        provider.set_state(&submitted.batch_id, BatchState::Ended);
        let results = manager.results(&submitted.batch_id).await.expect("results");
        assert_eq!(results.total_offers, 5);
        assert_eq!(results.successful_offers, 5);
        assert_eq!(results.failed_offers, 0);
        assert_eq!(results.usage.api_calls_count, 5);
        assert_eq!(results.usage.total_tokens, 600);
        assert_eq!(results.usage.model_name, "claude-sonnet-4-5");
        let ids: Vec<&str> = results.results.iter().map(|r| r.offer_id.as_str()).collect();
        assert_eq!(ids, all_offers().iter().map(String::as_str).collect::<Vec<_>>());
        let first = &results.results[0];
        assert_eq!(first.preprocessing_stats.total_skus_after, 2);
        assert_eq!(
            first.estimated_weights.as_ref().map(|w| w[0].skus.len()),
            Some(2)
        );

        assert!(manager.current().await.expect("current").is_none());
        let again = manager.submit(all_offers_request()).await.expect("slot freed");
        assert_ne!(again.batch_id, submitted.batch_id);
    }

    #[tokio::test]
    async fn every_offer_is_accounted_for_exactly_once() {
        let provider = Arc::new(FakeBatchProvider::new());
        let manager = manager(provider.clone());
        let input = [
            "624730890959",
            "not-a-number",
            "624730890960",
            "624730890959",
            "777",
            "624730890961",
            "624730890962",
        ];
        let submitted = manager.submit(submit_request(&input)).await.expect("submit");
        assert_eq!(submitted.total_requests, 4);
        assert_eq!(submitted.failed_offers_count, 3);
        let failed: Vec<&str> = submitted
            .failed_offers
            .iter()
            .map(|f| f.offer_id.as_str())
            .collect();
        assert_eq!(failed, ["not-a-number", "624730890959", "777"]);

        provider.error_result("624730890960");
        provider.malformed_result("624730890961");
        provider.omit_result("624730890962");
        provider.set_state(&submitted.batch_id, BatchState::Ended);
        let results = manager.results(&submitted.batch_id).await.expect("results");
        assert_eq!(results.total_offers, 4);
        assert_eq!(results.successful_offers, 1);
        assert_eq!(results.failed_offers, 3);

        let mut seen: Vec<String> = failed.iter().map(|id| id.to_string()).collect();
        seen.extend(results.results.iter().map(|r| r.offer_id.clone()));
        let mut expected: Vec<String> = input.iter().map(|id| id.to_string()).collect();
        seen.sort();
        expected.sort();
        assert_eq!(seen, expected);

        let by_id: HashMap<&str, &OfferResult> = results
            .results
            .iter()
            .map(|r| (r.offer_id.as_str(), r))
            .collect();
        assert_eq!(
            by_id["624730890960"].error.as_deref(),
            Some("invalid_request_error")
        );
        assert!(by_id["624730890961"].error.as_deref().unwrap_or("").contains("schema"));
        assert!(by_id["624730890961"].usage.is_some());
        assert!(by_id["624730890962"].error.is_some());
        assert!(by_id["624730890959"].success);
    }

    #[tokio::test]
    async fn custom_ids_are_normalized_offer_ids() {
        let provider = Arc::new(FakeBatchProvider::new());
        let manager = manager(provider.clone());
        let submitted = manager
            .submit(submit_request(&[" 624730890959", "624730890960"]))
            .await
            .expect("submit");
        assert_eq!(
            provider.custom_ids(&submitted.batch_id),
            ["624730890959", "624730890960"]
        );
    }

    #[tokio::test]
    async fn nothing_to_submit_leaves_slot_empty() {
        let provider = Arc::new(FakeBatchProvider::new());
        let manager = manager(provider.clone());
        let err = manager
            .submit(submit_request(&["1", "2"]))
            .await
            .expect_err("no survivors");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidArgument);
        assert!(manager.current().await.expect("current").is_none());
        assert_eq!(provider.created(), 0);

        let err = manager.submit(submit_request(&[])).await.expect_err("empty");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn vendor_failure_releases_the_claim() {
        let manager = manager(Arc::new(FakeBatchProvider::failing()));
        let err = manager
            .submit(all_offers_request())
            .await
            .expect_err("vendor down");
        assert_eq!(err.kind(), PipelineErrorKind::UpstreamUnavailable);
        assert!(manager.current().await.expect("current").is_none());
    }

    #[tokio::test]
    async fn gemini_model_is_rejected_for_batches() {
        let manager = manager(Arc::new(FakeBatchProvider::new()));
        let mut request = all_offers_request();
        request.model_name = Some("gemini-2.5-flash".into());
        let err = manager.submit(request).await.expect_err("wrong vendor");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidArgument);
        assert!(manager.current().await.expect("current").is_none());
    }

    #[tokio::test]
    async fn unknown_batch_id_is_not_found() {
        let provider = Arc::new(FakeBatchProvider::new());
        let manager = manager(provider.clone());
        let err = manager.status("msgbatch_99").await.expect_err("no batch");
        assert_eq!(err.kind(), PipelineErrorKind::NotFound);

        manager.submit(all_offers_request()).await.expect("submit");
        let err = manager.results("msgbatch_99").await.expect_err("wrong id");
        assert_eq!(err.kind(), PipelineErrorKind::NotFound);
    }

    #[tokio::test]
    async fn expired_batch_frees_the_slot_on_poll() {
        let provider = Arc::new(FakeBatchProvider::new());
        let manager = manager(provider.clone());
        let submitted = manager.submit(all_offers_request()).await.expect("submit");

        provider.set_state(&submitted.batch_id, BatchState::Expired);
        let status = manager.status(&submitted.batch_id).await.expect("status");
        assert_eq!(status.status, BatchState::Expired);
        assert_eq!(status.request_counts.expired, 5);
        assert!(manager.current().await.expect("current").is_none());

        manager.submit(all_offers_request()).await.expect("slot freed");
    }

    #[test]
    fn vendor_statuses_parse() {
        assert_eq!(BatchState::from_vendor("in_progress"), Some(BatchState::InProgress));
        assert_eq!(BatchState::from_vendor("ENDED"), Some(BatchState::Ended));
        assert_eq!(BatchState::from_vendor("mystery"), None);
        assert!(BatchState::Errored.is_failed());
        assert!(!BatchState::Ended.is_failed());
        assert_eq!(
            serde_json::to_value(BatchState::InProgress).expect("json"),
            "in_progress"
        );
    }

    #[tokio::test]
    async fn dropped_submit_still_tracks_the_vendor_batch() {
        let provider = Arc::new(FakeBatchProvider::new());
        let manager = BatchManager::new(
            Arc::new(store().slowed(Duration::from_millis(20))),
            provider.clone(),
            Arc::new(MemorySlot::new()),
            "claude-sonnet-4-5",
        );

        let caller = tokio::spawn({
            let manager = manager.clone();
            async move { manager.submit(all_offers_request()).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        caller.abort();

        let job = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(job) = manager.current().await.expect("current")
                    && job.submitted
                {
                    break job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("submit finished in the background");
        assert_eq!(job.batch_id, "msgbatch_01");
        assert_eq!(job.offers.len(), 5);
        assert_eq!(provider.created(), 1);

        provider.set_state(&job.batch_id, BatchState::Ended);
        let results = manager.results(&job.batch_id).await.expect("results");
        assert_eq!(results.successful_offers, 5);
        assert!(manager.current().await.expect("current").is_none());
    }

    #[tokio::test]
    async fn stale_reservation_is_taken_over() {
        let slot = Arc::new(MemorySlot::new());
        let abandoned = LiveJob {
            claimed_at: Utc::now() - TimeDelta::hours(1),
            ..LiveJob::reservation("claude-sonnet-4-5")
        };
        slot.claim(abandoned.clone()).await.expect("claim");
        let provider = Arc::new(FakeBatchProvider::new());
        let manager = BatchManager::new(Arc::new(store()), provider.clone(), slot, "claude-sonnet-4-5")
            .with_reservation_ttl(Duration::from_secs(600));

        let submitted = manager.submit(all_offers_request()).await.expect("submit");
        assert_ne!(submitted.batch_id, abandoned.batch_id);
        assert_eq!(provider.created(), 1);
    }

    #[tokio::test]
    async fn fresh_reservation_still_blocks_submit() {
        let slot = Arc::new(MemorySlot::new());
        let pending = LiveJob::reservation("claude-sonnet-4-5");
        slot.claim(pending.clone()).await.expect("claim");
        let provider = Arc::new(FakeBatchProvider::new());
        let manager = BatchManager::new(Arc::new(store()), provider.clone(), slot, "claude-sonnet-4-5");

        let err = manager
            .submit(all_offers_request())
            .await
            .expect_err("reservation is live");
        assert_eq!(err.kind(), PipelineErrorKind::Conflict);
        assert_eq!(
            err.conflict_info().map(|info| info.batch_id.as_str()),
            Some(pending.batch_id.as_str())
        );
        assert_eq!(provider.created(), 0);
    }

    #[tokio::test]
    async fn result_with_wrong_product_count_fails_that_offer() {
        let provider = Arc::new(FakeBatchProvider::new());
        let manager = manager(provider.clone());
        let submitted = manager.submit(all_offers_request()).await.expect("submit");
        let ids = provider.custom_ids(&submitted.batch_id);
        provider.raw_result(&ids[0], "[]");
        provider.raw_result(
            &ids[1],
            &serde_json::json!([{ "skus": [] }, { "skus": [] }]).to_string(),
        );
        provider.set_state(&submitted.batch_id, BatchState::Ended);

        let results = manager.results(&submitted.batch_id).await.expect("results");
        assert_eq!(results.successful_offers, 3);
        assert_eq!(results.failed_offers, 2);
        for (custom_id, expected) in [(&ids[0], "got 0"), (&ids[1], "got 2")] {
            let entry = results
                .results
                .iter()
                .find(|r| &r.offer_id == custom_id)
                .expect("entry for offer");
            assert!(!entry.success);
            assert!(entry.estimated_weights.is_none());
            assert!(entry.error.as_deref().unwrap_or("").contains(expected));
        }
    }
}
