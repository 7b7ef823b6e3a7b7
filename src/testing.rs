//! In-memory stand-ins for the product store and the model vendors.

use crate::batch::{
    BatchProvider, BatchRequest, BatchState, RequestCounts, VendorBatch, VendorOutcome,
    VendorResult,
};
use crate::config::Provider;
use crate::llm::{EstimatedProduct, Estimation, Estimator, SkuEstimate, TokenUsage, UsageStats};
use crate::pipeline::PipelineError;
use crate::preprocess::ProductRecord;
use crate::store::{ProductStore, StoreError, parse_offer_id};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// Product document with `sku_count` SKUs spread over `distinct` dimension
/// groups, shaped like the relaxed extended JSON the store returns.
pub fn product_document(name: &str, sku_count: usize, distinct: usize) -> Value {
    let skus: Vec<Value> = (0..sku_count)
        .map(|index| {
            let group = (index % distinct.max(1)) as f64;
            let mut sku = json!({
                "skuId": { "$numberLong": (5_170_000_000_000_u64 + index as u64).to_string() },
                "skuAttributes": [{ "attributeName": "Color", "value": format!("color-{index}") }],
                "skuShippingDetail": {
                    "length": 20.0 + group,
                    "width": 10.0,
                    "height": 5.0,
                    "weight": 300.0 + group
                }
            });
            if index == 0 {
                sku["productShippingInfo"] = json!({ "length": 22, "width": 11, "height": 6, "weight": 320 });
            }
            sku
        })
        .collect();
    json!({
        "_id": { "$oid": "64b7f0c2a1b2c3d4e5f60718" },
        "name": name,
        "categories": ["Home", "Lighting"],
        "productSkuInfos": skus
    })
}

#[derive(Default)]
pub struct MemoryStore {
    documents: HashMap<i64, Value>,
    unavailable: bool,
    delay: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Make every fetch take at least `delay`.
    pub fn slowed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with(mut self, offer_id: i64, document: Value) -> Self {
        self.documents.insert(offer_id, document);
        self
    }
}

#[async_trait]
impl ProductStore for MemoryStore {
    async fn fetch(&self, offer_id: &str) -> Result<Value, PipelineError> {
        let id = parse_offer_id(offer_id)?;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable {
            return Err(StoreError::Unavailable("connection refused".into()).into());
        }
        self.documents
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id).into())
    }

    async fn ping(&self) -> Result<(), PipelineError> {
        if self.unavailable {
            Err(StoreError::Unavailable("connection refused".into()).into())
        } else {
            Ok(())
        }
    }
}

fn estimates_for(product: &ProductRecord) -> EstimatedProduct {
    EstimatedProduct {
        skus: product
            .skus
            .iter()
            .map(|sku| SkuEstimate {
                sku_id: sku.sku_id.clone().unwrap_or_default(),
                length_cm: 20.0,
                width_cm: 10.0,
                height_cm: 5.0,
                weight_g: 300.0,
            })
            .collect(),
    }
}

pub struct FakeEstimator {
    provider: Provider,
    product_count: Option<usize>,
}

impl FakeEstimator {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            product_count: None,
        }
    }

    /// Reply with `count` products whatever the request held.
    pub fn returning_products(mut self, count: usize) -> Self {
        self.product_count = Some(count);
        self
    }
}

#[async_trait]
impl Estimator for FakeEstimator {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn estimate(
        &self,
        products: &[ProductRecord],
        model_name: &str,
    ) -> Result<Estimation, PipelineError> {
        let mut estimated: Vec<EstimatedProduct> = products.iter().map(estimates_for).collect();
        if let Some(count) = self.product_count {
            estimated = estimated.iter().cycle().take(count).cloned().collect();
        }
        Ok(Estimation {
            products: estimated,
            usage: UsageStats::single_call(
                model_name,
                TokenUsage {
                    input_tokens: 120,
                    output_tokens: 30,
                },
                Duration::from_millis(10),
            ),
        })
    }
}

struct FakeBatch {
    state: BatchState,
    requests: Vec<BatchRequest>,
}

#[derive(Default)]
struct FakeBatches {
    created: u32,
    batches: HashMap<String, FakeBatch>,
    fail_create: bool,
    errored: HashSet<String>,
    malformed: HashSet<String>,
    missing: HashSet<String>,
    raw: HashMap<String, String>,
}

/// Vendor batch API kept in memory. Batches stay `in_progress` until the
/// test moves them on with [`FakeBatchProvider::set_state`].
#[derive(Default)]
pub struct FakeBatchProvider {
    inner: Mutex<FakeBatches>,
}

impl FakeBatchProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let provider = Self::default();
        provider.lock().fail_create = true;
        provider
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeBatches> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_state(&self, batch_id: &str, state: BatchState) {
        if let Some(batch) = self.lock().batches.get_mut(batch_id) {
            batch.state = state;
        }
    }

    pub fn created(&self) -> u32 {
        self.lock().created
    }

    /// Request ids sent with `batch_id`, in submission order.
    pub fn custom_ids(&self, batch_id: &str) -> Vec<String> {
        self.lock()
            .batches
            .get(batch_id)
            .map(|batch| batch.requests.iter().map(|r| r.custom_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn error_result(&self, custom_id: &str) {
        self.lock().errored.insert(custom_id.to_string());
    }

    pub fn malformed_result(&self, custom_id: &str) {
        self.lock().malformed.insert(custom_id.to_string());
    }

    /// Answer `custom_id` with `text` verbatim.
    pub fn raw_result(&self, custom_id: &str, text: &str) {
        self.lock().raw.insert(custom_id.to_string(), text.to_string());
    }

    pub fn omit_result(&self, custom_id: &str) {
        self.lock().missing.insert(custom_id.to_string());
    }

    fn snapshot(id: &str, batch: &FakeBatch, errored: &HashSet<String>) -> VendorBatch {
        let total = batch.requests.len() as u64;
        let failed = batch
            .requests
            .iter()
            .filter(|r| errored.contains(&r.custom_id))
            .count() as u64;
        let request_counts = match batch.state {
            BatchState::Ended => RequestCounts {
                succeeded: total - failed,
                errored: failed,
                ..RequestCounts::default()
            },
            BatchState::Expired => RequestCounts {
                expired: total,
                ..RequestCounts::default()
            },
            _ => RequestCounts {
                processing: total,
                ..RequestCounts::default()
            },
        };
        let created_at = Utc::now() - ChronoDuration::minutes(30);
        VendorBatch {
            id: id.to_string(),
            state: batch.state,
            request_counts,
            created_at: Some(created_at),
            ended_at: (batch.state == BatchState::Ended).then(Utc::now),
            expires_at: Some(created_at + ChronoDuration::hours(24)),
        }
    }
}

#[async_trait]
impl BatchProvider for FakeBatchProvider {
    fn is_configured(&self) -> bool {
        true
    }

    async fn create_batch(
        &self,
        _model_name: &str,
        requests: &[BatchRequest],
    ) -> Result<VendorBatch, PipelineError> {
        let mut inner = self.lock();
        if inner.fail_create {
            return Err(PipelineError::upstream_unavailable(
                "batch_vendor",
                "HTTP 529 Overloaded: Overloaded",
            ));
        }
        inner.created += 1;
        let id = format!("msgbatch_{:02}", inner.created);
        let batch = FakeBatch {
            state: BatchState::InProgress,
            requests: requests.to_vec(),
        };
        let snapshot = Self::snapshot(&id, &batch, &inner.errored);
        inner.batches.insert(id, batch);
        Ok(snapshot)
    }

    async fn retrieve_batch(&self, batch_id: &str) -> Result<VendorBatch, PipelineError> {
        let inner = self.lock();
        let batch = inner.batches.get(batch_id).ok_or_else(|| {
            PipelineError::upstream_protocol("batch_vendor", "HTTP 404 Not Found: batch not found")
        })?;
        Ok(Self::snapshot(batch_id, batch, &inner.errored))
    }

    async fn batch_results(&self, batch_id: &str) -> Result<Vec<VendorResult>, PipelineError> {
        let inner = self.lock();
        let batch = inner.batches.get(batch_id).ok_or_else(|| {
            PipelineError::upstream_protocol("batch_vendor", "HTTP 404 Not Found: batch not found")
        })?;
        let mut lines: Vec<VendorResult> = batch
            .requests
            .iter()
            .filter(|request| !inner.missing.contains(&request.custom_id))
            .map(|request| {
                let outcome = if inner.errored.contains(&request.custom_id) {
                    VendorOutcome::Failed {
                        reason: "invalid_request_error".into(),
                    }
                } else if let Some(text) = inner.raw.get(&request.custom_id) {
                    VendorOutcome::Succeeded {
                        text: text.clone(),
                        usage: TokenUsage {
                            input_tokens: 100,
                            output_tokens: 20,
                        },
                    }
                } else if inner.malformed.contains(&request.custom_id) {
                    VendorOutcome::Succeeded {
                        text: "I could not find dimensions for this product.".into(),
                        usage: TokenUsage {
                            input_tokens: 100,
                            output_tokens: 12,
                        },
                    }
                } else {
                    VendorOutcome::Succeeded {
                        text: serde_json::to_string(&[estimates_for(&request.product)])
                            .unwrap_or_default(),
                        usage: TokenUsage {
                            input_tokens: 100,
                            output_tokens: 20,
                        },
                    }
                };
                VendorResult {
                    custom_id: request.custom_id.clone(),
                    outcome,
                }
            })
            .collect();
        // vendors do not promise input order
        lines.reverse();
        Ok(lines)
    }
}
