//! Turns a loosely structured product document into the typed record that
//! is sent to the model, and collapses SKUs that share identical physical
//! attributes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PreprocessError {
    #[error("product document is not a JSON object")]
    NotAnObject,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductRecord {
    pub id: Option<String>,
    pub name: Option<String>,
    pub categories: Vec<Value>,
    pub main_info: ShippingInfo,
    pub skus: Vec<SkuRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShippingInfo {
    pub length: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub weight: Option<f64>,
    #[serde(rename = "aiWeight")]
    pub ai_weight: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SkuRecord {
    #[serde(rename = "skuId")]
    pub sku_id: Option<String>,
    #[serde(rename = "skuAttributes")]
    pub attributes: Vec<Value>,
    pub length: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub weight: Option<f64>,
    #[serde(rename = "aiWeight")]
    pub ai_weight: Option<f64>,
}

impl SkuRecord {
    /// Bit patterns of length/width/height/weight, present only when all four
    /// are known and non-zero. Two SKUs with equal keys are duplicates.
    fn dimension_key(&self) -> Option<[u64; 4]> {
        let dims = [self.length?, self.width?, self.height?, self.weight?];
        if dims.iter().any(|value| *value == 0.0) {
            return None;
        }
        Some(dims.map(f64::to_bits))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreprocessStats {
    pub total_skus_before: usize,
    pub total_skus_after: usize,
    pub skus_removed: usize,
    pub duplicate_removal_applied: bool,
}

impl PreprocessStats {
    /// Every SKU of a multi-SKU product collapsed into a single representative.
    pub fn skus_were_identical(&self) -> bool {
        self.total_skus_before > 1 && self.total_skus_after == 1
    }
}

/// Parse a raw store document. Identifier wrappers (`{"$oid": ..}`,
/// `{"$numberLong": ..}`) are unwrapped, a missing SKU list becomes empty and
/// malformed SKU entries are skipped.
pub fn parse_product(document: &Value) -> Result<ProductRecord, PreprocessError> {
    let obj = document.as_object().ok_or(PreprocessError::NotAnObject)?;

    let sku_infos = obj
        .get("productSkuInfos")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let main_info = sku_infos
        .first()
        .and_then(Value::as_object)
        .and_then(|first| first.get("productShippingInfo"))
        .and_then(Value::as_object)
        .map(shipping_info)
        .unwrap_or_default();

    let skus = sku_infos
        .iter()
        .filter_map(Value::as_object)
        .map(parse_sku)
        .collect();

    Ok(ProductRecord {
        id: obj.get("_id").and_then(|raw| unwrap_scalar(raw, "$oid")),
        name: obj.get("name").and_then(Value::as_str).map(str::to_string),
        categories: obj
            .get("categories")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        main_info,
        skus,
    })
}

fn parse_sku(info: &Map<String, Value>) -> SkuRecord {
    let detail = info
        .get("skuShippingDetail")
        .and_then(Value::as_object)
        .map(shipping_info)
        .unwrap_or_default();
    SkuRecord {
        sku_id: info
            .get("skuId")
            .and_then(|raw| unwrap_scalar(raw, "$numberLong")),
        attributes: info
            .get("skuAttributes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        length: detail.length,
        width: detail.width,
        height: detail.height,
        weight: detail.weight,
        ai_weight: detail.ai_weight,
    }
}

fn shipping_info(obj: &Map<String, Value>) -> ShippingInfo {
    ShippingInfo {
        length: number(obj.get("length")),
        width: number(obj.get("width")),
        height: number(obj.get("height")),
        weight: number(obj.get("weight")),
        ai_weight: number(obj.get("aiWeight")),
    }
}

fn unwrap_scalar(value: &Value, wrapper: &str) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(obj) => obj.get(wrapper).and_then(|inner| unwrap_scalar(inner, wrapper)),
        _ => None,
    }
}

/// Numbers arrive as JSON numbers, numeric strings, or canonical extended
/// JSON wrappers such as `{"$numberDouble": "12.5"}`.
fn number(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Object(obj) => ["$numberDouble", "$numberInt", "$numberLong", "$numberDecimal"]
            .iter()
            .find_map(|key| obj.get(*key))
            .and_then(|inner| number(Some(inner))),
        _ => None,
    };
    parsed.filter(|n| n.is_finite())
}

/// Collapse duplicate SKUs (see [`SkuRecord::dimension_key`]), keeping the
/// first occurrence and the original order. Pure and idempotent.
pub fn preprocess(mut record: ProductRecord, drop_similar: bool) -> (ProductRecord, PreprocessStats) {
    let before = record.skus.len();
    if drop_similar {
        let mut seen = HashSet::new();
        record.skus.retain(|sku| match sku.dimension_key() {
            Some(key) => seen.insert(key),
            None => true,
        });
    }
    let after = record.skus.len();
    let removed = before - after;
    if removed > 0 {
        debug!(
            target = "weightwise.preprocess",
            product = record.name.as_deref().unwrap_or("unknown"),
            before,
            after,
            "duplicate_skus_removed"
        );
    }
    let stats = PreprocessStats {
        total_skus_before: before,
        total_skus_after: after,
        skus_removed: removed,
        duplicate_removal_applied: removed > 0,
    };
    (record, stats)
}
