use ::metrics::{counter, histogram};
use tracing::trace;

// Recorded through the `metrics` facade; the Prometheus recorder installed
// in `main` renders them at `/metrics`.

pub const REQUESTS_TOTAL: &str = "weightwise_requests_total";
pub const STAGE_DURATION_SECONDS: &str = "weightwise_stage_duration_seconds";
pub const STAGE_FAILURES_TOTAL: &str = "weightwise_stage_failures_total";

pub fn inc_requests(route: &'static str) {
    counter!(REQUESTS_TOTAL, "route" => route).increment(1);
    trace!(
        target = "weightwise.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    histogram!(STAGE_DURATION_SECONDS, "stage" => stage).record(elapsed_ms as f64 / 1000.0);
    trace!(
        target = "weightwise.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn stage_failed(stage: &'static str, kind: &'static str) {
    counter!(STAGE_FAILURES_TOTAL, "stage" => stage, "kind" => kind).increment(1);
    trace!(
        target = "weightwise.metrics",
        stage = stage,
        kind = kind,
        "stage_failed_total_inc"
    );
}
