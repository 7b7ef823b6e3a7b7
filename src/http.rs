use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Shared outbound client for the model vendors. The overall timeout bounds
/// every synchronous estimation call; model responses routinely take tens
/// of seconds, so the default is generous.
pub fn build_client() -> Client {
    let timeout = std::env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(120);
    let connect = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .user_agent(concat!("weightwise-api-rs/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Pull a human readable message out of a vendor error body. Both Anthropic
/// (`{"error": {"message": ..}}`) and Google (`{"error": {"message": ..}}`)
/// nest it the same way; anything else falls back to the raw body.
pub fn vendor_message(status: StatusCode, body: &str) -> String {
    let message = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        value
            .pointer("/error/message")
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    match message {
        Some(message) => format!("HTTP {status}: {message}"),
        None if body.trim().is_empty() => format!("HTTP {status}"),
        None => format!("HTTP {status}: {}", truncate(body.trim(), 300)),
    }
}

/// Statuses worth a caller-side retry.
pub fn is_transient(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn truncate(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        value.to_string()
    } else {
        let head: String = value.chars().take(limit.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
