use crate::llm::{AnthropicConfig, GeminiConfig};
use std::env;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid value for `{key}`: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub mongodb: MongoSettings,
    pub anthropic: AnthropicConfig,
    pub gemini: GeminiConfig,
    pub provider: Provider,
    pub default_model: String,
    pub batch_model: String,
    pub host: String,
    pub port: u16,
    pub debug: bool,
    pub redis_url: Option<String>,
    pub request_max_bytes: usize,
    /// Directory for daily-rotated log files; stdout only when unset.
    pub log_dir: Option<String>,
    /// Age after which an unfinished submit reservation may be taken over.
    pub batch_reservation_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct MongoSettings {
    pub connection_string: String,
    pub database_name: String,
    pub collection_name: String,
}

/// Vendor used for the synchronous `/estimate-weight` path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    Gemini,
}

impl Provider {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Some(Provider::Anthropic),
            "gemini" | "google" | "vertex" => Some(Provider::Gemini),
            _ => None,
        }
    }

    /// Guess the vendor from a model identifier such as `claude-sonnet-4-5`.
    pub fn infer_from_model(model: &str) -> Self {
        if model.trim().to_lowercase().starts_with("claude") {
            Provider::Anthropic
        } else {
            Provider::Gemini
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
        }
    }
}

impl Settings {
    /// Load settings from the process environment. A `.env` file in the
    /// working directory is honoured when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let connection_string = env_opt("MONGODB_CONNECTION_STRING")
            .ok_or(ConfigError::Missing("MONGODB_CONNECTION_STRING"))?;
        let mongodb = MongoSettings {
            connection_string,
            database_name: env_or("MONGODB_DATABASE_NAME", "markazmongodbprod"),
            collection_name: env_or("MONGODB_COLLECTION_NAME", "productsV2"),
        };

        let default_model = env_or("DEFAULT_MODEL_NAME", "gemini-2.5-flash");
        let provider = match env_opt("ESTIMATOR_PROVIDER") {
            Some(raw) => Provider::parse(&raw).ok_or(ConfigError::Invalid {
                key: "ESTIMATOR_PROVIDER",
                value: raw,
            })?,
            None => Provider::infer_from_model(&default_model),
        };

        let port = match env_opt("API_PORT").or_else(|| env_opt("PORT")) {
            Some(raw) => raw.parse::<u16>().map_err(|_| ConfigError::Invalid {
                key: "API_PORT",
                value: raw,
            })?,
            None => 8000,
        };

        Ok(Self {
            mongodb,
            anthropic: AnthropicConfig::from_env(),
            gemini: GeminiConfig::from_env(),
            provider,
            default_model,
            batch_model: env_or("BATCH_MODEL_NAME", "claude-sonnet-4-5"),
            host: env_or("API_HOST", "0.0.0.0"),
            port,
            debug: parse_env_bool("API_DEBUG"),
            redis_url: env_opt("REDIS_URL"),
            request_max_bytes: env_opt("REQUEST_MAX_BYTES")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(1024 * 1024),
            log_dir: env_opt("LOG_DIR"),
            batch_reservation_ttl_secs: env_opt("BATCH_RESERVATION_TTL_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(900),
        })
    }
}

pub(crate) fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn parse_env_bool(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
