//! The single "current batch" reservation. At most one batch job is live at
//! a time; the slot is claimed by submit and released once results have been
//! collected (or the vendor reports a terminal failure).

use crate::batch::BatchState;
use crate::preprocess::PreprocessStats;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

const PENDING_PREFIX: &str = "pending-";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveJob {
    pub batch_id: String,
    /// False while the submission is still being prepared and the vendor has
    /// not handed out a batch id yet.
    pub submitted: bool,
    pub status: BatchState,
    pub model_name: String,
    #[serde(default)]
    pub offers: Vec<SubmittedOffer>,
    pub claimed_at: DateTime<Utc>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedOffer {
    pub offer_id: String,
    pub custom_id: String,
    pub preprocessing_stats: PreprocessStats,
}

impl LiveJob {
    pub fn reservation(model_name: &str) -> Self {
        Self {
            batch_id: format!("{PENDING_PREFIX}{}", Uuid::new_v4().simple()),
            submitted: false,
            status: BatchState::Queued,
            model_name: model_name.to_string(),
            offers: Vec::new(),
            claimed_at: Utc::now(),
            created_at: None,
            expires_at: None,
        }
    }

    /// A reservation whose submit never finished within `ttl`.
    pub fn is_stale_reservation(&self, now: DateTime<Utc>, ttl: TimeDelta) -> bool {
        !self.submitted && now - self.claimed_at > ttl
    }
}

#[derive(Debug, Error)]
pub enum SlotError {
    #[error("batch `{}` is still live ({})", .0.batch_id, .0.status.as_str())]
    Occupied(Box<LiveJob>),
    #[error("slot backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait SlotStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Take the slot for `job`, failing with [`SlotError::Occupied`] when
    /// another job holds it.
    async fn claim(&self, job: LiveJob) -> Result<(), SlotError>;

    async fn current(&self) -> Result<Option<LiveJob>, SlotError>;

    /// Overwrite the slot only while it still belongs to `batch_id`.
    async fn replace(&self, batch_id: &str, job: LiveJob) -> Result<bool, SlotError>;

    /// Free the slot only while it still belongs to `batch_id`.
    async fn release(&self, batch_id: &str) -> Result<bool, SlotError>;
}

#[derive(Default)]
pub struct MemorySlot {
    inner: Mutex<Option<LiveJob>>,
}

impl MemorySlot {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SlotStore for MemorySlot {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn claim(&self, job: LiveJob) -> Result<(), SlotError> {
        let mut guard = self.inner.lock().await;
        if let Some(existing) = guard.as_ref() {
            return Err(SlotError::Occupied(Box::new(existing.clone())));
        }
        *guard = Some(job);
        Ok(())
    }

    async fn current(&self) -> Result<Option<LiveJob>, SlotError> {
        Ok(self.inner.lock().await.clone())
    }

    async fn replace(&self, batch_id: &str, job: LiveJob) -> Result<bool, SlotError> {
        let mut guard = self.inner.lock().await;
        match guard.as_ref() {
            Some(existing) if existing.batch_id == batch_id => {
                *guard = Some(job);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, batch_id: &str) -> Result<bool, SlotError> {
        let mut guard = self.inner.lock().await;
        match guard.as_ref() {
            Some(existing) if existing.batch_id == batch_id => {
                *guard = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

const REPLACE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then return 0 end
if cjson.decode(current)['batch_id'] ~= ARGV[1] then return 0 end
redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

const RELEASE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then return 0 end
if cjson.decode(current)['batch_id'] ~= ARGV[1] then return 0 end
redis.call('DEL', KEYS[1])
return 1
"#;

/// Slot shared by every replica: a single JSON value under one key, claimed
/// with `SET NX` and updated through compare-and-set scripts keyed on the
/// batch id.
pub struct RedisSlot {
    client: redis::Client,
    key: String,
}

impl RedisSlot {
    pub fn new(client: redis::Client, key: impl Into<String>) -> Self {
        Self {
            client,
            key: key.into(),
        }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, SlotError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)
    }
}

fn backend(err: impl std::fmt::Display) -> SlotError {
    SlotError::Backend(err.to_string())
}

#[async_trait]
impl SlotStore for RedisSlot {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn claim(&self, job: LiveJob) -> Result<(), SlotError> {
        let payload = serde_json::to_string(&job).map_err(backend)?;
        let mut conn = self.connection().await?;
        let stored: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(payload)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        if stored.is_some() {
            return Ok(());
        }
        match self.current().await? {
            Some(existing) => Err(SlotError::Occupied(Box::new(existing))),
            None => Err(SlotError::Backend(
                "slot changed while claiming; retry".into(),
            )),
        }
    }

    async fn current(&self) -> Result<Option<LiveJob>, SlotError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(&self.key).await.map_err(backend)?;
        raw.map(|value| serde_json::from_str(&value).map_err(backend))
            .transpose()
    }

    async fn replace(&self, batch_id: &str, job: LiveJob) -> Result<bool, SlotError> {
        let payload = serde_json::to_string(&job).map_err(backend)?;
        let mut conn = self.connection().await?;
        let updated: i64 = redis::Script::new(REPLACE_SCRIPT)
            .key(&self.key)
            .arg(batch_id)
            .arg(payload)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(updated == 1)
    }

    async fn release(&self, batch_id: &str) -> Result<bool, SlotError> {
        let mut conn = self.connection().await?;
        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(batch_id)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(released == 1)
    }
}
