use crate::config::MongoSettings;
use crate::pipeline::PipelineError;
use async_trait::async_trait;
use mongodb::bson::{Bson, Document, doc};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const STAGE: &str = "fetch";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("offer id `{0}` is not a valid integer")]
    InvalidOfferId(String),
    #[error("no product found for offer id {0}")]
    NotFound(i64),
    #[error("product store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for PipelineError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::InvalidOfferId(_) => PipelineError::invalid_argument(STAGE, value.to_string()),
            StoreError::NotFound(_) => PipelineError::not_found(STAGE, value.to_string()),
            StoreError::Unavailable(_) => {
                PipelineError::upstream_unavailable(STAGE, value.to_string())
            }
        }
    }
}

/// Offer ids arrive as strings but are stored as 64-bit integers.
pub fn parse_offer_id(raw: &str) -> Result<i64, StoreError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| StoreError::InvalidOfferId(raw.to_string()))
}

#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Raw product document for `offer_id`, as relaxed extended JSON.
    async fn fetch(&self, offer_id: &str) -> Result<Value, PipelineError>;

    async fn ping(&self) -> Result<(), PipelineError>;
}

pub struct MongoStore {
    client: Client,
    collection: Collection<Document>,
}

impl MongoStore {
    /// Build the client. The driver connects lazily, so an unreachable
    /// cluster only surfaces on the first query or [`ProductStore::ping`].
    pub async fn connect(settings: &MongoSettings) -> Result<Self, StoreError> {
        let mut options = ClientOptions::parse(&settings.connection_string)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        options.app_name = Some("weightwise-api-rs".into());
        options.server_selection_timeout = Some(Duration::from_secs(5));
        let client =
            Client::with_options(options).map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let collection = client
            .database(&settings.database_name)
            .collection::<Document>(&settings.collection_name);
        Ok(Self { client, collection })
    }
}

#[async_trait]
impl ProductStore for MongoStore {
    async fn fetch(&self, offer_id: &str) -> Result<Value, PipelineError> {
        let id = parse_offer_id(offer_id)?;
        let found = self
            .collection
            .find_one(doc! { "offerId": id })
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let document = found.ok_or(StoreError::NotFound(id))?;
        debug!(target = "weightwise.store", offer_id = id, "product_fetched");
        Ok(Bson::Document(document).into_relaxed_extjson())
    }

    async fn ping(&self) -> Result<(), PipelineError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(|err| StoreError::Unavailable(err.to_string()).into())
    }
}
