//! External collaborator interfaces
//!
//! The control loop treats fetching, enrichment, clustering and classification
//! as black boxes behind these traits. Each call is made through the retrying
//! invoker, so implementations report failures with the [`PipelineError`]
//! taxonomy: `TransientIo` for anything worth retrying, `Permanent` otherwise.
//!
//! Reference implementations used by the `moodpulse` binary live in the
//! submodules.

pub mod http_fetcher;
pub mod keyword_clusterer;
pub mod lexicon_classifier;
pub mod text_normalizer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::PipelineResult;
use crate::models::EmotionSample;

pub use http_fetcher::HttpFetcher;
pub use keyword_clusterer::KeywordClusterer;
pub use lexicon_classifier::{LexiconClassifier, LexiconLoader};
pub use text_normalizer::TextNormalizer;

/// One piece of raw content for an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub entity_id: String,
    /// Source-assigned id, unique per entity
    pub item_id: String,
    pub text: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

/// A failure confined to one item (or one entity) of a fetch call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub entity_id: String,
    /// None when the whole entity failed
    pub item_id: Option<String>,
    pub reason: String,
}

/// Result of one fetch call: what arrived plus what failed, per item
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchBatch {
    pub items: Vec<RawItem>,
    pub failures: Vec<ItemFailure>,
}

/// Raw item after enrichment (or the untouched original on fallback)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedItem {
    pub entity_id: String,
    pub item_id: String,
    pub text: String,
    /// False when enrichment failed and the original text was kept
    pub enriched: bool,
}

impl EnrichedItem {
    /// Keep the raw item as-is
    pub fn fallback(raw: &RawItem) -> Self {
        Self {
            entity_id: raw.entity_id.clone(),
            item_id: raw.item_id.clone(),
            text: raw.text.clone(),
            enriched: false,
        }
    }
}

/// Items of one entity grouped under a topic label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemCluster {
    pub entity_id: String,
    pub label: String,
    pub items: Vec<EnrichedItem>,
}

/// Content fetch collaborator
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch raw items for the given entities
    ///
    /// Duplicate ids must not produce duplicate items. A failing item or entity
    /// goes into `FetchBatch::failures`; only a failure of the call as a whole is
    /// returned as `Err`.
    async fn fetch(&self, entity_ids: &[String]) -> PipelineResult<FetchBatch>;
}

/// Enrichment collaborator (translation, extraction, cleanup)
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Enrich items; an item that cannot be enriched comes back as its fallback
    async fn enrich(&self, items: &[RawItem]) -> PipelineResult<Vec<EnrichedItem>>;
}

/// Topic clustering collaborator
#[async_trait]
pub trait Clusterer: Send + Sync {
    async fn cluster(&self, entity_id: &str, items: &[EnrichedItem]) -> PipelineResult<Vec<ItemCluster>>;
}

/// The expensive emotion classification capability
#[async_trait]
pub trait EmotionClassifier: Send + Sync {
    fn name(&self) -> &str;

    /// Classify one entity's items into samples (at most one per item)
    async fn classify(&self, entity_id: &str, items: &[EnrichedItem]) -> PipelineResult<Vec<EmotionSample>>;
}

/// Produces the classification capability on demand
#[async_trait]
pub trait ClassifierLoader: Send + Sync {
    /// Load the capability; any error is reported as unavailable
    async fn load(&self) -> PipelineResult<Arc<dyn EmotionClassifier>>;
}
