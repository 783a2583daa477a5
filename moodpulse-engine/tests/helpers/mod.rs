//! Shared fixtures for orchestrator integration tests
//!
//! Scripted collaborators stand in for the content source and the classifier
//! loader; enrichment and clustering use the real reference implementations.

#![allow(dead_code)]

use async_trait::async_trait;
use moodpulse_common::config::TomlConfig;
use moodpulse_common::db::init_database;
use moodpulse_common::events::{EventBus, PulseEvent};
use moodpulse_engine::collaborators::{
    ClassifierLoader, EmotionClassifier, EnrichedItem, Enricher, FetchBatch, Fetcher, ItemFailure,
    KeywordClusterer, LexiconClassifier, RawItem, TextNormalizer,
};
use moodpulse_engine::models::EntityState;
use moodpulse_engine::{Collaborators, PipelineError, PipelineOrchestrator, PipelineResult};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Defaults with instant backoff so retries do not slow the suite down
pub fn test_config() -> TomlConfig {
    let mut config = TomlConfig::default();
    config.resilience.backoff_initial_secs = 0;
    config.resilience.backoff_max_secs = 0;
    config.resilience.stage_timeout_secs = 5;
    config.pipeline.fetch_workers = 2;
    config
}

pub async fn test_db() -> (TempDir, SqlitePool) {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("moodpulse.db")).await.unwrap();
    (dir, pool)
}

pub fn entities(ids: &[&str]) -> Vec<EntityState> {
    ids.iter().map(|id| EntityState::new(*id, 2.0)).collect()
}

/// Content source answering from a fixed script
#[derive(Default)]
pub struct ScriptedFetcher {
    items: HashMap<String, Vec<String>>,
    transient: HashSet<String>,
    rejected: HashSet<String>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(mut self, entity_id: &str, texts: &[&str]) -> Self {
        self.items
            .insert(entity_id.to_string(), texts.iter().map(|t| t.to_string()).collect());
        self
    }

    /// Every fetch of this entity fails with a transient error
    pub fn unreachable(mut self, entity_id: &str) -> Self {
        self.transient.insert(entity_id.to_string());
        self
    }

    /// The source reports this entity as failed inside an otherwise fine batch
    pub fn rejecting(mut self, entity_id: &str) -> Self {
        self.rejected.insert(entity_id.to_string());
        self
    }

    pub fn calls(&self, entity_id: &str) -> u32 {
        self.calls.lock().unwrap().get(entity_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, entity_ids: &[String]) -> PipelineResult<FetchBatch> {
        let mut batch = FetchBatch::default();
        for id in entity_ids {
            *self.calls.lock().unwrap().entry(id.clone()).or_default() += 1;

            if self.transient.contains(id) {
                return Err(PipelineError::TransientIo(format!("{} unreachable", id)));
            }
            if self.rejected.contains(id) {
                batch.failures.push(ItemFailure {
                    entity_id: id.clone(),
                    item_id: None,
                    reason: "source answered 404 Not Found".to_string(),
                });
                continue;
            }
            if let Some(texts) = self.items.get(id) {
                for (n, text) in texts.iter().enumerate() {
                    batch.items.push(RawItem {
                        entity_id: id.clone(),
                        item_id: format!("{}-{}", id, n),
                        text: text.clone(),
                        published_at: None,
                    });
                }
            }
        }
        Ok(batch)
    }
}

/// Content source that never answers
pub struct StalledFetcher;

#[async_trait]
impl Fetcher for StalledFetcher {
    async fn fetch(&self, _entity_ids: &[String]) -> PipelineResult<FetchBatch> {
        std::future::pending().await
    }
}

/// Enricher whose service is down
pub struct BrokenEnricher;

#[async_trait]
impl Enricher for BrokenEnricher {
    async fn enrich(&self, _items: &[RawItem]) -> PipelineResult<Vec<EnrichedItem>> {
        Err(PipelineError::TransientIo("enrichment service unavailable".to_string()))
    }
}

/// Classifier loader that counts load attempts
pub struct CountingLoader {
    available: bool,
    attempts: AtomicU32,
}

impl CountingLoader {
    pub fn available() -> Self {
        Self {
            available: true,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClassifierLoader for CountingLoader {
    async fn load(&self) -> PipelineResult<Arc<dyn EmotionClassifier>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.available {
            return Err(PipelineError::CapabilityUnavailable("model weights missing".to_string()));
        }
        Ok(Arc::new(LexiconClassifier::builtin()?))
    }
}

pub fn collaborators(fetcher: Arc<dyn Fetcher>, loader: Arc<CountingLoader>) -> Collaborators {
    Collaborators {
        fetcher,
        enricher: Arc::new(TextNormalizer::new()),
        clusterer: Arc::new(KeywordClusterer::new()),
        classifier_loader: loader,
    }
}

pub fn orchestrator(
    pool: &SqlitePool,
    event_bus: &EventBus,
    ids: &[&str],
    collaborators: Collaborators,
    config: &TomlConfig,
) -> Arc<PipelineOrchestrator> {
    Arc::new(PipelineOrchestrator::new(
        pool.clone(),
        event_bus.clone(),
        entities(ids),
        collaborators,
        config,
    ))
}

/// Drain everything currently buffered on a receiver
pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<PulseEvent>) -> Vec<PulseEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
