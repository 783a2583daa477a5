//! Degraded operation and restart recovery
//!
//! - Analysis demotion after the capability fails to load twice in a row
//! - Enrichment outage falls back to raw items
//! - Scheduler and circuit state survive a restart

mod helpers;

use helpers::*;
use moodpulse_common::events::EventBus;
use moodpulse_engine::collaborators::{KeywordClusterer, LexiconLoader};
use moodpulse_engine::db;
use moodpulse_engine::lifecycle::CapabilityState;
use moodpulse_engine::models::{CycleStage, Emotion};
use moodpulse_engine::orchestrator::{DEMOTE_AFTER_UNAVAILABLE, FALLBACK_CONFIDENCE};
use moodpulse_engine::resilience::collaborators::FETCH;
use moodpulse_engine::resilience::CircuitState;
use moodpulse_engine::Collaborators;
use std::sync::Arc;

fn scripted() -> ScriptedFetcher {
    ScriptedFetcher::new()
        .with_items("Chile", &["Wonderful news", "Celebrate tonight"])
        .with_items("Peru", &["Protest in Lima"])
}

#[tokio::test]
async fn test_unavailable_capability_demotes_analysis() {
    let (_dir, pool) = test_db().await;
    let bus = EventBus::new(256);
    let loader = Arc::new(CountingLoader::unavailable());
    let orchestrator = orchestrator(
        &pool,
        &bus,
        &["Chile", "Peru"],
        collaborators(Arc::new(scripted()), loader.clone()),
        &test_config(),
    );

    let report = orchestrator.run_cycle().await.unwrap();

    assert!(report.analysis_demoted);
    assert!(report.degraded_stages.contains(&CycleStage::Analyzing));
    assert_eq!(loader.attempts(), DEMOTE_AFTER_UNAVAILABLE);
    assert_eq!(orchestrator.lifecycle().state(), CapabilityState::Unloaded);

    // Raw items are kept as neutral placeholders
    assert_eq!(report.samples_written, 3);
    let samples = db::samples::load_recent_samples(&pool, "Chile", 100).await.unwrap();
    assert_eq!(samples.len(), 2);
    assert!(samples
        .iter()
        .all(|s| s.emotion == Emotion::Neutral && s.confidence == FALLBACK_CONFIDENCE));

    // The cycle still completes and aggregates the placeholders
    assert_eq!(report.stage, CycleStage::Sleeping);
    let chile = db::consensus::load_consensus(&pool, "Chile").await.unwrap().unwrap();
    assert_eq!(chile.dominant_emotion, Emotion::Neutral);
}

#[tokio::test]
async fn test_missing_lexicon_file_demotes_analysis() {
    let (_dir, pool) = test_db().await;
    let bus = EventBus::new(256);
    let collaborators = Collaborators {
        fetcher: Arc::new(scripted()),
        enricher: Arc::new(moodpulse_engine::collaborators::TextNormalizer::new()),
        clusterer: Arc::new(KeywordClusterer::new()),
        classifier_loader: Arc::new(LexiconLoader::new(Some("/nonexistent/lexicon.toml".into()))),
    };
    let orchestrator = orchestrator(&pool, &bus, &["Chile"], collaborators, &test_config());

    let report = orchestrator.run_cycle().await.unwrap();

    assert!(report.analysis_demoted);
    assert_eq!(report.samples_written, 2);
}

#[tokio::test]
async fn test_enrichment_outage_keeps_raw_items() {
    let (_dir, pool) = test_db().await;
    let bus = EventBus::new(256);
    let mut collaborators = collaborators(
        Arc::new(scripted()),
        Arc::new(CountingLoader::available()),
    );
    collaborators.enricher = Arc::new(BrokenEnricher);
    let orchestrator = orchestrator(&pool, &bus, &["Chile", "Peru"], collaborators, &test_config());

    let report = orchestrator.run_cycle().await.unwrap();

    assert!(report.degraded_stages.contains(&CycleStage::Enriching));
    assert_eq!(report.items_enriched, 0);
    assert_eq!(report.enrichment_fallbacks, 3);
    assert_eq!(report.samples_written, 3);

    let chile = db::consensus::load_consensus(&pool, "Chile").await.unwrap().unwrap();
    assert_eq!(chile.dominant_emotion, Emotion::Joy);
}

#[tokio::test]
async fn test_scheduler_state_survives_restart() {
    let (_dir, pool) = test_db().await;
    let bus = EventBus::new(256);
    let fetcher = Arc::new(scripted().unreachable("Peru"));

    let first = orchestrator(
        &pool,
        &bus,
        &["Chile", "Peru"],
        collaborators(fetcher.clone(), Arc::new(CountingLoader::available())),
        &test_config(),
    );
    first.run_cycle().await.unwrap();
    let before = first.scheduler().snapshot();

    let second = orchestrator(
        &pool,
        &bus,
        &["Chile", "Peru"],
        collaborators(fetcher, Arc::new(CountingLoader::available())),
        &test_config(),
    );
    second.restore_state().await.unwrap();
    let after = second.scheduler().snapshot();

    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(b.id, a.id);
        assert_eq!(b.consecutive_failures, a.consecutive_failures);
        assert!((b.success_rate - a.success_rate).abs() < 1e-9);
        assert_eq!(
            b.last_polled_at.map(|t| t.timestamp_micros()),
            a.last_polled_at.map(|t| t.timestamp_micros())
        );
    }
    let peru = after.iter().find(|e| e.id == "Peru").unwrap();
    assert_eq!(peru.consecutive_failures, 1);

    // Consensus comes back from the store through the empty cache
    assert!(second.cache().is_empty());
    let chile = second.cached_consensus("Chile").await.unwrap().unwrap();
    assert_eq!(chile.dominant_emotion, Emotion::Joy);
    assert_eq!(second.cache().len(), 1);
}

#[tokio::test]
async fn test_open_circuit_survives_restart() {
    let (_dir, pool) = test_db().await;
    let bus = EventBus::new(256);
    let mut config = test_config();
    config.resilience.fail_max = 2;
    let fetcher = Arc::new(ScriptedFetcher::new().unreachable("Peru"));

    let first = orchestrator(
        &pool,
        &bus,
        &["Peru"],
        collaborators(fetcher.clone(), Arc::new(CountingLoader::available())),
        &config,
    );
    let report = first.run_cycle().await.unwrap();

    // Two failures open the circuit; the third attempt is refused without a call
    assert_eq!(fetcher.calls("Peru"), 2);
    assert_eq!(first.breaker().state(FETCH), CircuitState::Open);
    assert!(report.degraded_stages.contains(&CycleStage::Fetching));

    let second = orchestrator(
        &pool,
        &bus,
        &["Peru"],
        collaborators(fetcher.clone(), Arc::new(CountingLoader::available())),
        &config,
    );
    second.restore_state().await.unwrap();
    assert_eq!(second.breaker().state(FETCH), CircuitState::Open);

    // Still within the reset timeout: the next cycle fails fast
    second.run_cycle().await.unwrap();
    assert_eq!(fetcher.calls("Peru"), 2);
}
