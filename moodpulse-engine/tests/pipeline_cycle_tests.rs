//! Full pipeline cycles against a temporary store
//!
//! Covers the happy path end to end, cycle skipping, per-entity failure
//! isolation and cancellation.

mod helpers;

use helpers::*;
use moodpulse_common::events::EventBus;
use moodpulse_engine::cache::consensus_key;
use moodpulse_engine::db;
use moodpulse_engine::models::{CycleStage, Emotion, EmotionSample};
use std::sync::Arc;
use std::time::Duration;

const CHILE_TEXTS: [&str; 3] = [
    "Fans celebrate a wonderful victory",
    "<p>Happy crowds celebrate downtown</p>",
    "Great win for the national team",
];
const PERU_TEXTS: [&str; 2] = [
    "Outrage and protest over corruption",
    "Furious protest outside congress",
];

fn scripted() -> ScriptedFetcher {
    ScriptedFetcher::new()
        .with_items("Chile", &CHILE_TEXTS)
        .with_items("Peru", &PERU_TEXTS)
}

#[tokio::test]
async fn test_full_cycle_produces_consensus() {
    let (_dir, pool) = test_db().await;
    let bus = EventBus::new(256);
    let mut rx = bus.subscribe();
    let loader = Arc::new(CountingLoader::available());
    let fetcher = Arc::new(scripted());

    let orchestrator = orchestrator(
        &pool,
        &bus,
        &["Chile", "Kenya", "Peru"],
        collaborators(fetcher.clone(), loader.clone()),
        &test_config(),
    );

    let report = orchestrator.run_cycle().await.unwrap();

    let mut batch = report.batch.clone();
    batch.sort();
    assert_eq!(batch, vec!["Chile", "Kenya", "Peru"]);
    assert!(!report.skipped);
    assert!(!report.cancelled);
    assert_eq!(
        report.stage_trace,
        vec![
            CycleStage::Idle,
            CycleStage::Fetching,
            CycleStage::Enriching,
            CycleStage::Clustering,
            CycleStage::Analyzing,
            CycleStage::Aggregating,
            CycleStage::Caching,
            CycleStage::Sleeping,
        ]
    );
    assert_eq!(report.entities_fetched, 3);
    assert_eq!(report.items_fetched, 5);
    assert_eq!(report.items_enriched, 5);
    assert_eq!(report.samples_written, 5);
    assert!(report.degraded_stages.is_empty());
    assert!(report.next_interval > Duration::ZERO);

    let mut updated = report.consensus_updated.clone();
    updated.sort();
    assert_eq!(updated, vec!["Chile", "Peru"]);
    assert_eq!(report.no_data, vec!["Kenya"]);

    let chile = db::consensus::load_consensus(&pool, "Chile").await.unwrap().unwrap();
    assert_eq!(chile.dominant_emotion, Emotion::Joy);
    assert_eq!(chile.sample_count, 3);
    let peru = db::consensus::load_consensus(&pool, "Peru").await.unwrap().unwrap();
    assert_eq!(peru.dominant_emotion, Emotion::Anger);
    assert!(db::consensus::load_consensus(&pool, "Kenya").await.unwrap().is_none());

    assert_eq!(loader.attempts(), 1);
    assert_eq!(fetcher.calls("Kenya"), 1);

    let events: Vec<&str> = drain(&mut rx).iter().map(|e| e.event_type()).collect();
    assert_eq!(events.first(), Some(&"CycleStarted"));
    assert_eq!(events.last(), Some(&"CycleCompleted"));
    assert_eq!(events.iter().filter(|e| **e == "StageChanged").count(), 7);
    assert_eq!(events.iter().filter(|e| **e == "ConsensusUpdated").count(), 2);
    assert_eq!(events.iter().filter(|e| **e == "CapabilityLoaded").count(), 1);
}

#[tokio::test]
async fn test_cycle_warms_cache_and_persists_scheduler_state() {
    let (_dir, pool) = test_db().await;
    let bus = EventBus::new(256);
    let orchestrator = orchestrator(
        &pool,
        &bus,
        &["Chile", "Peru"],
        collaborators(Arc::new(scripted()), Arc::new(CountingLoader::available())),
        &test_config(),
    );

    orchestrator.run_cycle().await.unwrap();

    assert!(orchestrator.cache().get(&consensus_key("Chile")).is_some());
    let cached = orchestrator.cached_consensus("Chile").await.unwrap().unwrap();
    assert_eq!(cached.dominant_emotion, Emotion::Joy);
    assert!(orchestrator.cached_consensus("Kenya").await.unwrap().is_none());

    let stored = db::entities::load_entities(&pool).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|e| e.last_polled_at.is_some()));
    assert!(stored.iter().all(|e| e.consecutive_failures == 0));
}

#[tokio::test]
async fn test_second_cycle_reuses_loaded_capability() {
    let (_dir, pool) = test_db().await;
    let bus = EventBus::new(256);
    let loader = Arc::new(CountingLoader::available());
    let orchestrator = orchestrator(
        &pool,
        &bus,
        &["Chile", "Peru"],
        collaborators(Arc::new(scripted()), loader.clone()),
        &test_config(),
    );

    let first = orchestrator.run_cycle().await.unwrap();
    let second = orchestrator.run_cycle().await.unwrap();

    assert_eq!(first.samples_written, 5);
    // Same items again: samples are keyed by item, nothing new is written
    assert_eq!(second.samples_written, 0);
    assert_eq!(second.consensus_updated.len(), 2);
    assert_eq!(loader.attempts(), 1);
    assert_eq!(orchestrator.lifecycle().load_count(), 1);
}

#[tokio::test]
async fn test_well_stocked_population_skips_cycle() {
    let (_dir, pool) = test_db().await;
    let samples: Vec<EmotionSample> = (0..120)
        .map(|i| EmotionSample::new("Chile", format!("seed-{}", i), Emotion::Joy, 0.8))
        .collect();
    db::samples::insert_samples(&pool, &samples).await.unwrap();

    let bus = EventBus::new(256);
    let mut rx = bus.subscribe();
    let fetcher = Arc::new(scripted());
    let config = test_config();
    let orchestrator = orchestrator(
        &pool,
        &bus,
        &["Chile"],
        collaborators(fetcher.clone(), Arc::new(CountingLoader::available())),
        &config,
    );

    let report = orchestrator.run_cycle().await.unwrap();

    assert!(report.skipped);
    assert!(report.batch.is_empty());
    assert_eq!(report.stage_trace, vec![CycleStage::Idle, CycleStage::Sleeping]);
    assert_eq!(
        report.next_interval,
        Duration::from_secs(config.scheduler.idle_interval_secs)
    );
    assert_eq!(fetcher.calls("Chile"), 0);

    let events: Vec<&str> = drain(&mut rx).iter().map(|e| e.event_type()).collect();
    assert_eq!(events, vec!["CycleStarted", "StageChanged", "CycleCompleted"]);
}

#[tokio::test]
async fn test_unreachable_entity_does_not_sink_the_cycle() {
    let (_dir, pool) = test_db().await;
    let bus = EventBus::new(256);
    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .with_items("Chile", &CHILE_TEXTS)
            .unreachable("Peru"),
    );
    let config = test_config();
    let orchestrator = orchestrator(
        &pool,
        &bus,
        &["Chile", "Peru"],
        collaborators(fetcher.clone(), Arc::new(CountingLoader::available())),
        &config,
    );

    let report = orchestrator.run_cycle().await.unwrap();

    assert_eq!(fetcher.calls("Peru"), config.resilience.max_attempts);
    assert_eq!(report.entities_fetched, 1);
    assert_eq!(report.fetch_failures.len(), 1);
    assert_eq!(report.fetch_failures[0].0, "Peru");
    assert!(report.degraded_stages.contains(&CycleStage::Fetching));
    assert_eq!(report.consensus_updated, vec!["Chile"]);
    assert_eq!(report.stage, CycleStage::Sleeping);

    let peru = orchestrator
        .scheduler()
        .snapshot()
        .into_iter()
        .find(|e| e.id == "Peru")
        .unwrap();
    assert_eq!(peru.consecutive_failures, 1);
    assert!(peru.success_rate < 1.0);
}

#[tokio::test]
async fn test_rejected_entity_is_recorded_as_failed() {
    let (_dir, pool) = test_db().await;
    let bus = EventBus::new(256);
    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .with_items("Chile", &CHILE_TEXTS)
            .rejecting("Peru"),
    );
    let orchestrator = orchestrator(
        &pool,
        &bus,
        &["Chile", "Peru"],
        collaborators(fetcher.clone(), Arc::new(CountingLoader::available())),
        &test_config(),
    );

    let report = orchestrator.run_cycle().await.unwrap();

    // An answered request is not retried
    assert_eq!(fetcher.calls("Peru"), 1);
    assert_eq!(report.fetch_failures.len(), 1);
    assert!(report.degraded_stages.is_empty());
    let peru = orchestrator
        .scheduler()
        .snapshot()
        .into_iter()
        .find(|e| e.id == "Peru")
        .unwrap();
    assert_eq!(peru.consecutive_failures, 1);
}

#[tokio::test]
async fn test_stop_signal_aborts_cycle_cleanly() {
    let (_dir, pool) = test_db().await;
    let bus = EventBus::new(256);
    let orchestrator = orchestrator(
        &pool,
        &bus,
        &["Chile", "Peru"],
        collaborators(Arc::new(StalledFetcher), Arc::new(CountingLoader::available())),
        &test_config(),
    );

    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let report = orchestrator.run_cycle().await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.stage, CycleStage::Idle);
    assert_eq!(report.stage_trace, vec![CycleStage::Idle, CycleStage::Fetching, CycleStage::Idle]);
    assert_eq!(db::consensus::count_consensus(&pool).await.unwrap(), 0);
    // No outcome recorded for calls that were abandoned
    assert!(orchestrator
        .scheduler()
        .snapshot()
        .iter()
        .all(|e| e.last_polled_at.is_none()));
}

#[tokio::test]
async fn test_start_and_stop_handle() {
    let (_dir, pool) = test_db().await;
    let bus = EventBus::new(256);
    let mut rx = bus.subscribe();
    let orchestrator = orchestrator(
        &pool,
        &bus,
        &["Chile"],
        collaborators(Arc::new(scripted()), Arc::new(CountingLoader::available())),
        &test_config(),
    );

    let handle = Arc::clone(&orchestrator).start();
    assert!(handle.is_running());

    // Wait for the first cycle to finish, then stop while the loop sleeps
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("first cycle did not complete")
            .unwrap();
        if event.event_type() == "CycleCompleted" {
            break;
        }
    }

    handle.stop().await;
    assert!(orchestrator.cancellation_token().is_cancelled());
    assert!(db::consensus::load_consensus(&pool, "Chile").await.unwrap().is_some());
}

#[tokio::test]
async fn test_cycle_runs_on_a_spawned_task() {
    let (_dir, pool) = test_db().await;
    let bus = EventBus::new(256);
    let mut config = test_config();
    config.pipeline.fetch_workers = 4;
    let orchestrator = orchestrator(
        &pool,
        &bus,
        &["Chile", "Kenya", "Peru"],
        collaborators(Arc::new(scripted()), Arc::new(CountingLoader::available())),
        &config,
    );

    let background = Arc::clone(&orchestrator);
    let report = tokio::spawn(async move { background.run_cycle().await })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.entities_fetched, 3);
    assert_eq!(report.items_fetched, 5);
    let mut updated = report.consensus_updated.clone();
    updated.sort();
    assert_eq!(updated, vec!["Chile", "Peru"]);
}
