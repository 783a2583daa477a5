//! Pipeline orchestrator
//!
//! Drives the control loop one cycle at a time.
//!
//! # Stage Progression
//! IDLE → FETCHING → ENRICHING → CLUSTERING → ANALYZING → AGGREGATING → CACHING → SLEEPING
//!
//! A cycle whose entities are all well stocked goes straight from IDLE to
//! SLEEPING. Each stage is handled by a dedicated `phase_*` method:
//!
//! - **FETCHING**: per-entity fetch calls on a bounded worker pool, outcomes fed
//!   back into the scheduler
//! - **ENRICHING**: one enrichment call for the whole batch, raw items kept on failure
//! - **CLUSTERING**: per-entity grouping, one unlabelled cluster on failure
//! - **ANALYZING**: classification behind the lifecycle manager; samples are
//!   written per entity before aggregation starts
//! - **AGGREGATING**: consensus per fetched entity
//! - **CACHING**: cache invalidation and warm-up, durable state flush
//!
//! Every collaborator call goes through the retrying invoker. A stage that
//! exhausts its retries is logged and marked degraded; the cycle carries on with
//! whatever partial output exists.

use chrono::Utc;
use moodpulse_common::config::TomlConfig;
use moodpulse_common::events::{EventBus, PulseEvent};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{consensus_key, ResponseCache};
use crate::collaborators::{ClassifierLoader, Clusterer, Enricher, Fetcher};
use crate::consensus::ConsensusAggregator;
use crate::db;
use crate::error::{PipelineError, PipelineResult};
use crate::lifecycle::ResourceLifecycleManager;
use crate::models::{ConsensusResult, CycleReport, CycleStage, EntityState};
use crate::resilience::{CircuitBreaker, RetryPolicy, RetryingInvoker};
use crate::scheduler::EntityScheduler;

mod phase_aggregating;
mod phase_analyzing;
mod phase_caching;
mod phase_clustering;
mod phase_enriching;
mod phase_fetching;
mod status;

pub use phase_analyzing::{fallback_samples, DEMOTE_AFTER_UNAVAILABLE, FALLBACK_CONFIDENCE};
pub use status::OrchestratorStatus;

/// External collaborators the pipeline calls into
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn Fetcher>,
    pub enricher: Arc<dyn Enricher>,
    pub clusterer: Arc<dyn Clusterer>,
    pub classifier_loader: Arc<dyn ClassifierLoader>,
}

/// Orchestrator tunables taken from the bootstrap config
#[derive(Debug, Clone)]
struct PipelineSettings {
    fetch_workers: usize,
    consensus_ttl: Duration,
    sweep_interval: Duration,
}

/// Pipeline orchestrator service
pub struct PipelineOrchestrator {
    db: SqlitePool,
    event_bus: EventBus,
    scheduler: Arc<EntityScheduler>,
    breaker: Arc<CircuitBreaker>,
    invoker: RetryingInvoker,
    lifecycle: Arc<ResourceLifecycleManager>,
    aggregator: ConsensusAggregator,
    cache: Arc<ResponseCache>,
    fetcher: Arc<dyn Fetcher>,
    enricher: Arc<dyn Enricher>,
    clusterer: Arc<dyn Clusterer>,
    settings: PipelineSettings,
    cancel: CancellationToken,
}

impl PipelineOrchestrator {
    /// Create a new orchestrator
    ///
    /// # Arguments
    /// * `db` - Database connection pool
    /// * `event_bus` - Event bus for cycle, circuit and capability events
    /// * `entities` - The polled population (registry)
    /// * `collaborators` - Fetch, enrichment, clustering and classifier loading
    /// * `config` - Validated bootstrap configuration
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        entities: Vec<EntityState>,
        collaborators: Collaborators,
        config: &TomlConfig,
    ) -> Self {
        let cancel = CancellationToken::new();

        let breaker = Arc::new(
            CircuitBreaker::new(config.resilience.fail_max, config.resilience.reset_timeout())
                .with_events(event_bus.clone()),
        );
        let invoker = RetryingInvoker::new(
            Arc::clone(&breaker),
            RetryPolicy::from_config(&config.resilience),
        )
        .with_cancellation(cancel.clone());

        let lifecycle = Arc::new(
            ResourceLifecycleManager::new(
                collaborators.classifier_loader,
                config.lifecycle.idle_timeout(),
            )
            .with_events(event_bus.clone()),
        );

        Self {
            scheduler: Arc::new(EntityScheduler::new(entities, config.scheduler.clone())),
            aggregator: ConsensusAggregator::new(db.clone(), config.pipeline.sample_limit),
            cache: Arc::new(ResponseCache::new(Duration::from_secs(config.cache.default_ttl_secs))),
            breaker,
            invoker,
            lifecycle,
            fetcher: collaborators.fetcher,
            enricher: collaborators.enricher,
            clusterer: collaborators.clusterer,
            settings: PipelineSettings {
                fetch_workers: config.pipeline.fetch_workers.max(1),
                consensus_ttl: Duration::from_secs(config.cache.consensus_ttl_secs),
                sweep_interval: config.lifecycle.sweep_interval(),
            },
            cancel,
            db,
            event_bus,
        }
    }

    /// Reload scheduler and circuit state persisted by a previous run
    pub async fn restore_state(&self) -> PipelineResult<()> {
        let entities = db::entities::load_entities(&self.db).await?;
        let restored = self.scheduler.restore(entities);

        let circuits = db::circuit_states::load_circuit_states(&self.db).await?;
        let circuit_count = circuits.len();
        self.breaker.restore(circuits);

        info!(
            entities = restored,
            circuits = circuit_count,
            "Restored persisted control loop state"
        );
        Ok(())
    }

    pub fn scheduler(&self) -> &Arc<EntityScheduler> {
        &self.scheduler
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn lifecycle(&self) -> &Arc<ResourceLifecycleManager> {
        &self.lifecycle
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Token that stops the loop and aborts in-flight collaborator calls
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one full cycle and report what it did
    ///
    /// Collaborator failures never fail the cycle. Only store errors are
    /// returned; a stop signal ends the cycle early with `cancelled` set.
    pub async fn run_cycle(&self) -> PipelineResult<CycleReport> {
        let mut report = CycleReport::new();

        let counts = db::samples::sample_counts(&self.db).await?;
        self.scheduler.refresh_data_needs(&counts);

        if self.scheduler.should_skip_cycle() {
            return Ok(self.skip_cycle(report).await);
        }

        report.batch = self.scheduler.next_batch();
        info!(
            cycle_id = %report.cycle_id,
            batch = ?report.batch,
            "Starting pipeline cycle"
        );
        self.event_bus.emit_lossy(PulseEvent::CycleStarted {
            cycle_id: report.cycle_id,
            batch: report.batch.clone(),
            timestamp: Utc::now(),
        });

        match self.run_stages(&mut report).await {
            Ok(()) => {}
            Err(PipelineError::Cancelled) => {
                info!(cycle_id = %report.cycle_id, stage = %report.stage, "Cycle cancelled");
                report.cancelled = true;
                if report.stage != CycleStage::Idle {
                    self.enter_stage(&mut report, CycleStage::Idle);
                }
                report.finish();
                return Ok(report);
            }
            Err(e) => return Err(e),
        }

        report.next_interval = self.scheduler.calculate_interval();
        self.enter_stage(&mut report, CycleStage::Sleeping);
        report.finish();
        self.emit_completed(&report);

        info!(
            cycle_id = %report.cycle_id,
            fetched = report.entities_fetched,
            items = report.items_fetched,
            samples = report.samples_written,
            consensus = report.consensus_updated.len(),
            failures = report.fetch_failures.len(),
            degraded = ?report.degraded_stages,
            next_interval_secs = report.next_interval.as_secs(),
            "Pipeline cycle completed"
        );
        Ok(report)
    }

    async fn run_stages(&self, report: &mut CycleReport) -> PipelineResult<()> {
        let batch = report.batch.clone();

        self.checkpoint()?;
        self.enter_stage(report, CycleStage::Fetching);
        let fetched = self.phase_fetching(report, &batch).await?;

        self.checkpoint()?;
        self.enter_stage(report, CycleStage::Enriching);
        let enriched = self.phase_enriching(report, fetched.items).await?;

        self.checkpoint()?;
        self.enter_stage(report, CycleStage::Clustering);
        let grouped = self.phase_clustering(report, &fetched.entities, enriched).await?;

        self.checkpoint()?;
        self.enter_stage(report, CycleStage::Analyzing);
        self.phase_analyzing(report, &grouped).await?;

        self.checkpoint()?;
        self.enter_stage(report, CycleStage::Aggregating);
        let updated = self.phase_aggregating(report, &fetched.entities).await?;

        self.checkpoint()?;
        self.enter_stage(report, CycleStage::Caching);
        self.phase_caching(report, &updated).await
    }

    async fn skip_cycle(&self, mut report: CycleReport) -> CycleReport {
        report.skipped = true;
        report.next_interval = self.scheduler.idle_interval();
        info!(
            cycle_id = %report.cycle_id,
            sleep_secs = report.next_interval.as_secs(),
            "Every entity is well stocked, skipping cycle"
        );
        self.event_bus.emit_lossy(PulseEvent::CycleStarted {
            cycle_id: report.cycle_id,
            batch: Vec::new(),
            timestamp: Utc::now(),
        });

        self.lifecycle.idle_sweep().await;

        self.enter_stage(&mut report, CycleStage::Sleeping);
        report.finish();
        self.emit_completed(&report);
        report
    }

    fn checkpoint(&self) -> PipelineResult<()> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn enter_stage(&self, report: &mut CycleReport, stage: CycleStage) {
        let transition = report.transition_to(stage);
        debug!(
            cycle_id = %report.cycle_id,
            from = %transition.from,
            to = %transition.to,
            "Stage changed"
        );
        self.event_bus.emit_lossy(PulseEvent::StageChanged {
            cycle_id: transition.cycle_id,
            from: transition.from.to_string(),
            to: transition.to.to_string(),
            timestamp: transition.transitioned_at,
        });
    }

    fn emit_completed(&self, report: &CycleReport) {
        self.event_bus.emit_lossy(PulseEvent::CycleCompleted {
            cycle_id: report.cycle_id,
            skipped: report.skipped,
            entities_fetched: report.entities_fetched,
            samples_written: report.samples_written,
            consensus_updated: report.consensus_updated.len(),
            failures: report.fetch_failures.len(),
            next_interval_secs: report.next_interval.as_secs(),
            timestamp: Utc::now(),
        });
    }

    /// Read-through consensus lookup: cache, then store (filling the cache)
    pub async fn cached_consensus(&self, entity_id: &str) -> PipelineResult<Option<ConsensusResult>> {
        let key = consensus_key(entity_id);
        if let Some(value) = self.cache.get(&key) {
            match serde_json::from_value::<ConsensusResult>(value) {
                Ok(result) => return Ok(Some(result)),
                Err(e) => {
                    warn!(entity = %entity_id, error = %e, "Dropping unreadable cached consensus");
                    self.cache.remove(&key);
                }
            }
        }

        let Some(result) = db::consensus::load_consensus(&self.db, entity_id).await? else {
            return Ok(None);
        };
        self.cache
            .set(key, serde_json::to_value(&result)?, Some(self.settings.consensus_ttl));
        Ok(Some(result))
    }

    /// Start the control loop and the idle sweep in the background
    ///
    /// The loop runs until [`OrchestratorHandle::stop`] is called. Stopping
    /// cancels this orchestrator's token, so it cannot be started again.
    pub fn start(self: Arc<Self>) -> OrchestratorHandle {
        let cancel = self.cancel.clone();

        let sweeper = Arc::clone(&self);
        let sweep_task = tokio::spawn(async move { sweeper.sweep_loop().await });
        let loop_task = tokio::spawn(async move { self.control_loop().await });

        info!("Control loop started");
        OrchestratorHandle {
            cancel,
            loop_task,
            sweep_task,
        }
    }

    async fn control_loop(&self) {
        while !self.cancel.is_cancelled() {
            let interval = match self.run_cycle().await {
                Ok(report) if report.cancelled => break,
                Ok(report) => report.next_interval,
                Err(e) => {
                    error!(error = %e, "Pipeline cycle failed");
                    self.scheduler.idle_interval()
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Control loop stopped");
    }

    async fn sweep_loop(&self) {
        let mut ticker = tokio::time::interval(self.settings.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.lifecycle.idle_sweep().await;
                }
            }
        }
    }
}

/// Handle to a running control loop
pub struct OrchestratorHandle {
    cancel: CancellationToken,
    loop_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
}

impl OrchestratorHandle {
    pub fn is_running(&self) -> bool {
        !self.loop_task.is_finished()
    }

    /// Signal stop and wait for the background tasks to finish
    ///
    /// An in-flight cycle aborts at its next collaborator call or stage boundary.
    pub async fn stop(self) {
        self.cancel.cancel();
        for (name, task) in [("control loop", self.loop_task), ("idle sweep", self.sweep_task)] {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "Background task ended abnormally");
            }
        }
    }
}
