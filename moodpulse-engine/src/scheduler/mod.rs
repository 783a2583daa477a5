//! Adaptive entity scheduler
//!
//! Owns the per-entity priority state. Every cycle it hands the orchestrator a
//! batch sized by how many entities are urgent, and a sleep interval chosen the
//! same way. Fetch outcomes flow back through [`EntityScheduler::record_outcome`]
//! and [`EntityScheduler::record_activity`], closing the loop.
//!
//! **Fairness:** each batch reserves `rotation_slots` positions for a circular
//! pointer over the id-sorted population. The pointer advances past every entity
//! it passes (picked by rotation or already picked by priority), so every entity
//! appears within `ceil(population / rotation_slots)` consecutive batches no
//! matter how low its score.
//!
//! **Concurrency:** all state, the pointer included, sits behind one
//! scheduler-wide lock. No lock is held across an await.

pub mod priority;

use chrono::{DateTime, Utc};
use moodpulse_common::config::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::EntityState;

pub use priority::compute_priority;

/// Score buckets reported by [`EntityScheduler::stats`]
const CRITICAL_SCORE: f64 = 20.0;
const HIGH_SCORE: f64 = 10.0;
const MEDIUM_SCORE: f64 = 5.0;

/// Count of entities per priority bucket
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityDistribution {
    /// Score > 20
    pub critical: usize,
    /// Score in (10, 20]
    pub high: usize,
    /// Score in (5, 10]
    pub medium: usize,
    pub low: usize,
}

/// Point-in-time scheduler statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub total_entities: usize,
    pub urgent_entities: usize,
    pub distribution: PriorityDistribution,
    pub average_success_rate: f64,
    pub failing_entities: usize,
    #[serde(with = "crate::models::cycle::duration_secs")]
    pub current_interval: Duration,
}

struct SchedulerState {
    /// Sorted by id; rotation walks this order
    entities: Vec<EntityState>,
    index: HashMap<String, usize>,
    rotation_pointer: usize,
    current_interval: Duration,
}

impl SchedulerState {
    fn entity_mut(&mut self, entity_id: &str) -> Option<&mut EntityState> {
        let idx = *self.index.get(entity_id)?;
        self.entities.get_mut(idx)
    }
}

/// Adaptive priority scheduler over a fixed entity population
pub struct EntityScheduler {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
}

impl EntityScheduler {
    /// Build a scheduler from the registry
    ///
    /// Duplicate ids keep their first occurrence.
    pub fn new(entities: Vec<EntityState>, config: SchedulerConfig) -> Self {
        let mut seen = HashSet::new();
        let mut entities: Vec<EntityState> = entities
            .into_iter()
            .filter(|e| seen.insert(e.id.clone()))
            .collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));

        let index = entities
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
        let current_interval = Duration::from_secs(config.idle_interval_secs);

        Self {
            config,
            state: Mutex::new(SchedulerState {
                entities,
                index,
                rotation_pointer: 0,
                current_interval,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        // State stays consistent between statements, so a poisoned lock is still usable
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Current priority of one entity, None if the id is not registered
    pub fn compute_priority(&self, entity_id: &str) -> Option<f64> {
        let now = Utc::now();
        let state = self.lock();
        let idx = *state.index.get(entity_id)?;
        Some(compute_priority(&state.entities[idx], now))
    }

    /// Next batch of entity ids to poll
    pub fn next_batch(&self) -> Vec<String> {
        self.next_batch_at(Utc::now())
    }

    /// [`next_batch`](Self::next_batch) against an explicit clock
    ///
    /// Priority picks come first (score descending, id ascending), followed by
    /// the rotation picks in pointer order.
    pub fn next_batch_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut state = self.lock();
        let population = state.entities.len();
        if population == 0 {
            return Vec::new();
        }

        let mut ranked: Vec<(usize, f64)> = state
            .entities
            .iter()
            .enumerate()
            .map(|(i, e)| (i, compute_priority(e, now)))
            .collect();
        let urgent = ranked
            .iter()
            .filter(|(_, score)| *score > self.config.urgent_score)
            .count();

        let size = priority::batch_size_for(
            urgent,
            &self.config.urgent_thresholds,
            self.config.maintenance_batch,
        )
        .min(population);
        let rotation_slots = self.config.rotation_slots.min(size);
        let priority_slots = size - rotation_slots;

        // Entities are id-sorted, so index order is the id tie-break
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut picked: Vec<usize> = ranked.iter().take(priority_slots).map(|(i, _)| *i).collect();
        let mut taken: HashSet<usize> = picked.iter().copied().collect();

        let mut rotated = 0;
        let mut visited = 0;
        while rotated < rotation_slots && visited < population {
            let idx = state.rotation_pointer;
            state.rotation_pointer = (state.rotation_pointer + 1) % population;
            visited += 1;
            if taken.insert(idx) {
                picked.push(idx);
                rotated += 1;
            }
        }

        let batch: Vec<String> = picked.iter().map(|i| state.entities[*i].id.clone()).collect();
        debug!(
            urgent = urgent,
            batch_size = batch.len(),
            rotation_pointer = state.rotation_pointer,
            "Selected batch"
        );
        batch
    }

    /// True when every entity already has plenty of data
    ///
    /// An empty population also skips; there is nothing to fetch.
    pub fn should_skip_cycle(&self) -> bool {
        let state = self.lock();
        state
            .entities
            .iter()
            .all(|e| e.data_need < self.config.data_need_low_water)
    }

    /// Entities whose score currently exceeds the urgent threshold
    pub fn urgent_count_at(&self, now: DateTime<Utc>) -> usize {
        let state = self.lock();
        state
            .entities
            .iter()
            .filter(|e| compute_priority(e, now) > self.config.urgent_score)
            .count()
    }

    /// Sleep before the next cycle
    pub fn calculate_interval(&self) -> Duration {
        self.calculate_interval_at(Utc::now())
    }

    pub fn calculate_interval_at(&self, now: DateTime<Utc>) -> Duration {
        let urgent = self.urgent_count_at(now);
        let interval = priority::interval_for(
            urgent,
            &self.config.interval_thresholds,
            self.config.idle_interval_secs,
        );
        self.lock().current_interval = interval;
        interval
    }

    /// Long interval used when a cycle is skipped
    pub fn idle_interval(&self) -> Duration {
        let interval = Duration::from_secs(self.config.idle_interval_secs);
        self.lock().current_interval = interval;
        interval
    }

    /// Feed one fetch outcome back into the entity's priority state
    ///
    /// Returns false (and changes nothing) for an unknown id.
    pub fn record_outcome(&self, entity_id: &str, success: bool) -> bool {
        self.record_outcome_at(entity_id, success, Utc::now())
    }

    pub fn record_outcome_at(&self, entity_id: &str, success: bool, now: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        let Some(entity) = state.entity_mut(entity_id) else {
            warn!(entity = %entity_id, "Outcome recorded for unknown entity");
            return false;
        };

        entity.success_rate = priority::next_success_rate(entity.success_rate, success);
        if success {
            entity.consecutive_failures = 0;
        } else {
            entity.consecutive_failures = entity.consecutive_failures.saturating_add(1);
        }
        entity.last_polled_at = Some(now);

        debug!(
            entity = %entity_id,
            success = success,
            success_rate = entity.success_rate,
            consecutive_failures = entity.consecutive_failures,
            "Recorded outcome"
        );
        true
    }

    /// Update the activity boost from the items a successful fetch returned
    ///
    /// The rate is measured against the previous poll; an entity polled for the
    /// first time keeps its boost. Call before [`record_outcome`](Self::record_outcome),
    /// which moves `last_polled_at` forward.
    pub fn record_activity(&self, entity_id: &str, items: usize, now: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        let Some(entity) = state.entity_mut(entity_id) else {
            return false;
        };
        if let Some(previous) = entity.last_polled_at {
            let hours = moodpulse_common::time::hours_between(previous, now)
                .max(priority::MIN_ACTIVITY_WINDOW_HOURS);
            entity.activity_boost = priority::activity_boost_for_rate(items as f64 / hours);
        }
        true
    }

    /// Refresh data need from the number of samples on file
    pub fn update_data_need(&self, entity_id: &str, sample_count: u64) -> bool {
        let mut state = self.lock();
        match state.entity_mut(entity_id) {
            Some(entity) => {
                entity.data_need = priority::data_need_for_sample_count(sample_count);
                true
            }
            None => false,
        }
    }

    /// Refresh data need for every entity; ids missing from `counts` have no samples
    pub fn refresh_data_needs(&self, counts: &HashMap<String, u64>) {
        let mut state = self.lock();
        for entity in state.entities.iter_mut() {
            let count = counts.get(&entity.id).copied().unwrap_or(0);
            entity.data_need = priority::data_need_for_sample_count(count);
        }
    }

    /// Copy of every entity's state, id-sorted
    pub fn snapshot(&self) -> Vec<EntityState> {
        self.lock().entities.clone()
    }

    /// Overlay persisted state onto the registry
    ///
    /// Importance stays as the registry defines it; persisted rows for ids no
    /// longer registered are ignored. Returns how many entities were restored.
    pub fn restore(&self, persisted: Vec<EntityState>) -> usize {
        let mut state = self.lock();
        let mut restored = 0;
        for saved in persisted {
            if let Some(entity) = state.entity_mut(&saved.id) {
                entity.data_need = saved.data_need.clamp(0.0, 10.0);
                entity.last_polled_at = saved.last_polled_at;
                entity.consecutive_failures = saved.consecutive_failures;
                entity.success_rate = saved.success_rate.clamp(0.0, 1.0);
                entity.activity_boost = saved.activity_boost.max(0.0);
                restored += 1;
            }
        }
        restored
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> SchedulerStats {
        let state = self.lock();
        let mut distribution = PriorityDistribution::default();
        let mut urgent = 0;
        for entity in &state.entities {
            let score = compute_priority(entity, now);
            if score > self.config.urgent_score {
                urgent += 1;
            }
            if score > CRITICAL_SCORE {
                distribution.critical += 1;
            } else if score > HIGH_SCORE {
                distribution.high += 1;
            } else if score > MEDIUM_SCORE {
                distribution.medium += 1;
            } else {
                distribution.low += 1;
            }
        }

        let total = state.entities.len();
        let average_success_rate = if total == 0 {
            0.0
        } else {
            state.entities.iter().map(|e| e.success_rate).sum::<f64>() / total as f64
        };

        SchedulerStats {
            total_entities: total,
            urgent_entities: urgent,
            distribution,
            average_success_rate,
            failing_entities: state
                .entities
                .iter()
                .filter(|e| e.consecutive_failures > 0)
                .count(),
            current_interval: state.current_interval,
        }
    }
}
