//! Per-entity scheduling state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scheduling state of one polled entity
///
/// Created once at process start from the registry (or restored from the store),
/// mutated every cycle by the scheduler, never deleted. The priority score is
/// derived from these fields and never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub id: String,
    /// 0-10, inverse of how much fresh data is already on file
    pub data_need: f64,
    /// 0-10, static weight from the registry
    pub importance: f64,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Exponentially smoothed, always within [0, 1]
    pub success_rate: f64,
    /// Recent-traffic multiplier, >= 0
    pub activity_boost: f64,
}

impl EntityState {
    /// Fresh state for a never-polled entity
    pub fn new(id: impl Into<String>, importance: f64) -> Self {
        Self {
            id: id.into(),
            data_need: 10.0,
            importance: importance.clamp(0.0, 10.0),
            last_polled_at: None,
            consecutive_failures: 0,
            success_rate: 1.0,
            activity_boost: 1.0,
        }
    }
}
