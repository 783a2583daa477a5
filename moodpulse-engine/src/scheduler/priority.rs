//! Priority formula and tier lookups
//!
//! Pure functions over explicit inputs, so every weight can be tested without a
//! scheduler, store or clock.

use chrono::{DateTime, Utc};
use moodpulse_common::config::{BatchTier, IntervalTier};
use moodpulse_common::time::hours_between;
use std::time::Duration;

use crate::models::EntityState;

pub const DATA_NEED_WEIGHT: f64 = 2.0;
pub const IMPORTANCE_WEIGHT: f64 = 1.5;
pub const TIME_DECAY_WEIGHT: f64 = 1.0;

/// Decay credited to an entity that has never been polled
pub const NEVER_POLLED_DECAY: f64 = 5.0;
/// Ceiling for the elapsed-time decay of a polled entity
pub const MAX_TIME_DECAY: f64 = 3.0;
/// Hours of staleness worth one point of decay
pub const DECAY_HOURS_PER_POINT: f64 = 24.0;

pub const SUCCESS_GROWTH: f64 = 1.1;
pub const FAILURE_DECAY: f64 = 0.9;

/// Items per hour worth one point of activity boost
pub const ACTIVITY_ITEMS_PER_POINT: f64 = 10.0;
pub const MAX_ACTIVITY_BONUS: f64 = 2.0;
/// Shortest elapsed window used for the items-per-hour rate
pub const MIN_ACTIVITY_WINDOW_HOURS: f64 = 1.0 / 60.0;

/// Staleness term of the priority score
///
/// Linear in hours since the last poll, capped at [`MAX_TIME_DECAY`].
pub fn time_decay(last_polled_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    match last_polled_at {
        None => NEVER_POLLED_DECAY,
        Some(polled) => (hours_between(polled, now) / DECAY_HOURS_PER_POINT).min(MAX_TIME_DECAY),
    }
}

/// `(data_need*2.0 + importance*1.5 + time_decay*1.0) * success_rate * activity_boost`
///
/// Negative or NaN inputs count as zero, so the score is never negative.
pub fn priority_score(
    data_need: f64,
    importance: f64,
    time_decay: f64,
    success_rate: f64,
    activity_boost: f64,
) -> f64 {
    let base = non_negative(data_need) * DATA_NEED_WEIGHT
        + non_negative(importance) * IMPORTANCE_WEIGHT
        + non_negative(time_decay) * TIME_DECAY_WEIGHT;
    base * non_negative(success_rate).min(1.0) * non_negative(activity_boost)
}

/// Priority score of an entity at `now`
pub fn compute_priority(entity: &EntityState, now: DateTime<Utc>) -> f64 {
    priority_score(
        entity.data_need,
        entity.importance,
        time_decay(entity.last_polled_at, now),
        entity.success_rate,
        entity.activity_boost,
    )
}

/// Data need derived from how many samples are already on file
pub fn data_need_for_sample_count(count: u64) -> f64 {
    match count {
        0..=19 => 10.0,
        20..=49 => 7.0,
        50..=99 => 4.0,
        _ => 1.0,
    }
}

/// Activity multiplier for an observed item rate
pub fn activity_boost_for_rate(items_per_hour: f64) -> f64 {
    1.0 + (non_negative(items_per_hour) / ACTIVITY_ITEMS_PER_POINT).min(MAX_ACTIVITY_BONUS)
}

/// Smoothed success rate after one outcome, clamped to [0, 1]
pub fn next_success_rate(current: f64, success: bool) -> f64 {
    let current = non_negative(current).min(1.0);
    if success {
        (current * SUCCESS_GROWTH).min(1.0)
    } else {
        (current * FAILURE_DECAY).max(0.0)
    }
}

/// Batch size for an urgent count
///
/// Tiers are checked in order; the first with `urgent >= min_urgent` wins.
pub fn batch_size_for(urgent: usize, tiers: &[BatchTier], maintenance_batch: usize) -> usize {
    tiers
        .iter()
        .find(|tier| urgent >= tier.min_urgent)
        .map(|tier| tier.batch)
        .unwrap_or(maintenance_batch)
}

/// Sleep interval for an urgent count
pub fn interval_for(urgent: usize, tiers: &[IntervalTier], idle_secs: u64) -> Duration {
    let secs = tiers
        .iter()
        .find(|tier| urgent >= tier.min_urgent)
        .map(|tier| tier.secs)
        .unwrap_or(idle_secs);
    Duration::from_secs(secs)
}

fn non_negative(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.max(0.0)
    }
}
