//! Static entity registry
//!
//! The polled population is fixed for the lifetime of the process. Importance
//! reflects population size and source activity: a high tier (5-10), a medium
//! tier (4) and a default of 2 for everything else.

use moodpulse_common::config::EntityConfig;

use crate::models::EntityState;

/// Importance for entities outside the high and medium tiers
pub const DEFAULT_IMPORTANCE: f64 = 2.0;

const COUNTRIES: [&str; 53] = [
    "USA", "UK", "Canada", "Australia", "India", "Germany", "France", "Japan",
    "Brazil", "Mexico", "Spain", "Italy", "Netherlands", "Sweden", "Norway",
    "Denmark", "Finland", "Poland", "Russia", "China", "South Korea", "Indonesia",
    "Philippines", "Thailand", "Vietnam", "Malaysia", "Singapore", "Turkey",
    "Egypt", "South Africa", "Nigeria", "Kenya", "Argentina", "Chile", "Colombia",
    "Peru", "Venezuela", "New Zealand", "Ireland", "Switzerland", "Austria",
    "Belgium", "Greece", "Portugal", "Czech Republic", "Hungary", "Romania",
    "Ukraine", "Israel", "Saudi Arabia", "UAE", "Pakistan", "Bangladesh",
];

const HIGH_TIER: [(&str, f64); 16] = [
    ("usa", 10.0),
    ("india", 9.0),
    ("uk", 9.0),
    ("china", 8.0),
    ("canada", 8.0),
    ("brazil", 7.0),
    ("australia", 7.0),
    ("germany", 7.0),
    ("france", 6.0),
    ("japan", 6.0),
    ("south korea", 6.0),
    ("russia", 6.0),
    ("mexico", 5.0),
    ("spain", 5.0),
    ("italy", 5.0),
    ("turkey", 5.0),
];

const MEDIUM_TIER: [&str; 10] = [
    "poland", "netherlands", "sweden", "argentina", "indonesia", "philippines",
    "thailand", "south africa", "egypt", "nigeria",
];

/// Importance weight of a built-in entity
pub fn importance_for(id: &str) -> f64 {
    let key = id.to_lowercase();
    if let Some((_, weight)) = HIGH_TIER.iter().find(|(name, _)| *name == key) {
        return *weight;
    }
    if MEDIUM_TIER.contains(&key.as_str()) {
        return 4.0;
    }
    DEFAULT_IMPORTANCE
}

/// Built-in registry of monitored countries
pub fn default_registry() -> Vec<EntityState> {
    COUNTRIES
        .iter()
        .map(|id| EntityState::new(*id, importance_for(id)))
        .collect()
}

/// Registry from config overrides, or the built-in one when none are given
pub fn registry_from_config(overrides: &[EntityConfig]) -> Vec<EntityState> {
    if overrides.is_empty() {
        return default_registry();
    }
    overrides
        .iter()
        .map(|entry| EntityState::new(entry.id.clone(), entry.importance))
        .collect()
}
