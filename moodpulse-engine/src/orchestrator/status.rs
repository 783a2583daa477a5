//! Point-in-time view of the control loop's components

use serde::Serialize;

use super::PipelineOrchestrator;
use crate::cache::CacheStats;
use crate::lifecycle::CapabilityState;
use crate::resilience::CircuitSnapshot;
use crate::scheduler::SchedulerStats;

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub scheduler: SchedulerStats,
    pub cache: CacheStats,
    pub circuits: Vec<CircuitSnapshot>,
    pub capability: CapabilityState,
    pub capability_loads: u64,
    pub capability_unloads: u64,
}

impl OrchestratorStatus {
    /// One-line summary for logs
    pub fn display_string(&self) -> String {
        let open = self
            .circuits
            .iter()
            .filter(|c| c.state != crate::resilience::CircuitState::Closed)
            .map(|c| c.collaborator.as_str())
            .collect::<Vec<_>>();
        format!(
            "{} entities ({} urgent), cache {} entries, capability {:?}, circuits not closed: [{}]",
            self.scheduler.total_entities,
            self.scheduler.urgent_entities,
            self.cache.entries,
            self.capability,
            open.join(", ")
        )
    }
}

impl PipelineOrchestrator {
    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            scheduler: self.scheduler.stats(),
            cache: self.cache.stats(),
            circuits: self.breaker.snapshot(),
            capability: self.lifecycle.state(),
            capability_loads: self.lifecycle.load_count(),
            capability_unloads: self.lifecycle.unload_count(),
        }
    }
}
