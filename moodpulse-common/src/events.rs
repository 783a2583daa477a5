//! Event types for the moodpulse event system
//!
//! Provides the shared [`PulseEvent`] definitions and the broadcast [`EventBus`].
//! Subscribers (log sinks, future API surfaces) observe the control loop without
//! being coupled to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Control loop events
///
/// Events are broadcast via EventBus and can be serialized for transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PulseEvent {
    /// A pipeline cycle began
    CycleStarted {
        cycle_id: Uuid,
        /// Entities selected for this cycle (empty when the cycle is skipped)
        batch: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// The orchestrator moved to a new stage
    StageChanged {
        cycle_id: Uuid,
        /// Stage left
        from: String,
        /// Stage entered
        to: String,
        timestamp: DateTime<Utc>,
    },

    /// A consensus row was upserted for an entity
    ConsensusUpdated {
        entity_id: String,
        dominant_emotion: String,
        confidence: f64,
        sample_count: u32,
        timestamp: DateTime<Utc>,
    },

    /// A collaborator's circuit changed state
    CircuitStateChanged {
        collaborator: String,
        /// "closed", "open" or "half_open"
        old_state: String,
        new_state: String,
        failure_count: u32,
        timestamp: DateTime<Utc>,
    },

    /// The analysis capability finished loading
    CapabilityLoaded {
        load_duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// The analysis capability was released after being idle
    CapabilityUnloaded {
        idle_seconds: u64,
        timestamp: DateTime<Utc>,
    },

    /// A pipeline cycle finished (skipped cycles included)
    CycleCompleted {
        cycle_id: Uuid,
        skipped: bool,
        entities_fetched: usize,
        samples_written: usize,
        consensus_updated: usize,
        failures: usize,
        next_interval_secs: u64,
        timestamp: DateTime<Utc>,
    },
}

impl PulseEvent {
    /// Short event name for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            PulseEvent::CycleStarted { .. } => "CycleStarted",
            PulseEvent::StageChanged { .. } => "StageChanged",
            PulseEvent::ConsensusUpdated { .. } => "ConsensusUpdated",
            PulseEvent::CircuitStateChanged { .. } => "CircuitStateChanged",
            PulseEvent::CapabilityLoaded { .. } => "CapabilityLoaded",
            PulseEvent::CapabilityUnloaded { .. } => "CapabilityUnloaded",
            PulseEvent::CycleCompleted { .. } => "CycleCompleted",
        }
    }
}

/// Broadcast bus shared by all control loop components
///
/// Cloning is cheap; all clones publish into the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PulseEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before slow subscribers start lagging
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<PulseEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: PulseEvent,
    ) -> Result<usize, broadcast::error::SendError<PulseEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: PulseEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> PulseEvent {
        PulseEvent::ConsensusUpdated {
            entity_id: "Chile".to_string(),
            dominant_emotion: "joy".to_string(),
            confidence: 0.7,
            sample_count: 12,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_error() {
        let bus = EventBus::new(10);
        assert!(bus.emit(sample_event()).is_err());
        bus.emit_lossy(sample_event());
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.capacity(), 10);
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();

        assert_eq!(bus.emit(sample_event()).unwrap(), 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type(), "ConsensusUpdated");
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(sample_event()).unwrap();
        assert_eq!(json["type"], "ConsensusUpdated");
        assert_eq!(json["entity_id"], "Chile");
    }
}
