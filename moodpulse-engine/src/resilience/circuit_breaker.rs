//! Per-collaborator circuit breaker
//!
//! Closed → (`fail_max` consecutive failures) → Open → (`reset_timeout`) →
//! HalfOpen → one probe → Closed on success, Open again on failure.
//!
//! Every call goes through a [`CallPermit`]. A permit dropped without an outcome
//! (the caller was cancelled mid-call) hands the half-open probe slot back, so a
//! cancelled probe never wedges the circuit.

use chrono::{DateTime, Utc};
use moodpulse_common::events::{EventBus, PulseEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CircuitState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(CircuitState::Closed),
            "open" => Ok(CircuitState::Open),
            "half_open" => Ok(CircuitState::HalfOpen),
            other => Err(PipelineError::Permanent(format!("Unknown circuit state '{}'", other))),
        }
    }
}

/// Durable view of one circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub collaborator: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failure_count: u32,
    /// Monotonic anchor for the reset timeout
    opened_at: Option<Instant>,
    /// Wall-clock twin of `opened_at`, persisted across restarts
    opened_wall: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

impl Circuit {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            opened_wall: None,
            probe_in_flight: false,
        }
    }
}

/// How the outcome of a permitted call is accounted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    /// The call never reached a verdict (cancelled); nothing is counted
    Abandoned,
}

impl CallOutcome {
    /// Classify a collaborator result for breaker accounting
    ///
    /// Permanent errors mean the collaborator answered, so they count as success.
    pub fn of<T>(result: &PipelineResult<T>) -> Self {
        match result {
            Ok(_) => CallOutcome::Success,
            Err(PipelineError::Cancelled) | Err(PipelineError::CircuitOpen { .. }) => {
                CallOutcome::Abandoned
            }
            Err(e) if e.counts_as_collaborator_failure() => CallOutcome::Failure,
            Err(_) => CallOutcome::Success,
        }
    }
}

/// Permission to make one collaborator call
#[must_use = "a permit must be settled with the call outcome"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    collaborator: String,
    probe: bool,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record the outcome of the permitted call
    pub fn settle(mut self, outcome: CallOutcome) {
        self.settled = true;
        self.breaker.settle(&self.collaborator, self.probe, outcome);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker
                .settle(&self.collaborator, self.probe, CallOutcome::Abandoned);
        }
    }
}

/// Circuit breakers for every named collaborator
pub struct CircuitBreaker {
    fail_max: u32,
    reset_timeout: Duration,
    circuits: Mutex<HashMap<String, Circuit>>,
    events: Option<EventBus>,
}

impl CircuitBreaker {
    pub fn new(fail_max: u32, reset_timeout: Duration) -> Self {
        Self {
            fail_max: fail_max.max(1),
            reset_timeout,
            circuits: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    /// Publish state transitions on the event bus
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Circuit>> {
        self.circuits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask to call `collaborator`
    ///
    /// Fails with `CircuitOpen` while the circuit is open, or while it is half-open
    /// and the single probe is already in flight.
    pub fn try_acquire(&self, collaborator: &str) -> PipelineResult<CallPermit<'_>> {
        let mut circuits = self.lock();
        let circuit = circuits
            .entry(collaborator.to_string())
            .or_insert_with(Circuit::closed);

        let probe = match circuit.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = circuit.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                if elapsed < self.reset_timeout {
                    return Err(PipelineError::CircuitOpen {
                        collaborator: collaborator.to_string(),
                    });
                }
                self.transition(collaborator, circuit, CircuitState::HalfOpen);
                circuit.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if circuit.probe_in_flight {
                    return Err(PipelineError::CircuitOpen {
                        collaborator: collaborator.to_string(),
                    });
                }
                circuit.probe_in_flight = true;
                true
            }
        };

        Ok(CallPermit {
            breaker: self,
            collaborator: collaborator.to_string(),
            probe,
            settled: false,
        })
    }

    fn settle(&self, collaborator: &str, probe: bool, outcome: CallOutcome) {
        let mut circuits = self.lock();
        let Some(circuit) = circuits.get_mut(collaborator) else {
            return;
        };
        if probe {
            circuit.probe_in_flight = false;
        }

        match outcome {
            CallOutcome::Abandoned => {}
            CallOutcome::Success => match circuit.state {
                CircuitState::Closed => circuit.failure_count = 0,
                // Only the probe may close a tripped circuit; late calls admitted
                // before it opened leave it alone
                CircuitState::Open | CircuitState::HalfOpen if probe => {
                    circuit.failure_count = 0;
                    circuit.opened_at = None;
                    circuit.opened_wall = None;
                    self.transition(collaborator, circuit, CircuitState::Closed);
                }
                CircuitState::Open | CircuitState::HalfOpen => {}
            },
            CallOutcome::Failure => {
                circuit.failure_count = circuit.failure_count.saturating_add(1);
                let trip = match circuit.state {
                    CircuitState::Closed => circuit.failure_count >= self.fail_max,
                    CircuitState::HalfOpen => probe,
                    // A call admitted before the circuit opened; it already counted
                    CircuitState::Open => false,
                };
                if trip {
                    circuit.opened_at = Some(Instant::now());
                    circuit.opened_wall = Some(Utc::now());
                    self.transition(collaborator, circuit, CircuitState::Open);
                }
            }
        }
    }

    fn transition(&self, collaborator: &str, circuit: &mut Circuit, to: CircuitState) {
        let from = circuit.state;
        circuit.state = to;

        match to {
            CircuitState::Open => warn!(
                collaborator = %collaborator,
                failure_count = circuit.failure_count,
                reset_timeout_secs = self.reset_timeout.as_secs(),
                "Circuit opened"
            ),
            _ => info!(
                collaborator = %collaborator,
                from = %from,
                to = %to,
                "Circuit state changed"
            ),
        }

        if let Some(events) = &self.events {
            events.emit_lossy(PulseEvent::CircuitStateChanged {
                collaborator: collaborator.to_string(),
                old_state: from.as_str().to_string(),
                new_state: to.as_str().to_string(),
                failure_count: circuit.failure_count,
                timestamp: Utc::now(),
            });
        }
    }

    /// Current state (Closed for a collaborator never called)
    pub fn state(&self, collaborator: &str) -> CircuitState {
        self.lock()
            .get(collaborator)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn failure_count(&self, collaborator: &str) -> u32 {
        self.lock()
            .get(collaborator)
            .map(|c| c.failure_count)
            .unwrap_or(0)
    }

    /// Snapshot of every known circuit, sorted by collaborator name
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let circuits = self.lock();
        let mut snapshots: Vec<CircuitSnapshot> = circuits
            .iter()
            .map(|(name, c)| CircuitSnapshot {
                collaborator: name.clone(),
                state: c.state,
                failure_count: c.failure_count,
                opened_at: c.opened_wall,
            })
            .collect();
        snapshots.sort_by(|a, b| a.collaborator.cmp(&b.collaborator));
        snapshots
    }

    /// Load persisted circuits, re-anchoring open timers on the monotonic clock
    ///
    /// A persisted half-open circuit had a probe in flight when the process
    /// stopped; it comes back open and immediately eligible for a new probe.
    pub fn restore(&self, snapshots: Vec<CircuitSnapshot>) {
        let now_wall = Utc::now();
        let now = Instant::now();
        let mut circuits = self.lock();

        for snap in snapshots {
            let circuit = match snap.state {
                CircuitState::Closed => Circuit {
                    failure_count: snap.failure_count,
                    ..Circuit::closed()
                },
                CircuitState::Open | CircuitState::HalfOpen => {
                    let elapsed = match (snap.state, snap.opened_at) {
                        (CircuitState::Open, Some(opened)) => (now_wall - opened)
                            .to_std()
                            .unwrap_or(Duration::ZERO)
                            .min(self.reset_timeout),
                        _ => self.reset_timeout,
                    };
                    Circuit {
                        state: CircuitState::Open,
                        failure_count: snap.failure_count,
                        opened_at: Some(now.checked_sub(elapsed).unwrap_or(now)),
                        opened_wall: Some(snap.opened_at.unwrap_or(now_wall)),
                        probe_in_flight: false,
                    }
                }
            };
            circuits.insert(snap.collaborator, circuit);
        }
    }
}
