//! Analysis capability lifecycle
//!
//! The classifier is one shared, expensive resource per process. It is loaded on
//! first use and released after `idle_timeout` without use. Load and unload are
//! the only privileged transitions:
//!
//! ```text
//! Unloaded → Loading → Loaded → (idle sweep) → Unloaded
//!               └─(load error)──→ Unloaded
//! ```
//!
//! The slot lock is held across the load, so concurrent callers queue behind the
//! single in-flight load and then share its result. That holds for failures too:
//! callers that queued while a load failed get the same `CapabilityUnavailable`
//! instead of starting loads of their own.

use chrono::Utc;
use moodpulse_common::events::{EventBus, PulseEvent};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::collaborators::{ClassifierLoader, EmotionClassifier};
use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityState {
    Unloaded,
    Loading,
    Loaded,
}

struct Slot {
    capability: Option<Arc<dyn EmotionClassifier>>,
    last_used_at: Instant,
    /// Reason of the most recent failed load
    last_failure: Option<String>,
}

/// Resets the observable state if a load is abandoned midway
struct LoadingGuard<'a> {
    state: &'a StdMutex<CapabilityState>,
    armed: bool,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.state.lock().unwrap_or_else(PoisonError::into_inner) = CapabilityState::Unloaded;
        }
    }
}

/// Owns the load/unload state of the classification capability
pub struct ResourceLifecycleManager {
    loader: Arc<dyn ClassifierLoader>,
    idle_timeout: Duration,
    slot: Mutex<Slot>,
    state: StdMutex<CapabilityState>,
    /// Finished load attempts, bumped under the slot lock
    load_attempts: AtomicU64,
    load_count: AtomicU64,
    unload_count: AtomicU64,
    events: Option<EventBus>,
}

impl ResourceLifecycleManager {
    pub fn new(loader: Arc<dyn ClassifierLoader>, idle_timeout: Duration) -> Self {
        Self {
            loader,
            idle_timeout,
            slot: Mutex::new(Slot {
                capability: None,
                last_used_at: Instant::now(),
                last_failure: None,
            }),
            state: StdMutex::new(CapabilityState::Unloaded),
            load_attempts: AtomicU64::new(0),
            load_count: AtomicU64::new(0),
            unload_count: AtomicU64::new(0),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn set_state(&self, state: CapabilityState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn state(&self) -> CapabilityState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Underlying load operations performed so far
    pub fn load_count(&self) -> u64 {
        self.load_count.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> u64 {
        self.unload_count.load(Ordering::SeqCst)
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Handle to the loaded capability, loading it first if needed
    ///
    /// Refreshes `last_used_at`. Load failures surface as
    /// `CapabilityUnavailable` and leave the state Unloaded.
    pub async fn ensure_loaded(&self) -> PipelineResult<Arc<dyn EmotionClassifier>> {
        let attempts_seen = self.load_attempts.load(Ordering::SeqCst);
        let mut slot = self.slot.lock().await;

        if let Some(capability) = &slot.capability {
            let capability = Arc::clone(capability);
            slot.last_used_at = Instant::now();
            return Ok(capability);
        }

        // A load finished while this caller waited and it failed: share that outcome
        if self.load_attempts.load(Ordering::SeqCst) != attempts_seen {
            if let Some(reason) = &slot.last_failure {
                return Err(PipelineError::CapabilityUnavailable(reason.clone()));
            }
        }

        self.set_state(CapabilityState::Loading);
        let mut guard = LoadingGuard {
            state: &self.state,
            armed: true,
        };
        let started = Instant::now();
        info!("Loading analysis capability");

        let loaded = self.loader.load().await;
        guard.armed = false;
        self.load_attempts.fetch_add(1, Ordering::SeqCst);

        match loaded {
            Ok(capability) => {
                let elapsed = started.elapsed();
                slot.capability = Some(Arc::clone(&capability));
                slot.last_used_at = Instant::now();
                slot.last_failure = None;
                self.load_count.fetch_add(1, Ordering::SeqCst);
                self.set_state(CapabilityState::Loaded);

                info!(
                    capability = %capability.name(),
                    load_ms = elapsed.as_millis() as u64,
                    "Analysis capability loaded"
                );
                if let Some(events) = &self.events {
                    events.emit_lossy(PulseEvent::CapabilityLoaded {
                        load_duration_ms: elapsed.as_millis() as u64,
                        timestamp: Utc::now(),
                    });
                }
                Ok(capability)
            }
            Err(err) => {
                self.set_state(CapabilityState::Unloaded);
                warn!(error = %err, "Analysis capability failed to load");
                let reason = match err {
                    PipelineError::CapabilityUnavailable(reason) => reason,
                    other => other.to_string(),
                };
                slot.last_failure = Some(reason.clone());
                Err(PipelineError::CapabilityUnavailable(reason))
            }
        }
    }

    /// Refresh `last_used_at` after a gated call completes
    ///
    /// Skipped when a load is in progress; that load sets the timestamp itself.
    pub fn mark_used(&self) {
        if let Ok(mut slot) = self.slot.try_lock() {
            if slot.capability.is_some() {
                slot.last_used_at = Instant::now();
            }
        }
    }

    /// Release the capability if it has been idle longer than `idle_timeout`
    ///
    /// Returns true only for the sweep that performed the unload.
    pub async fn idle_sweep(&self) -> bool {
        // A load in progress holds the slot; a loading capability is not idle
        let Ok(mut slot) = self.slot.try_lock() else {
            return false;
        };
        if slot.capability.is_none() {
            return false;
        }

        let idle = slot.last_used_at.elapsed();
        if idle <= self.idle_timeout {
            return false;
        }

        slot.capability = None;
        self.unload_count.fetch_add(1, Ordering::SeqCst);
        self.set_state(CapabilityState::Unloaded);

        info!(idle_secs = idle.as_secs(), "Analysis capability unloaded after idle timeout");
        if let Some(events) = &self.events {
            events.emit_lossy(PulseEvent::CapabilityUnloaded {
                idle_seconds: idle.as_secs(),
                timestamp: Utc::now(),
            });
        }
        true
    }
}
