//! Error types for moodpulse-engine
//!
//! Propagation policy:
//! - `TransientIo` is retried by the retrying invoker and only escapes it once
//!   attempts are exhausted
//! - `Permanent` marks the affected entity failed for the cycle, never the loop
//! - `CapabilityUnavailable` demotes the Analyzing stage to fallback output
//! - `CircuitOpen` is a fast-fail; no call was attempted
//!
//! An entity without samples is not an error at all: aggregation reports it as
//! [`AggregateOutcome::NoData`](crate::models::AggregateOutcome::NoData).

use thiserror::Error;

/// Control loop error taxonomy
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network or timeout class failure; safe to retry
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Malformed entity or input; retrying cannot help
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// The analysis capability could not be loaded
    #[error("Analysis capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// Collaborator circuit is open (or a half-open probe is already in flight)
    #[error("Circuit open for collaborator '{collaborator}'")]
    CircuitOpen { collaborator: String },

    /// Stop signal observed while waiting
    #[error("Operation cancelled")]
    Cancelled,

    /// Durable store failure
    #[error("Storage error: {0}")]
    Storage(#[from] moodpulse_common::Error),
}

impl PipelineError {
    /// Whether the retrying invoker may try again
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TransientIo(_))
    }

    /// Whether the failure should count against a collaborator's circuit
    ///
    /// Fast-fails and cancellations never reached the collaborator, and
    /// permanent errors describe bad input rather than an unhealthy collaborator.
    pub fn counts_as_collaborator_failure(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientIo(_) | PipelineError::CapabilityUnavailable(_)
        )
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Storage(moodpulse_common::Error::Database(err))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Storage(moodpulse_common::Error::InvalidInput(err.to_string()))
    }
}

/// Result type for control loop operations
pub type PipelineResult<T> = Result<T, PipelineError>;
