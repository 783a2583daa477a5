//! moodpulse-engine library interface
//!
//! Adaptive polling and emotion consensus control loop. Exposes the components
//! individually for integration testing and for embedding the loop elsewhere.

pub mod cache;
pub mod collaborators;
pub mod consensus;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod resilience;
pub mod scheduler;

pub use crate::error::{PipelineError, PipelineResult};
pub use crate::orchestrator::{Collaborators, OrchestratorHandle, PipelineOrchestrator};
