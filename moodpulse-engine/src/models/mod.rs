//! Data model for the control loop

pub mod consensus;
pub mod cycle;
pub mod emotion;
pub mod entity;

pub use consensus::{AggregateOutcome, ConsensusResult, VoteAlgorithm};
pub use cycle::{CycleReport, CycleStage, StageTransition};
pub use emotion::{Emotion, EmotionSample};
pub use entity::EntityState;
