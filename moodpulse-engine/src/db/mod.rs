//! Durable control state
//!
//! Entity priority fields, emotion samples, consensus results and circuit states.
//! Timestamps are RFC 3339 text, maps are JSON text. Writes that can collide with
//! parallel workers go through [`retry_on_lock`](moodpulse_common::db::retry_on_lock).

pub mod circuit_states;
pub mod consensus;
pub mod entities;
pub mod samples;

/// Longest a single write waits on a locked database
pub const LOCK_WAIT_MS: u64 = 5_000;
