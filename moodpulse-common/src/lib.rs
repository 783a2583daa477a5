//! # moodpulse common library
//!
//! Shared code for the moodpulse workspace:
//! - Error and result types
//! - TOML configuration and root folder resolution
//! - SQLite initialization and lock-retry helpers
//! - Event types (PulseEvent enum) and the broadcast EventBus
//! - Timestamp helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
