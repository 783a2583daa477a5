//! Database initialization
//!
//! Creates the SQLite database on first run and applies the schema idempotently.
//! Only the durable control state lives here: entity priority fields, emotion
//! samples, consensus results and circuit breaker states. Cached responses are
//! in-memory only.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Busy timeout applied to every connection; lock waits beyond it are handled by
/// [`retry_on_lock`](super::retry_on_lock)
const BUSY_TIMEOUT_MS: u64 = 250;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Pragmas go on the connect options so every pooled connection gets them.
    // WAL lets aggregation read a consistent snapshot while workers append samples.
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));

    // Parallel fetch workers write concurrently, so keep a few connections warm
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    Ok(pool)
}

/// Apply all table definitions (safe to call multiple times)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_entities_table(pool).await?;
    create_emotion_samples_table(pool).await?;
    create_consensus_results_table(pool).await?;
    create_circuit_states_table(pool).await?;
    info!("Database schema ready (entities, emotion_samples, consensus_results, circuit_states)");
    Ok(())
}

async fn create_entities_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            entity_id TEXT PRIMARY KEY,
            importance REAL NOT NULL,
            data_need REAL NOT NULL DEFAULT 10.0,
            last_polled_at TEXT,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            success_rate REAL NOT NULL DEFAULT 1.0,
            activity_boost REAL NOT NULL DEFAULT 1.0,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_emotion_samples_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS emotion_samples (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            emotion TEXT NOT NULL,
            confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
            created_at TEXT NOT NULL,
            UNIQUE (entity_id, item_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_emotion_samples_entity ON emotion_samples (entity_id, created_at)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_consensus_results_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS consensus_results (
            entity_id TEXT PRIMARY KEY,
            dominant_emotion TEXT NOT NULL,
            confidence REAL NOT NULL,
            algorithm_votes TEXT NOT NULL,
            distribution TEXT NOT NULL,
            weighted_scores TEXT NOT NULL DEFAULT '{}',
            average_confidence REAL NOT NULL DEFAULT 0.0,
            sample_count INTEGER NOT NULL,
            tie_broken INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_circuit_states_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS circuit_states (
            collaborator_name TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            failure_count INTEGER NOT NULL DEFAULT 0,
            opened_at TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}
