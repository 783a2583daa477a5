//! Circuit breaker state persistence

use chrono::Utc;
use moodpulse_common::db::retry_on_lock;
use moodpulse_common::time::{parse_rfc3339, to_db_timestamp};
use moodpulse_common::{Error, Result};
use sqlx::{Row, SqlitePool};

use super::LOCK_WAIT_MS;
use crate::resilience::{CircuitSnapshot, CircuitState};

/// Upsert every circuit snapshot in one transaction
pub async fn save_circuit_states(pool: &SqlitePool, snapshots: &[CircuitSnapshot]) -> Result<()> {
    if snapshots.is_empty() {
        return Ok(());
    }

    retry_on_lock("save_circuit_states", LOCK_WAIT_MS, || async {
        let now = to_db_timestamp(Utc::now());
        let mut tx = pool.begin().await?;
        for snap in snapshots {
            sqlx::query(
                r#"
                INSERT INTO circuit_states (collaborator_name, state, failure_count, opened_at, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(collaborator_name) DO UPDATE SET
                    state = excluded.state,
                    failure_count = excluded.failure_count,
                    opened_at = excluded.opened_at,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&snap.collaborator)
            .bind(snap.state.as_str())
            .bind(snap.failure_count as i64)
            .bind(snap.opened_at.map(to_db_timestamp))
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    })
    .await
}

/// Load all persisted circuits
pub async fn load_circuit_states(pool: &SqlitePool) -> Result<Vec<CircuitSnapshot>> {
    let rows = sqlx::query(
        "SELECT collaborator_name, state, failure_count, opened_at FROM circuit_states ORDER BY collaborator_name",
    )
    .fetch_all(pool)
    .await?;

    let mut snapshots = Vec::with_capacity(rows.len());
    for row in rows {
        let state: String = row.get("state");
        let failure_count: i64 = row.get("failure_count");
        let opened_at: Option<String> = row.get("opened_at");
        snapshots.push(CircuitSnapshot {
            collaborator: row.get("collaborator_name"),
            state: state
                .parse::<CircuitState>()
                .map_err(|e| Error::InvalidInput(e.to_string()))?,
            failure_count: failure_count.max(0) as u32,
            opened_at: opened_at.as_deref().map(parse_rfc3339).transpose()?,
        });
    }
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use moodpulse_common::db::init_database;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_circuit_states_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pulse.db");
        let pool = init_database(&path).await.unwrap();

        let opened = parse_rfc3339("2026-03-01T10:00:00Z").unwrap();
        let snapshots = vec![
            CircuitSnapshot {
                collaborator: "classify".into(),
                state: CircuitState::Closed,
                failure_count: 1,
                opened_at: None,
            },
            CircuitSnapshot {
                collaborator: "fetch".into(),
                state: CircuitState::Open,
                failure_count: 5,
                opened_at: Some(opened),
            },
        ];
        save_circuit_states(&pool, &snapshots).await.unwrap();
        pool.close().await;

        let pool = init_database(&path).await.unwrap();
        assert_eq!(load_circuit_states(&pool).await.unwrap(), snapshots);
    }
}
