//! Consensus result persistence (at most one row per entity)

use moodpulse_common::db::retry_on_lock;
use moodpulse_common::time::{parse_rfc3339, to_db_timestamp};
use moodpulse_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::LOCK_WAIT_MS;
use crate::models::{ConsensusResult, Emotion};

/// Insert or replace the entity's consensus row
pub async fn upsert_consensus(pool: &SqlitePool, result: &ConsensusResult) -> Result<()> {
    let votes = to_json(&result.algorithm_votes)?;
    let distribution = to_json(&result.distribution)?;
    let weighted_scores = to_json(&result.weighted_scores)?;
    let updated_at = to_db_timestamp(result.updated_at);

    retry_on_lock("upsert_consensus", LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            INSERT INTO consensus_results (
                entity_id, dominant_emotion, confidence, algorithm_votes, distribution,
                weighted_scores, average_confidence, sample_count, tie_broken, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(entity_id) DO UPDATE SET
                dominant_emotion = excluded.dominant_emotion,
                confidence = excluded.confidence,
                algorithm_votes = excluded.algorithm_votes,
                distribution = excluded.distribution,
                weighted_scores = excluded.weighted_scores,
                average_confidence = excluded.average_confidence,
                sample_count = excluded.sample_count,
                tie_broken = excluded.tie_broken,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&result.entity_id)
        .bind(result.dominant_emotion.as_str())
        .bind(result.confidence)
        .bind(&votes)
        .bind(&distribution)
        .bind(&weighted_scores)
        .bind(result.average_confidence)
        .bind(result.sample_count as i64)
        .bind(result.tie_broken)
        .bind(&updated_at)
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
}

/// Load an entity's consensus row, if one exists
pub async fn load_consensus(pool: &SqlitePool, entity_id: &str) -> Result<Option<ConsensusResult>> {
    let row = sqlx::query(
        r#"
        SELECT entity_id, dominant_emotion, confidence, algorithm_votes, distribution,
               weighted_scores, average_confidence, sample_count, tie_broken, updated_at
        FROM consensus_results
        WHERE entity_id = ?
        "#,
    )
    .bind(entity_id)
    .fetch_optional(pool)
    .await?;

    row.map(|row| from_row(&row)).transpose()
}

/// Number of stored consensus rows
pub async fn count_consensus(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM consensus_results")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

fn from_row(row: &SqliteRow) -> Result<ConsensusResult> {
    let dominant: String = row.get("dominant_emotion");
    let votes: String = row.get("algorithm_votes");
    let distribution: String = row.get("distribution");
    let weighted_scores: String = row.get("weighted_scores");
    let sample_count: i64 = row.get("sample_count");
    let updated_at: String = row.get("updated_at");

    Ok(ConsensusResult {
        entity_id: row.get("entity_id"),
        dominant_emotion: dominant
            .parse::<Emotion>()
            .map_err(|e| Error::InvalidInput(e.to_string()))?,
        confidence: row.get("confidence"),
        algorithm_votes: from_json(&votes)?,
        distribution: from_json(&distribution)?,
        weighted_scores: from_json(&weighted_scores)?,
        average_confidence: row.get("average_confidence"),
        sample_count: sample_count.max(0) as u32,
        tie_broken: row.get("tie_broken"),
        updated_at: parse_rfc3339(&updated_at)?,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Internal(format!("JSON encode failed: {}", e)))
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| Error::InvalidInput(format!("JSON decode failed: {}", e)))
}
