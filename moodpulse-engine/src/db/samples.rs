//! Emotion sample persistence
//!
//! Samples are immutable once written. `(entity_id, item_id)` is unique, so
//! re-classifying an item after a retried or aborted cycle never duplicates it.

use moodpulse_common::db::retry_on_lock;
use moodpulse_common::time::{parse_rfc3339, to_db_timestamp};
use moodpulse_common::Result;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::warn;

use super::LOCK_WAIT_MS;
use crate::models::{Emotion, EmotionSample};

/// Insert samples in one transaction; returns how many rows were new
pub async fn insert_samples(pool: &SqlitePool, samples: &[EmotionSample]) -> Result<usize> {
    if samples.is_empty() {
        return Ok(0);
    }

    retry_on_lock("insert_samples", LOCK_WAIT_MS, || async {
        let mut tx = pool.begin().await?;
        let mut inserted = 0usize;
        for sample in samples {
            let result = sqlx::query(
                r#"
                INSERT INTO emotion_samples (entity_id, item_id, emotion, confidence, created_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(entity_id, item_id) DO NOTHING
                "#,
            )
            .bind(&sample.entity_id)
            .bind(&sample.item_id)
            .bind(sample.emotion.as_str())
            .bind(sample.confidence)
            .bind(to_db_timestamp(sample.created_at))
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(inserted)
    })
    .await
}

/// Most recent `limit` samples of an entity, newest first
///
/// Rows with a label outside the emotion set are skipped with a warning.
pub async fn load_recent_samples(
    pool: &SqlitePool,
    entity_id: &str,
    limit: u32,
) -> Result<Vec<EmotionSample>> {
    let rows = sqlx::query(
        r#"
        SELECT entity_id, item_id, emotion, confidence, created_at
        FROM emotion_samples
        WHERE entity_id = ?
        ORDER BY created_at DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(entity_id)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    let mut samples = Vec::with_capacity(rows.len());
    for row in rows {
        let label: String = row.get("emotion");
        let Ok(emotion) = label.parse::<Emotion>() else {
            warn!(entity = %entity_id, label = %label, "Skipping sample with unknown emotion");
            continue;
        };
        let created_at: String = row.get("created_at");
        samples.push(EmotionSample {
            entity_id: row.get("entity_id"),
            item_id: row.get("item_id"),
            emotion,
            confidence: row.get("confidence"),
            created_at: parse_rfc3339(&created_at)?,
        });
    }
    Ok(samples)
}

/// Sample count per entity (entities without samples are absent)
pub async fn sample_counts(pool: &SqlitePool) -> Result<HashMap<String, u64>> {
    let rows = sqlx::query("SELECT entity_id, COUNT(*) AS n FROM emotion_samples GROUP BY entity_id")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let n: i64 = row.get("n");
            (row.get::<String, _>("entity_id"), n.max(0) as u64)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use moodpulse_common::db::init_database;
    use tempfile::TempDir;

    fn sample(entity: &str, item: &str, emotion: Emotion, minutes_ago: i64) -> EmotionSample {
        let mut s = EmotionSample::new(entity, item, emotion, 0.7);
        s.created_at = Utc::now() - Duration::minutes(minutes_ago);
        s
    }

    #[tokio::test]
    async fn test_duplicate_items_are_ignored() {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("pulse.db")).await.unwrap();

        let batch = vec![
            sample("Chile", "a", Emotion::Joy, 3),
            sample("Chile", "b", Emotion::Fear, 2),
        ];
        assert_eq!(insert_samples(&pool, &batch).await.unwrap(), 2);
        assert_eq!(insert_samples(&pool, &batch).await.unwrap(), 0);

        let counts = sample_counts(&pool).await.unwrap();
        assert_eq!(counts.get("Chile"), Some(&2));
        assert_eq!(counts.get("Peru"), None);
    }

    #[tokio::test]
    async fn test_recent_samples_are_limited_and_newest_first() {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("pulse.db")).await.unwrap();

        let batch: Vec<EmotionSample> = (0..5)
            .map(|i| sample("Chile", &format!("item-{}", i), Emotion::Anger, 10 - i))
            .chain(std::iter::once(sample("Peru", "p", Emotion::Joy, 0)))
            .collect();
        insert_samples(&pool, &batch).await.unwrap();

        let recent = load_recent_samples(&pool, "Chile", 3).await.unwrap();
        let ids: Vec<&str> = recent.iter().map(|s| s.item_id.as_str()).collect();
        assert_eq!(ids, vec!["item-4", "item-3", "item-2"]);
        assert!(recent.iter().all(|s| s.entity_id == "Chile"));
    }
}
