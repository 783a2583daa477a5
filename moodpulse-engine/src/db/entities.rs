//! Entity priority state persistence

use chrono::Utc;
use moodpulse_common::db::retry_on_lock;
use moodpulse_common::time::{parse_rfc3339, to_db_timestamp};
use moodpulse_common::Result;
use sqlx::{Row, SqlitePool};

use super::LOCK_WAIT_MS;
use crate::models::EntityState;

/// Upsert every entity's scheduling state in one transaction
pub async fn save_entities(pool: &SqlitePool, entities: &[EntityState]) -> Result<()> {
    retry_on_lock("save_entities", LOCK_WAIT_MS, || async {
        let now = to_db_timestamp(Utc::now());
        let mut tx = pool.begin().await?;
        for entity in entities {
            sqlx::query(
                r#"
                INSERT INTO entities (
                    entity_id, importance, data_need, last_polled_at,
                    consecutive_failures, success_rate, activity_boost, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(entity_id) DO UPDATE SET
                    importance = excluded.importance,
                    data_need = excluded.data_need,
                    last_polled_at = excluded.last_polled_at,
                    consecutive_failures = excluded.consecutive_failures,
                    success_rate = excluded.success_rate,
                    activity_boost = excluded.activity_boost,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&entity.id)
            .bind(entity.importance)
            .bind(entity.data_need)
            .bind(entity.last_polled_at.map(to_db_timestamp))
            .bind(entity.consecutive_failures as i64)
            .bind(entity.success_rate)
            .bind(entity.activity_boost)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    })
    .await
}

/// Load all persisted entity states
pub async fn load_entities(pool: &SqlitePool) -> Result<Vec<EntityState>> {
    let rows = sqlx::query(
        r#"
        SELECT entity_id, importance, data_need, last_polled_at,
               consecutive_failures, success_rate, activity_boost
        FROM entities
        ORDER BY entity_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut entities = Vec::with_capacity(rows.len());
    for row in rows {
        let last_polled: Option<String> = row.get("last_polled_at");
        let failures: i64 = row.get("consecutive_failures");
        entities.push(EntityState {
            id: row.get("entity_id"),
            importance: row.get("importance"),
            data_need: row.get("data_need"),
            last_polled_at: last_polled.as_deref().map(parse_rfc3339).transpose()?,
            consecutive_failures: failures.max(0) as u32,
            success_rate: row.get("success_rate"),
            activity_boost: row.get("activity_boost"),
        });
    }
    Ok(entities)
}
