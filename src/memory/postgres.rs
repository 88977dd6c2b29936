//! Postgres-backed pattern memory
//!
//! Schema is created lazily on first use.

use crate::error::InvestigationError;
use crate::memory::{
    entity_key, key_matches, EntityReputation, PatternMemory, PatternMetadata, PatternRecord,
};
use crate::models::SpecialistKind;
use crate::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

pub struct PostgresPatternMemory {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresPatternMemory {
    /// Build a lazily-connecting pool; no I/O happens here
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| {
                InvestigationError::DatabaseError(format!(
                    "Failed to configure pattern memory pool: {}",
                    e
                ))
            })?;

        info!("Pattern memory backend: postgres");

        Ok(Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS pattern_memory (
                      key TEXT PRIMARY KEY,
                      value JSONB NOT NULL,
                      kind TEXT,
                      confidence DOUBLE PRECISION NOT NULL,
                      success_rate DOUBLE PRECISION NOT NULL,
                      detection_count BIGINT NOT NULL,
                      last_seen TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS entity_reputation (
                      entity_key TEXT PRIMARY KEY,
                      entity_name TEXT NOT NULL,
                      risk_score DOUBLE PRECISION NOT NULL,
                      sanctions_status TEXT NOT NULL,
                      adverse_media TEXT NOT NULL,
                      investigation_count BIGINT NOT NULL,
                      last_updated TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                InvestigationError::DatabaseError(format!(
                    "Failed to initialize pattern memory schema: {}",
                    e
                ))
            })?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl PatternMemory for PostgresPatternMemory {
    async fn get(&self, key: &str) -> Result<Option<PatternRecord>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            SELECT key, value, kind, confidence, success_rate, detection_count, last_seen
            FROM pattern_memory
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            InvestigationError::DatabaseError(format!("Failed to load pattern {}: {}", key, e))
        })?;

        let Some(row) = row else {
            return Ok(None);
        };

        let kind: Option<String> = row.try_get("kind").unwrap_or(None);
        let detection_count: i64 = row.try_get("detection_count").unwrap_or(0);

        Ok(Some(PatternRecord {
            key: row.try_get("key").unwrap_or_else(|_| key.to_string()),
            value: row.try_get("value").unwrap_or(serde_json::Value::Null),
            metadata: PatternMetadata {
                kind: kind.as_deref().and_then(SpecialistKind::parse),
                confidence: row.try_get("confidence").unwrap_or(0.0),
                success_rate: row.try_get("success_rate").unwrap_or(0.0),
                detection_count: detection_count.max(0) as u64,
                last_seen: row
                    .try_get("last_seen")
                    .unwrap_or_else(|_| chrono::Utc::now()),
            },
        }))
    }

    async fn set(&self, key: &str, value: serde_json::Value, metadata: PatternMetadata) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO pattern_memory
              (key, value, kind, confidence, success_rate, detection_count, last_seen)
            VALUES
              ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (key) DO UPDATE SET
              value = EXCLUDED.value,
              kind = EXCLUDED.kind,
              confidence = EXCLUDED.confidence,
              success_rate = EXCLUDED.success_rate,
              detection_count = EXCLUDED.detection_count,
              last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(key)
        .bind(&value)
        .bind(metadata.kind.map(|k| k.as_str()))
        .bind(metadata.confidence)
        .bind(metadata.success_rate)
        .bind(metadata.detection_count as i64)
        .bind(metadata.last_seen)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            InvestigationError::DatabaseError(format!("Failed to store pattern {}: {}", key, e))
        })?;

        Ok(())
    }

    async fn search(&self, query: &str) -> Result<Vec<String>> {
        self.ensure_schema().await?;

        let rows = sqlx::query("SELECT key FROM pattern_memory ORDER BY confidence DESC, key ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                InvestigationError::DatabaseError(format!("Failed to search patterns: {}", e))
            })?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.try_get::<String, _>("key").ok())
            .filter(|key| key_matches(key, query))
            .collect())
    }

    async fn entity(&self, entity_name: &str) -> Result<Option<EntityReputation>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            SELECT entity_name, risk_score, sanctions_status, adverse_media,
                   investigation_count, last_updated
            FROM entity_reputation
            WHERE entity_key = $1
            "#,
        )
        .bind(entity_key(entity_name))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            InvestigationError::DatabaseError(format!(
                "Failed to load entity {}: {}",
                entity_name, e
            ))
        })?;

        let Some(row) = row else {
            return Ok(None);
        };

        let investigation_count: i64 = row.try_get("investigation_count").unwrap_or(0);

        Ok(Some(EntityReputation {
            entity_name: row
                .try_get("entity_name")
                .unwrap_or_else(|_| entity_name.to_string()),
            risk_score: row.try_get("risk_score").unwrap_or(0.0),
            sanctions_status: row
                .try_get("sanctions_status")
                .unwrap_or_else(|_| "unknown".to_string()),
            adverse_media: row
                .try_get("adverse_media")
                .unwrap_or_else(|_| "none".to_string()),
            investigation_count: investigation_count.max(0) as u64,
            last_updated: row
                .try_get("last_updated")
                .unwrap_or_else(|_| chrono::Utc::now()),
        }))
    }

    async fn set_entity(&self, reputation: EntityReputation) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO entity_reputation
              (entity_key, entity_name, risk_score, sanctions_status, adverse_media,
               investigation_count, last_updated)
            VALUES
              ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (entity_key) DO UPDATE SET
              entity_name = EXCLUDED.entity_name,
              risk_score = EXCLUDED.risk_score,
              sanctions_status = EXCLUDED.sanctions_status,
              adverse_media = EXCLUDED.adverse_media,
              investigation_count = EXCLUDED.investigation_count,
              last_updated = EXCLUDED.last_updated
            "#,
        )
        .bind(entity_key(&reputation.entity_name))
        .bind(&reputation.entity_name)
        .bind(reputation.risk_score)
        .bind(&reputation.sanctions_status)
        .bind(&reputation.adverse_media)
        .bind(reputation.investigation_count as i64)
        .bind(reputation.last_updated)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            InvestigationError::DatabaseError(format!(
                "Failed to store entity {}: {}",
                reputation.entity_name, e
            ))
        })?;

        Ok(())
    }
}
