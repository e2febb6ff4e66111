//! Append-only store of prediction records.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::PipelineError;
use crate::models::{Label, NewPrediction, PredictionRecord, UserId};

#[async_trait]
pub trait PredictionStore: Send + Sync {
    /// Appends one record. Image filenames are unique across the store.
    async fn create_prediction_record(
        &self,
        prediction: NewPrediction,
    ) -> Result<PredictionRecord, PipelineError>;
}

#[derive(Debug, Clone)]
pub struct SqlitePredictionStore {
    pool: SqlitePool,
}

impl SqlitePredictionStore {
    pub async fn connect(database_url: &str) -> Result<Self, PipelineError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::with_pool(pool).await
    }

    /// Private database living as long as the store; used by tests.
    pub async fn in_memory() -> Result<Self, PipelineError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, PipelineError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| PipelineError::Storage(format!("migration failed: {}", e)))?;
        Ok(Self { pool })
    }

    pub async fn predictions_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<PredictionRecord>, PipelineError> {
        let rows = sqlx::query_as::<_, (i64, i64, String, String, f64, String)>(
            r#"SELECT id, user_id, image_filename, prediction_result, confidence_score, timestamp
            FROM predictions WHERE user_id = ? ORDER BY id"#,
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, user_id, image_filename, label, confidence, timestamp)| {
                Ok(PredictionRecord {
                    id,
                    user_id: UserId(user_id),
                    image_filename,
                    label: Label::from_str(&label).map_err(PipelineError::Storage)?,
                    confidence,
                    created_at: OffsetDateTime::parse(&timestamp, &Rfc3339)
                        .map_err(|e| PipelineError::Storage(e.to_string()))?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl PredictionStore for SqlitePredictionStore {
    async fn create_prediction_record(
        &self,
        prediction: NewPrediction,
    ) -> Result<PredictionRecord, PipelineError> {
        let created_at = OffsetDateTime::now_utc();
        let timestamp = created_at
            .format(&Rfc3339)
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let id = sqlx::query(
            r#"INSERT INTO predictions
            (user_id, image_filename, prediction_result, confidence_score, timestamp)
            VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(prediction.user_id.0)
        .bind(&prediction.image_filename)
        .bind(prediction.label.as_str())
        .bind(prediction.confidence)
        .bind(&timestamp)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        tracing::debug!(id, filename = %prediction.image_filename, "stored prediction record");
        Ok(PredictionRecord {
            id,
            user_id: prediction.user_id,
            image_filename: prediction.image_filename,
            label: prediction.label,
            confidence: prediction.confidence,
            created_at,
        })
    }
}
