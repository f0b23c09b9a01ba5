//! Persistence for ingestion records

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;
use waxlog_common::types::{EntityType, MonthKey};

use super::error::IngestError;
use super::models::{FileState, IngestionRecord, IngestionStatus};
use crate::db::is_unique_violation;

/// Storage for [`IngestionRecord`]s
///
/// Writes go through [`compare_and_swap`](Self::compare_and_swap) so two
/// schedulers racing on the same month cannot both claim it.
#[async_trait]
pub trait IngestionRepository: Send + Sync {
    /// Fails with [`IngestError::AlreadyExists`] when the month is taken
    async fn insert(&self, record: &IngestionRecord) -> Result<(), IngestError>;

    async fn find_by_month(&self, month_key: MonthKey)
        -> Result<Option<IngestionRecord>, IngestError>;

    async fn find_by_status(
        &self,
        status: IngestionStatus,
    ) -> Result<Vec<IngestionRecord>, IngestError>;

    /// Newest months first
    async fn list_recent(&self, limit: i64) -> Result<Vec<IngestionRecord>, IngestError>;

    /// Persist `record` only if the stored status is still `expected`.
    /// Returns false when another writer got there first.
    async fn compare_and_swap(
        &self,
        record: &IngestionRecord,
        expected: IngestionStatus,
    ) -> Result<bool, IngestError>;
}

// ============================================================================
// Postgres
// ============================================================================

pub struct PgIngestionRepository {
    pool: PgPool,
}

impl PgIngestionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct IngestionRow {
    id: Uuid,
    month_key: String,
    status: String,
    retry_count: i32,
    error_message: Option<String>,
    checksums: Json<BTreeMap<EntityType, String>>,
    file_status: Json<BTreeMap<EntityType, FileState>>,
    started_at: Option<DateTime<Utc>>,
    download_completed_at: Option<DateTime<Utc>>,
    processing_completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IngestionRow> for IngestionRecord {
    type Error = IngestError;

    fn try_from(row: IngestionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            month_key: row
                .month_key
                .parse()
                .map_err(|e| IngestError::Corrupt(format!("{}", e)))?,
            status: row.status.parse()?,
            retry_count: row.retry_count,
            error_message: row.error_message,
            checksums: row.checksums.0,
            files: row.file_status.0,
            started_at: row.started_at,
            download_completed_at: row.download_completed_at,
            processing_completed_at: row.processing_completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, month_key, status, retry_count, error_message, checksums, file_status,
           started_at, download_completed_at, processing_completed_at, created_at, updated_at
    FROM ingestion_records
"#;

fn collect(rows: Vec<IngestionRow>) -> Result<Vec<IngestionRecord>, IngestError> {
    rows.into_iter().map(IngestionRecord::try_from).collect()
}

#[async_trait]
impl IngestionRepository for PgIngestionRepository {
    async fn insert(&self, record: &IngestionRecord) -> Result<(), IngestError> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_records (
                id, month_key, status, retry_count, error_message, checksums, file_status,
                started_at, download_completed_at, processing_completed_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.id)
        .bind(record.month_key.to_string())
        .bind(record.status.as_str())
        .bind(record.retry_count)
        .bind(&record.error_message)
        .bind(Json(&record.checksums))
        .bind(Json(&record.files))
        .bind(record.started_at)
        .bind(record.download_completed_at)
        .bind(record.processing_completed_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                IngestError::AlreadyExists(record.month_key)
            } else {
                IngestError::Database(e)
            }
        })?;

        Ok(())
    }

    async fn find_by_month(
        &self,
        month_key: MonthKey,
    ) -> Result<Option<IngestionRecord>, IngestError> {
        let row = sqlx::query_as::<_, IngestionRow>(&format!("{} WHERE month_key = $1", SELECT_COLUMNS))
            .bind(month_key.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(IngestionRecord::try_from).transpose()
    }

    async fn find_by_status(
        &self,
        status: IngestionStatus,
    ) -> Result<Vec<IngestionRecord>, IngestError> {
        let rows = sqlx::query_as::<_, IngestionRow>(&format!(
            "{} WHERE status = $1 ORDER BY month_key",
            SELECT_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<IngestionRecord>, IngestError> {
        let rows = sqlx::query_as::<_, IngestionRow>(&format!(
            "{} ORDER BY month_key DESC LIMIT $1",
            SELECT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn compare_and_swap(
        &self,
        record: &IngestionRecord,
        expected: IngestionStatus,
    ) -> Result<bool, IngestError> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_records
            SET status = $3,
                retry_count = $4,
                error_message = $5,
                checksums = $6,
                file_status = $7,
                started_at = $8,
                download_completed_at = $9,
                processing_completed_at = $10,
                updated_at = $11
            WHERE month_key = $1 AND status = $2
            "#,
        )
        .bind(record.month_key.to_string())
        .bind(expected.as_str())
        .bind(record.status.as_str())
        .bind(record.retry_count)
        .bind(&record.error_message)
        .bind(Json(&record.checksums))
        .bind(Json(&record.files))
        .bind(record.started_at)
        .bind(record.download_completed_at)
        .bind(record.processing_completed_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Process-local repository for tests and single-node development
#[derive(Default)]
pub struct MemoryIngestionRepository {
    records: RwLock<HashMap<MonthKey, IngestionRecord>>,
}

impl MemoryIngestionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IngestionRepository for MemoryIngestionRepository {
    async fn insert(&self, record: &IngestionRecord) -> Result<(), IngestError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.month_key) {
            return Err(IngestError::AlreadyExists(record.month_key));
        }
        records.insert(record.month_key, record.clone());
        Ok(())
    }

    async fn find_by_month(
        &self,
        month_key: MonthKey,
    ) -> Result<Option<IngestionRecord>, IngestError> {
        Ok(self.records.read().await.get(&month_key).cloned())
    }

    async fn find_by_status(
        &self,
        status: IngestionStatus,
    ) -> Result<Vec<IngestionRecord>, IngestError> {
        let mut found: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|record| record.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|record| record.month_key);
        Ok(found)
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<IngestionRecord>, IngestError> {
        let mut all: Vec<_> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.month_key.cmp(&a.month_key));
        all.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(all)
    }

    async fn compare_and_swap(
        &self,
        record: &IngestionRecord,
        expected: IngestionStatus,
    ) -> Result<bool, IngestError> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.month_key) {
            Some(stored) if stored.status == expected => {
                *stored = record.clone();
                Ok(true)
            },
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn month(key: &str) -> MonthKey {
        key.parse().unwrap()
    }

    #[tokio::test]
    async fn test_memory_insert_is_unique_per_month() {
        let repo = MemoryIngestionRepository::new();
        repo.insert(&IngestionRecord::new(month("2025-01"))).await.unwrap();

        let err = repo
            .insert(&IngestionRecord::new(month("2025-01")))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_memory_compare_and_swap_checks_status() {
        let repo = MemoryIngestionRepository::new();
        let mut record = IngestionRecord::new(month("2025-01"));
        repo.insert(&record).await.unwrap();

        record.status = IngestionStatus::Downloading;
        assert!(repo
            .compare_and_swap(&record, IngestionStatus::NotStarted)
            .await
            .unwrap());
        // Second writer still believes the row is NotStarted
        assert!(!repo
            .compare_and_swap(&record, IngestionStatus::NotStarted)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_memory_list_recent_orders_newest_first() {
        let repo = MemoryIngestionRepository::new();
        for key in ["2024-11", "2025-01", "2024-12"] {
            repo.insert(&IngestionRecord::new(month(key))).await.unwrap();
        }

        let recent = repo.list_recent(2).await.unwrap();
        let keys: Vec<_> = recent.iter().map(|r| r.month_key.to_string()).collect();
        assert_eq!(keys, vec!["2025-01", "2024-12"]);
    }
}
