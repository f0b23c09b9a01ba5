//! Batch upsert of parsed catalog records
//!
//! Each batch is written with a single `INSERT ... ON CONFLICT (id) DO UPDATE`,
//! so replaying a file after a crash rewrites rows instead of duplicating them.

use async_trait::async_trait;
use serde_json::json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::debug;
use waxlog_common::types::{EntityType, MonthKey};

use super::records::{ArtistRecord, CatalogRecord, LabelRecord, MasterRecord, ReleaseRecord};

#[async_trait]
pub trait CatalogWriter: Send + Sync {
    /// Upsert one batch, returning the number of rows written
    async fn upsert_batch(&self, month: MonthKey, batch: Vec<CatalogRecord>) -> anyhow::Result<u64>;
}

/// Postgres rejects an upsert that touches the same row twice; keep the last copy
fn dedupe_by_id<T>(records: Vec<T>, id: impl Fn(&T) -> i64) -> Vec<T> {
    let mut seen = HashSet::with_capacity(records.len());
    let mut kept: Vec<T> = records
        .into_iter()
        .rev()
        .filter(|r| seen.insert(id(r)))
        .collect();
    kept.reverse();
    kept
}

pub struct PgCatalogWriter {
    pool: PgPool,
}

impl PgCatalogWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn upsert_artists(&self, month: &str, rows: Vec<ArtistRecord>) -> sqlx::Result<u64> {
        let rows = dedupe_by_id(rows, |r| r.id);
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO artists (id, name, real_name, profile, data_quality, data, source_month) ",
        );
        qb.push_values(rows.iter(), |mut b, r| {
            b.push_bind(r.id)
                .push_bind(&r.name)
                .push_bind(&r.real_name)
                .push_bind(&r.profile)
                .push_bind(&r.data_quality)
                .push_bind(json!({
                    "urls": r.urls,
                    "name_variations": r.name_variations,
                    "aliases": r.aliases,
                    "members": r.members,
                    "groups": r.groups,
                }))
                .push_bind(month);
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, real_name = EXCLUDED.real_name, \
             profile = EXCLUDED.profile, data_quality = EXCLUDED.data_quality, data = EXCLUDED.data, \
             source_month = EXCLUDED.source_month, updated_at = NOW()",
        );
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    async fn upsert_labels(&self, month: &str, rows: Vec<LabelRecord>) -> sqlx::Result<u64> {
        let rows = dedupe_by_id(rows, |r| r.id);
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO labels (id, name, contact_info, profile, parent_label_id, data_quality, data, source_month) ",
        );
        qb.push_values(rows.iter(), |mut b, r| {
            b.push_bind(r.id)
                .push_bind(&r.name)
                .push_bind(&r.contact_info)
                .push_bind(&r.profile)
                .push_bind(r.parent_label.as_ref().and_then(|p| p.id))
                .push_bind(&r.data_quality)
                .push_bind(json!({
                    "parent_label": r.parent_label,
                    "sublabels": r.sublabels,
                    "urls": r.urls,
                }))
                .push_bind(month);
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, contact_info = EXCLUDED.contact_info, \
             profile = EXCLUDED.profile, parent_label_id = EXCLUDED.parent_label_id, \
             data_quality = EXCLUDED.data_quality, data = EXCLUDED.data, \
             source_month = EXCLUDED.source_month, updated_at = NOW()",
        );
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    async fn upsert_masters(&self, month: &str, rows: Vec<MasterRecord>) -> sqlx::Result<u64> {
        let rows = dedupe_by_id(rows, |r| r.id);
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO masters (id, title, main_release_id, year, data_quality, data, source_month) ",
        );
        qb.push_values(rows.iter(), |mut b, r| {
            b.push_bind(r.id)
                .push_bind(&r.title)
                .push_bind(r.main_release)
                .push_bind(r.year)
                .push_bind(&r.data_quality)
                .push_bind(json!({
                    "artists": r.artists,
                    "genres": r.genres,
                    "styles": r.styles,
                }))
                .push_bind(month);
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET title = EXCLUDED.title, \
             main_release_id = EXCLUDED.main_release_id, year = EXCLUDED.year, \
             data_quality = EXCLUDED.data_quality, data = EXCLUDED.data, \
             source_month = EXCLUDED.source_month, updated_at = NOW()",
        );
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    async fn upsert_releases(&self, month: &str, rows: Vec<ReleaseRecord>) -> sqlx::Result<u64> {
        let rows = dedupe_by_id(rows, |r| r.id);
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO releases (id, title, status, country, released, master_id, data_quality, data, source_month) ",
        );
        qb.push_values(rows.iter(), |mut b, r| {
            b.push_bind(r.id)
                .push_bind(&r.title)
                .push_bind(&r.status)
                .push_bind(&r.country)
                .push_bind(&r.released)
                .push_bind(r.master_id)
                .push_bind(&r.data_quality)
                .push_bind(json!({
                    "artists": r.artists,
                    "extra_artists": r.extra_artists,
                    "labels": r.labels,
                    "formats": r.formats,
                    "genres": r.genres,
                    "styles": r.styles,
                    "tracklist": r.tracklist,
                }))
                .push_bind(month);
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET title = EXCLUDED.title, status = EXCLUDED.status, \
             country = EXCLUDED.country, released = EXCLUDED.released, master_id = EXCLUDED.master_id, \
             data_quality = EXCLUDED.data_quality, data = EXCLUDED.data, \
             source_month = EXCLUDED.source_month, updated_at = NOW()",
        );
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }
}

#[async_trait]
impl CatalogWriter for PgCatalogWriter {
    async fn upsert_batch(&self, month: MonthKey, batch: Vec<CatalogRecord>) -> anyhow::Result<u64> {
        let month = month.to_string();
        let mut artists = Vec::new();
        let mut labels = Vec::new();
        let mut masters = Vec::new();
        let mut releases = Vec::new();

        for record in batch {
            match record {
                CatalogRecord::Artist(r) => artists.push(r),
                CatalogRecord::Label(r) => labels.push(r),
                CatalogRecord::Master(r) => masters.push(r),
                CatalogRecord::Release(r) => releases.push(r),
            }
        }

        let mut written = 0;
        if !artists.is_empty() {
            written += self.upsert_artists(&month, artists).await?;
        }
        if !labels.is_empty() {
            written += self.upsert_labels(&month, labels).await?;
        }
        if !masters.is_empty() {
            written += self.upsert_masters(&month, masters).await?;
        }
        if !releases.is_empty() {
            written += self.upsert_releases(&month, releases).await?;
        }

        debug!(month_key = %month, rows = written, "Upserted catalog batch");
        Ok(written)
    }
}

/// Keeps rows in memory and counts writes per entity; for tests
#[derive(Default)]
pub struct MemoryCatalogWriter {
    rows: Mutex<HashMap<(EntityType, i64), CatalogRecord>>,
    writes: Mutex<HashMap<EntityType, u64>>,
}

impl MemoryCatalogWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, entity: EntityType, id: i64) -> Option<CatalogRecord> {
        self.rows.lock().await.get(&(entity, id)).cloned()
    }

    pub async fn count(&self, entity: EntityType) -> usize {
        self.rows
            .lock()
            .await
            .keys()
            .filter(|(e, _)| *e == entity)
            .count()
    }

    /// Total upserted rows for `entity`, including rewrites of the same id
    pub async fn writes(&self, entity: EntityType) -> u64 {
        self.writes.lock().await.get(&entity).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CatalogWriter for MemoryCatalogWriter {
    async fn upsert_batch(&self, _month: MonthKey, batch: Vec<CatalogRecord>) -> anyhow::Result<u64> {
        let mut rows = self.rows.lock().await;
        let mut writes = self.writes.lock().await;
        let written = batch.len() as u64;

        for record in batch {
            *writes.entry(record.entity()).or_default() += 1;
            rows.insert((record.entity(), record.id()), record);
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_keeps_last_occurrence_in_order() {
        let rows = vec![(1, "a"), (2, "b"), (1, "c"), (3, "d")];
        let kept = dedupe_by_id(rows, |r| r.0);
        assert_eq!(kept, vec![(2, "b"), (1, "c"), (3, "d")]);
    }

    #[tokio::test]
    async fn test_memory_writer_upserts_by_id() {
        let writer = MemoryCatalogWriter::new();
        let month: MonthKey = "2025-02".parse().unwrap();
        let artist = |name: &str| {
            CatalogRecord::Artist(ArtistRecord {
                id: 1,
                name: name.to_string(),
                real_name: None,
                profile: None,
                data_quality: None,
                urls: vec![],
                name_variations: vec![],
                aliases: vec![],
                members: vec![],
                groups: vec![],
            })
        };

        writer.upsert_batch(month, vec![artist("Old")]).await.unwrap();
        writer.upsert_batch(month, vec![artist("New")]).await.unwrap();

        assert_eq!(writer.count(EntityType::Artists).await, 1);
        assert_eq!(writer.writes(EntityType::Artists).await, 2);
        let Some(CatalogRecord::Artist(stored)) = writer.get(EntityType::Artists, 1).await else {
            panic!("artist missing");
        };
        assert_eq!(stored.name, "New");
    }
}
