//! User collection and wantlist pages
//!
//! Collection items are keyed by instance id (the same release can be owned
//! twice); wantlist items by release id. Every write stamps the session that
//! saw the item so a full sync can prune whatever it did not see.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::error::SyncError;
use super::models::{SyncSessionId, SyncType};

/// Path of the listing endpoint for `username`, relative to the API base
pub fn page_path(sync_type: SyncType, username: &str) -> String {
    match sync_type {
        SyncType::Collection => format!("/users/{username}/collection/folders/0/releases"),
        SyncType::Wantlist => format!("/users/{username}/wants"),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionItem {
    pub release_id: i64,
    /// Collection only
    pub instance_id: Option<i64>,
    pub folder_id: Option<i64>,
    pub rating: i32,
    pub date_added: Option<DateTime<Utc>>,
    /// The item exactly as the API returned it
    pub data: Value,
}

impl CollectionItem {
    fn from_json(sync_type: SyncType, item: &Value) -> Result<Self, SyncError> {
        let release_id = item
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| SyncError::Page("item without an id".to_string()))?;

        let instance_id = item.get("instance_id").and_then(Value::as_i64);
        if sync_type == SyncType::Collection && instance_id.is_none() {
            return Err(SyncError::Page(format!(
                "collection item {release_id} without an instance_id"
            )));
        }

        Ok(Self {
            release_id,
            instance_id,
            folder_id: item.get("folder_id").and_then(Value::as_i64),
            rating: item
                .get("rating")
                .and_then(Value::as_i64)
                .map(|r| r as i32)
                .unwrap_or(0),
            date_added: item
                .get("date_added")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc)),
            data: item.clone(),
        })
    }

    /// Identity within the user's list
    pub fn key(&self) -> i64 {
        self.instance_id.unwrap_or(self.release_id)
    }
}

/// One decoded page of a listing
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionPage {
    pub page: u32,
    pub pages: u32,
    pub items: Vec<CollectionItem>,
}

impl CollectionPage {
    pub fn from_json(sync_type: SyncType, body: &Value) -> Result<Self, SyncError> {
        let pagination = body
            .get("pagination")
            .ok_or_else(|| SyncError::Page("missing pagination".to_string()))?;
        let field = |name: &str| {
            pagination
                .get(name)
                .and_then(Value::as_u64)
                .map(|v| v as u32)
                .ok_or_else(|| SyncError::Page(format!("missing pagination.{name}")))
        };

        let list_key = match sync_type {
            SyncType::Collection => "releases",
            SyncType::Wantlist => "wants",
        };
        let items = body
            .get(list_key)
            .and_then(Value::as_array)
            .ok_or_else(|| SyncError::Page(format!("missing {list_key} array")))?
            .iter()
            .map(|item| CollectionItem::from_json(sync_type, item))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            page: field("page")?,
            pages: field("pages")?,
            items,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub inserted: u64,
    pub updated: u64,
}

#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Upsert `items`, stamping them as seen by `session_id`
    async fn apply_page(
        &self,
        user_id: Uuid,
        sync_type: SyncType,
        session_id: SyncSessionId,
        items: &[CollectionItem],
    ) -> Result<ApplyOutcome, SyncError>;

    /// Delete the user's items not seen by `session_id`
    async fn prune(
        &self,
        user_id: Uuid,
        sync_type: SyncType,
        session_id: SyncSessionId,
    ) -> Result<u64, SyncError>;

    async fn count(&self, user_id: Uuid, sync_type: SyncType) -> Result<i64, SyncError>;
}

/// Later duplicates win; Postgres refuses to upsert one key twice in a statement
fn dedupe(items: &[CollectionItem]) -> Vec<&CollectionItem> {
    let mut by_key: HashMap<i64, &CollectionItem> = HashMap::with_capacity(items.len());
    let mut order = Vec::with_capacity(items.len());
    for item in items {
        if by_key.insert(item.key(), item).is_none() {
            order.push(item.key());
        }
    }
    order.into_iter().filter_map(|k| by_key.get(&k).copied()).collect()
}

fn table(sync_type: SyncType) -> &'static str {
    match sync_type {
        SyncType::Collection => "user_collection_items",
        SyncType::Wantlist => "user_wantlist_items",
    }
}

// ============================================================================
// Postgres
// ============================================================================

pub struct PgCollectionStore {
    pool: PgPool,
}

impl PgCollectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CollectionStore for PgCollectionStore {
    async fn apply_page(
        &self,
        user_id: Uuid,
        sync_type: SyncType,
        session_id: SyncSessionId,
        items: &[CollectionItem],
    ) -> Result<ApplyOutcome, SyncError> {
        let rows = dedupe(items);
        if rows.is_empty() {
            return Ok(ApplyOutcome::default());
        }
        let session = session_id.as_uuid();

        let mut qb: QueryBuilder<Postgres> = match sync_type {
            SyncType::Collection => {
                let mut qb = QueryBuilder::new(
                    "INSERT INTO user_collection_items \
                     (user_id, instance_id, release_id, folder_id, rating, date_added, data, last_seen_session) ",
                );
                qb.push_values(rows.iter(), |mut b, item| {
                    b.push_bind(user_id)
                        .push_bind(item.key())
                        .push_bind(item.release_id)
                        .push_bind(item.folder_id)
                        .push_bind(item.rating)
                        .push_bind(item.date_added)
                        .push_bind(&item.data)
                        .push_bind(session);
                });
                qb.push(
                    " ON CONFLICT (user_id, instance_id) DO UPDATE SET \
                     release_id = EXCLUDED.release_id, folder_id = EXCLUDED.folder_id, ",
                );
                qb
            }
            SyncType::Wantlist => {
                let mut qb = QueryBuilder::new(
                    "INSERT INTO user_wantlist_items \
                     (user_id, release_id, rating, date_added, data, last_seen_session) ",
                );
                qb.push_values(rows.iter(), |mut b, item| {
                    b.push_bind(user_id)
                        .push_bind(item.release_id)
                        .push_bind(item.rating)
                        .push_bind(item.date_added)
                        .push_bind(&item.data)
                        .push_bind(session);
                });
                qb.push(" ON CONFLICT (user_id, release_id) DO UPDATE SET ");
                qb
            }
        };
        qb.push(
            "rating = EXCLUDED.rating, date_added = EXCLUDED.date_added, data = EXCLUDED.data, \
             last_seen_session = EXCLUDED.last_seen_session, updated_at = NOW() \
             RETURNING (xmax = 0) AS inserted",
        );

        let flags: Vec<(bool,)> = qb.build_query_as().fetch_all(&self.pool).await?;
        let inserted = flags.iter().filter(|(inserted,)| *inserted).count() as u64;
        Ok(ApplyOutcome {
            inserted,
            updated: flags.len() as u64 - inserted,
        })
    }

    async fn prune(
        &self,
        user_id: Uuid,
        sync_type: SyncType,
        session_id: SyncSessionId,
    ) -> Result<u64, SyncError> {
        let sql = format!(
            "DELETE FROM {} WHERE user_id = $1 AND last_seen_session IS DISTINCT FROM $2",
            table(sync_type)
        );
        let result = sqlx::query(&sql)
            .bind(user_id)
            .bind(session_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count(&self, user_id: Uuid, sync_type: SyncType) -> Result<i64, SyncError> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE user_id = $1", table(sync_type));
        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
pub struct MemoryCollectionStore {
    items: RwLock<HashMap<(Uuid, SyncType, i64), (CollectionItem, SyncSessionId)>>,
}

impl MemoryCollectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, user_id: Uuid, sync_type: SyncType, key: i64) -> Option<CollectionItem> {
        self.items
            .read()
            .await
            .get(&(user_id, sync_type, key))
            .map(|(item, _)| item.clone())
    }
}

#[async_trait]
impl CollectionStore for MemoryCollectionStore {
    async fn apply_page(
        &self,
        user_id: Uuid,
        sync_type: SyncType,
        session_id: SyncSessionId,
        items: &[CollectionItem],
    ) -> Result<ApplyOutcome, SyncError> {
        let mut stored = self.items.write().await;
        let mut outcome = ApplyOutcome::default();
        for item in dedupe(items) {
            match stored.insert((user_id, sync_type, item.key()), (item.clone(), session_id)) {
                Some(_) => outcome.updated += 1,
                None => outcome.inserted += 1,
            }
        }
        Ok(outcome)
    }

    async fn prune(
        &self,
        user_id: Uuid,
        sync_type: SyncType,
        session_id: SyncSessionId,
    ) -> Result<u64, SyncError> {
        let mut stored = self.items.write().await;
        let before = stored.len();
        stored.retain(|(user, kind, _), (_, seen)| {
            *user != user_id || *kind != sync_type || *seen == session_id
        });
        Ok((before - stored.len()) as u64)
    }

    async fn count(&self, user_id: Uuid, sync_type: SyncType) -> Result<i64, SyncError> {
        Ok(self
            .items
            .read()
            .await
            .keys()
            .filter(|(user, kind, _)| *user == user_id && *kind == sync_type)
            .count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collection_body() -> Value {
        json!({
            "pagination": {"page": 1, "pages": 3, "per_page": 2, "items": 5},
            "releases": [
                {"id": 2464521, "instance_id": 148842, "folder_id": 1, "rating": 4,
                 "date_added": "2017-06-22T14:27:35-07:00",
                 "basic_information": {"title": "Blue Train"}},
                {"id": 1, "instance_id": 7, "folder_id": 1, "rating": 0}
            ]
        })
    }

    #[test]
    fn test_parse_collection_page() {
        let page = CollectionPage::from_json(SyncType::Collection, &collection_body()).unwrap();
        assert_eq!(page.page, 1);
        assert_eq!(page.pages, 3);
        assert_eq!(page.items.len(), 2);

        let first = &page.items[0];
        assert_eq!(first.key(), 148842);
        assert_eq!(first.rating, 4);
        assert_eq!(
            first.date_added.unwrap().to_rfc3339(),
            "2017-06-22T21:27:35+00:00"
        );
        assert_eq!(first.data["basic_information"]["title"], "Blue Train");
    }

    #[test]
    fn test_parse_wantlist_keys_by_release() {
        let body = json!({
            "pagination": {"page": 2, "pages": 2},
            "wants": [{"id": 42, "rating": 0, "notes": ""}]
        });
        let page = CollectionPage::from_json(SyncType::Wantlist, &body).unwrap();
        assert_eq!(page.items[0].key(), 42);
        assert_eq!(page.items[0].instance_id, None);
    }

    #[test]
    fn test_parse_rejects_wrong_shape() {
        // A wantlist body is not a collection page
        let body = json!({"pagination": {"page": 1, "pages": 1}, "wants": []});
        assert!(matches!(
            CollectionPage::from_json(SyncType::Collection, &body),
            Err(SyncError::Page(_))
        ));
        assert!(CollectionPage::from_json(SyncType::Wantlist, &json!({"message": "nope"})).is_err());

        let missing_instance = json!({
            "pagination": {"page": 1, "pages": 1},
            "releases": [{"id": 1}]
        });
        assert!(CollectionPage::from_json(SyncType::Collection, &missing_instance).is_err());
    }

    #[tokio::test]
    async fn test_apply_counts_new_and_seen_items() {
        let store = MemoryCollectionStore::new();
        let user = Uuid::new_v4();
        let page = CollectionPage::from_json(SyncType::Collection, &collection_body()).unwrap();

        let first = SyncSessionId::new();
        let outcome = store
            .apply_page(user, SyncType::Collection, first, &page.items)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome { inserted: 2, updated: 0 });

        let second = SyncSessionId::new();
        let outcome = store
            .apply_page(user, SyncType::Collection, second, &page.items[..1])
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome { inserted: 0, updated: 1 });

        // Only instance 148842 was seen by the second session
        assert_eq!(store.prune(user, SyncType::Collection, second).await.unwrap(), 1);
        assert_eq!(store.count(user, SyncType::Collection).await.unwrap(), 1);
        assert!(store.get(user, SyncType::Collection, 148842).await.is_some());
    }

    #[tokio::test]
    async fn test_prune_is_scoped_to_user_and_list() {
        let store = MemoryCollectionStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let want = CollectionPage::from_json(
            SyncType::Wantlist,
            &json!({"pagination": {"page": 1, "pages": 1}, "wants": [{"id": 9}]}),
        )
        .unwrap();

        store
            .apply_page(a, SyncType::Wantlist, SyncSessionId::new(), &want.items)
            .await
            .unwrap();
        store
            .apply_page(b, SyncType::Wantlist, SyncSessionId::new(), &want.items)
            .await
            .unwrap();

        assert_eq!(
            store.prune(a, SyncType::Collection, SyncSessionId::new()).await.unwrap(),
            0
        );
        assert_eq!(
            store.prune(a, SyncType::Wantlist, SyncSessionId::new()).await.unwrap(),
            1
        );
        assert_eq!(store.count(b, SyncType::Wantlist).await.unwrap(), 1);
    }

    #[test]
    fn test_dedupe_keeps_last_occurrence() {
        let body = json!({
            "pagination": {"page": 1, "pages": 1},
            "wants": [{"id": 5, "rating": 1}, {"id": 6}, {"id": 5, "rating": 3}]
        });
        let page = CollectionPage::from_json(SyncType::Wantlist, &body).unwrap();
        let rows = dedupe(&page.items);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].rating, 3);
    }
}
