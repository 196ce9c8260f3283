//! Read-only query surface over the catalog.
//!
//! Lookups never fail for missing ids: unknown ids are simply absent from the
//! returned maps. Only connectivity or SQL failures surface as errors.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite};

use super::model::{Ad, AdId, DownloadStatus, ImageAsset, SourceImage};
use super::{Database, StoreError};
use crate::index::{Modality, RowId};

/// Upper bound of bound parameters per statement.
const MAX_BINDS_PER_QUERY: usize = 500;

const AD_COLUMNS: &str = "SELECT id, name, url, title, background, insight, creative, result, \
     score, favorites, comments, publish_time, category, \
     CAST(created_at AS TEXT) AS created_at \
     FROM advertisements";

#[derive(Debug, sqlx::FromRow)]
struct RowMapping {
    row_id: i64,
    ad_id: AdId,
}

#[derive(Debug, sqlx::FromRow)]
struct ImageRow {
    id: i64,
    ad_id: AdId,
    local_path: String,
    embedding_id: i64,
}

/// Catalog counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct CatalogStats {
    pub ads: i64,
    pub images: i64,
    pub completed_images: i64,
    pub indexed_images: i64,
    pub text_rows: i64,
}

/// Read access to ads, their images and the row id mapping tables.
///
/// Cheap to clone: the pool is reference counted.
#[derive(Clone)]
pub struct EntityStore {
    db: Database,
}

impl EntityStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Metadata of the given ads, keyed by id.
    pub async fn get_ads(&self, ids: &[AdId]) -> Result<HashMap<AdId, Ad>, StoreError> {
        let mut ads = HashMap::new();

        for chunk in unique(ids).chunks(MAX_BINDS_PER_QUERY) {
            let mut query = QueryBuilder::<Sqlite>::new(AD_COLUMNS);
            query.push(" WHERE id IN (");
            push_id_list(&mut query, chunk);

            for ad in query.build_query_as::<Ad>().fetch_all(&self.db).await? {
                ads.insert(ad.id, ad);
            }
        }

        Ok(ads)
    }

    /// Completed, embedded images of the given ads in stored order.
    ///
    /// Every requested id is present in the result; ads without a qualifying
    /// image map to an empty list.
    pub async fn completed_images_by_ad(
        &self,
        ids: &[AdId],
    ) -> Result<HashMap<AdId, Vec<ImageAsset>>, StoreError> {
        let ids = unique(ids);
        let mut images: HashMap<AdId, Vec<ImageAsset>> =
            ids.iter().map(|&id| (id, Vec::new())).collect();

        for chunk in ids.chunks(MAX_BINDS_PER_QUERY) {
            let mut query = QueryBuilder::<Sqlite>::new(
                "SELECT id, ad_id, local_path, embedding_id FROM images WHERE download_status = ",
            );
            query.push_bind(DownloadStatus::Completed.as_str());
            query.push(" AND embedding_id IS NOT NULL AND local_path IS NOT NULL AND ad_id IN (");
            push_id_list(&mut query, chunk);
            query.push(" ORDER BY ad_id, id");

            for row in query.build_query_as::<ImageRow>().fetch_all(&self.db).await? {
                let Ok(position) = RowId::try_from(row.embedding_id) else {
                    log::warn!("Image {} has negative embedding id {}", row.id, row.embedding_id);
                    continue;
                };
                images.entry(row.ad_id).or_default().push(ImageAsset {
                    image_id: row.id,
                    location: row.local_path,
                    row: position,
                });
            }
        }

        Ok(images)
    }

    /// Map index rows of `modality` to the ads that own them.
    ///
    /// Rows without a mapping are absent from the result.
    pub async fn resolve_rows(
        &self,
        rows: &[RowId],
        modality: Modality,
    ) -> Result<HashMap<RowId, AdId>, StoreError> {
        let rows: Vec<i64> = unique(rows)
            .into_iter()
            .filter_map(|row| i64::try_from(row).ok())
            .collect();
        let mut mapping = HashMap::with_capacity(rows.len());

        let select = match modality {
            Modality::Image => {
                "SELECT embedding_id AS row_id, ad_id FROM images WHERE embedding_id IN ("
            }
            Modality::Text => "SELECT row_id, ad_id FROM text_rows WHERE row_id IN (",
        };

        for chunk in rows.chunks(MAX_BINDS_PER_QUERY) {
            let mut query = QueryBuilder::<Sqlite>::new(select);
            push_id_list(&mut query, chunk);

            for row in query.build_query_as::<RowMapping>().fetch_all(&self.db).await? {
                mapping.insert(row.row_id as RowId, row.ad_id);
            }
        }

        Ok(mapping)
    }

    /// Every completed image with a local file, by image id.
    pub async fn completed_images(&self) -> Result<Vec<SourceImage>, StoreError> {
        let images = sqlx::query_as::<_, SourceImage>(
            "SELECT id, ad_id, local_path FROM images \
             WHERE download_status = ? AND local_path IS NOT NULL ORDER BY id",
        )
        .bind(DownloadStatus::Completed.as_str())
        .fetch_all(&self.db)
        .await?;

        Ok(images)
    }

    /// Every ad, by id.
    pub async fn all_ads(&self) -> Result<Vec<Ad>, StoreError> {
        let ads = sqlx::query_as::<_, Ad>(&format!("{AD_COLUMNS} ORDER BY id"))
            .fetch_all(&self.db)
            .await?;

        Ok(ads)
    }

    pub async fn stats(&self) -> Result<CatalogStats, StoreError> {
        let stats = sqlx::query_as::<_, CatalogStats>(
            "SELECT \
             (SELECT COUNT(*) FROM advertisements) AS ads, \
             (SELECT COUNT(*) FROM images) AS images, \
             (SELECT COUNT(*) FROM images WHERE download_status = 'completed') AS completed_images, \
             (SELECT COUNT(*) FROM images WHERE embedding_id IS NOT NULL) AS indexed_images, \
             (SELECT COUNT(*) FROM text_rows) AS text_rows",
        )
        .fetch_one(&self.db)
        .await?;

        Ok(stats)
    }
}

fn unique<T: Copy + Ord>(ids: &[T]) -> Vec<T> {
    ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Push `?, ?, ...)` binding every id. `ids` must not be empty.
fn push_id_list(query: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    let mut separated = query.separated(", ");
    for &id in ids {
        separated.push_bind(id);
    }
    separated.push_unseparated(")");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::init_memory_db;
    use crate::tests::{insert_ad, insert_image, insert_text_row};

    async fn store() -> EntityStore {
        EntityStore::new(init_memory_db().await.unwrap())
    }

    #[tokio::test]
    async fn test_get_ads_omits_unknown_ids() {
        let store = store().await;
        let first = insert_ad(store.database(), "First", "creative one").await;
        let second = insert_ad(store.database(), "Second", "creative two").await;

        let ads = store.get_ads(&[second, 999, first, second]).await.unwrap();

        assert_eq!(ads.len(), 2);
        assert_eq!(ads[&first].title.as_deref(), Some("First"));
        assert_eq!(ads[&second].display_text(), Some("creative two"));
        assert!(ads[&first].created_at.is_some());
    }

    #[tokio::test]
    async fn test_empty_id_sets_issue_no_query() {
        let store = store().await;
        assert!(store.get_ads(&[]).await.unwrap().is_empty());
        assert!(store.completed_images_by_ad(&[]).await.unwrap().is_empty());
        assert!(store.resolve_rows(&[], Modality::Image).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_completed_images_filters_status_and_row() {
        let store = store().await;
        let db = store.database();
        let ad = insert_ad(db, "Ad", "text").await;
        let bare = insert_ad(db, "No images", "text").await;

        let kept = insert_image(db, ad, Some("a.jpg"), DownloadStatus::Completed, Some(4)).await;
        insert_image(db, ad, Some("b.jpg"), DownloadStatus::Completed, None).await;
        insert_image(db, ad, Some("c.jpg"), DownloadStatus::Pending, Some(5)).await;
        insert_image(db, ad, Some("d.jpg"), DownloadStatus::Failed, Some(6)).await;
        let second = insert_image(db, ad, Some("e.jpg"), DownloadStatus::Completed, Some(1)).await;

        let images = store.completed_images_by_ad(&[ad, bare]).await.unwrap();

        assert_eq!(
            images[&ad],
            vec![
                ImageAsset {
                    image_id: kept,
                    location: "a.jpg".to_string(),
                    row: 4
                },
                ImageAsset {
                    image_id: second,
                    location: "e.jpg".to_string(),
                    row: 1
                },
            ]
        );
        assert!(images[&bare].is_empty());
    }

    #[tokio::test]
    async fn test_resolve_rows_per_modality() {
        let store = store().await;
        let db = store.database();
        let first = insert_ad(db, "First", "").await;
        let second = insert_ad(db, "Second", "").await;

        insert_image(db, first, Some("a.jpg"), DownloadStatus::Completed, Some(0)).await;
        insert_image(db, second, Some("b.jpg"), DownloadStatus::Completed, Some(1)).await;
        // text rows deliberately not in ad id order
        insert_text_row(db, 0, second).await;
        insert_text_row(db, 1, first).await;

        let image = store.resolve_rows(&[0, 1, 7], Modality::Image).await.unwrap();
        assert_eq!(image, HashMap::from([(0, first), (1, second)]));

        let text = store.resolve_rows(&[1, 0, 9], Modality::Text).await.unwrap();
        assert_eq!(text, HashMap::from([(0, second), (1, first)]));
    }

    #[tokio::test]
    async fn test_large_id_sets_are_chunked() {
        let store = store().await;
        let ad = insert_ad(store.database(), "Only", "").await;

        let mut ids: Vec<AdId> = (10_000..10_000 + 3 * MAX_BINDS_PER_QUERY as i64).collect();
        ids.push(ad);

        let ads = store.get_ads(&ids).await.unwrap();
        assert_eq!(ads.len(), 1);
        assert!(ads.contains_key(&ad));
    }

    #[tokio::test]
    async fn test_stats() {
        let store = store().await;
        let db = store.database();
        let ad = insert_ad(db, "Ad", "").await;
        insert_image(db, ad, Some("a.jpg"), DownloadStatus::Completed, Some(0)).await;
        insert_image(db, ad, None, DownloadStatus::Pending, None).await;
        insert_text_row(db, 0, ad).await;

        assert_eq!(
            store.stats().await.unwrap(),
            CatalogStats {
                ads: 1,
                images: 2,
                completed_images: 1,
                indexed_images: 1,
                text_rows: 1,
            }
        );
    }
}
